/// Category inference and spec defaults for auto-registered symbols
use crate::types::{CategoryPattern, SymbolCategory, SymbolSpec};

/// Built-in ordered pattern list. Crypto tokens come first so that
/// names like BNBUSD hit the crypto rule before the 6-letter forex
/// rule; metals and indices follow; JPY pairs are matched by suffix.
pub fn default_patterns() -> Vec<CategoryPattern> {
    let entry = |pattern: &str, category: SymbolCategory| CategoryPattern {
        pattern: pattern.to_string(),
        category,
    };

    vec![
        entry("BTC", SymbolCategory::Crypto),
        entry("ETH", SymbolCategory::Crypto),
        entry("XRP", SymbolCategory::Crypto),
        entry("SOL", SymbolCategory::Crypto),
        entry("ADA", SymbolCategory::Crypto),
        entry("DOGE", SymbolCategory::Crypto),
        entry("BNB", SymbolCategory::Crypto),
        entry("LTC", SymbolCategory::Crypto),
        entry("DOT", SymbolCategory::Crypto),
        entry("XAU", SymbolCategory::Metal),
        entry("XAG", SymbolCategory::Metal),
        entry("XPT", SymbolCategory::Metal),
        entry("US30", SymbolCategory::Index),
        entry("US500", SymbolCategory::Index),
        entry("SPX", SymbolCategory::Index),
        entry("NAS100", SymbolCategory::Index),
        entry("GER40", SymbolCategory::Index),
        entry("UK100", SymbolCategory::Index),
        entry("JPN225", SymbolCategory::Index),
        entry("WTI", SymbolCategory::Commodity),
        entry("BRENT", SymbolCategory::Commodity),
        entry("NGAS", SymbolCategory::Commodity),
    ]
}

/// Walk the ordered pattern list (first substring match wins), then
/// fall back to structural rules: JPY suffix and 6-letter alphabetic
/// names are forex, anything else is other.
pub fn infer_category(symbol: &str, patterns: &[CategoryPattern]) -> SymbolCategory {
    for entry in patterns {
        if symbol.contains(&entry.pattern) {
            return entry.category;
        }
    }

    if symbol.ends_with("JPY") {
        return SymbolCategory::Forex;
    }
    if symbol.len() == 6 && symbol.bytes().all(|b| b.is_ascii_uppercase()) {
        return SymbolCategory::Forex;
    }

    SymbolCategory::Other
}

/// Category defaults for an auto-registered spec. Admin overrides land
/// later through the registry upsert path.
pub fn spec_defaults(symbol: &str, category: SymbolCategory) -> SymbolSpec {
    let is_jpy = symbol.ends_with("JPY");

    let (contract_size, pip_size, margin_percent) = match category {
        SymbolCategory::Forex => (100_000.0, if is_jpy { 0.01 } else { 0.0001 }, 1.0),
        SymbolCategory::Metal => (100.0, 0.01, 2.0),
        SymbolCategory::Index => (10.0, 0.1, 5.0),
        SymbolCategory::Crypto => (1.0, if symbol.starts_with("BTC") { 1.0 } else { 0.01 }, 10.0),
        SymbolCategory::Stock => (100.0, 0.01, 20.0),
        SymbolCategory::Commodity => (1000.0, 0.01, 5.0),
        SymbolCategory::Other => (1.0, 0.01, 10.0),
    };

    SymbolSpec {
        symbol: symbol.to_string(),
        category,
        description: String::new(),
        contract_size,
        pip_size,
        pip_value: contract_size * pip_size,
        min_volume: 0.01,
        volume_step: 0.01,
        max_volume: 100.0,
        margin_percent,
        commission_per_lot: 0.0,
        swap_long: 0.0,
        swap_short: 0.0,
        disabled: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crypto_beats_forex_rule() {
        let patterns = default_patterns();
        // BNBUSD is 6 characters but the crypto prefix rule runs first
        assert_eq!(infer_category("BNBUSD", &patterns), SymbolCategory::Crypto);
        assert_eq!(infer_category("BTCUSD", &patterns), SymbolCategory::Crypto);
    }

    #[test]
    fn test_metals_and_indices() {
        let patterns = default_patterns();
        assert_eq!(infer_category("XAUUSD", &patterns), SymbolCategory::Metal);
        assert_eq!(infer_category("NAS100", &patterns), SymbolCategory::Index);
    }

    #[test]
    fn test_forex_fallbacks() {
        let patterns = default_patterns();
        assert_eq!(infer_category("USDJPY", &patterns), SymbolCategory::Forex);
        assert_eq!(infer_category("EURUSD", &patterns), SymbolCategory::Forex);
        assert_eq!(infer_category("ABC123", &patterns), SymbolCategory::Other);
    }

    #[test]
    fn test_spec_defaults() {
        let eurusd = spec_defaults("EURUSD", SymbolCategory::Forex);
        assert_eq!(eurusd.contract_size, 100_000.0);
        assert_eq!(eurusd.pip_size, 0.0001);
        assert_eq!(eurusd.margin_percent, 1.0);

        let usdjpy = spec_defaults("USDJPY", SymbolCategory::Forex);
        assert_eq!(usdjpy.pip_size, 0.01);

        let btcusd = spec_defaults("BTCUSD", SymbolCategory::Crypto);
        assert_eq!(btcusd.contract_size, 1.0);
        assert_eq!(btcusd.pip_size, 1.0);
        assert_eq!(btcusd.margin_percent, 10.0);
    }
}
