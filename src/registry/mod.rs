/// Symbol registry: authoritative catalog of tradable instruments
pub mod autogen;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{EngineError, Result};
use crate::types::{CategoryPattern, GroupSpec, SymbolCategory, SymbolSpec};

/// Filter for `list`
#[derive(Debug, Clone, Default)]
pub struct SymbolFilter {
    pub enabled_only: bool,
    pub category: Option<SymbolCategory>,
}

/// Persisted registry state (`config.json` under the data root)
#[derive(Debug, Serialize, Deserialize, Default)]
struct RegistryFile {
    symbols: Vec<SymbolSpec>,
    groups: Vec<GroupSpec>,
}

type SymbolMap = HashMap<String, Arc<SymbolSpec>>;
type GroupMap = HashMap<String, Arc<GroupSpec>>;

/// Read-mostly symbol catalog. Lookups run against an immutable
/// snapshot; updates swap in a new snapshot (copy-on-write), so the
/// tick hot path never takes a lock.
pub struct SymbolRegistry {
    symbols: ArcSwap<SymbolMap>,
    groups: ArcSwap<GroupMap>,
    patterns: Vec<CategoryPattern>,
    persist_path: Option<PathBuf>,
}

/// Uppercase-sanitize and validate a symbol name: A-Z0-9, 3 to 12 chars
pub fn sanitize_symbol(raw: &str) -> Result<String> {
    let name = raw.trim().to_ascii_uppercase();
    let valid = (3..=12).contains(&name.len())
        && name.bytes().all(|b| b.is_ascii_uppercase() || b.is_ascii_digit());
    if valid {
        Ok(name)
    } else {
        Err(EngineError::InvalidSymbolName(raw.trim().to_string()))
    }
}

impl SymbolRegistry {
    pub fn new(patterns: Vec<CategoryPattern>) -> Self {
        let patterns = if patterns.is_empty() {
            autogen::default_patterns()
        } else {
            patterns
        };
        SymbolRegistry {
            symbols: ArcSwap::from_pointee(HashMap::new()),
            groups: ArcSwap::from_pointee(HashMap::new()),
            patterns,
            persist_path: None,
        }
    }

    /// Attach a persistence path and load any existing `config.json`
    pub fn with_persistence<P: AsRef<Path>>(mut self, path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let file: RegistryFile = serde_json::from_str(&content)?;

            let mut symbols = HashMap::new();
            for spec in file.symbols {
                symbols.insert(spec.symbol.clone(), Arc::new(spec));
            }
            let mut groups = HashMap::new();
            for group in file.groups {
                groups.insert(group.id.clone(), Arc::new(group));
            }

            info!(
                symbols = symbols.len(),
                groups = groups.len(),
                "Loaded symbol registry"
            );
            self.symbols.store(Arc::new(symbols));
            self.groups.store(Arc::new(groups));
        }
        self.persist_path = Some(path);
        Ok(self)
    }

    /// Idempotent upsert. Rejects invalid symbol names.
    pub fn register(&self, mut spec: SymbolSpec) -> Result<()> {
        spec.symbol = sanitize_symbol(&spec.symbol)?;
        let symbol = spec.symbol.clone();

        self.symbols.rcu(|current| {
            let mut next: SymbolMap = (**current).clone();
            next.insert(symbol.clone(), Arc::new(spec.clone()));
            next
        });

        debug!(symbol = %symbol, category = spec.category.as_str(), "Registered symbol");
        self.persist()
    }

    /// O(1) lookup against the current snapshot
    pub fn get(&self, symbol: &str) -> Option<Arc<SymbolSpec>> {
        self.symbols.load().get(symbol).cloned()
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.symbols.load().contains_key(symbol)
    }

    pub fn list(&self, filter: &SymbolFilter) -> Vec<Arc<SymbolSpec>> {
        let mut specs: Vec<Arc<SymbolSpec>> = self
            .symbols
            .load()
            .values()
            .filter(|s| !(filter.enabled_only && s.disabled))
            .filter(|s| filter.category.map_or(true, |c| s.category == c))
            .cloned()
            .collect();
        specs.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        specs
    }

    pub fn set_disabled(&self, symbol: &str, disabled: bool) -> Result<()> {
        let symbol = sanitize_symbol(symbol)?;
        if !self.contains(&symbol) {
            return Err(EngineError::UnknownSymbol(symbol));
        }

        self.symbols.rcu(|current| {
            let mut next: SymbolMap = (**current).clone();
            if let Some(existing) = next.get(&symbol) {
                let mut spec = (**existing).clone();
                spec.disabled = disabled;
                next.insert(symbol.clone(), Arc::new(spec));
            }
            next
        });

        info!(symbol = %symbol, disabled, "Symbol toggled");
        self.persist()
    }

    /// Auto-register a symbol seen for the first time on the quote
    /// stream. Category and spec defaults come from the ordered
    /// pattern list; an admin can override the spec later.
    pub fn autogenerate(&self, symbol: &str) -> Result<Arc<SymbolSpec>> {
        let symbol = sanitize_symbol(symbol)?;
        if let Some(existing) = self.get(&symbol) {
            return Ok(existing);
        }

        let category = autogen::infer_category(&symbol, &self.patterns);
        let spec = autogen::spec_defaults(&symbol, category);
        info!(symbol = %symbol, category = category.as_str(), "Auto-registered symbol");
        self.register(spec)?;

        self.get(&symbol)
            .ok_or_else(|| EngineError::Internal(format!("registry lost symbol {}", symbol)))
    }

    pub fn get_group(&self, group_id: &str) -> Option<Arc<GroupSpec>> {
        self.groups.load().get(group_id).cloned()
    }

    pub fn upsert_group(&self, group: GroupSpec) -> Result<()> {
        let id = group.id.clone();
        self.groups.rcu(|current| {
            let mut next: GroupMap = (**current).clone();
            next.insert(id.clone(), Arc::new(group.clone()));
            next
        });
        self.persist()
    }

    pub fn symbol_count(&self) -> usize {
        self.symbols.load().len()
    }

    fn persist(&self) -> Result<()> {
        let Some(path) = &self.persist_path else {
            return Ok(());
        };

        let file = RegistryFile {
            symbols: self.symbols.load().values().map(|s| (**s).clone()).collect(),
            groups: self.groups.load().values().map(|g| (**g).clone()).collect(),
        };
        let json = serde_json::to_string_pretty(&file)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_symbol() {
        assert_eq!(sanitize_symbol(" eurusd ").unwrap(), "EURUSD");
        assert_eq!(sanitize_symbol("XAUUSD").unwrap(), "XAUUSD");
        assert!(sanitize_symbol("EU").is_err());
        assert!(sanitize_symbol("WAY_TOO_LONG_NAME").is_err());
        assert!(sanitize_symbol("EUR/USD").is_err());
    }

    #[test]
    fn test_register_and_get() {
        let registry = SymbolRegistry::new(vec![]);
        let spec = autogen::spec_defaults("EURUSD", SymbolCategory::Forex);
        registry.register(spec).unwrap();

        let fetched = registry.get("EURUSD").unwrap();
        assert_eq!(fetched.contract_size, 100_000.0);
        assert!(registry.get("GBPUSD").is_none());
    }

    #[test]
    fn test_register_is_idempotent_upsert() {
        let registry = SymbolRegistry::new(vec![]);
        let mut spec = autogen::spec_defaults("EURUSD", SymbolCategory::Forex);
        registry.register(spec.clone()).unwrap();

        spec.commission_per_lot = 7.0;
        registry.register(spec).unwrap();

        assert_eq!(registry.symbol_count(), 1);
        assert_eq!(registry.get("EURUSD").unwrap().commission_per_lot, 7.0);
    }

    #[test]
    fn test_list_filters() {
        let registry = SymbolRegistry::new(vec![]);
        registry.autogenerate("EURUSD").unwrap();
        registry.autogenerate("BTCUSD").unwrap();
        registry.set_disabled("EURUSD", true).unwrap();

        let all = registry.list(&SymbolFilter::default());
        assert_eq!(all.len(), 2);

        let enabled = registry.list(&SymbolFilter { enabled_only: true, category: None });
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].symbol, "BTCUSD");

        let crypto = registry.list(&SymbolFilter {
            enabled_only: false,
            category: Some(SymbolCategory::Crypto),
        });
        assert_eq!(crypto.len(), 1);
    }

    #[test]
    fn test_persistence_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        {
            let registry = SymbolRegistry::new(vec![]).with_persistence(&path).unwrap();
            registry.autogenerate("USDJPY").unwrap();
            registry
                .upsert_group(GroupSpec {
                    id: "vip".to_string(),
                    margin_call_pct: 120.0,
                    stop_out_pct: 60.0,
                    default_leverage: 200,
                    commission_per_lot: 3.0,
                })
                .unwrap();
        }

        let reloaded = SymbolRegistry::new(vec![]).with_persistence(&path).unwrap();
        assert_eq!(reloaded.get("USDJPY").unwrap().pip_size, 0.01);
        assert_eq!(reloaded.get_group("vip").unwrap().stop_out_pct, 60.0);
    }
}
