/// Margin and P/L arithmetic
use std::collections::HashMap;

use crate::types::{Account, Position, Side, SymbolSpec};

/// Latest internalized quote used for mark-to-market
#[derive(Debug, Clone, Copy)]
pub struct LatestQuote {
    pub bid: f64,
    pub ask: f64,
    pub ts_ms: i64,
}

impl LatestQuote {
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }
}

/// Margin required to carry `volume` lots at `price`:
/// volume * contract_size * price / leverage * margin_percent
pub fn required_margin(volume: f64, spec: &SymbolSpec, price: f64, leverage: u32) -> f64 {
    volume * spec.contract_size * price / leverage.max(1) as f64 * (spec.margin_percent / 100.0)
}

/// Price a position would close at right now
pub fn close_side_price(side: Side, quote: &LatestQuote) -> f64 {
    match side {
        Side::Buy => quote.bid,
        Side::Sell => quote.ask,
    }
}

/// Price a new position of `side` opens at
pub fn open_side_price(side: Side, quote: &LatestQuote) -> f64 {
    match side {
        Side::Buy => quote.ask,
        Side::Sell => quote.bid,
    }
}

/// Raw P/L in the symbol's quote currency:
/// (close - open) * side * volume * contract_size
pub fn raw_pnl(position: &Position, close_price: f64, spec: &SymbolSpec) -> f64 {
    (close_price - position.open_price) * position.side.sign() * position.volume * spec.contract_size
}

/// Convert a quote-currency amount into the account currency using
/// the internalized quotes. Identity when the symbol is quoted in the
/// account currency; falls back to the raw amount when no conversion
/// pair has ticked yet.
pub fn to_account_currency(
    amount: f64,
    symbol: &str,
    account: &Account,
    quotes: &HashMap<String, LatestQuote>,
) -> f64 {
    let Some(quote_ccy) = quote_currency(symbol) else {
        return amount;
    };
    if quote_ccy == account.currency {
        return amount;
    }

    let direct = format!("{}{}", quote_ccy, account.currency);
    if let Some(q) = quotes.get(&direct) {
        return amount * q.mid();
    }
    let inverse = format!("{}{}", account.currency, quote_ccy);
    if let Some(q) = quotes.get(&inverse) {
        let mid = q.mid();
        if mid > 0.0 {
            return amount / mid;
        }
    }
    amount
}

/// Quote currency of a conventional 6-letter pair
fn quote_currency(symbol: &str) -> Option<&str> {
    if symbol.len() == 6 && symbol.bytes().all(|b| b.is_ascii_uppercase()) {
        Some(&symbol[3..])
    } else {
        None
    }
}
