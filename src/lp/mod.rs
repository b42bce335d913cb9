/// LP seam: the core only ever sees normalized Quote producers.
/// Real adapters (FIX, vendor WebSocket/REST) live outside this crate
/// and push into the ingest channel; the simulated feed below drives
/// the full pipeline for local runs.
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::types::Quote;

#[async_trait]
pub trait QuoteSource: Send {
    /// Next normalized quote, or None when the source is exhausted
    async fn next_quote(&mut self) -> Option<Quote>;
}

/// Random-walk quote generator over a fixed symbol set
pub struct SimulatedLp {
    symbols: Vec<(String, f64)>,
    interval: Duration,
    rng: StdRng,
    cursor: usize,
}

impl SimulatedLp {
    pub fn new(symbols: Vec<String>, interval: Duration) -> Self {
        let symbols = symbols
            .into_iter()
            .map(|s| {
                let mid = match s.as_str() {
                    s if s.ends_with("JPY") => 155.0,
                    s if s.starts_with("BTC") => 65_000.0,
                    s if s.starts_with("XAU") => 2_400.0,
                    _ => 1.0850,
                };
                (s, mid)
            })
            .collect();
        SimulatedLp {
            symbols,
            interval,
            rng: StdRng::from_entropy(),
            cursor: 0,
        }
    }
}

#[async_trait]
impl QuoteSource for SimulatedLp {
    async fn next_quote(&mut self) -> Option<Quote> {
        if self.symbols.is_empty() {
            return None;
        }
        tokio::time::sleep(self.interval).await;

        self.cursor = (self.cursor + 1) % self.symbols.len();
        let (symbol, mid) = &mut self.symbols[self.cursor];

        // Random walk of up to 2 basis points per step
        let step = *mid * 2e-4 * (self.rng.gen::<f64>() - 0.5);
        *mid = (*mid + step).max(*mid * 0.5);
        let half_spread = *mid * 1e-4 / 2.0;

        Some(Quote {
            symbol: symbol.clone(),
            bid: *mid - half_spread,
            ask: *mid + half_spread,
            ts: Utc::now(),
            lp_tag: "sim".to_string(),
        })
    }
}

/// Pump a source into the ingest channel until either side closes
pub async fn run_quote_source<S: QuoteSource>(mut source: S, tx: mpsc::Sender<Quote>) {
    info!("Quote source started");
    while let Some(quote) = source.next_quote().await {
        if tx.send(quote).await.is_err() {
            warn!("Ingest channel closed, quote source stopping");
            return;
        }
    }
    info!("Quote source exhausted");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sim_feed_produces_valid_quotes() {
        let mut lp = SimulatedLp::new(
            vec!["EURUSD".to_string(), "USDJPY".to_string()],
            Duration::from_millis(1),
        );

        for _ in 0..20 {
            let quote = lp.next_quote().await.unwrap();
            assert!(quote.bid > 0.0);
            assert!(quote.ask >= quote.bid);
            assert_eq!(quote.lp_tag, "sim");
        }
    }

    #[tokio::test]
    async fn test_empty_symbol_set_exhausts() {
        let mut lp = SimulatedLp::new(vec![], Duration::from_millis(1));
        assert!(lp.next_quote().await.is_none());
    }
}
