/// Incremental multi-timeframe OHLC aggregation driven by the tick
/// stream. History is bounded per (symbol, timeframe) and sparse:
/// intervals without ticks get no bar.
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use crate::types::{OhlcBar, Tick};
use crate::utils::bar_start;

/// Supported timeframes in seconds: M1, M5, M15, M30, H1, H4, D1, W1, MN
pub const TIMEFRAMES: [u32; 9] = [60, 300, 900, 1800, 3600, 14_400, 86_400, 604_800, 2_592_000];

/// Bar in progress for one (symbol, timeframe)
#[derive(Debug, Clone)]
struct FormingBar {
    bar_start: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: u64,
}

impl FormingBar {
    fn new(bar_start: i64, price: f64) -> Self {
        FormingBar {
            bar_start,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 1,
        }
    }

    fn update(&mut self, price: f64) {
        self.close = price;
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.volume += 1;
    }

    fn to_bar(&self, symbol: &str, timeframe_secs: u32) -> OhlcBar {
        OhlcBar {
            symbol: symbol.to_string(),
            timeframe_secs,
            bar_start: self.bar_start,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
        }
    }
}

struct TfState {
    current: Option<FormingBar>,
    history: VecDeque<OhlcBar>,
}

struct SymbolOhlc {
    states: HashMap<u32, TfState>,
    last_tick: DateTime<Utc>,
}

pub struct OhlcCache {
    history_bars: usize,
    symbols: RwLock<HashMap<String, Arc<RwLock<SymbolOhlc>>>>,
}

impl OhlcCache {
    pub fn new(history_bars: usize) -> Self {
        OhlcCache {
            history_bars,
            symbols: RwLock::new(HashMap::new()),
        }
    }

    /// Update every timeframe's forming bar from one tick. Bars are
    /// priced at the mid: open/high/low/close all track (bid+ask)/2.
    pub async fn on_tick(&self, tick: &Tick) {
        let entry = self.entry(&tick.symbol).await;
        let mut state = entry.write().await;
        state.last_tick = tick.timestamp;

        let mid = tick.mid();
        let ts_secs = tick.timestamp.timestamp();

        for &tf in TIMEFRAMES.iter() {
            let aligned = bar_start(ts_secs, tf);
            let tf_state = state.states.entry(tf).or_insert_with(|| TfState {
                current: None,
                history: VecDeque::new(),
            });

            match tf_state.current.as_mut() {
                Some(bar) if bar.bar_start == aligned => bar.update(mid),
                Some(bar) => {
                    let finished = bar.to_bar(&tick.symbol, tf);
                    if tf_state.history.len() >= self.history_bars {
                        tf_state.history.pop_front();
                    }
                    tf_state.history.push_back(finished);
                    tf_state.current = Some(FormingBar::new(aligned, mid));
                }
                None => {
                    tf_state.current = Some(FormingBar::new(aligned, mid));
                }
            }
        }
    }

    /// Last `limit` bars oldest first, the forming bar last
    pub async fn get_ohlc(&self, symbol: &str, timeframe_secs: u32, limit: usize) -> Vec<OhlcBar> {
        let symbols = self.symbols.read().await;
        let Some(entry) = symbols.get(symbol) else {
            return Vec::new();
        };
        let state = entry.read().await;
        let Some(tf_state) = state.states.get(&timeframe_secs) else {
            return Vec::new();
        };

        let mut bars: Vec<OhlcBar> = tf_state.history.iter().cloned().collect();
        if let Some(forming) = &tf_state.current {
            bars.push(forming.to_bar(symbol, timeframe_secs));
        }

        if bars.len() > limit {
            bars.drain(..bars.len() - limit);
        }
        bars
    }

    /// Drop hot state for symbols with no ticks since `cutoff`.
    /// Callers lazily reinitialize on the next tick. Returns the
    /// released symbol names.
    pub async fn compact_idle(&self, cutoff: DateTime<Utc>) -> Vec<String> {
        let mut symbols = self.symbols.write().await;
        let mut released = Vec::new();

        let idle: Vec<String> = {
            let mut idle = Vec::new();
            for (symbol, entry) in symbols.iter() {
                let state = entry.read().await;
                if state.last_tick < cutoff {
                    idle.push(symbol.clone());
                }
            }
            idle
        };

        for symbol in idle {
            symbols.remove(&symbol);
            debug!(symbol = %symbol, "Released idle OHLC state");
            released.push(symbol);
        }
        released
    }

    pub async fn symbol_count(&self) -> usize {
        self.symbols.read().await.len()
    }

    async fn entry(&self, symbol: &str) -> Arc<RwLock<SymbolOhlc>> {
        {
            let symbols = self.symbols.read().await;
            if let Some(entry) = symbols.get(symbol) {
                return Arc::clone(entry);
            }
        }

        let mut symbols = self.symbols.write().await;
        Arc::clone(symbols.entry(symbol.to_string()).or_insert_with(|| {
            Arc::new(RwLock::new(SymbolOhlc {
                states: HashMap::new(),
                last_tick: Utc::now(),
            }))
        }))
    }
}
