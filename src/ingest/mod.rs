/// Quote ingestion coordinator: the sole writer into the tick store,
/// OHLC cache, broadcast hub and B-book evaluations
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bbook::BBookEngine;
use crate::data::{OhlcCache, TickStore};
use crate::error::{EngineError, Result};
use crate::hub::BroadcastHub;
use crate::registry::{sanitize_symbol, SymbolRegistry};
use crate::types::{EngineConfig, Quote, Tick};

pub struct IngestStats {
    pub accepted: u64,
    pub rejected: u64,
    pub clamped: u64,
}

/// Routes each accepted quote through one bounded stream per symbol,
/// so a symbol's consumers (ring, OHLC, hub, B-book) always observe
/// its ticks in order while different symbols run in parallel.
pub struct QuoteIngestor {
    registry: Arc<SymbolRegistry>,
    tick_store: Arc<TickStore>,
    ohlc: Arc<OhlcCache>,
    hub: Arc<BroadcastHub>,
    bbook: Arc<BBookEngine>,

    broker_id: u32,
    clock_skew: chrono::Duration,
    queue_capacity: usize,

    workers: RwLock<HashMap<String, mpsc::Sender<Tick>>>,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
    /// Last accepted timestamp per (symbol, lp_tag), for the
    /// monotonicity clamp
    last_seen: Mutex<HashMap<(String, String), i64>>,

    accepted: AtomicU64,
    rejected: AtomicU64,
    clamped: AtomicU64,
}

impl QuoteIngestor {
    pub fn new(
        registry: Arc<SymbolRegistry>,
        tick_store: Arc<TickStore>,
        ohlc: Arc<OhlcCache>,
        hub: Arc<BroadcastHub>,
        bbook: Arc<BBookEngine>,
        config: &EngineConfig,
    ) -> Self {
        QuoteIngestor {
            registry,
            tick_store,
            ohlc,
            hub,
            bbook,
            broker_id: config.broker_id,
            clock_skew: chrono::Duration::seconds(config.quote_clock_skew_secs as i64),
            queue_capacity: config.ingest_queue_capacity,
            workers: RwLock::new(HashMap::new()),
            worker_handles: Mutex::new(Vec::new()),
            last_seen: Mutex::new(HashMap::new()),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            clamped: AtomicU64::new(0),
        }
    }

    /// Validate and normalize one LP quote, then hand it to the
    /// symbol's worker stream.
    pub async fn ingest(&self, quote: Quote) -> Result<()> {
        let symbol = sanitize_symbol(&quote.symbol).inspect_err(|_| {
            self.rejected.fetch_add(1, Ordering::Relaxed);
        })?;

        if !(quote.bid.is_finite() && quote.ask.is_finite())
            || quote.bid <= 0.0
            || quote.ask < quote.bid
        {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(EngineError::InvalidPrice(format!(
                "{}: bid {} / ask {}",
                symbol, quote.bid, quote.ask
            )));
        }

        // Clamp wild clocks to now, then enforce per-(symbol, lp)
        // monotonicity
        let now = Utc::now();
        let mut ts = quote.ts;
        if (ts - now).abs() > self.clock_skew {
            warn!(symbol = %symbol, lp = %quote.lp_tag, quote_ts = %ts, "Quote timestamp outside skew window, clamped to now");
            ts = now;
            self.clamped.fetch_add(1, Ordering::Relaxed);
        }
        {
            let mut last_seen = self.last_seen.lock().await;
            let key = (symbol.clone(), quote.lp_tag.clone());
            let ts_ms = ts.timestamp_millis();
            match last_seen.get_mut(&key) {
                Some(last) if *last > ts_ms => {
                    debug!(symbol = %symbol, lp = %quote.lp_tag, "Backward timestamp clamped");
                    ts = chrono::DateTime::from_timestamp_millis(*last).unwrap_or(now);
                    self.clamped.fetch_add(1, Ordering::Relaxed);
                }
                Some(last) => *last = ts_ms,
                None => {
                    last_seen.insert(key, ts_ms);
                }
            }
        }

        if !self.registry.contains(&symbol) {
            self.registry.autogenerate(&symbol)?;
        }

        let tick = Tick {
            broker_id: self.broker_id,
            symbol: symbol.clone(),
            bid: quote.bid,
            ask: quote.ask,
            spread: quote.ask - quote.bid,
            timestamp: ts,
            lp_tag: quote.lp_tag,
        };

        let tx = self.worker(&symbol).await;
        tx.send(tick)
            .await
            .map_err(|_| EngineError::Unavailable(format!("ingest stream closed for {}", symbol)))?;
        self.accepted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Consume quotes from an adapter channel until it closes
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<Quote>) {
        info!("Quote ingestion started");
        while let Some(quote) = rx.recv().await {
            if let Err(e) = self.ingest(quote).await {
                debug!(error = %e, code = e.error_code(), "Quote rejected");
            }
        }
        info!("Quote channel closed, ingestion stopped");
    }

    pub fn stats(&self) -> IngestStats {
        IngestStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            clamped: self.clamped.load(Ordering::Relaxed),
        }
    }

    /// Drain the per-symbol streams within the deadline
    pub async fn shutdown(&self, deadline: Duration) {
        {
            let mut workers = self.workers.write().await;
            workers.clear();
        }
        let handles: Vec<JoinHandle<()>> = {
            let mut worker_handles = self.worker_handles.lock().await;
            worker_handles.drain(..).collect()
        };
        let drain = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(deadline, drain).await.is_err() {
            warn!("Ingest drain deadline exceeded");
        }
    }

    async fn worker(&self, symbol: &str) -> mpsc::Sender<Tick> {
        {
            let workers = self.workers.read().await;
            if let Some(tx) = workers.get(symbol) {
                return tx.clone();
            }
        }

        let mut workers = self.workers.write().await;
        if let Some(tx) = workers.get(symbol) {
            return tx.clone();
        }

        let (tx, mut rx) = mpsc::channel::<Tick>(self.queue_capacity);
        let tick_store = Arc::clone(&self.tick_store);
        let ohlc = Arc::clone(&self.ohlc);
        let hub = Arc::clone(&self.hub);
        let bbook = Arc::clone(&self.bbook);
        let worker_symbol = symbol.to_string();

        let handle = tokio::spawn(async move {
            while let Some(tick) = rx.recv().await {
                // Order matters: store (ring) first so GetRecent sees
                // the tick before any subscriber does, then OHLC, the
                // hub fan-out, and the B-book evaluation last.
                if let Err(e) = tick_store.store_tick(tick.clone()).await {
                    warn!(symbol = %worker_symbol, error = %e, "Tick rejected by store");
                    continue;
                }
                ohlc.on_tick(&tick).await;
                hub.broadcast_tick(&tick).await;
                bbook.on_tick(&tick.symbol, tick.bid, tick.ask, tick.timestamp).await;
            }
            debug!(symbol = %worker_symbol, "Ingest worker drained");
        });

        workers.insert(symbol.to_string(), tx.clone());
        self.worker_handles.lock().await.push(handle);
        debug!(symbol, "Ingest worker started");
        tx
    }
}
