/// Tick store: per-symbol hot ring + single writer task per symbol
/// draining a bounded queue into daily files
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::backend::TickBackend;
use super::tick_ring::TickRing;
use crate::error::{EngineError, Result};
use crate::registry::sanitize_symbol;
use crate::types::{EngineConfig, Tick};
use crate::utils::day_key;

/// Hard cap applied to `get_range` limits
pub const RANGE_HARD_CAP: usize = 50_000;

/// Attempts per batch before it is dropped and counted
const WRITE_ATTEMPTS: u32 = 4;
const WRITE_BACKOFF_BASE_MS: u64 = 100;

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct TickStoreStats {
    pub accepted: u64,
    pub rejected: u64,
    pub dropped_writes: u64,
    pub failed_batches: u64,
}

struct SymbolSlot {
    ring: RwLock<TickRing>,
    write_tx: Mutex<Option<mpsc::Sender<Tick>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    tick_count: AtomicU64,
}

pub struct TickStore {
    root: PathBuf,
    backend: Arc<dyn TickBackend>,
    ring_capacity: usize,
    write_queue_capacity: usize,
    write_batch_max: usize,
    write_batch_interval: Duration,

    slots: RwLock<HashMap<String, Arc<SymbolSlot>>>,
    draining: AtomicBool,

    accepted: AtomicU64,
    rejected: AtomicU64,
    dropped_writes: AtomicU64,
    failed_batches: Arc<AtomicU64>,
}

impl TickStore {
    pub fn new<P: AsRef<Path>>(root: P, backend: Arc<dyn TickBackend>, config: &EngineConfig) -> Self {
        TickStore {
            root: root.as_ref().to_path_buf(),
            backend,
            ring_capacity: config.ring_capacity,
            write_queue_capacity: config.write_queue_capacity,
            write_batch_max: config.write_batch_max,
            write_batch_interval: Duration::from_millis(config.write_batch_interval_ms),
            slots: RwLock::new(HashMap::new()),
            draining: AtomicBool::new(false),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            dropped_writes: AtomicU64::new(0),
            failed_batches: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Synchronous hot path: validate, append to the ring, enqueue for
    /// the writer. Never performs disk I/O; a full write queue counts
    /// a drop but the ring is always updated, so real-time consumers
    /// still see the tick and the call still succeeds.
    pub async fn store_tick(&self, tick: Tick) -> Result<()> {
        validate_tick(&tick).inspect_err(|_| {
            self.rejected.fetch_add(1, Ordering::Relaxed);
        })?;

        let slot = self.slot(&tick.symbol).await;

        {
            let mut ring = slot.ring.write().await;
            ring.push(tick.clone());
        }
        slot.tick_count.fetch_add(1, Ordering::Relaxed);
        self.accepted.fetch_add(1, Ordering::Relaxed);

        if self.draining.load(Ordering::Relaxed) {
            return Ok(());
        }

        let tx = slot.write_tx.lock().await;
        if let Some(tx) = tx.as_ref() {
            if let Err(e) = tx.try_send(tick) {
                let total = self.dropped_writes.fetch_add(1, Ordering::Relaxed) + 1;
                match e {
                    mpsc::error::TrySendError::Full(t) => {
                        warn!(
                            symbol = %t.symbol,
                            dropped_total = total,
                            "Write queue full, tick not persisted"
                        );
                    }
                    mpsc::error::TrySendError::Closed(t) => {
                        warn!(symbol = %t.symbol, "Write queue closed, tick not persisted");
                    }
                }
            }
        }

        Ok(())
    }

    /// Most recent ticks from the ring, newest first
    pub async fn get_recent(&self, symbol: &str, limit: usize) -> Vec<Tick> {
        let slots = self.slots.read().await;
        match slots.get(symbol) {
            Some(slot) => slot.ring.read().await.recent(limit),
            None => Vec::new(),
        }
    }

    /// Latest tick for a symbol, if any has been seen this session
    pub async fn latest(&self, symbol: &str) -> Option<Tick> {
        let slots = self.slots.read().await;
        let slot = slots.get(symbol)?;
        let ring = slot.ring.read().await;
        ring.last().cloned()
    }

    /// Range query across daily files, oldest first. Offset is clamped
    /// to >= 0 by type, limit to the hard cap. Ticks still sitting in
    /// the current write batch may be missed; the result is eventually
    /// consistent.
    pub async fn get_range(
        &self,
        symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Tick>> {
        let symbol = sanitize_symbol(symbol)?;
        let limit = limit.clamp(1, RANGE_HARD_CAP);

        let mut out = Vec::new();
        let mut to_skip = offset;

        let mut day = from.date_naive();
        let last_day = to.date_naive();
        while day <= last_day {
            let ticks = self
                .backend
                .read_range(&symbol, &day.format("%Y-%m-%d").to_string(), from, to)
                .await?;
            for tick in ticks {
                if to_skip > 0 {
                    to_skip -= 1;
                    continue;
                }
                out.push(tick);
                if out.len() >= limit {
                    return Ok(out);
                }
            }
            day = day.succ_opt().ok_or_else(|| {
                EngineError::Internal("date overflow in range query".to_string())
            })?;
        }

        Ok(out)
    }

    /// Known symbols: union of live slots and on-disk directories
    pub async fn get_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = {
            let slots = self.slots.read().await;
            slots.keys().cloned().collect()
        };

        let ticks_dir = self.root.join("ticks");
        if let Ok(mut entries) = tokio::fs::read_dir(&ticks_dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                if let Some(name) = entry.file_name().to_str() {
                    if sanitize_symbol(name).is_ok() && !symbols.iter().any(|s| s == name) {
                        symbols.push(name.to_string());
                    }
                }
            }
        }

        symbols.sort();
        symbols
    }

    /// Ticks accepted for a symbol this session
    pub async fn get_tick_count(&self, symbol: &str) -> u64 {
        let slots = self.slots.read().await;
        slots
            .get(symbol)
            .map(|s| s.tick_count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn stats(&self) -> TickStoreStats {
        TickStoreStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            dropped_writes: self.dropped_writes.load(Ordering::Relaxed),
            failed_batches: self.failed_batches.load(Ordering::Relaxed),
        }
    }

    pub fn backend(&self) -> Arc<dyn TickBackend> {
        Arc::clone(&self.backend)
    }

    /// Stop accepting writes and drain every symbol's queue within the
    /// deadline. Ticks still in flight after the deadline are lost
    /// (crash semantics documented for the last unflushed batch).
    pub async fn shutdown(&self, deadline: Duration) {
        self.draining.store(true, Ordering::Relaxed);

        let slots: Vec<Arc<SymbolSlot>> = {
            let slots = self.slots.read().await;
            slots.values().cloned().collect()
        };

        let mut handles = Vec::new();
        for slot in &slots {
            slot.write_tx.lock().await.take();
            if let Some(handle) = slot.writer.lock().await.take() {
                handles.push(handle);
            }
        }

        let drain = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(deadline, drain).await.is_err() {
            warn!("Tick store drain deadline exceeded, unflushed batches lost");
        } else {
            info!("Tick store drained");
        }
    }

    async fn slot(&self, symbol: &str) -> Arc<SymbolSlot> {
        {
            let slots = self.slots.read().await;
            if let Some(slot) = slots.get(symbol) {
                return Arc::clone(slot);
            }
        }

        let mut slots = self.slots.write().await;
        if let Some(slot) = slots.get(symbol) {
            return Arc::clone(slot);
        }

        let (tx, rx) = mpsc::channel(self.write_queue_capacity);
        let writer = tokio::spawn(writer_loop(
            symbol.to_string(),
            rx,
            Arc::clone(&self.backend),
            self.write_batch_max,
            self.write_batch_interval,
            Arc::clone(&self.failed_batches),
        ));

        let slot = Arc::new(SymbolSlot {
            ring: RwLock::new(TickRing::new(self.ring_capacity)),
            write_tx: Mutex::new(Some(tx)),
            writer: Mutex::new(Some(writer)),
            tick_count: AtomicU64::new(0),
        });
        slots.insert(symbol.to_string(), Arc::clone(&slot));
        debug!(symbol, "Created tick store slot");
        slot
    }
}

fn validate_tick(tick: &Tick) -> Result<()> {
    if !tick.bid.is_finite() || !tick.ask.is_finite() || !tick.spread.is_finite() {
        return Err(EngineError::InvalidPrice(format!(
            "{}: non-finite quote",
            tick.symbol
        )));
    }
    if tick.bid <= 0.0 || tick.ask < tick.bid {
        return Err(EngineError::InvalidPrice(format!(
            "{}: bid {} / ask {}",
            tick.symbol, tick.bid, tick.ask
        )));
    }
    Ok(())
}

/// Single writer per symbol: batch by size/time, rotate on UTC day
/// change, retry failed appends with backoff and drop the batch once
/// the budget is exhausted. Never blocks the hot path.
async fn writer_loop(
    symbol: String,
    mut rx: mpsc::Receiver<Tick>,
    backend: Arc<dyn TickBackend>,
    batch_max: usize,
    batch_interval: Duration,
    failed_batches: Arc<AtomicU64>,
) {
    let mut batch: Vec<Tick> = Vec::with_capacity(batch_max);
    let mut open_day: Option<String> = None;

    loop {
        tokio::select! {
            maybe_tick = rx.recv() => match maybe_tick {
                Some(tick) => {
                    batch.push(tick);
                    if batch.len() >= batch_max {
                        flush(&symbol, &mut batch, &mut open_day, &backend, &failed_batches).await;
                    }
                }
                None => {
                    flush(&symbol, &mut batch, &mut open_day, &backend, &failed_batches).await;
                    if let Some(day) = open_day.take() {
                        let _ = backend.close_day(&symbol, &day).await;
                    }
                    debug!(symbol, "Writer drained and exiting");
                    return;
                }
            },
            _ = tokio::time::sleep(batch_interval), if !batch.is_empty() => {
                flush(&symbol, &mut batch, &mut open_day, &backend, &failed_batches).await;
            }
        }
    }
}

async fn flush(
    symbol: &str,
    batch: &mut Vec<Tick>,
    open_day: &mut Option<String>,
    backend: &Arc<dyn TickBackend>,
    failed_batches: &Arc<AtomicU64>,
) {
    if batch.is_empty() {
        return;
    }

    // Split the batch at UTC day boundaries so a tick at exactly
    // 00:00:00 lands in the new day's file.
    let drained: Vec<Tick> = batch.drain(..).collect();
    let mut group: Vec<Tick> = Vec::with_capacity(drained.len());
    let mut group_day: Option<String> = None;

    for tick in drained {
        let day = day_key(tick.timestamp);
        if group_day.as_deref() != Some(day.as_str()) {
            if let Some(prev_day) = group_day.take() {
                commit(symbol, &prev_day, &group, backend, failed_batches).await;
                group.clear();
                let _ = backend.close_day(symbol, &prev_day).await;
            }
            if let Some(prev_open) = open_day.as_deref() {
                if prev_open != day {
                    let _ = backend.close_day(symbol, prev_open).await;
                    info!(symbol, day = %day, "Rotated to new daily tick file");
                }
            }
            *open_day = Some(day.clone());
            group_day = Some(day);
        }
        group.push(tick);
    }

    if let Some(day) = group_day {
        commit(symbol, &day, &group, backend, failed_batches).await;
    }
}

async fn commit(
    symbol: &str,
    day: &str,
    ticks: &[Tick],
    backend: &Arc<dyn TickBackend>,
    failed_batches: &Arc<AtomicU64>,
) {
    for attempt in 0..WRITE_ATTEMPTS {
        match backend.append_batch(symbol, day, ticks).await {
            Ok(()) => return,
            Err(e) => {
                if attempt + 1 == WRITE_ATTEMPTS {
                    failed_batches.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        symbol,
                        day,
                        dropped = ticks.len(),
                        error = %e,
                        code = e.error_code(),
                        "Batch write failed, dropping batch"
                    );
                    return;
                }
                let backoff = WRITE_BACKOFF_BASE_MS << attempt;
                warn!(symbol, day, attempt, error = %e, "Batch write failed, retrying");
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }
        }
    }
}
