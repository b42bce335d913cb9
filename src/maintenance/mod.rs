/// Background maintenance: retention sweep, OHLC compaction, order
/// expiration, deferred ledger retries
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use tracing::{error, info, warn};

use crate::bbook::BBookEngine;
use crate::data::{OhlcCache, TickBackend};
use crate::error::Result;
use crate::registry::sanitize_symbol;
use crate::types::EngineConfig;
use crate::utils::parse_day_key;

#[derive(Debug, Default, Clone)]
pub struct SweepReport {
    pub removed: usize,
    pub archived: usize,
}

pub struct RetentionSweeper {
    root: PathBuf,
    backend: Arc<dyn TickBackend>,
    retention_days: u32,
    compression_enabled: bool,
}

impl RetentionSweeper {
    pub fn new(root: PathBuf, backend: Arc<dyn TickBackend>, config: &EngineConfig) -> Self {
        RetentionSweeper {
            root,
            backend,
            retention_days: config.retention_days,
            compression_enabled: config.compression_enabled,
        }
    }

    /// One pass: every live day file older than `today - retention`
    /// is archived (compression on) or removed. Only files directly
    /// under `ticks/<SYMBOL>/` are ever touched; the archive
    /// subdirectory is out of bounds.
    pub async fn sweep_once(&self, today: NaiveDate) -> Result<SweepReport> {
        let cutoff = today - chrono::Duration::days(self.retention_days as i64);
        let mut report = SweepReport::default();

        let ticks_dir = self.root.join("ticks");
        if !ticks_dir.exists() {
            return Ok(report);
        }

        let mut symbols = tokio::fs::read_dir(&ticks_dir).await?;
        while let Ok(Some(symbol_entry)) = symbols.next_entry().await {
            let Some(symbol) = symbol_entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if sanitize_symbol(&symbol).is_err() {
                continue;
            }

            let symbol_dir = ticks_dir.join(&symbol);
            let mut files = tokio::fs::read_dir(&symbol_dir).await?;
            while let Ok(Some(entry)) = files.next_entry().await {
                let path = entry.path();
                if !path.is_file() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().to_string();
                let Some(day) = name.split('.').next().and_then(parse_day_key) else {
                    continue;
                };
                if day >= cutoff {
                    continue;
                }

                if self.compression_enabled {
                    let day_key = day.format("%Y-%m-%d").to_string();
                    match self.backend.archive_day(&symbol, &day_key).await {
                        Ok(archive) => {
                            info!(symbol = %symbol, day = %day_key, archive = %archive.display(), "Day file archived");
                            report.archived += 1;
                        }
                        Err(e) => {
                            warn!(symbol = %symbol, day = %day_key, error = %e, "Archive failed");
                        }
                    }
                } else {
                    tokio::fs::remove_file(&path).await?;
                    info!(symbol = %symbol, day = %day, "Day file removed");
                    report.removed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Periodic sweep loop
    pub async fn run(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.sweep_once(Utc::now().date_naive()).await {
                Ok(report) => {
                    if report.archived + report.removed > 0 {
                        info!(archived = report.archived, removed = report.removed, "Retention sweep finished");
                    }
                }
                Err(e) => error!(error = %e, code = e.error_code(), "Retention sweep failed"),
            }
        }
    }
}

/// Daily OHLC compaction: release hot state for symbols idle beyond
/// the configured number of days.
pub async fn run_ohlc_compaction(ohlc: Arc<OhlcCache>, idle_days: u32) {
    let mut ticker = tokio::time::interval(Duration::from_secs(86_400));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let cutoff = Utc::now() - chrono::Duration::days(idle_days as i64);
        let released = ohlc.compact_idle(cutoff).await;
        if !released.is_empty() {
            info!(count = released.len(), "OHLC state compacted");
        }
    }
}

/// Once-per-second engine housekeeping: pending-order expiration and
/// deferred close retries.
pub async fn run_engine_sweeper(engine: Arc<BBookEngine>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        engine.sweep_expired(Utc::now()).await;
        engine.retry_pending_closes().await;
    }
}

/// Guard against an unwritable data root at startup
pub async fn ensure_state_dirs(root: &Path) -> Result<()> {
    for sub in ["ticks", "ledger"] {
        let dir = root.join(sub);
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            crate::error::EngineError::UnwritableStateDir(format!("{}: {}", dir.display(), e))
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::JsonlBackend;
    use crate::types::Tick;
    use chrono::TimeZone;

    async fn seed_day(backend: &JsonlBackend, symbol: &str, day: &str) {
        let ts = Utc.from_utc_datetime(
            &parse_day_key(day).unwrap().and_hms_opt(12, 0, 0).unwrap(),
        );
        let tick = Tick {
            broker_id: 1,
            symbol: symbol.to_string(),
            bid: 1.08,
            ask: 1.0802,
            spread: 0.0002,
            timestamp: ts,
            lp_tag: "seed".to_string(),
        };
        backend.append_batch(symbol, day, &[tick]).await.unwrap();
        backend.close_day(symbol, day).await.unwrap();
    }

    #[tokio::test]
    async fn test_retention_archives_old_days() {
        // retention 30 days, today 2026-02-15, compression on:
        // 2026-01-10 moves to the archive, 2026-02-14 is untouched.
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(JsonlBackend::new(dir.path()));
        seed_day(&backend, "EURUSD", "2026-01-10").await;
        seed_day(&backend, "EURUSD", "2026-02-14").await;

        let config: crate::types::EngineConfig =
            toml::from_str("retention_days = 30\ncompression_enabled = true").unwrap();
        let sweeper = RetentionSweeper::new(
            dir.path().to_path_buf(),
            backend,
            &config,
        );

        let report = sweeper.sweep_once(parse_day_key("2026-02-15").unwrap()).await.unwrap();
        assert_eq!(report.archived, 1);
        assert_eq!(report.removed, 0);
        assert!(dir.path().join("ticks/EURUSD/archive/2026-01-10.json.gz").exists());
        assert!(!dir.path().join("ticks/EURUSD/2026-01-10.json").exists());
        assert!(dir.path().join("ticks/EURUSD/2026-02-14.json").exists());
    }

    #[tokio::test]
    async fn test_retention_removes_without_compression() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(JsonlBackend::new(dir.path()));
        seed_day(&backend, "EURUSD", "2026-01-10").await;

        let config: crate::types::EngineConfig =
            toml::from_str("retention_days = 30\ncompression_enabled = false").unwrap();
        let sweeper = RetentionSweeper::new(dir.path().to_path_buf(), backend, &config);

        let report = sweeper.sweep_once(parse_day_key("2026-02-15").unwrap()).await.unwrap();
        assert_eq!(report.removed, 1);
        assert!(!dir.path().join("ticks/EURUSD/2026-01-10.json").exists());
        assert!(!dir.path().join("ticks/EURUSD/archive/2026-01-10.json.gz").exists());
    }

    #[tokio::test]
    async fn test_archive_dir_never_reswept() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(JsonlBackend::new(dir.path()));
        seed_day(&backend, "EURUSD", "2026-01-10").await;

        let config: crate::types::EngineConfig =
            toml::from_str("retention_days = 30\ncompression_enabled = true").unwrap();
        let sweeper = RetentionSweeper::new(dir.path().to_path_buf(), backend, &config);

        let today = parse_day_key("2026-02-15").unwrap();
        sweeper.sweep_once(today).await.unwrap();
        // Second pass finds nothing: the archive is out of bounds
        let report = sweeper.sweep_once(today).await.unwrap();
        assert_eq!(report.archived, 0);
        assert!(dir.path().join("ticks/EURUSD/archive/2026-01-10.json.gz").exists());
    }
}
