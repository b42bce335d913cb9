/// Admin operations over the tick storage, and the audit trail.
/// HTTP plumbing lives outside the core; these are the callable
/// operations it exposes.
pub mod audit;

pub use audit::AuditLog;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::data::TickBackend;
use crate::error::Result;
use crate::registry::{sanitize_symbol, SymbolRegistry};
use crate::types::Tick;
use crate::utils::parse_day_key;

#[derive(Debug, Clone, Serialize)]
pub struct SymbolStorageStats {
    pub symbol: String,
    pub day_files: usize,
    pub archived_files: usize,
    pub bytes: u64,
    pub first_day: Option<NaiveDate>,
    pub last_day: Option<NaiveDate>,
    /// Calendar days between first and last with no day file
    pub gap_days: Vec<NaiveDate>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StorageStats {
    pub total_files: usize,
    pub total_bytes: u64,
    pub symbols: Vec<SymbolStorageStats>,
}

/// One imported tick row: symbol,bid,ask,timestamp,lp
#[derive(Debug, Deserialize)]
struct ImportRow {
    symbol: String,
    bid: f64,
    ask: f64,
    timestamp: chrono::DateTime<Utc>,
    #[serde(default)]
    lp: String,
}

pub struct StorageAdmin {
    root: PathBuf,
    backend: Arc<dyn TickBackend>,
    registry: Arc<SymbolRegistry>,
    audit: Arc<AuditLog>,
    broker_id: u32,
}

impl StorageAdmin {
    pub fn new(
        root: PathBuf,
        backend: Arc<dyn TickBackend>,
        registry: Arc<SymbolRegistry>,
        audit: Arc<AuditLog>,
        broker_id: u32,
    ) -> Self {
        StorageAdmin { root, backend, registry, audit, broker_id }
    }

    /// Totals, per-symbol coverage and the gap list
    pub async fn storage_stats(&self) -> Result<StorageStats> {
        let mut symbols = Vec::new();
        let mut total_files = 0usize;
        let mut total_bytes = 0u64;

        for symbol in self.symbol_dirs().await? {
            let dir = self.root.join("ticks").join(&symbol);
            let mut days: BTreeMap<NaiveDate, u64> = BTreeMap::new();
            let mut bytes = 0u64;

            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Ok(Some(entry)) = entries.next_entry().await {
                let meta = entry.metadata().await?;
                if !meta.is_file() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().to_string();
                let Some(day) = name.split('.').next().and_then(parse_day_key) else {
                    continue;
                };
                days.insert(day, meta.len());
                bytes += meta.len();
            }

            let archived_files = count_files(&dir.join("archive")).await;
            let first_day = days.keys().next().copied();
            let last_day = days.keys().last().copied();

            let mut gap_days = Vec::new();
            if let (Some(first), Some(last)) = (first_day, last_day) {
                let mut day = first;
                while day < last {
                    if !days.contains_key(&day) {
                        gap_days.push(day);
                    }
                    day = day.succ_opt().unwrap_or(last);
                }
            }

            total_files += days.len() + archived_files;
            total_bytes += bytes;
            symbols.push(SymbolStorageStats {
                symbol,
                day_files: days.len(),
                archived_files,
                bytes,
                first_day,
                last_day,
                gap_days,
            });
        }

        Ok(StorageStats { total_files, total_bytes, symbols })
    }

    /// Import ticks from a CSV file (symbol,bid,ask,timestamp,lp).
    /// Rows are validated and appended to the matching day files.
    pub async fn import_ticks(&self, csv_path: &Path) -> Result<usize> {
        let content = tokio::fs::read_to_string(csv_path).await?;
        let mut reader = csv::Reader::from_reader(content.as_bytes());

        // Group rows per (symbol, day) so each batch lands in one file
        let mut batches: BTreeMap<(String, String), Vec<Tick>> = BTreeMap::new();
        let mut imported = 0usize;
        let mut skipped = 0usize;

        for row in reader.deserialize::<ImportRow>() {
            let row = match row {
                Ok(row) => row,
                Err(e) => {
                    warn!(error = %e, "Skipping malformed import row");
                    skipped += 1;
                    continue;
                }
            };
            let Ok(symbol) = sanitize_symbol(&row.symbol) else {
                skipped += 1;
                continue;
            };
            if !(row.bid > 0.0 && row.ask >= row.bid) {
                skipped += 1;
                continue;
            }

            self.registry.autogenerate(&symbol)?;
            let tick = Tick {
                broker_id: self.broker_id,
                symbol: symbol.clone(),
                bid: row.bid,
                ask: row.ask,
                spread: row.ask - row.bid,
                timestamp: row.timestamp,
                lp_tag: if row.lp.is_empty() { "import".to_string() } else { row.lp },
            };
            let day = crate::utils::day_key(tick.timestamp);
            batches.entry((symbol, day)).or_default().push(tick);
            imported += 1;
        }

        for ((symbol, day), ticks) in batches {
            self.backend.append_batch(&symbol, &day, &ticks).await?;
            self.backend.close_day(&symbol, &day).await?;
        }

        self.audit
            .record(
                "import_ticks",
                json!({ "path": csv_path.display().to_string(), "imported": imported, "skipped": skipped }),
            )
            .await?;
        info!(imported, skipped, "Tick import finished");
        Ok(imported)
    }

    /// Remove day files strictly older than the cutoff date
    pub async fn cleanup_before(&self, cutoff: NaiveDate) -> Result<usize> {
        let mut removed = 0usize;
        for symbol in self.symbol_dirs().await? {
            for (day, path) in self.day_files(&symbol).await? {
                if day < cutoff {
                    tokio::fs::remove_file(&path).await?;
                    removed += 1;
                }
            }
        }
        self.audit
            .record("cleanup_before", json!({ "cutoff": cutoff, "removed": removed }))
            .await?;
        info!(removed, %cutoff, "Cleanup finished");
        Ok(removed)
    }

    /// Compress day files strictly older than the cutoff into the
    /// per-symbol archive
    pub async fn compress_before(&self, cutoff: NaiveDate) -> Result<usize> {
        let mut archived = 0usize;
        for symbol in self.symbol_dirs().await? {
            for (day, _path) in self.day_files(&symbol).await? {
                if day < cutoff {
                    self.backend.archive_day(&symbol, &day.format("%Y-%m-%d").to_string()).await?;
                    archived += 1;
                }
            }
        }
        self.audit
            .record("compress_before", json!({ "cutoff": cutoff, "archived": archived }))
            .await?;
        info!(archived, %cutoff, "Compression finished");
        Ok(archived)
    }

    /// Copy the tick tree into a backup directory
    pub async fn backup_to(&self, dest: &Path) -> Result<usize> {
        let mut copied = 0usize;
        for symbol in self.symbol_dirs().await? {
            let dest_dir = dest.join("ticks").join(&symbol);
            tokio::fs::create_dir_all(&dest_dir).await?;
            for (_day, path) in self.day_files(&symbol).await? {
                let Some(name) = path.file_name() else { continue };
                tokio::fs::copy(&path, dest_dir.join(name)).await?;
                copied += 1;
            }
        }
        self.audit
            .record("backup_to", json!({ "dest": dest.display().to_string(), "files": copied }))
            .await?;
        info!(copied, "Backup finished");
        Ok(copied)
    }

    /// Admin toggle, journaled to the audit trail
    pub async fn set_symbol_disabled(&self, symbol: &str, disabled: bool) -> Result<()> {
        self.registry.set_disabled(symbol, disabled)?;
        self.audit
            .record("set_symbol_disabled", json!({ "symbol": symbol, "disabled": disabled }))
            .await
    }

    async fn symbol_dirs(&self) -> Result<Vec<String>> {
        let ticks_dir = self.root.join("ticks");
        let mut symbols = Vec::new();
        if !ticks_dir.exists() {
            return Ok(symbols);
        }
        let mut entries = tokio::fs::read_dir(&ticks_dir).await?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            if let Some(name) = entry.file_name().to_str() {
                if sanitize_symbol(name).is_ok() {
                    symbols.push(name.to_string());
                }
            }
        }
        symbols.sort();
        Ok(symbols)
    }

    /// Live (unarchived) day files for a symbol
    async fn day_files(&self, symbol: &str) -> Result<Vec<(NaiveDate, PathBuf)>> {
        let dir = self.root.join("ticks").join(symbol);
        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(day) = name.split('.').next().and_then(parse_day_key) {
                files.push((day, path));
            }
        }
        files.sort();
        Ok(files)
    }
}

async fn count_files(dir: &Path) -> usize {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return 0;
    };
    let mut count = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.path().is_file() {
            count += 1;
        }
    }
    count
}
