/// Append-only ledger of balance-affecting events
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{EngineError, Result};
use crate::types::{LedgerEntry, LedgerKind};

/// Entry draft before the ledger assigns its sequence number
#[derive(Debug, Clone)]
pub struct LedgerDraft {
    pub account_id: u64,
    pub kind: LedgerKind,
    pub amount: f64,
    pub ref_position_id: Option<u64>,
    pub ref_order_id: Option<u64>,
    pub timestamp: DateTime<Utc>,
    pub note: String,
}

impl LedgerDraft {
    pub fn new(account_id: u64, kind: LedgerKind, amount: f64) -> Self {
        LedgerDraft {
            account_id,
            kind,
            amount,
            ref_position_id: None,
            ref_order_id: None,
            timestamp: Utc::now(),
            note: String::new(),
        }
    }

    pub fn with_position(mut self, position_id: u64) -> Self {
        self.ref_position_id = Some(position_id);
        self
    }

    pub fn with_order(mut self, order_id: u64) -> Self {
        self.ref_order_id = Some(order_id);
        self
    }

    pub fn with_note<S: Into<String>>(mut self, note: S) -> Self {
        self.note = note.into();
        self
    }
}

struct LedgerInner {
    file: File,
    next_seq: u64,
    /// Running checkpoint: current balance per account
    balances: HashMap<u64, f64>,
    total_entries: u64,
}

/// Single-writer append-only journal. Sequence numbers are strictly
/// increasing; writes of one batch share a single fsync. The in-memory
/// balance map is the maintained checkpoint; historical queries scan
/// the file.
pub struct Ledger {
    path: PathBuf,
    inner: Mutex<LedgerInner>,
}

impl Ledger {
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                EngineError::UnwritableStateDir(format!("{}: {}", parent.display(), e))
            })?;
        }

        let mut next_seq = 1u64;
        let mut balances: HashMap<u64, f64> = HashMap::new();
        let mut total_entries = 0u64;

        if path.exists() {
            let file = File::open(&path).await?;
            let reader = BufReader::new(file);
            let mut lines = reader.lines();
            let mut line_no = 0u64;

            while let Some(line) = lines.next_line().await? {
                line_no += 1;
                if line.trim().is_empty() {
                    continue;
                }
                let entry: LedgerEntry = serde_json::from_str(&line).map_err(|e| {
                    EngineError::CorruptLedger(format!("line {}: {}", line_no, e))
                })?;
                if entry.seq < next_seq {
                    return Err(EngineError::CorruptLedger(format!(
                        "seq {} at line {} not increasing (expected >= {})",
                        entry.seq, line_no, next_seq
                    )));
                }
                next_seq = entry.seq + 1;
                *balances.entry(entry.account_id).or_insert(0.0) += entry.amount;
                total_entries += 1;
            }

            info!(entries = total_entries, next_seq, "Ledger loaded");
        }

        let file = OpenOptions::new().create(true).append(true).open(&path).await?;

        Ok(Ledger {
            path,
            inner: Mutex::new(LedgerInner {
                file,
                next_seq,
                balances,
                total_entries,
            }),
        })
    }

    /// Append a batch of drafts. Sequence assignment, the file write
    /// and the fsync happen under the writer lock so the journal is a
    /// strict total order; the fsync is shared by the whole batch.
    pub async fn append(&self, drafts: Vec<LedgerDraft>) -> Result<Vec<LedgerEntry>> {
        if drafts.is_empty() {
            return Ok(Vec::new());
        }

        let mut inner = self.inner.lock().await;

        let mut entries = Vec::with_capacity(drafts.len());
        let mut buffer = String::new();
        for draft in drafts {
            let entry = LedgerEntry {
                seq: inner.next_seq,
                account_id: draft.account_id,
                kind: draft.kind,
                amount: draft.amount,
                ref_position_id: draft.ref_position_id,
                ref_order_id: draft.ref_order_id,
                timestamp: draft.timestamp,
                note: draft.note,
            };
            inner.next_seq += 1;
            buffer.push_str(&serde_json::to_string(&entry)?);
            buffer.push('\n');
            entries.push(entry);
        }

        inner.file.write_all(buffer.as_bytes()).await?;
        inner.file.sync_data().await?;

        for entry in &entries {
            *inner.balances.entry(entry.account_id).or_insert(0.0) += entry.amount;
            inner.total_entries += 1;
        }

        debug!(count = entries.len(), "Ledger batch committed");
        Ok(entries)
    }

    /// Append pre-sequenced entries (replay/import path). A duplicate
    /// or regressing seq rejects the whole batch.
    pub async fn append_assigned(&self, entries: Vec<LedgerEntry>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut inner = self.inner.lock().await;

        let mut expected = inner.next_seq;
        for entry in &entries {
            if entry.seq < expected {
                return Err(EngineError::CorruptLedger(format!(
                    "duplicate seq {} (next is {})",
                    entry.seq, expected
                )));
            }
            expected = entry.seq + 1;
        }

        let mut buffer = String::new();
        for entry in &entries {
            buffer.push_str(&serde_json::to_string(entry)?);
            buffer.push('\n');
        }
        inner.file.write_all(buffer.as_bytes()).await?;
        inner.file.sync_data().await?;

        for entry in &entries {
            *inner.balances.entry(entry.account_id).or_insert(0.0) += entry.amount;
            inner.total_entries += 1;
        }
        inner.next_seq = expected;

        Ok(())
    }

    /// Current balance from the maintained checkpoint
    pub async fn balance(&self, account_id: u64) -> f64 {
        let inner = self.inner.lock().await;
        inner.balances.get(&account_id).copied().unwrap_or(0.0)
    }

    /// Balance as of `t`: scan of entries with timestamp <= t
    pub async fn balance_at(&self, account_id: u64, t: DateTime<Utc>) -> Result<f64> {
        let entries = self.scan(|e| e.account_id == account_id && e.timestamp <= t).await?;
        Ok(entries.iter().map(|e| e.amount).sum())
    }

    /// Most recent entries for an account, newest first
    pub async fn entries_for(&self, account_id: u64, limit: usize) -> Result<Vec<LedgerEntry>> {
        let mut entries = self.scan(|e| e.account_id == account_id).await?;
        entries.reverse();
        entries.truncate(limit);
        Ok(entries)
    }

    pub async fn next_seq(&self) -> u64 {
        self.inner.lock().await.next_seq
    }

    pub async fn total_entries(&self) -> u64 {
        self.inner.lock().await.total_entries
    }

    async fn scan<F: Fn(&LedgerEntry) -> bool>(&self, keep: F) -> Result<Vec<LedgerEntry>> {
        // Hold the writer lock so the scan sees a consistent prefix
        let _guard = self.inner.lock().await;

        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.path).await?;
        let reader = BufReader::new(file);
        let mut lines = reader.lines();

        let mut out = Vec::new();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(entry) = serde_json::from_str::<LedgerEntry>(&line) {
                if keep(&entry) {
                    out.push(entry);
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_balance_is_sum_of_entries() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(dir.path().join("ledger/ledger.log")).await.unwrap();

        ledger
            .append(vec![
                LedgerDraft::new(1, LedgerKind::Deposit, 1000.0),
                LedgerDraft::new(1, LedgerKind::Commission, -7.0),
                LedgerDraft::new(2, LedgerKind::Deposit, 500.0),
            ])
            .await
            .unwrap();
        ledger
            .append(vec![LedgerDraft::new(1, LedgerKind::TradePnl, -21.0)])
            .await
            .unwrap();

        assert!((ledger.balance(1).await - 972.0).abs() < 1e-9);
        assert!((ledger.balance(2).await - 500.0).abs() < 1e-9);
        assert_eq!(ledger.balance(3).await, 0.0);
    }

    #[tokio::test]
    async fn test_seq_strictly_increasing() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(dir.path().join("ledger.log")).await.unwrap();

        let entries = ledger
            .append(vec![
                LedgerDraft::new(1, LedgerKind::Deposit, 100.0),
                LedgerDraft::new(1, LedgerKind::Deposit, 100.0),
            ])
            .await
            .unwrap();
        assert_eq!(entries[0].seq, 1);
        assert_eq!(entries[1].seq, 2);
        assert_eq!(ledger.next_seq().await, 3);
    }

    #[tokio::test]
    async fn test_reload_rebuilds_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.log");

        {
            let ledger = Ledger::open(&path).await.unwrap();
            ledger
                .append(vec![LedgerDraft::new(1, LedgerKind::Deposit, 250.0)])
                .await
                .unwrap();
        }

        let reopened = Ledger::open(&path).await.unwrap();
        assert!((reopened.balance(1).await - 250.0).abs() < 1e-9);
        assert_eq!(reopened.next_seq().await, 2);
    }

    #[tokio::test]
    async fn test_duplicate_seq_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(dir.path().join("ledger.log")).await.unwrap();

        let entries = ledger
            .append(vec![LedgerDraft::new(1, LedgerKind::Deposit, 100.0)])
            .await
            .unwrap();

        // Re-processing the same batch must be rejected
        let result = ledger.append_assigned(entries).await;
        assert!(matches!(result, Err(EngineError::CorruptLedger(_))));
    }

    #[tokio::test]
    async fn test_corrupt_file_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.log");
        std::fs::write(&path, "this is not json\n").unwrap();

        let result = Ledger::open(&path).await;
        assert!(matches!(result, Err(EngineError::CorruptLedger(_))));
    }

    #[tokio::test]
    async fn test_balance_at_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(dir.path().join("ledger.log")).await.unwrap();

        let t0 = Utc::now();
        let mut early = LedgerDraft::new(1, LedgerKind::Deposit, 100.0);
        early.timestamp = t0 - chrono::Duration::hours(2);
        let mut late = LedgerDraft::new(1, LedgerKind::Deposit, 50.0);
        late.timestamp = t0 + chrono::Duration::hours(2);
        ledger.append(vec![early, late]).await.unwrap();

        assert!((ledger.balance_at(1, t0).await.unwrap() - 100.0).abs() < 1e-9);
        assert!(
            (ledger.balance_at(1, t0 + chrono::Duration::days(1)).await.unwrap() - 150.0).abs()
                < 1e-9
        );
    }
}
