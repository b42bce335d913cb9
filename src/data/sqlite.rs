/// SQLite tick backend: one database file per UTC day per symbol
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection};

use super::backend::{gzip_file_blocking, symbol_dir, TickBackend};
use crate::error::{EngineError, Result};
use crate::types::Tick;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS ticks (
    ts      INTEGER NOT NULL,
    bid     REAL NOT NULL,
    ask     REAL NOT NULL,
    spread  REAL NOT NULL,
    lp      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_ticks_ts ON ticks (ts);
";

pub struct SqliteBackend {
    root: PathBuf,
    broker_id: u32,
}

impl SqliteBackend {
    pub fn new<P: AsRef<Path>>(root: P, broker_id: u32) -> Self {
        SqliteBackend {
            root: root.as_ref().to_path_buf(),
            broker_id,
        }
    }

    fn day_path(&self, symbol: &str, day: &str) -> Result<PathBuf> {
        Ok(symbol_dir(&self.root, symbol)?.join(format!("{}.sqlite", day)))
    }
}

#[async_trait]
impl TickBackend for SqliteBackend {
    fn file_ext(&self) -> &'static str {
        ".sqlite"
    }

    async fn append_batch(&self, symbol: &str, day: &str, ticks: &[Tick]) -> Result<()> {
        if ticks.is_empty() {
            return Ok(());
        }

        let path = self.day_path(symbol, day)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let rows: Vec<(i64, f64, f64, f64, String)> = ticks
            .iter()
            .map(|t| (t.timestamp.timestamp_millis(), t.bid, t.ask, t.spread, t.lp_tag.clone()))
            .collect();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut conn = Connection::open(&path)?;
            conn.execute_batch(SCHEMA)?;

            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO ticks (ts, bid, ask, spread, lp) VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                for (ts, bid, ask, spread, lp) in &rows {
                    stmt.execute(params![ts, bid, ask, spread, lp])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
        .map_err(|e| EngineError::Internal(format!("sqlite append task panicked: {}", e)))?
    }

    async fn read_range(
        &self,
        symbol: &str,
        day: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Tick>> {
        let path = self.day_path(symbol, day)?;
        if !path.exists() {
            return Ok(Vec::new());
        }

        let symbol = symbol.to_string();
        let broker_id = self.broker_id;
        let (from_ms, to_ms) = (from.timestamp_millis(), to.timestamp_millis());

        tokio::task::spawn_blocking(move || -> Result<Vec<Tick>> {
            let conn = Connection::open(&path)?;
            let mut stmt = conn.prepare_cached(
                "SELECT ts, bid, ask, spread, lp FROM ticks
                 WHERE ts >= ?1 AND ts <= ?2 ORDER BY ts ASC, rowid ASC",
            )?;

            let rows = stmt.query_map(params![from_ms, to_ms], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?;

            let mut ticks = Vec::new();
            for row in rows {
                let (ts, bid, ask, spread, lp) = row?;
                let timestamp = Utc
                    .timestamp_millis_opt(ts)
                    .single()
                    .unwrap_or_else(Utc::now);
                ticks.push(Tick {
                    broker_id,
                    symbol: symbol.clone(),
                    bid,
                    ask,
                    spread,
                    timestamp,
                    lp_tag: lp,
                });
            }
            Ok(ticks)
        })
        .await
        .map_err(|e| EngineError::Internal(format!("sqlite read task panicked: {}", e)))?
    }

    async fn close_day(&self, _symbol: &str, _day: &str) -> Result<()> {
        // Connections are opened per batch; nothing held open
        Ok(())
    }

    async fn archive_day(&self, symbol: &str, day: &str) -> Result<PathBuf> {
        let src = self.day_path(symbol, day)?;
        let dst = symbol_dir(&self.root, symbol)?
            .join("archive")
            .join(format!("{}.sqlite.gz", day));

        let dst_clone = dst.clone();
        tokio::task::spawn_blocking(move || gzip_file_blocking(&src, &dst_clone))
            .await
            .map_err(|e| EngineError::Internal(format!("archive task panicked: {}", e)))??;

        Ok(dst)
    }
}
