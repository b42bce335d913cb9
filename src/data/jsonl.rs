/// Line-delimited JSON tick backend: one tick per line, one file per
/// UTC day per symbol
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::warn;

use super::backend::{gzip_file_blocking, symbol_dir, TickBackend};
use crate::error::{EngineError, Result};
use crate::types::Tick;

pub struct JsonlBackend {
    root: PathBuf,
    /// Open append handle per symbol for the current day
    open_files: Mutex<HashMap<String, (String, File)>>,
}

impl JsonlBackend {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        JsonlBackend {
            root: root.as_ref().to_path_buf(),
            open_files: Mutex::new(HashMap::new()),
        }
    }

    fn day_path(&self, symbol: &str, day: &str) -> Result<PathBuf> {
        Ok(symbol_dir(&self.root, symbol)?.join(format!("{}.json", day)))
    }
}

#[async_trait]
impl TickBackend for JsonlBackend {
    fn file_ext(&self) -> &'static str {
        ".json"
    }

    async fn append_batch(&self, symbol: &str, day: &str, ticks: &[Tick]) -> Result<()> {
        if ticks.is_empty() {
            return Ok(());
        }

        let mut buffer = String::with_capacity(ticks.len() * 128);
        for tick in ticks {
            buffer.push_str(&serde_json::to_string(tick)?);
            buffer.push('\n');
        }

        let mut open_files = self.open_files.lock().await;
        let needs_open = match open_files.get(symbol) {
            Some((open_day, _)) => open_day != day,
            None => true,
        };
        if needs_open {
            let path = self.day_path(symbol, day)?;
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let file = OpenOptions::new().create(true).append(true).open(&path).await?;
            open_files.insert(symbol.to_string(), (day.to_string(), file));
        }

        let (_, file) = open_files
            .get_mut(symbol)
            .ok_or_else(|| EngineError::Internal(format!("no open day file for {}", symbol)))?;
        file.write_all(buffer.as_bytes()).await?;
        file.sync_data().await?;

        Ok(())
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

        let file = File::open(&path).await?;
        let reader = BufReader::new(file);
        let mut lines = reader.lines();

        let mut ticks = Vec::new();
        while let Some(line) = lines.next_line().await? {
            match serde_json::from_str::<Tick>(&line) {
                Ok(tick) => {
                    if tick.timestamp >= from && tick.timestamp <= to {
                        ticks.push(tick);
                    }
                }
                Err(e) => {
                    warn!(symbol, day, error = %e, "Skipping unparseable tick line");
                }
            }
        }

        Ok(ticks)
    }

    async fn close_day(&self, symbol: &str, day: &str) -> Result<()> {
        let mut open_files = self.open_files.lock().await;
        if let Some((open_day, file)) = open_files.get_mut(symbol) {
            if open_day == day {
                file.sync_all().await?;
                open_files.remove(symbol);
            }
        }
        Ok(())
    }

    async fn archive_day(&self, symbol: &str, day: &str) -> Result<PathBuf> {
        self.close_day(symbol, day).await?;

        let src = self.day_path(symbol, day)?;
        let dst = symbol_dir(&self.root, symbol)?
            .join("archive")
            .join(format!("{}.json.gz", day));

        let dst_clone = dst.clone();
        tokio::task::spawn_blocking(move || gzip_file_blocking(&src, &dst_clone))
            .await
            .map_err(|e| EngineError::Internal(format!("archive task panicked: {}", e)))??;

        Ok(dst)
    }
}
