/// Append-only audit trail of admin actions, JSON per line
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub params: serde_json::Value,
}

pub struct AuditLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl AuditLog {
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path).await?;
        Ok(AuditLog { path, file: Mutex::new(file) })
    }

    pub async fn record(&self, action: &str, params: serde_json::Value) -> Result<()> {
        let record = AuditRecord {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            action: action.to_string(),
            params,
        };
        let line = serde_json::to_string(&record)?;

        let mut file = self.file.lock().await;
        file.write_all(format!("{}\n", line).as_bytes()).await?;
        file.sync_data().await?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
