//! Audit Logger - Append-only JSONL record of every mitigation

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::{create_dir_all, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::info;
use uuid::Uuid;

/// One applied or failed mitigation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MitigationRecord {
    pub timestamp: DateTime<Utc>,
    pub cycle_id: Uuid,
    /// Plan step as the solver wrote it, e.g. `BLOCK_IP IP0`
    pub action: String,
    /// Command line issued, if any
    pub command: Option<String>,
    pub success: bool,
    pub detail: String,
}

pub struct AuditLogger {
    log_path: PathBuf,
}

impl AuditLogger {
    /// Create the logger, making sure the parent directory exists
    pub async fn new(log_path: &Path) -> Result<Self> {
        if let Some(dir) = log_path.parent() {
            if !dir.as_os_str().is_empty() {
                create_dir_all(dir)
                    .await
                    .context("Failed to create audit log directory")?;
            }
        }

        info!("Audit logger initialized: {}", log_path.display());

        Ok(Self {
            log_path: log_path.to_path_buf(),
        })
    }

    pub async fn log(&self, record: &MitigationRecord) -> Result<()> {
        let json = serde_json::to_string(record)? + "\n";

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await
            .context("Failed to open audit log")?;

        file.write_all(json.as_bytes())
            .await
            .context("Failed to write audit record")?;

        file.sync_all().await.context("Failed to sync audit log")?;

        Ok(())
    }

    /// Read back every record; unparseable lines are skipped
    pub async fn read_all(&self) -> Result<Vec<MitigationRecord>> {
        if !self.log_path.exists() {
            return Ok(vec![]);
        }

        let content = tokio::fs::read_to_string(&self.log_path)
            .await
            .context("Failed to read audit log")?;

        Ok(content
            .lines()
            .filter(|line| !line.is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}
