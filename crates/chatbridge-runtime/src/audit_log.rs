use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::collaborators::{AuditEntry, AuditLogger};
use crate::state_io::{
    append_jsonl_line, current_unix_timestamp_ms, read_json_if_present, write_json_atomic,
    LogRotationPolicy,
};
use crate::status_tracker::DeliveryStatus;

pub const AUDIT_LOG_FILE_NAME: &str = "audit-log.jsonl";
pub const MESSAGE_STATUS_FILE_NAME: &str = "message-status.json";
pub const MESSAGE_STATUS_SCHEMA_VERSION: u32 = 1;
const MAX_TRACKED_MESSAGE_STATUSES: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// One line of `audit-log.jsonl`.
pub struct AuditRecord {
    pub timestamp_unix_ms: u64,
    #[serde(flatten)]
    pub entry: AuditEntry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageStatusRecord {
    pub status: DeliveryStatus,
    pub updated_unix_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MessageStatusFile {
    schema_version: u32,
    #[serde(default)]
    statuses: BTreeMap<String, MessageStatusRecord>,
}

impl Default for MessageStatusFile {
    fn default() -> Self {
        Self {
            schema_version: MESSAGE_STATUS_SCHEMA_VERSION,
            statuses: BTreeMap::new(),
        }
    }
}

/// `AuditLogger` writing JSONL audit records and a message-status index.
pub struct JsonlAuditLog {
    log_path: PathBuf,
    status_path: PathBuf,
    rotation: LogRotationPolicy,
    lock: Mutex<()>,
}

impl JsonlAuditLog {
    pub fn for_state_dir(state_dir: &Path, rotation: LogRotationPolicy) -> Self {
        Self {
            log_path: state_dir.join(AUDIT_LOG_FILE_NAME),
            status_path: state_dir.join(MESSAGE_STATUS_FILE_NAME),
            rotation,
            lock: Mutex::new(()),
        }
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    fn load_statuses(&self) -> Result<MessageStatusFile> {
        let file = read_json_if_present::<MessageStatusFile>(&self.status_path)?.unwrap_or_default();
        if file.schema_version != MESSAGE_STATUS_SCHEMA_VERSION {
            bail!(
                "unsupported message status schema: expected {}, found {}",
                MESSAGE_STATUS_SCHEMA_VERSION,
                file.schema_version
            );
        }
        Ok(file)
    }

    pub async fn message_status(&self, message_id: &str) -> Result<Option<MessageStatusRecord>> {
        let _guard = self.lock.lock().await;
        Ok(self.load_statuses()?.statuses.get(message_id).copied())
    }
}

/// Reads every record from an audit log, oldest first.
pub fn read_audit_records(path: &Path) -> Result<Vec<AuditRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    raw.lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(index, line)| {
            serde_json::from_str::<AuditRecord>(line).with_context(|| {
                format!("failed to parse {} record {}", path.display(), index + 1)
            })
        })
        .collect()
}

#[async_trait]
impl AuditLogger for JsonlAuditLog {
    async fn log(&self, entry: AuditEntry) -> Result<()> {
        let record = AuditRecord {
            timestamp_unix_ms: current_unix_timestamp_ms(),
            entry,
        };
        let line = serde_json::to_string(&record).context("failed to encode audit record")?;
        let _guard = self.lock.lock().await;
        append_jsonl_line(&self.log_path, &line, self.rotation)
    }

    async fn update_message_status(&self, message_id: &str, status: DeliveryStatus) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut file = self.load_statuses()?;
        // The in-memory tracker starts empty after a restart; never regress what is on disk.
        if file
            .statuses
            .get(message_id)
            .is_some_and(|stored| stored.status >= status)
        {
            return Ok(());
        }
        file.statuses.insert(
            message_id.to_string(),
            MessageStatusRecord {
                status,
                updated_unix_ms: current_unix_timestamp_ms(),
            },
        );
        if file.statuses.len() > MAX_TRACKED_MESSAGE_STATUSES {
            let mut by_age = file
                .statuses
                .iter()
                .map(|(id, record)| (record.updated_unix_ms, id.clone()))
                .collect::<Vec<_>>();
            by_age.sort();
            let excess = file.statuses.len() - MAX_TRACKED_MESSAGE_STATUSES;
            for (_, id) in by_age.into_iter().take(excess) {
                file.statuses.remove(&id);
            }
        }
        write_json_atomic(&self.status_path, &file)
            .with_context(|| format!("failed to persist status for message {message_id}"))
    }
}
