//! File persistence helpers shared by bridge state stores.
//!
//! State documents are written with temp file + rename so external readers and
//! `chatbridge status` never observe partial JSON. Audit logs are append-only
//! JSONL files rotated by size.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

const DEFAULT_ROTATION_MAX_BYTES: u64 = 10 * 1024 * 1024;
const DEFAULT_ROTATION_MAX_FILES: usize = 5;

/// Returns the current Unix timestamp in milliseconds.
pub fn current_unix_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

fn ensure_parent_dir(path: &Path) -> Result<&Path> {
    let parent = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)
        .with_context(|| format!("failed to create {}", parent.display()))?;
    Ok(parent)
}

/// Serializes `value` as pretty JSON and replaces `path` atomically.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if path.as_os_str().is_empty() {
        bail!("destination path cannot be empty");
    }
    if path.is_dir() {
        bail!("destination path '{}' is a directory", path.display());
    }
    let mut payload = serde_json::to_string_pretty(value)
        .with_context(|| format!("failed to serialize {}", path.display()))?;
    payload.push('\n');

    let parent = ensure_parent_dir(path)?;
    let temp_path = parent.join(format!(
        ".{}.tmp-{}-{}",
        path.file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("state"),
        std::process::id(),
        current_unix_timestamp_ms()
    ));
    std::fs::write(&temp_path, payload)
        .with_context(|| format!("failed to write temporary file {}", temp_path.display()))?;
    std::fs::rename(&temp_path, path).with_context(|| {
        format!(
            "failed to move {} into place at {}",
            temp_path.display(),
            path.display()
        )
    })?;
    Ok(())
}

/// Reads a JSON document, returning `None` when the file does not exist.
pub fn read_json_if_present<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let parsed = serde_json::from_str::<T>(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(parsed))
}

/// Size-based rotation settings for append-only logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRotationPolicy {
    pub max_bytes: u64,
    pub max_files: usize,
}

impl Default for LogRotationPolicy {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_ROTATION_MAX_BYTES,
            max_files: DEFAULT_ROTATION_MAX_FILES,
        }
    }
}

impl LogRotationPolicy {
    /// Reads `CHATBRIDGE_LOG_ROTATION_MAX_BYTES`/`_MAX_FILES`, ignoring zero or garbage.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let max_bytes = std::env::var("CHATBRIDGE_LOG_ROTATION_MAX_BYTES")
            .ok()
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(defaults.max_bytes);
        let max_files = std::env::var("CHATBRIDGE_LOG_ROTATION_MAX_FILES")
            .ok()
            .and_then(|raw| raw.trim().parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(defaults.max_files);
        Self {
            max_bytes,
            max_files,
        }
    }
}

fn backup_path(path: &Path, index: usize) -> PathBuf {
    PathBuf::from(format!("{}.{index}", path.display()))
}

fn rotate(path: &Path, policy: LogRotationPolicy) -> Result<()> {
    if policy.max_files <= 1 {
        std::fs::remove_file(path)
            .with_context(|| format!("failed to truncate {}", path.display()))?;
        return Ok(());
    }
    for index in (1..policy.max_files).rev() {
        let source = if index == 1 {
            path.to_path_buf()
        } else {
            backup_path(path, index - 1)
        };
        if !source.exists() {
            continue;
        }
        let destination = backup_path(path, index);
        if destination.exists() {
            std::fs::remove_file(&destination).with_context(|| {
                format!("failed to replace rotated log {}", destination.display())
            })?;
        }
        std::fs::rename(&source, &destination).with_context(|| {
            format!(
                "failed to rotate {} to {}",
                source.display(),
                destination.display()
            )
        })?;
    }
    Ok(())
}

/// Appends one JSON line, rotating first when the line would overflow `max_bytes`.
pub fn append_jsonl_line(path: &Path, line: &str, policy: LogRotationPolicy) -> Result<()> {
    ensure_parent_dir(path)?;
    if path.exists() {
        let current = std::fs::metadata(path)
            .with_context(|| format!("failed to stat {}", path.display()))?
            .len();
        let incoming = u64::try_from(line.len().saturating_add(1)).unwrap_or(u64::MAX);
        if current > 0 && current.saturating_add(incoming) > policy.max_bytes {
            rotate(path, policy)?;
        }
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    writeln!(file, "{line}").with_context(|| format!("failed to append {}", path.display()))?;
    file.flush()
        .with_context(|| format!("failed to flush {}", path.display()))?;
    Ok(())
}
