use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chatbridge_transport::SessionCredentials;
use serde::{Deserialize, Serialize};

use crate::state_io::{current_unix_timestamp_ms, read_json_if_present, write_json_atomic};

pub const CREDENTIALS_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CredentialsFile {
    schema_version: u32,
    saved_unix_ms: u64,
    credentials: SessionCredentials,
}

#[derive(Debug, Clone)]
/// Persists the transport's opaque credential blob under `<state_dir>/auth/`.
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn for_state_dir(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join("auth").join("credentials.json"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<SessionCredentials>> {
        let Some(file) = read_json_if_present::<CredentialsFile>(&self.path)? else {
            return Ok(None);
        };
        if file.schema_version != CREDENTIALS_SCHEMA_VERSION {
            bail!(
                "unsupported credentials schema: expected {}, found {}",
                CREDENTIALS_SCHEMA_VERSION,
                file.schema_version
            );
        }
        Ok(Some(file.credentials))
    }

    pub fn save(&self, credentials: &SessionCredentials) -> Result<()> {
        let file = CredentialsFile {
            schema_version: CREDENTIALS_SCHEMA_VERSION,
            saved_unix_ms: current_unix_timestamp_ms(),
            credentials: credentials.clone(),
        };
        write_json_atomic(&self.path, &file)
            .with_context(|| format!("failed to persist credentials {}", self.path.display()))
    }

    /// Removes persisted credentials. Returns whether anything was removed.
    pub fn purge(&self) -> Result<bool> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(error) => Err(error)
                .with_context(|| format!("failed to remove {}", self.path.display())),
        }
    }
}
