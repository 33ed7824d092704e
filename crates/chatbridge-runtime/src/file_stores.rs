//! File-backed collaborator implementations rooted at the bridge state dir.
//!
//! Each store re-reads its JSON document on every call so operator edits
//! and external writers are picked up without a restart. Writes go through
//! `write_json_atomic` while holding the store's async lock.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chatbridge_transport::CanonicalIdentity;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::collaborators::{
    AudienceConfig, ConversationMessage, ConversationMode, ConversationRole, ConversationSession,
    ConversationStore, FollowUpScheduler, ModeStore,
};
use crate::connection_supervisor::ConnectionHandle;
use crate::state_io::{current_unix_timestamp_ms, read_json_if_present, write_json_atomic};

pub const MODE_STORE_SCHEMA_VERSION: u32 = 1;
pub const MODE_STORE_FILE_NAME: &str = "modes.json";
pub const CONVERSATION_STORE_SCHEMA_VERSION: u32 = 1;
pub const CONVERSATION_STORE_FILE_NAME: &str = "conversations.json";
pub const DEFAULT_HISTORY_WINDOW: usize = 20;
pub const AUDIENCE_POLICY_SCHEMA_VERSION: u32 = 1;
pub const AUDIENCE_POLICY_FILE_NAME: &str = "audience-policy.json";

fn ensure_schema(found: u32, expected: u32, label: &str) -> Result<()> {
    if found != expected {
        bail!("unsupported {label} schema: expected {expected}, found {found}");
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ModeRecord {
    mode: ConversationMode,
    updated_unix_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ModeStoreFile {
    schema_version: u32,
    #[serde(default)]
    contacts: BTreeMap<CanonicalIdentity, ModeRecord>,
}

impl Default for ModeStoreFile {
    fn default() -> Self {
        Self {
            schema_version: MODE_STORE_SCHEMA_VERSION,
            contacts: BTreeMap::new(),
        }
    }
}

/// `ModeStore` persisted to `<state_dir>/modes.json`.
///
/// Only non-default modes are stored; a contact set back to AI is removed.
pub struct JsonModeStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonModeStore {
    pub fn for_state_dir(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join(MODE_STORE_FILE_NAME),
            lock: Mutex::new(()),
        }
    }

    fn load(&self) -> Result<ModeStoreFile> {
        let file = read_json_if_present::<ModeStoreFile>(&self.path)?.unwrap_or_default();
        ensure_schema(file.schema_version, MODE_STORE_SCHEMA_VERSION, "mode store")?;
        Ok(file)
    }
}

#[async_trait]
impl ModeStore for JsonModeStore {
    async fn get_mode(&self, identity: &CanonicalIdentity) -> Result<ConversationMode> {
        let _guard = self.lock.lock().await;
        Ok(self
            .load()?
            .contacts
            .get(identity)
            .map(|record| record.mode)
            .unwrap_or_default())
    }

    async fn set_mode(&self, identity: &CanonicalIdentity, mode: ConversationMode) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut file = self.load()?;
        if mode == ConversationMode::Ai {
            file.contacts.remove(identity);
        } else {
            file.contacts.insert(
                identity.clone(),
                ModeRecord {
                    mode,
                    updated_unix_ms: current_unix_timestamp_ms(),
                },
            );
        }
        write_json_atomic(&self.path, &file)
            .with_context(|| format!("failed to persist mode for {identity}"))
    }

    async fn remove_contact(&self, identity: &CanonicalIdentity) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let mut file = self.load()?;
        if file.contacts.remove(identity).is_none() {
            return Ok(false);
        }
        write_json_atomic(&self.path, &file)?;
        Ok(true)
    }

    async fn get_all_human_states(&self) -> Result<BTreeMap<CanonicalIdentity, ConversationMode>> {
        let _guard = self.lock.lock().await;
        Ok(self
            .load()?
            .contacts
            .into_iter()
            .filter(|(_, record)| record.mode != ConversationMode::Ai)
            .map(|(identity, record)| (identity, record.mode))
            .collect())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredSession {
    chat_id: String,
    #[serde(default)]
    mode: ConversationMode,
    #[serde(default)]
    last_activity_unix_ms: u64,
    #[serde(default)]
    message_count: usize,
    #[serde(default)]
    messages: Vec<ConversationMessage>,
}

impl StoredSession {
    fn new(chat_id: &str) -> Self {
        Self {
            chat_id: chat_id.to_string(),
            mode: ConversationMode::Ai,
            last_activity_unix_ms: current_unix_timestamp_ms(),
            message_count: 0,
            messages: Vec::new(),
        }
    }

    fn summary(&self, identity: &CanonicalIdentity) -> ConversationSession {
        ConversationSession {
            identity: identity.clone(),
            chat_id: self.chat_id.clone(),
            mode: self.mode,
            last_activity_unix_ms: self.last_activity_unix_ms,
            message_count: self.message_count,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConversationStoreFile {
    schema_version: u32,
    #[serde(default)]
    sessions: BTreeMap<CanonicalIdentity, StoredSession>,
}

impl Default for ConversationStoreFile {
    fn default() -> Self {
        Self {
            schema_version: CONVERSATION_STORE_SCHEMA_VERSION,
            sessions: BTreeMap::new(),
        }
    }
}

/// `ConversationStore` persisted to `<state_dir>/conversations.json`.
///
/// Sessions are keyed by canonical identity; the chat id of the latest
/// message is kept so replies reach the address the customer last used.
/// History is trimmed to the most recent `history_window` messages.
pub struct JsonConversationStore {
    path: PathBuf,
    history_window: usize,
    lock: Mutex<()>,
}

impl JsonConversationStore {
    pub fn for_state_dir(state_dir: &Path, history_window: usize) -> Self {
        Self {
            path: state_dir.join(CONVERSATION_STORE_FILE_NAME),
            history_window: history_window.max(1),
            lock: Mutex::new(()),
        }
    }

    fn load(&self) -> Result<ConversationStoreFile> {
        let file = read_json_if_present::<ConversationStoreFile>(&self.path)?.unwrap_or_default();
        ensure_schema(
            file.schema_version,
            CONVERSATION_STORE_SCHEMA_VERSION,
            "conversation store",
        )?;
        Ok(file)
    }

    fn save(&self, file: &ConversationStoreFile) -> Result<()> {
        write_json_atomic(&self.path, file)
    }
}

#[async_trait]
impl ConversationStore for JsonConversationStore {
    async fn add_message(
        &self,
        identity: &CanonicalIdentity,
        role: ConversationRole,
        text: &str,
        chat_id: &str,
    ) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut file = self.load()?;
        let now = current_unix_timestamp_ms();
        let session = file
            .sessions
            .entry(identity.clone())
            .or_insert_with(|| StoredSession::new(chat_id));
        session.chat_id = chat_id.to_string();
        session.last_activity_unix_ms = now;
        session.message_count = session.message_count.saturating_add(1);
        session.messages.push(ConversationMessage {
            role,
            text: text.to_string(),
            unix_ms: now,
        });
        if session.messages.len() > self.history_window {
            let overflow = session.messages.len() - self.history_window;
            session.messages.drain(..overflow);
        }
        self.save(&file)
            .with_context(|| format!("failed to append {} message for {identity}", role.as_str()))
    }

    async fn get_messages(
        &self,
        identity: &CanonicalIdentity,
        _chat_id: &str,
    ) -> Result<Vec<ConversationMessage>> {
        let _guard = self.lock.lock().await;
        Ok(self
            .load()?
            .sessions
            .get(identity)
            .map(|session| session.messages.clone())
            .unwrap_or_default())
    }

    async fn get_session(
        &self,
        identity: &CanonicalIdentity,
        _chat_id: &str,
    ) -> Result<Option<ConversationSession>> {
        let _guard = self.lock.lock().await;
        Ok(self
            .load()?
            .sessions
            .get(identity)
            .map(|session| session.summary(identity)))
    }

    async fn clear_session(&self, identity: &CanonicalIdentity) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut file = self.load()?;
        if file.sessions.remove(identity).is_some() {
            self.save(&file)?;
        }
        Ok(())
    }

    async fn update_session_mode(
        &self,
        identity: &CanonicalIdentity,
        chat_id: &str,
        mode: ConversationMode,
    ) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut file = self.load()?;
        let session = file
            .sessions
            .entry(identity.clone())
            .or_insert_with(|| StoredSession::new(chat_id));
        session.mode = mode;
        self.save(&file)
    }

    async fn purge_idle_sessions(&self, max_idle: Duration) -> Result<usize> {
        let _guard = self.lock.lock().await;
        let mut file = self.load()?;
        let max_idle_ms = u64::try_from(max_idle.as_millis()).unwrap_or(u64::MAX);
        let cutoff = current_unix_timestamp_ms().saturating_sub(max_idle_ms);
        let before = file.sessions.len();
        file.sessions
            .retain(|_, session| session.last_activity_unix_ms >= cutoff);
        let removed = before - file.sessions.len();
        if removed > 0 {
            self.save(&file)?;
        }
        Ok(removed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// Public struct `AudiencePolicyFile` used across chatbridge components.
pub struct AudiencePolicyFile {
    pub schema_version: u32,
    #[serde(default, rename = "groupsAiEnabled")]
    pub groups_ai_enabled: bool,
    #[serde(default = "default_individual_ai_enabled", rename = "individualAiEnabled")]
    pub individual_ai_enabled: bool,
}

fn default_individual_ai_enabled() -> bool {
    true
}

impl Default for AudiencePolicyFile {
    fn default() -> Self {
        Self {
            schema_version: AUDIENCE_POLICY_SCHEMA_VERSION,
            groups_ai_enabled: false,
            individual_ai_enabled: true,
        }
    }
}

pub fn audience_policy_path_for_state_dir(state_dir: &Path) -> PathBuf {
    state_dir.join("security").join(AUDIENCE_POLICY_FILE_NAME)
}

pub fn load_audience_policy_for_state_dir(state_dir: &Path) -> Result<AudiencePolicyFile> {
    let path = audience_policy_path_for_state_dir(state_dir);
    load_audience_policy_file(&path)
        .with_context(|| format!("failed to load audience policy {}", path.display()))
}

pub fn load_audience_policy_file(path: &Path) -> Result<AudiencePolicyFile> {
    let Some(policy) = read_json_if_present::<AudiencePolicyFile>(path)? else {
        return Ok(AudiencePolicyFile::default());
    };
    ensure_schema(
        policy.schema_version,
        AUDIENCE_POLICY_SCHEMA_VERSION,
        "audience policy",
    )?;
    Ok(policy)
}

/// `AudienceConfig` that re-reads the policy file on every query.
pub struct FileAudienceConfig {
    state_dir: PathBuf,
}

impl FileAudienceConfig {
    pub fn for_state_dir(state_dir: &Path) -> Self {
        Self {
            state_dir: state_dir.to_path_buf(),
        }
    }
}

#[async_trait]
impl AudienceConfig for FileAudienceConfig {
    async fn is_groups_ai_enabled(&self) -> Result<bool> {
        Ok(load_audience_policy_for_state_dir(&self.state_dir)?.groups_ai_enabled)
    }

    async fn is_individual_ai_enabled(&self) -> Result<bool> {
        Ok(load_audience_policy_for_state_dir(&self.state_dir)?.individual_ai_enabled)
    }
}

#[derive(Debug, Clone, Copy, Default)]
/// Follow-up scheduler that never schedules anything.
pub struct NoopFollowUpScheduler;

#[async_trait]
impl FollowUpScheduler for NoopFollowUpScheduler {
    async fn has_active_follow_up(&self, _identity: &CanonicalIdentity) -> Result<bool> {
        Ok(false)
    }

    async fn cancel_follow_up(&self, _identity: &CanonicalIdentity, _reason: &str) -> Result<()> {
        Ok(())
    }

    async fn analyze_user_response(
        &self,
        _identity: &CanonicalIdentity,
        _text: &str,
        _history: &[ConversationMessage],
    ) -> Result<()> {
        Ok(())
    }

    async fn start_follow_up_timer(&self, connection: ConnectionHandle) -> Result<()> {
        tracing::debug!(
            state = connection.state().as_str(),
            "follow-up scheduling disabled"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chatbridge_transport::{canonical_identity, CanonicalIdentity};
    use tempfile::tempdir;

    use super::{
        load_audience_policy_for_state_dir, AudiencePolicyFile, FileAudienceConfig,
        JsonConversationStore, JsonModeStore, NoopFollowUpScheduler,
    };
    use crate::collaborators::{
        AudienceConfig, ConversationMode, ConversationRole, ConversationStore, FollowUpScheduler,
        ModeStore,
    };

    fn identity(raw: &str) -> CanonicalIdentity {
        canonical_identity(raw).expect("identity")
    }

    #[tokio::test]
    async fn functional_json_mode_store_persists_non_default_modes() {
        let temp = tempdir().expect("tempdir");
        let store = JsonModeStore::for_state_dir(temp.path());
        let ana = identity("15550001111@s.whatsapp.net");
        let bo = identity("15550002222@s.whatsapp.net");

        assert_eq!(store.get_mode(&ana).await.expect("mode"), ConversationMode::Ai);
        store
            .set_mode(&ana, ConversationMode::Human)
            .await
            .expect("human");
        store
            .set_mode(&bo, ConversationMode::Support)
            .await
            .expect("support");
        assert!(store.is_human_mode(&ana).await.expect("human check"));
        assert!(store.is_support_mode(&bo).await.expect("support check"));

        let reopened = JsonModeStore::for_state_dir(temp.path());
        let states = reopened.get_all_human_states().await.expect("states");
        assert_eq!(states.len(), 2);
        assert_eq!(states.get(&ana), Some(&ConversationMode::Human));

        reopened
            .set_mode(&ana, ConversationMode::Ai)
            .await
            .expect("back to ai");
        assert!(reopened.remove_contact(&bo).await.expect("remove"));
        assert!(!reopened.remove_contact(&bo).await.expect("remove again"));
        assert!(reopened
            .get_all_human_states()
            .await
            .expect("states")
            .is_empty());
    }

    #[tokio::test]
    async fn functional_json_conversation_store_bounds_history_and_tracks_sessions() {
        let temp = tempdir().expect("tempdir");
        let store = JsonConversationStore::for_state_dir(temp.path(), 3);
        let ana = identity("15550001111@s.whatsapp.net");
        let chat = "15550001111@s.whatsapp.net";
        for index in 0..5 {
            let role = if index % 2 == 0 {
                ConversationRole::User
            } else {
                ConversationRole::Assistant
            };
            store
                .add_message(&ana, role, &format!("message {index}"), chat)
                .await
                .expect("add");
        }
        let messages = store.get_messages(&ana, chat).await.expect("messages");
        assert_eq!(
            messages
                .iter()
                .map(|message| message.text.as_str())
                .collect::<Vec<_>>(),
            vec!["message 2", "message 3", "message 4"]
        );

        store
            .update_session_mode(&ana, chat, ConversationMode::Support)
            .await
            .expect("mode");
        let session = store
            .get_session(&ana, chat)
            .await
            .expect("session")
            .expect("present");
        assert_eq!(session.message_count, 5);
        assert_eq!(session.mode, ConversationMode::Support);

        store.clear_session(&ana).await.expect("clear");
        assert!(store.get_session(&ana, chat).await.expect("session").is_none());
        assert!(store.get_messages(&ana, chat).await.expect("messages").is_empty());
    }

    #[tokio::test]
    async fn functional_purge_idle_sessions_removes_only_stale_sessions() {
        let temp = tempdir().expect("tempdir");
        let store = JsonConversationStore::for_state_dir(temp.path(), 20);
        let ana = identity("15550001111@s.whatsapp.net");
        store
            .add_message(&ana, ConversationRole::User, "hi", "15550001111@s.whatsapp.net")
            .await
            .expect("add");
        assert_eq!(
            store
                .purge_idle_sessions(Duration::from_secs(3600))
                .await
                .expect("purge"),
            0
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            store
                .purge_idle_sessions(Duration::from_millis(1))
                .await
                .expect("purge"),
            1
        );
    }

    #[tokio::test]
    async fn unit_audience_policy_defaults_when_file_missing() {
        let temp = tempdir().expect("tempdir");
        let policy = load_audience_policy_for_state_dir(temp.path()).expect("policy");
        assert_eq!(policy, AudiencePolicyFile::default());
        let config = FileAudienceConfig::for_state_dir(temp.path());
        assert!(!config.is_groups_ai_enabled().await.expect("groups"));
        assert!(config.is_individual_ai_enabled().await.expect("individual"));
    }

    #[tokio::test]
    async fn functional_audience_policy_is_reread_on_each_query() {
        let temp = tempdir().expect("tempdir");
        let config = FileAudienceConfig::for_state_dir(temp.path());
        std::fs::create_dir_all(temp.path().join("security")).expect("mkdir");
        let path = temp.path().join("security/audience-policy.json");
        std::fs::write(&path, r#"{"schema_version":1,"groupsAiEnabled":true}"#).expect("write");
        assert!(config.is_groups_ai_enabled().await.expect("groups"));
        assert!(config.is_individual_ai_enabled().await.expect("individual default"));

        std::fs::write(
            &path,
            r#"{"schema_version":1,"groupsAiEnabled":false,"individualAiEnabled":false}"#,
        )
        .expect("rewrite");
        assert!(!config.is_groups_ai_enabled().await.expect("groups"));
        assert!(!config.is_individual_ai_enabled().await.expect("individual"));
    }

    #[tokio::test]
    async fn regression_audience_policy_rejects_unknown_schema() {
        let temp = tempdir().expect("tempdir");
        std::fs::create_dir_all(temp.path().join("security")).expect("mkdir");
        std::fs::write(
            temp.path().join("security/audience-policy.json"),
            r#"{"schema_version":2,"groupsAiEnabled":true}"#,
        )
        .expect("write");
        let error = FileAudienceConfig::for_state_dir(temp.path())
            .is_groups_ai_enabled()
            .await
            .expect_err("schema mismatch");
        assert!(format!("{error:#}").contains("unsupported audience policy schema"));
    }

    #[tokio::test]
    async fn unit_noop_follow_up_scheduler_reports_nothing_active() {
        let scheduler = NoopFollowUpScheduler;
        let ana = identity("15550001111@s.whatsapp.net");
        assert!(!scheduler.has_active_follow_up(&ana).await.expect("active"));
        scheduler
            .cancel_follow_up(&ana, "customer_replied")
            .await
            .expect("cancel");
    }
}
