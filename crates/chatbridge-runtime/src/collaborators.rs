//! Contracts for the services the bridge core consumes but does not own.
//!
//! Audit logging, conversation history, per-contact mode persistence,
//! audience kill switches, follow-up scheduling, and AI generation all sit
//! behind these traits. File-backed implementations live in `file_stores`,
//! `audit_log`, and `openai_responder`.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chatbridge_transport::CanonicalIdentity;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::connection_supervisor::ConnectionHandle;
use crate::status_tracker::DeliveryStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Per-contact routing decision.
pub enum ConversationMode {
    #[default]
    Ai,
    Human,
    Support,
}

impl ConversationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ai => "ai",
            Self::Human => "human",
            Self::Support => "support",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `AuditEntryKind` values.
pub enum AuditEntryKind {
    Received,
    Sent,
    Suppressed,
    ModeChange,
    SendFailure,
    Error,
}

impl AuditEntryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Sent => "sent",
            Self::Suppressed => "suppressed",
            Self::ModeChange => "mode_change",
            Self::SendFailure => "send_failure",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// One append-only audit record.
pub struct AuditEntry {
    pub kind: AuditEntryKind,
    pub text: String,
    pub identity: CanonicalIdentity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl AuditEntry {
    pub fn new(kind: AuditEntryKind, identity: &CanonicalIdentity, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
            identity: identity.clone(),
            display_name: None,
            is_group: false,
            group_label: None,
            message_id: None,
            detail: None,
        }
    }
}

#[async_trait]
/// Trait contract for the append-only audit trail.
pub trait AuditLogger: Send + Sync {
    async fn log(&self, entry: AuditEntry) -> Result<()>;

    async fn update_message_status(&self, message_id: &str, status: DeliveryStatus) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationRole {
    User,
    Assistant,
}

impl ConversationRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: ConversationRole,
    pub text: String,
    #[serde(default)]
    pub unix_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSession {
    pub identity: CanonicalIdentity,
    pub chat_id: String,
    #[serde(default)]
    pub mode: ConversationMode,
    #[serde(default)]
    pub last_activity_unix_ms: u64,
    #[serde(default)]
    pub message_count: usize,
}

#[async_trait]
/// Trait contract for persisted conversation history.
pub trait ConversationStore: Send + Sync {
    async fn add_message(
        &self,
        identity: &CanonicalIdentity,
        role: ConversationRole,
        text: &str,
        chat_id: &str,
    ) -> Result<()>;

    async fn get_messages(
        &self,
        identity: &CanonicalIdentity,
        chat_id: &str,
    ) -> Result<Vec<ConversationMessage>>;

    async fn get_session(
        &self,
        identity: &CanonicalIdentity,
        chat_id: &str,
    ) -> Result<Option<ConversationSession>>;

    async fn clear_session(&self, identity: &CanonicalIdentity) -> Result<()>;

    async fn update_session_mode(
        &self,
        identity: &CanonicalIdentity,
        chat_id: &str,
        mode: ConversationMode,
    ) -> Result<()>;

    /// Drops sessions idle for longer than `max_idle`; returns how many were removed.
    async fn purge_idle_sessions(&self, max_idle: Duration) -> Result<usize>;
}

#[async_trait]
/// Trait contract for the backing persistence of per-contact modes.
pub trait ModeStore: Send + Sync {
    async fn get_mode(&self, identity: &CanonicalIdentity) -> Result<ConversationMode>;

    async fn set_mode(&self, identity: &CanonicalIdentity, mode: ConversationMode) -> Result<()>;

    async fn remove_contact(&self, identity: &CanonicalIdentity) -> Result<bool>;

    /// Every contact whose mode is not the automated default.
    async fn get_all_human_states(&self) -> Result<BTreeMap<CanonicalIdentity, ConversationMode>>;

    async fn is_human_mode(&self, identity: &CanonicalIdentity) -> Result<bool> {
        Ok(self.get_mode(identity).await? == ConversationMode::Human)
    }

    async fn is_support_mode(&self, identity: &CanonicalIdentity) -> Result<bool> {
        Ok(self.get_mode(identity).await? == ConversationMode::Support)
    }
}

#[async_trait]
/// Audience-level AI kill switches.
pub trait AudienceConfig: Send + Sync {
    async fn is_groups_ai_enabled(&self) -> Result<bool>;

    async fn is_individual_ai_enabled(&self) -> Result<bool>;
}

#[async_trait]
/// Trait contract for the external follow-up scheduler.
pub trait FollowUpScheduler: Send + Sync {
    async fn has_active_follow_up(&self, identity: &CanonicalIdentity) -> Result<bool>;

    async fn cancel_follow_up(&self, identity: &CanonicalIdentity, reason: &str) -> Result<()>;

    async fn analyze_user_response(
        &self,
        identity: &CanonicalIdentity,
        text: &str,
        history: &[ConversationMessage],
    ) -> Result<()>;

    /// (Re)arms the scheduler's timer against the live connection.
    async fn start_follow_up_timer(&self, connection: ConnectionHandle) -> Result<()>;
}

#[derive(Debug, Error)]
/// Enumerates supported `ResponderError` values.
pub enum ResponderError {
    #[error("missing API key")]
    MissingApiKey,
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("provider returned non-success status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("responder unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
/// Generates the assistant reply for a conversation.
///
/// The returned text may embed the support handoff marker; see
/// [`crate::handoff_marker::parse_ai_reply`].
pub trait AiResponder: Send + Sync {
    async fn generate_response(
        &self,
        history: &[ConversationMessage],
    ) -> Result<String, ResponderError>;
}
