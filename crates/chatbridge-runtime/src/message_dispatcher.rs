//! Inbound message dispatch: filter chain, AI round trip, reply, audit.
//!
//! Every inbound message runs the same ordered chain and stops at the first
//! exclusion. Failures never escape a dispatch cycle: send failures are
//! categorized and logged, anything else triggers a generic apology.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use chatbridge_transport::{
    canonical_identity, is_group_address, CanonicalIdentity, RawInboundMessage, TransportError,
    TransportErrorKind,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;

use crate::collaborators::{
    AiResponder, AudienceConfig, AuditEntry, AuditEntryKind, AuditLogger, ConversationMessage,
    ConversationMode, ConversationRole, ConversationStore, FollowUpScheduler, ModeStore,
};
use crate::connection_supervisor::{ConnectionHandle, MessageEvent};
use crate::handoff_marker::{parse_ai_reply, HandoffRequest};
use crate::mode_gate::ModeGate;
use crate::state_io::current_unix_timestamp_ms;
use crate::status_tracker::StatusTracker;

pub const DEFAULT_PROCESSED_MESSAGE_CAP: usize = 512;
pub const DEFAULT_GROUP_LABEL: &str = "Group";
pub const DEFAULT_APOLOGY_TEXT: &str =
    "Sorry, we could not process your message right now. Please try again in a few minutes.";
pub const FOLLOW_UP_CANCEL_REASON: &str = "customer_replied";

#[derive(Debug, Clone, PartialEq, Eq)]
/// Public struct `DispatcherConfig` used across chatbridge components.
pub struct DispatcherConfig {
    pub processed_message_cap: usize,
    pub apology_text: String,
    pub default_group_label: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            processed_message_cap: DEFAULT_PROCESSED_MESSAGE_CAP,
            apology_text: DEFAULT_APOLOGY_TEXT.to_string(),
            default_group_label: DEFAULT_GROUP_LABEL.to_string(),
        }
    }
}

#[derive(Clone)]
/// External services the dispatcher consumes.
pub struct DispatcherCollaborators {
    pub logger: Arc<dyn AuditLogger>,
    pub conversations: Arc<dyn ConversationStore>,
    pub modes: Arc<dyn ModeStore>,
    pub audience: Arc<dyn AudienceConfig>,
    pub follow_ups: Arc<dyn FollowUpScheduler>,
    pub responder: Arc<dyn AiResponder>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A message that survived the payload filters, normalized for one dispatch cycle.
pub struct InboundMessage {
    pub identity: CanonicalIdentity,
    pub chat_address: String,
    pub raw_text: String,
    pub is_group: bool,
    pub group_label: Option<String>,
    pub display_name: String,
    pub message_id: Option<String>,
}

impl InboundMessage {
    fn audit(&self, kind: AuditEntryKind, text: impl Into<String>) -> AuditEntry {
        let mut entry = AuditEntry::new(kind, &self.identity, text);
        entry.display_name = Some(self.display_name.clone());
        entry.is_group = self.is_group;
        entry.group_label = self.group_label.clone();
        entry
    }

    /// Label used when recording outbound traffic.
    fn audience_label(&self) -> &str {
        self.group_label.as_deref().unwrap_or(&self.display_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Enumerates supported `SendFailureCategory` values.
pub enum SendFailureCategory {
    ChatNotFound,
    RecipientNotRegistered,
    SessionNotAuthenticated,
    DeliveryFailed,
}

impl SendFailureCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ChatNotFound => "chat_not_found",
            Self::RecipientNotRegistered => "recipient_not_registered",
            Self::SessionNotAuthenticated => "session_not_authenticated",
            Self::DeliveryFailed => "delivery_failed",
        }
    }

    pub fn operator_message(self) -> &'static str {
        match self {
            Self::ChatNotFound => "chat not found",
            Self::RecipientNotRegistered => "recipient is not registered on the platform",
            Self::SessionNotAuthenticated => "messaging session is not authenticated",
            Self::DeliveryFailed => "message could not be delivered",
        }
    }
}

pub fn categorize_send_failure(error: &TransportError) -> SendFailureCategory {
    match error.kind {
        TransportErrorKind::ChatNotFound => SendFailureCategory::ChatNotFound,
        TransportErrorKind::RecipientNotRegistered => SendFailureCategory::RecipientNotRegistered,
        TransportErrorKind::NotAuthenticated | TransportErrorKind::NotConnected => {
            SendFailureCategory::SessionNotAuthenticated
        }
        TransportErrorKind::Timeout | TransportErrorKind::Protocol | TransportErrorKind::Io => {
            SendFailureCategory::DeliveryFailed
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Enumerates supported `IgnoreReason` values.
pub enum IgnoreReason {
    SelfEcho,
    EmptyPayload,
    Duplicate,
    Unaddressable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Enumerates supported `SuppressionReason` values.
pub enum SuppressionReason {
    ModeNotAi(ConversationMode),
    GroupsAiDisabled,
    IndividualAiDisabled,
}

impl SuppressionReason {
    fn note(self) -> String {
        match self {
            Self::ModeNotAi(mode) => format!("auto-reply suppressed: contact is in {} mode", mode.as_str()),
            Self::GroupsAiDisabled => "auto-reply suppressed: AI disabled for groups".to_string(),
            Self::IndividualAiDisabled => {
                "auto-reply suppressed: AI disabled for direct chats".to_string()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Enumerates supported `DispatchOutcome` values.
pub enum DispatchOutcome {
    Ignored(IgnoreReason),
    Suppressed(SuppressionReason),
    Replied { message_id: String, handoff: bool },
    SendFailed(SendFailureCategory),
    Apologized { delivered: bool },
}

/// Bounded FIFO of transport message ids already dispatched.
pub struct ProcessedMessageIndex {
    cap: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl ProcessedMessageIndex {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.seen.contains(key)
    }

    /// Returns false when `key` was already recorded.
    pub fn mark_processed(&mut self, key: &str) -> bool {
        if !self.seen.insert(key.to_string()) {
            return false;
        }
        self.order.push_back(key.to_string());
        while self.order.len() > self.cap {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

type IdentityLock = Arc<tokio::sync::Mutex<()>>;

struct DispatcherInner {
    config: DispatcherConfig,
    collaborators: DispatcherCollaborators,
    mode_gate: ModeGate,
    status_tracker: Arc<StatusTracker>,
    connection: ConnectionHandle,
    processed: Mutex<ProcessedMessageIndex>,
    identity_locks: Mutex<HashMap<CanonicalIdentity, IdentityLock>>,
}

#[derive(Clone)]
/// Routes inbound messages through the decision chain and replies via the live connection.
pub struct MessageDispatcher {
    inner: Arc<DispatcherInner>,
}

impl MessageDispatcher {
    pub fn new(
        config: DispatcherConfig,
        collaborators: DispatcherCollaborators,
        status_tracker: Arc<StatusTracker>,
        connection: ConnectionHandle,
    ) -> Self {
        let mode_gate = ModeGate::new(Arc::clone(&collaborators.modes));
        let processed = ProcessedMessageIndex::new(config.processed_message_cap);
        Self {
            inner: Arc::new(DispatcherInner {
                config,
                collaborators,
                mode_gate,
                status_tracker,
                connection,
                processed: Mutex::new(processed),
                identity_locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn mode_gate(&self) -> &ModeGate {
        &self.inner.mode_gate
    }

    /// Consumes message events until the supervisor side of the channel closes.
    ///
    /// Each inbound message is dispatched on its own task. Messages from one
    /// identity run in arrival order; in-flight dispatches are awaited before
    /// returning.
    pub async fn run(&self, mut events: mpsc::Receiver<MessageEvent>) {
        let mut in_flight = JoinSet::new();
        let mut queue_tails = HashMap::<CanonicalIdentity, oneshot::Receiver<()>>::new();
        while let Some(event) = events.recv().await {
            while let Some(finished) = in_flight.try_join_next() {
                if let Err(error) = finished {
                    tracing::error!(error = %error, "dispatch task ended abnormally");
                }
            }
            // A closed tail means that identity has nothing queued or running.
            queue_tails.retain(|_, tail| {
                matches!(tail.try_recv(), Err(oneshot::error::TryRecvError::Empty))
            });
            match event {
                MessageEvent::Upserted(messages) => {
                    for message in messages {
                        let dispatcher = self.clone();
                        let Some(identity) = canonical_identity(&message.remote_address) else {
                            in_flight.spawn(async move {
                                dispatcher.dispatch(message).await;
                            });
                            continue;
                        };
                        let (done, tail) = oneshot::channel::<()>();
                        let previous = queue_tails.insert(identity, tail);
                        in_flight.spawn(async move {
                            if let Some(previous) = previous {
                                // Resolves once the earlier dispatch drops its sender.
                                let _ = previous.await;
                            }
                            dispatcher.dispatch(message).await;
                            drop(done);
                        });
                    }
                }
                MessageEvent::StatusUpdated(updates) => {
                    for update in updates {
                        if let Err(error) = self
                            .inner
                            .status_tracker
                            .apply_status(&update.message_id, update.status_code)
                            .await
                        {
                            tracing::warn!(
                                message_id = %update.message_id,
                                error = %error,
                                "failed to persist delivery status"
                            );
                        }
                    }
                }
            }
        }
        while let Some(finished) = in_flight.join_next().await {
            if let Err(error) = finished {
                tracing::error!(error = %error, "dispatch task ended abnormally");
            }
        }
    }

    pub async fn dispatch(&self, raw: RawInboundMessage) -> DispatchOutcome {
        if self.is_self_echo(&raw) {
            return DispatchOutcome::Ignored(IgnoreReason::SelfEcho);
        }
        let Some(text) = raw
            .text
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty())
        else {
            return DispatchOutcome::Ignored(IgnoreReason::EmptyPayload);
        };
        if let Some(message_id) = raw.message_id.as_deref() {
            if !lock_or_recover(&self.inner.processed).mark_processed(message_id) {
                tracing::debug!(message_id, "skipping already dispatched message");
                return DispatchOutcome::Ignored(IgnoreReason::Duplicate);
            }
        }
        let Some(identity) = canonical_identity(&raw.remote_address) else {
            return DispatchOutcome::Ignored(IgnoreReason::Unaddressable);
        };

        let lock = self.identity_lock(&identity);
        let outcome = {
            let _sequenced = lock.lock().await;
            let message = self.resolve_inbound(identity.clone(), &raw, text).await;
            self.dispatch_resolved(&message).await
        };
        self.release_identity_lock(&identity, lock);
        outcome
    }

    fn is_self_echo(&self, raw: &RawInboundMessage) -> bool {
        if raw.from_me {
            return true;
        }
        let Some(own) = self.inner.connection.own_identity() else {
            return false;
        };
        let sender = raw
            .participant_address
            .as_deref()
            .unwrap_or(&raw.remote_address);
        canonical_identity(sender).is_some_and(|sender| sender == own)
    }

    fn identity_lock(&self, identity: &CanonicalIdentity) -> IdentityLock {
        let mut locks = lock_or_recover(&self.inner.identity_locks);
        Arc::clone(locks.entry(identity.clone()).or_default())
    }

    fn release_identity_lock(&self, identity: &CanonicalIdentity, lock: IdentityLock) {
        let mut locks = lock_or_recover(&self.inner.identity_locks);
        // Map entry plus ours: no other dispatch is waiting on this identity.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(identity);
        }
    }

    async fn resolve_inbound(
        &self,
        identity: CanonicalIdentity,
        raw: &RawInboundMessage,
        text: &str,
    ) -> InboundMessage {
        let is_group = is_group_address(&raw.remote_address);
        let group_label = if is_group {
            Some(self.resolve_group_label(&raw.remote_address).await)
        } else {
            None
        };
        let display_name = raw
            .push_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| identity.to_string());
        InboundMessage {
            identity,
            chat_address: raw.remote_address.clone(),
            raw_text: text.to_string(),
            is_group,
            group_label,
            display_name,
            message_id: raw.message_id.clone(),
        }
    }

    async fn resolve_group_label(&self, group_address: &str) -> String {
        match self.inner.connection.group_metadata(group_address).await {
            Ok(metadata) if !metadata.subject.trim().is_empty() => metadata.subject.trim().to_string(),
            Ok(_) => self.inner.config.default_group_label.clone(),
            Err(error) => {
                tracing::debug!(group = group_address, error = %error, "group label unavailable");
                self.inner.config.default_group_label.clone()
            }
        }
    }

    async fn dispatch_resolved(&self, message: &InboundMessage) -> DispatchOutcome {
        let mut received = message.audit(AuditEntryKind::Received, message.raw_text.clone());
        received.message_id = message.message_id.clone();
        self.audit(received).await;

        match self.reply_chain(message).await {
            Ok(outcome) => outcome,
            Err(error) => self.apologize(message, error).await,
        }
    }

    async fn reply_chain(&self, message: &InboundMessage) -> Result<DispatchOutcome> {
        let collaborators = &self.inner.collaborators;
        let identity = &message.identity;

        let mode = self
            .inner
            .mode_gate
            .mode(identity)
            .await
            .context("failed to read conversation mode")?;
        if mode != ConversationMode::Ai {
            return Ok(self.suppress(message, SuppressionReason::ModeNotAi(mode)).await);
        }

        let audience_enabled = if message.is_group {
            collaborators.audience.is_groups_ai_enabled().await
        } else {
            collaborators.audience.is_individual_ai_enabled().await
        }
        .context("failed to read audience AI policy")?;
        if !audience_enabled {
            let reason = if message.is_group {
                SuppressionReason::GroupsAiDisabled
            } else {
                SuppressionReason::IndividualAiDisabled
            };
            return Ok(self.suppress(message, reason).await);
        }

        self.cancel_pending_follow_up(identity).await;

        // The user turn is stored only once it has an answer, so a failed round
        // trip leaves the history as it was.
        let mut history = collaborators
            .conversations
            .get_messages(identity, &message.chat_address)
            .await
            .context("failed to load conversation history")?;
        history.push(ConversationMessage {
            role: ConversationRole::User,
            text: message.raw_text.clone(),
            unix_ms: current_unix_timestamp_ms(),
        });
        let raw_reply = collaborators
            .responder
            .generate_response(&history)
            .await
            .context("AI responder failed")?;

        let parsed = parse_ai_reply(&raw_reply);
        let handoff = parsed.handoff == Some(HandoffRequest::Support);
        if handoff {
            let change = self
                .inner
                .mode_gate
                .request_handoff(identity)
                .await
                .context("failed to switch contact to support mode")?;
            collaborators
                .conversations
                .update_session_mode(identity, &message.chat_address, ConversationMode::Support)
                .await
                .context("failed to update session mode")?;
            self.audit(message.audit(
                AuditEntryKind::ModeChange,
                format!(
                    "mode {} -> {} (support handoff requested)",
                    change.previous.as_str(),
                    change.current.as_str()
                ),
            ))
            .await;
        }
        collaborators
            .conversations
            .add_message(identity, ConversationRole::User, &message.raw_text, &message.chat_address)
            .await
            .context("failed to record user message")?;
        collaborators
            .conversations
            .add_message(
                identity,
                ConversationRole::Assistant,
                &parsed.text,
                &message.chat_address,
            )
            .await
            .context("failed to record assistant reply")?;

        let sent = match self
            .inner
            .connection
            .send_text(&message.chat_address, &parsed.text)
            .await
        {
            Ok(sent) => sent,
            Err(error) => return Ok(self.record_send_failure(message, &error).await),
        };

        let mut entry = message.audit(AuditEntryKind::Sent, parsed.text.clone());
        entry.display_name = Some(message.audience_label().to_string());
        entry.message_id = Some(sent.message_id.clone());
        self.audit(entry).await;
        tracing::info!(
            identity = %identity,
            message_id = %sent.message_id,
            handoff,
            "reply sent"
        );

        if let Err(error) = collaborators
            .follow_ups
            .analyze_user_response(identity, &message.raw_text, &history)
            .await
        {
            tracing::warn!(identity = %identity, error = %error, "follow-up analysis failed");
        }

        Ok(DispatchOutcome::Replied {
            message_id: sent.message_id,
            handoff,
        })
    }

    async fn cancel_pending_follow_up(&self, identity: &CanonicalIdentity) {
        let follow_ups = &self.inner.collaborators.follow_ups;
        let result = match follow_ups.has_active_follow_up(identity).await {
            Ok(true) => follow_ups
                .cancel_follow_up(identity, FOLLOW_UP_CANCEL_REASON)
                .await,
            Ok(false) => Ok(()),
            Err(error) => Err(error),
        };
        if let Err(error) = result {
            tracing::warn!(identity = %identity, error = %error, "failed to cancel follow-up");
        }
    }

    async fn suppress(&self, message: &InboundMessage, reason: SuppressionReason) -> DispatchOutcome {
        tracing::debug!(identity = %message.identity, ?reason, "auto-reply suppressed");
        self.audit(message.audit(AuditEntryKind::Suppressed, reason.note()))
            .await;
        DispatchOutcome::Suppressed(reason)
    }

    async fn record_send_failure(
        &self,
        message: &InboundMessage,
        error: &TransportError,
    ) -> DispatchOutcome {
        let category = categorize_send_failure(error);
        tracing::warn!(
            identity = %message.identity,
            category = category.as_str(),
            error = %error,
            "reply send failed"
        );
        let mut entry = message.audit(AuditEntryKind::SendFailure, category.operator_message());
        entry.detail = Some(error.to_string());
        self.audit(entry).await;
        DispatchOutcome::SendFailed(category)
    }

    async fn apologize(&self, message: &InboundMessage, error: anyhow::Error) -> DispatchOutcome {
        let detail = format!("{error:#}");
        tracing::error!(identity = %message.identity, error = %detail, "dispatch failed");
        let mut entry = message.audit(AuditEntryKind::Error, "dispatch failed; apology sent");
        entry.detail = Some(detail);
        self.audit(entry).await;

        let delivered = match self
            .inner
            .connection
            .send_text(&message.chat_address, &self.inner.config.apology_text)
            .await
        {
            Ok(_) => true,
            Err(send_error) => {
                tracing::warn!(
                    identity = %message.identity,
                    error = %send_error,
                    "failed to deliver apology"
                );
                false
            }
        };
        DispatchOutcome::Apologized { delivered }
    }

    async fn audit(&self, entry: AuditEntry) {
        let kind = entry.kind;
        if let Err(error) = self.inner.collaborators.logger.log(entry).await {
            tracing::warn!(kind = kind.as_str(), error = %error, "failed to append audit entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use anyhow::Result;
    use async_trait::async_trait;
    use chatbridge_transport::{
        canonical_identity, CanonicalIdentity, MessageStatusUpdate, RawInboundMessage,
        ScriptedTransport, TransportConnector, TransportError, TransportErrorKind,
    };
    use tempfile::{tempdir, TempDir};
    use tokio::sync::mpsc;

    use super::{
        categorize_send_failure, DispatchOutcome, DispatcherCollaborators, DispatcherConfig,
        IgnoreReason, MessageDispatcher, ProcessedMessageIndex, SendFailureCategory,
        SuppressionReason, DEFAULT_APOLOGY_TEXT, FOLLOW_UP_CANCEL_REASON,
    };
    use crate::collaborators::{
        AiResponder, AuditEntry, AuditEntryKind, AuditLogger, ConversationMessage,
        ConversationMode, ConversationRole, ConversationStore, FollowUpScheduler, ModeStore,
        ResponderError,
    };
    use crate::connection_supervisor::{ConnectionHandle, MessageEvent};
    use crate::file_stores::{FileAudienceConfig, JsonConversationStore, JsonModeStore};
    use crate::handoff_marker::HANDOFF_MARKER;
    use crate::status_tracker::{DeliveryStatus, StatusTracker};

    #[derive(Default)]
    struct RecordingLogger {
        entries: Mutex<Vec<AuditEntry>>,
        statuses: Mutex<Vec<(String, DeliveryStatus)>>,
    }

    impl RecordingLogger {
        fn entries(&self) -> Vec<AuditEntry> {
            self.entries.lock().expect("entries lock").clone()
        }

        fn count(&self, kind: AuditEntryKind) -> usize {
            self.entries().iter().filter(|entry| entry.kind == kind).count()
        }
    }

    #[async_trait]
    impl AuditLogger for RecordingLogger {
        async fn log(&self, entry: AuditEntry) -> Result<()> {
            self.entries.lock().expect("entries lock").push(entry);
            Ok(())
        }

        async fn update_message_status(
            &self,
            message_id: &str,
            status: DeliveryStatus,
        ) -> Result<()> {
            self.statuses
                .lock()
                .expect("statuses lock")
                .push((message_id.to_string(), status));
            Ok(())
        }
    }

    struct QueuedResponder {
        replies: Mutex<VecDeque<Result<String, ResponderError>>>,
        seen_histories: Mutex<Vec<Vec<ConversationMessage>>>,
    }

    impl QueuedResponder {
        fn new(replies: Vec<Result<String, ResponderError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                seen_histories: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl AiResponder for QueuedResponder {
        async fn generate_response(
            &self,
            history: &[ConversationMessage],
        ) -> Result<String, ResponderError> {
            self.seen_histories
                .lock()
                .expect("histories lock")
                .push(history.to_vec());
            self.replies
                .lock()
                .expect("replies lock")
                .pop_front()
                .unwrap_or_else(|| Ok("default reply".to_string()))
        }
    }

    /// Answers with the latest user turn after a short pause, recording the order it saw.
    #[derive(Default)]
    struct EchoResponder {
        seen_turns: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AiResponder for EchoResponder {
        async fn generate_response(
            &self,
            history: &[ConversationMessage],
        ) -> Result<String, ResponderError> {
            let latest = history
                .last()
                .map(|turn| turn.text.clone())
                .unwrap_or_default();
            self.seen_turns
                .lock()
                .expect("turns lock")
                .push(latest.clone());
            tokio::time::sleep(Duration::from_millis(2)).await;
            Ok(format!("echo {latest}"))
        }
    }

    #[derive(Default)]
    struct RecordingFollowUps {
        active: Mutex<bool>,
        cancellations: Mutex<Vec<(CanonicalIdentity, String)>>,
        analyzed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl FollowUpScheduler for RecordingFollowUps {
        async fn has_active_follow_up(&self, _identity: &CanonicalIdentity) -> Result<bool> {
            Ok(*self.active.lock().expect("active lock"))
        }

        async fn cancel_follow_up(&self, identity: &CanonicalIdentity, reason: &str) -> Result<()> {
            self.cancellations
                .lock()
                .expect("cancellations lock")
                .push((identity.clone(), reason.to_string()));
            *self.active.lock().expect("active lock") = false;
            Ok(())
        }

        async fn analyze_user_response(
            &self,
            _identity: &CanonicalIdentity,
            text: &str,
            _history: &[ConversationMessage],
        ) -> Result<()> {
            self.analyzed
                .lock()
                .expect("analyzed lock")
                .push(text.to_string());
            Ok(())
        }

        async fn start_follow_up_timer(&self, _connection: ConnectionHandle) -> Result<()> {
            Ok(())
        }
    }

    struct Harness {
        temp: TempDir,
        transport: ScriptedTransport,
        logger: Arc<RecordingLogger>,
        modes: Arc<JsonModeStore>,
        conversations: Arc<JsonConversationStore>,
        follow_ups: Arc<RecordingFollowUps>,
        responder: Arc<QueuedResponder>,
        connection: ConnectionHandle,
        dispatcher: MessageDispatcher,
    }

    impl Harness {
        async fn new(replies: Vec<Result<String, ResponderError>>) -> Self {
            let temp = tempdir().expect("tempdir");
            let transport = ScriptedTransport::new();
            let live = transport.connect(None).await.expect("connect");
            let connection = ConnectionHandle::new();
            connection.attach(live.session);
            connection.update(|status| {
                status.own_identity = canonical_identity("15550009999@s.whatsapp.net");
            });

            let logger = Arc::new(RecordingLogger::default());
            let modes = Arc::new(JsonModeStore::for_state_dir(temp.path()));
            let conversations = Arc::new(JsonConversationStore::for_state_dir(temp.path(), 20));
            let follow_ups = Arc::new(RecordingFollowUps::default());
            let responder = Arc::new(QueuedResponder::new(replies));
            let dispatcher = MessageDispatcher::new(
                DispatcherConfig::default(),
                DispatcherCollaborators {
                    logger: logger.clone(),
                    conversations: conversations.clone(),
                    modes: modes.clone(),
                    audience: Arc::new(FileAudienceConfig::for_state_dir(temp.path())),
                    follow_ups: follow_ups.clone(),
                    responder: responder.clone(),
                },
                Arc::new(StatusTracker::new(logger.clone())),
                connection.clone(),
            );
            Self {
                temp,
                transport,
                logger,
                modes,
                conversations,
                follow_ups,
                responder,
                connection,
                dispatcher,
            }
        }

        fn write_audience_policy(&self, groups: bool, individual: bool) {
            let dir = self.temp.path().join("security");
            std::fs::create_dir_all(&dir).expect("mkdir");
            std::fs::write(
                dir.join("audience-policy.json"),
                format!(
                    r#"{{"schema_version":1,"groupsAiEnabled":{groups},"individualAiEnabled":{individual}}}"#
                ),
            )
            .expect("write policy");
        }
    }

    fn customer() -> CanonicalIdentity {
        canonical_identity("15550001111@s.whatsapp.net").expect("identity")
    }

    fn direct_message(id: &str, text: &str) -> RawInboundMessage {
        RawInboundMessage {
            message_id: Some(id.to_string()),
            remote_address: "15550001111@s.whatsapp.net".to_string(),
            push_name: Some("Ana".to_string()),
            text: Some(text.to_string()),
            ..RawInboundMessage::default()
        }
    }

    fn group_message(id: &str, text: &str) -> RawInboundMessage {
        RawInboundMessage {
            message_id: Some(id.to_string()),
            remote_address: "120363000000000001@g.us".to_string(),
            participant_address: Some("15550001111@s.whatsapp.net".to_string()),
            push_name: Some("Ana".to_string()),
            text: Some(text.to_string()),
            ..RawInboundMessage::default()
        }
    }

    #[test]
    fn unit_categorize_send_failure_uses_error_kind() {
        let cases = [
            (TransportErrorKind::ChatNotFound, SendFailureCategory::ChatNotFound),
            (
                TransportErrorKind::RecipientNotRegistered,
                SendFailureCategory::RecipientNotRegistered,
            ),
            (
                TransportErrorKind::NotAuthenticated,
                SendFailureCategory::SessionNotAuthenticated,
            ),
            (
                TransportErrorKind::NotConnected,
                SendFailureCategory::SessionNotAuthenticated,
            ),
            (TransportErrorKind::Timeout, SendFailureCategory::DeliveryFailed),
        ];
        for (kind, expected) in cases {
            let error = TransportError::new(kind, "the wording does not matter");
            assert_eq!(categorize_send_failure(&error), expected);
        }
    }

    #[test]
    fn unit_processed_message_index_evicts_oldest_beyond_cap() {
        let mut index = ProcessedMessageIndex::new(2);
        assert!(index.mark_processed("a"));
        assert!(!index.mark_processed("a"));
        assert!(index.mark_processed("b"));
        assert!(index.mark_processed("c"));
        assert_eq!(index.len(), 2);
        assert!(!index.contains("a"));
        assert!(index.contains("c"));
    }

    #[tokio::test]
    async fn functional_direct_message_gets_ai_reply_and_is_audited() {
        let harness = Harness::new(vec![Ok("We open at 9am.".to_string())]).await;
        let outcome = harness
            .dispatcher
            .dispatch(direct_message("in-1", "  When do you open?  "))
            .await;
        assert_eq!(
            outcome,
            DispatchOutcome::Replied {
                message_id: "scripted-1".to_string(),
                handoff: false
            }
        );

        let sent = harness.transport.sent_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].target, "15550001111@s.whatsapp.net");
        assert_eq!(sent[0].text, "We open at 9am.");

        let entries = harness.logger.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, AuditEntryKind::Received);
        assert_eq!(entries[0].text, "When do you open?");
        assert_eq!(entries[0].message_id.as_deref(), Some("in-1"));
        assert_eq!(entries[1].kind, AuditEntryKind::Sent);
        assert_eq!(entries[1].message_id.as_deref(), Some("scripted-1"));
        assert_eq!(entries[1].display_name.as_deref(), Some("Ana"));

        let history = harness
            .conversations
            .get_messages(&customer(), "15550001111@s.whatsapp.net")
            .await
            .expect("history");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, ConversationRole::User);
        assert_eq!(history[1].role, ConversationRole::Assistant);
        let seen = harness.responder.seen_histories.lock().expect("lock").clone();
        assert_eq!(seen[0].len(), 1);
        assert_eq!(
            harness.follow_ups.analyzed.lock().expect("lock").as_slice(),
            &["When do you open?".to_string()]
        );
    }

    #[tokio::test]
    async fn regression_self_echo_produces_no_log_and_no_reply() {
        let harness = Harness::new(Vec::new()).await;
        let mut from_me = direct_message("echo-1", "sent by the bot");
        from_me.from_me = true;
        assert_eq!(
            harness.dispatcher.dispatch(from_me).await,
            DispatchOutcome::Ignored(IgnoreReason::SelfEcho)
        );

        let mut own_sender = group_message("echo-2", "bot in a group");
        own_sender.participant_address = Some("15550009999:4@s.whatsapp.net".to_string());
        assert_eq!(
            harness.dispatcher.dispatch(own_sender).await,
            DispatchOutcome::Ignored(IgnoreReason::SelfEcho)
        );
        assert!(harness.logger.entries().is_empty());
        assert!(harness.transport.sent_messages().is_empty());
    }

    #[tokio::test]
    async fn unit_empty_payload_is_dropped_silently() {
        let harness = Harness::new(Vec::new()).await;
        let mut blank = direct_message("blank-1", "   ");
        assert_eq!(
            harness.dispatcher.dispatch(blank.clone()).await,
            DispatchOutcome::Ignored(IgnoreReason::EmptyPayload)
        );
        blank.text = None;
        assert_eq!(
            harness.dispatcher.dispatch(blank).await,
            DispatchOutcome::Ignored(IgnoreReason::EmptyPayload)
        );
        assert!(harness.logger.entries().is_empty());
    }

    #[tokio::test]
    async fn functional_non_ai_mode_logs_receipt_and_sends_nothing() {
        let harness = Harness::new(Vec::new()).await;
        harness
            .modes
            .set_mode(&customer(), ConversationMode::Human)
            .await
            .expect("set mode");
        let outcome = harness
            .dispatcher
            .dispatch(direct_message("in-2", "hello?"))
            .await;
        assert_eq!(
            outcome,
            DispatchOutcome::Suppressed(SuppressionReason::ModeNotAi(ConversationMode::Human))
        );
        assert!(harness.transport.sent_messages().is_empty());
        assert_eq!(harness.logger.count(AuditEntryKind::Received), 1);
        assert_eq!(harness.logger.count(AuditEntryKind::Suppressed), 1);
        assert!(harness.responder.seen_histories.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn functional_group_message_with_groups_ai_disabled_is_suppressed_once() {
        let harness = Harness::new(Vec::new()).await;
        harness
            .transport
            .set_group_subject("120363000000000001@g.us", "Wholesale buyers");
        let outcome = harness
            .dispatcher
            .dispatch(group_message("grp-1", "price list please"))
            .await;
        assert_eq!(
            outcome,
            DispatchOutcome::Suppressed(SuppressionReason::GroupsAiDisabled)
        );
        assert!(harness.transport.sent_messages().is_empty());
        assert_eq!(harness.logger.count(AuditEntryKind::Suppressed), 1);
        let received = &harness.logger.entries()[0];
        assert!(received.is_group);
        assert_eq!(received.group_label.as_deref(), Some("Wholesale buyers"));
        let group = canonical_identity("120363000000000001@g.us").expect("group");
        assert_eq!(
            harness.modes.get_mode(&group).await.expect("mode"),
            ConversationMode::Ai
        );
        assert!(harness
            .modes
            .get_all_human_states()
            .await
            .expect("states")
            .is_empty());
    }

    #[tokio::test]
    async fn functional_group_reply_falls_back_to_default_label() {
        let harness = Harness::new(vec![Ok("Sent you the list.".to_string())]).await;
        harness.write_audience_policy(true, true);
        let outcome = harness
            .dispatcher
            .dispatch(group_message("grp-2", "price list please"))
            .await;
        assert!(matches!(outcome, DispatchOutcome::Replied { .. }));
        let sent_entry = harness
            .logger
            .entries()
            .into_iter()
            .find(|entry| entry.kind == AuditEntryKind::Sent)
            .expect("sent entry");
        assert_eq!(sent_entry.group_label.as_deref(), Some("Group"));
        assert_eq!(sent_entry.display_name.as_deref(), Some("Group"));
        assert_eq!(
            harness.transport.sent_messages()[0].target,
            "120363000000000001@g.us"
        );
    }

    #[tokio::test]
    async fn functional_individual_ai_disabled_suppresses_direct_chats() {
        let harness = Harness::new(Vec::new()).await;
        harness.write_audience_policy(false, false);
        assert_eq!(
            harness
                .dispatcher
                .dispatch(direct_message("in-3", "hi"))
                .await,
            DispatchOutcome::Suppressed(SuppressionReason::IndividualAiDisabled)
        );
        assert!(harness.transport.sent_messages().is_empty());
    }

    #[tokio::test]
    async fn functional_handoff_marker_switches_mode_and_is_stripped() {
        let harness = Harness::new(vec![Ok(format!(
            "I will get a specialist for you. {HANDOFF_MARKER}"
        ))])
        .await;
        let outcome = harness
            .dispatcher
            .dispatch(direct_message("in-4", "I want a refund"))
            .await;
        assert!(matches!(
            outcome,
            DispatchOutcome::Replied { handoff: true, .. }
        ));

        let sent = harness.transport.sent_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].text, "I will get a specialist for you.");
        assert!(!sent[0].text.contains(HANDOFF_MARKER));
        assert_eq!(
            harness.modes.get_mode(&customer()).await.expect("mode"),
            ConversationMode::Support
        );
        assert_eq!(harness.logger.count(AuditEntryKind::ModeChange), 1);
        let session = harness
            .conversations
            .get_session(&customer(), "15550001111@s.whatsapp.net")
            .await
            .expect("session")
            .expect("present");
        assert_eq!(session.mode, ConversationMode::Support);
        let history = harness
            .conversations
            .get_messages(&customer(), "15550001111@s.whatsapp.net")
            .await
            .expect("history");
        assert_eq!(history[1].text, "I will get a specialist for you.");

        let follow_up = harness
            .dispatcher
            .dispatch(direct_message("in-5", "hello?"))
            .await;
        assert_eq!(
            follow_up,
            DispatchOutcome::Suppressed(SuppressionReason::ModeNotAi(ConversationMode::Support))
        );
        assert_eq!(harness.transport.sent_messages().len(), 1);
    }

    #[tokio::test]
    async fn functional_ai_error_sends_exactly_one_apology() {
        let harness = Harness::new(vec![Err(ResponderError::HttpStatus {
            status: 502,
            body: "upstream overloaded".to_string(),
        })])
        .await;
        let outcome = harness
            .dispatcher
            .dispatch(direct_message("in-6", "are you there?"))
            .await;
        assert_eq!(outcome, DispatchOutcome::Apologized { delivered: true });

        let sent = harness.transport.sent_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].target, "15550001111@s.whatsapp.net");
        assert_eq!(sent[0].text, DEFAULT_APOLOGY_TEXT);
        let errors = harness
            .logger
            .entries()
            .into_iter()
            .filter(|entry| entry.kind == AuditEntryKind::Error)
            .collect::<Vec<_>>();
        assert_eq!(errors.len(), 1);
        assert!(errors[0]
            .detail
            .as_deref()
            .unwrap_or_default()
            .contains("upstream overloaded"));
        assert_eq!(
            harness.modes.get_mode(&customer()).await.expect("mode"),
            ConversationMode::Ai
        );
    }

    #[tokio::test]
    async fn functional_send_failure_is_categorized_without_retry_or_apology() {
        let harness = Harness::new(vec![Ok("Here you go.".to_string())]).await;
        harness.transport.fail_next_send(TransportError::new(
            TransportErrorKind::RecipientNotRegistered,
            "jid not on platform",
        ));
        let outcome = harness
            .dispatcher
            .dispatch(direct_message("in-7", "hi"))
            .await;
        assert_eq!(
            outcome,
            DispatchOutcome::SendFailed(SendFailureCategory::RecipientNotRegistered)
        );
        assert!(harness.transport.sent_messages().is_empty());
        let failure = harness
            .logger
            .entries()
            .into_iter()
            .find(|entry| entry.kind == AuditEntryKind::SendFailure)
            .expect("failure entry");
        assert!(failure
            .detail
            .as_deref()
            .unwrap_or_default()
            .contains("jid not on platform"));
        assert_eq!(harness.logger.count(AuditEntryKind::Error), 0);
    }

    #[tokio::test]
    async fn functional_disconnected_session_maps_to_not_authenticated() {
        let harness = Harness::new(vec![Ok("Here you go.".to_string())]).await;
        harness.connection.detach();
        assert_eq!(
            harness
                .dispatcher
                .dispatch(direct_message("in-8", "hi"))
                .await,
            DispatchOutcome::SendFailed(SendFailureCategory::SessionNotAuthenticated)
        );
    }

    #[tokio::test]
    async fn regression_replayed_message_id_is_dispatched_once() {
        let harness = Harness::new(Vec::new()).await;
        let first = harness
            .dispatcher
            .dispatch(direct_message("dup-1", "hello"))
            .await;
        assert!(matches!(first, DispatchOutcome::Replied { .. }));
        assert_eq!(
            harness
                .dispatcher
                .dispatch(direct_message("dup-1", "hello"))
                .await,
            DispatchOutcome::Ignored(IgnoreReason::Duplicate)
        );
        assert_eq!(harness.transport.sent_messages().len(), 1);
        assert_eq!(harness.logger.count(AuditEntryKind::Received), 1);
    }

    #[tokio::test]
    async fn functional_active_follow_up_is_cancelled_when_customer_replies() {
        let harness = Harness::new(Vec::new()).await;
        *harness.follow_ups.active.lock().expect("lock") = true;
        harness
            .dispatcher
            .dispatch(direct_message("in-9", "yes, still interested"))
            .await;
        let cancellations = harness.follow_ups.cancellations.lock().expect("lock").clone();
        assert_eq!(
            cancellations,
            vec![(customer(), FOLLOW_UP_CANCEL_REASON.to_string())]
        );
    }

    #[tokio::test]
    async fn integration_run_dispatches_messages_serially_per_identity_and_tracks_status() {
        let harness = Harness::new(vec![
            Ok("first answer".to_string()),
            Ok("second answer".to_string()),
        ])
        .await;
        let (sender, receiver) = mpsc::channel(8);
        let dispatcher = harness.dispatcher.clone();
        let runner = tokio::spawn(async move { dispatcher.run(receiver).await });

        sender
            .send(MessageEvent::Upserted(vec![
                direct_message("ser-1", "first question"),
                direct_message("ser-2", "second question"),
            ]))
            .await
            .expect("send upsert");
        for _ in 0..200 {
            if harness.transport.sent_messages().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        sender
            .send(MessageEvent::StatusUpdated(vec![
                MessageStatusUpdate {
                    message_id: "scripted-1".to_string(),
                    status_code: 4,
                },
                MessageStatusUpdate {
                    message_id: "scripted-1".to_string(),
                    status_code: 3,
                },
            ]))
            .await
            .expect("send status");
        drop(sender);
        tokio::time::timeout(Duration::from_secs(2), runner)
            .await
            .expect("runner finished")
            .expect("runner joined");

        assert_eq!(harness.transport.sent_messages().len(), 2);
        let histories = harness.responder.seen_histories.lock().expect("lock").clone();
        // The second call saw the first exchange because dispatch is sequenced.
        assert_eq!(histories[0].len(), 1);
        assert_eq!(histories[1].len(), 3);
        assert_eq!(
            harness.logger.statuses.lock().expect("lock").as_slice(),
            &[("scripted-1".to_string(), DeliveryStatus::Read)]
        );
    }

    #[tokio::test]
    async fn regression_failed_ai_round_trip_leaves_history_untouched() {
        let harness = Harness::new(vec![
            Err(ResponderError::HttpStatus {
                status: 503,
                body: "unavailable".to_string(),
            }),
            Ok("We open at nine.".to_string()),
        ])
        .await;
        assert_eq!(
            harness
                .dispatcher
                .dispatch(direct_message("in-10", "first try"))
                .await,
            DispatchOutcome::Apologized { delivered: true }
        );
        let history = harness
            .conversations
            .get_messages(&customer(), "15550001111@s.whatsapp.net")
            .await
            .expect("history");
        assert!(history.is_empty());

        harness
            .dispatcher
            .dispatch(direct_message("in-11", "when do you open?"))
            .await;
        let seen = harness.responder.seen_histories.lock().expect("lock").clone();
        assert_eq!(seen[1].len(), 1);
        assert_eq!(seen[1][0].text, "when do you open?");
        let history = harness
            .conversations
            .get_messages(&customer(), "15550001111@s.whatsapp.net")
            .await
            .expect("history");
        let roles = history.iter().map(|turn| turn.role).collect::<Vec<_>>();
        assert_eq!(roles, vec![ConversationRole::User, ConversationRole::Assistant]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn regression_run_keeps_arrival_order_for_one_identity() {
        for round in 0..10 {
            let temp = tempdir().expect("tempdir");
            let transport = ScriptedTransport::new();
            let live = transport.connect(None).await.expect("connect");
            let connection = ConnectionHandle::new();
            connection.attach(live.session);
            let logger = Arc::new(RecordingLogger::default());
            let responder = Arc::new(EchoResponder::default());
            let dispatcher = MessageDispatcher::new(
                DispatcherConfig::default(),
                DispatcherCollaborators {
                    logger: logger.clone(),
                    conversations: Arc::new(JsonConversationStore::for_state_dir(temp.path(), 40)),
                    modes: Arc::new(JsonModeStore::for_state_dir(temp.path())),
                    audience: Arc::new(FileAudienceConfig::for_state_dir(temp.path())),
                    follow_ups: Arc::new(RecordingFollowUps::default()),
                    responder: responder.clone(),
                },
                Arc::new(StatusTracker::new(logger)),
                connection,
            );

            let (sender, receiver) = mpsc::channel(8);
            let runner = tokio::spawn(async move { dispatcher.run(receiver).await });
            let questions = (0..6).map(|index| format!("q{index}")).collect::<Vec<_>>();
            sender
                .send(MessageEvent::Upserted(
                    questions
                        .iter()
                        .enumerate()
                        .map(|(index, text)| direct_message(&format!("ord-{round}-{index}"), text))
                        .collect(),
                ))
                .await
                .expect("send upsert");
            drop(sender);
            tokio::time::timeout(Duration::from_secs(5), runner)
                .await
                .expect("runner finished")
                .expect("runner joined");

            let seen = responder.seen_turns.lock().expect("turns lock").clone();
            assert_eq!(seen, questions, "round {round}");
            let replies = transport
                .sent_messages()
                .into_iter()
                .map(|sent| sent.text)
                .collect::<Vec<_>>();
            let expected = questions
                .iter()
                .map(|text| format!("echo {text}"))
                .collect::<Vec<_>>();
            assert_eq!(replies, expected, "round {round}");
        }
    }
}
