//! In-process transport driven entirely by the caller.
//!
//! Used to replay synthetic event sequences against the supervisor and the
//! dispatcher without a sidecar: scripted events are delivered on connect,
//! further events can be emitted at any time, and every command is recorded.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::transport_contract::{
    GroupMetadata, SentMessage, SessionCredentials, TransportConnection, TransportConnector,
    TransportError, TransportErrorKind, TransportEvent, TransportSession,
};

const SCRIPTED_EVENT_BUFFER: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedSend {
    pub target: String,
    pub text: String,
    pub message_id: String,
}

#[derive(Default)]
struct ScriptedState {
    connect_attempts: Vec<Option<SessionCredentials>>,
    connect_failures: VecDeque<TransportError>,
    connect_scripts: VecDeque<Vec<TransportEvent>>,
    live_events: Option<mpsc::Sender<TransportEvent>>,
    sent: Vec<RecordedSend>,
    send_failures: VecDeque<TransportError>,
    next_message_id: u64,
    group_subjects: HashMap<String, String>,
    logout_calls: usize,
    end_calls: usize,
}

#[derive(Clone, Default)]
/// Public struct `ScriptedTransport` used for deterministic runtime tests.
pub struct ScriptedTransport {
    state: Arc<Mutex<ScriptedState>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ScriptedState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queues events delivered as soon as the next session is established.
    pub fn script_connect(&self, events: Vec<TransportEvent>) {
        self.lock().connect_scripts.push_back(events);
    }

    pub fn fail_next_connect(&self, error: TransportError) {
        self.lock().connect_failures.push_back(error);
    }

    pub fn fail_next_send(&self, error: TransportError) {
        self.lock().send_failures.push_back(error);
    }

    pub fn set_group_subject(&self, group_address: &str, subject: &str) {
        self.lock()
            .group_subjects
            .insert(group_address.to_string(), subject.to_string());
    }

    /// Emits an event on the live session. Returns false when no session is listening.
    pub async fn emit(&self, event: TransportEvent) -> bool {
        let sender = self.lock().live_events.clone();
        match sender {
            Some(sender) => sender.send(event).await.is_ok(),
            None => false,
        }
    }

    pub fn has_live_session(&self) -> bool {
        self.lock()
            .live_events
            .as_ref()
            .is_some_and(|sender| !sender.is_closed())
    }

    pub fn connect_attempts(&self) -> Vec<Option<SessionCredentials>> {
        self.lock().connect_attempts.clone()
    }

    pub fn sent_messages(&self) -> Vec<RecordedSend> {
        self.lock().sent.clone()
    }

    pub fn logout_calls(&self) -> usize {
        self.lock().logout_calls
    }

    pub fn end_calls(&self) -> usize {
        self.lock().end_calls
    }
}

#[async_trait]
impl TransportConnector for ScriptedTransport {
    async fn connect(
        &self,
        credentials: Option<SessionCredentials>,
    ) -> Result<TransportConnection, TransportError> {
        let mut state = self.lock();
        state.connect_attempts.push(credentials);
        if let Some(error) = state.connect_failures.pop_front() {
            return Err(error);
        }
        let (sender, events) = mpsc::channel(SCRIPTED_EVENT_BUFFER);
        for event in state.connect_scripts.pop_front().unwrap_or_default() {
            if sender.try_send(event).is_err() {
                break;
            }
        }
        state.live_events = Some(sender);
        drop(state);
        Ok(TransportConnection {
            session: Arc::new(ScriptedSession {
                transport: self.clone(),
            }),
            events,
        })
    }
}

struct ScriptedSession {
    transport: ScriptedTransport,
}

#[async_trait]
impl TransportSession for ScriptedSession {
    async fn send_text(&self, target: &str, text: &str) -> Result<SentMessage, TransportError> {
        let mut state = self.transport.lock();
        if let Some(error) = state.send_failures.pop_front() {
            return Err(error);
        }
        state.next_message_id = state.next_message_id.saturating_add(1);
        let message_id = format!("scripted-{}", state.next_message_id);
        state.sent.push(RecordedSend {
            target: target.to_string(),
            text: text.to_string(),
            message_id: message_id.clone(),
        });
        Ok(SentMessage { message_id })
    }

    async fn group_metadata(&self, group_address: &str) -> Result<GroupMetadata, TransportError> {
        let state = self.transport.lock();
        match state.group_subjects.get(group_address) {
            Some(subject) => Ok(GroupMetadata {
                group_address: group_address.to_string(),
                subject: subject.clone(),
            }),
            None => Err(TransportError::new(
                TransportErrorKind::ChatNotFound,
                format!("no scripted metadata for {group_address}"),
            )),
        }
    }

    async fn logout(&self) -> Result<(), TransportError> {
        let mut state = self.transport.lock();
        state.logout_calls = state.logout_calls.saturating_add(1);
        state.live_events = None;
        Ok(())
    }

    async fn end(&self) {
        let mut state = self.transport.lock();
        state.end_calls = state.end_calls.saturating_add(1);
        state.live_events = None;
    }
}

#[cfg(test)]
mod tests {
    use super::ScriptedTransport;
    use crate::transport_contract::{
        ConnectionUpdate, TransportConnector, TransportError, TransportErrorKind, TransportEvent,
        TransportSession,
    };

    #[tokio::test]
    async fn unit_scripted_transport_delivers_connect_script_then_live_events() {
        let transport = ScriptedTransport::new();
        transport.script_connect(vec![TransportEvent::Connection(ConnectionUpdate::Open {
            own_address: None,
        })]);
        let mut connection = transport.connect(None).await.expect("connect");
        assert_eq!(
            connection.events.recv().await,
            Some(TransportEvent::Connection(ConnectionUpdate::Open {
                own_address: None
            }))
        );
        assert!(
            transport
                .emit(TransportEvent::Connection(ConnectionUpdate::Connecting))
                .await
        );
        assert_eq!(
            connection.events.recv().await,
            Some(TransportEvent::Connection(ConnectionUpdate::Connecting))
        );
    }

    #[tokio::test]
    async fn unit_scripted_transport_records_sends_and_injected_failures() {
        let transport = ScriptedTransport::new();
        let connection = transport.connect(None).await.expect("connect");
        transport.fail_next_send(TransportError::new(
            TransportErrorKind::RecipientNotRegistered,
            "not on platform",
        ));
        let error = connection
            .session
            .send_text("1@s.whatsapp.net", "hi")
            .await
            .expect_err("injected failure");
        assert_eq!(error.kind, TransportErrorKind::RecipientNotRegistered);

        let sent = connection
            .session
            .send_text("1@s.whatsapp.net", "hi")
            .await
            .expect("send");
        assert_eq!(sent.message_id, "scripted-1");
        assert_eq!(transport.sent_messages().len(), 1);
    }

    #[tokio::test]
    async fn regression_scripted_transport_end_detaches_live_session() {
        let transport = ScriptedTransport::new();
        let connection = transport.connect(None).await.expect("connect");
        connection.session.end().await;
        assert!(!transport.has_live_session());
        assert!(
            !transport
                .emit(TransportEvent::Connection(ConnectionUpdate::Connecting))
                .await
        );
        assert_eq!(transport.end_calls(), 1);
    }
}
