//! Transport session lifecycle: connect, pair, classify closures, reconnect.
//!
//! A single supervision task per `start()` owns the live session. Lifecycle
//! events drive the [`ConnectionState`] machine; message events are forwarded
//! untouched to the dispatcher channel. The live send capability is exposed
//! only through [`ConnectionHandle`].

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use anyhow::{bail, Result};
use chatbridge_transport::{
    canonical_identity, CanonicalIdentity, ConnectionUpdate, DisconnectCode, GroupMetadata,
    MessageStatusUpdate, RawInboundMessage, SentMessage, TransportConnection, TransportConnector,
    TransportError, TransportEvent, TransportSession,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::collaborators::{ConversationStore, FollowUpScheduler};
use crate::credential_store::CredentialStore;
use crate::state_io::{current_unix_timestamp_ms, read_json_if_present, write_json_atomic};

pub const CONNECTION_SNAPSHOT_SCHEMA_VERSION: u32 = 1;
pub const CONNECTION_SNAPSHOT_FILE_NAME: &str = "connection-state.json";
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 5_000;
pub const DEFAULT_MAX_CREDENTIAL_RESETS: u32 = 3;
pub const DEFAULT_SESSION_CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_SESSION_MAX_IDLE: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `ConnectionState` values.
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Failed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// How the supervisor reacts to a session close.
pub enum DisconnectClass {
    LoggedOut,
    CredentialRejected,
    Transient,
}

pub fn classify_disconnect(code: DisconnectCode) -> DisconnectClass {
    match code {
        DisconnectCode::LoggedOut => DisconnectClass::LoggedOut,
        DisconnectCode::BadSession
        | DisconnectCode::Forbidden
        | DisconnectCode::MultideviceMismatch => DisconnectClass::CredentialRejected,
        DisconnectCode::ConnectionClosed
        | DisconnectCode::ConnectionLost
        | DisconnectCode::ConnectionReplaced
        | DisconnectCode::RestartRequired
        | DisconnectCode::Unavailable
        | DisconnectCode::Other(_) => DisconnectClass::Transient,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
/// Public struct `ConnectionStatus` observed through [`ConnectionHandle::subscribe`].
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub reconnect_counter: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pairing_challenge: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub own_identity: Option<CanonicalIdentity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_close_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_close_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Persisted form of [`ConnectionStatus`] read by `chatbridge status`.
pub struct ConnectionSnapshot {
    pub schema_version: u32,
    #[serde(flatten)]
    pub status: ConnectionStatus,
    pub updated_unix_ms: u64,
}

pub fn connection_snapshot_path(state_dir: &Path) -> PathBuf {
    state_dir.join(CONNECTION_SNAPSHOT_FILE_NAME)
}

pub fn load_connection_snapshot(state_dir: &Path) -> Result<Option<ConnectionSnapshot>> {
    let Some(snapshot) =
        read_json_if_present::<ConnectionSnapshot>(&connection_snapshot_path(state_dir))?
    else {
        return Ok(None);
    };
    if snapshot.schema_version != CONNECTION_SNAPSHOT_SCHEMA_VERSION {
        bail!(
            "unsupported connection snapshot schema: expected {}, found {}",
            CONNECTION_SNAPSHOT_SCHEMA_VERSION,
            snapshot.schema_version
        );
    }
    Ok(Some(snapshot))
}

fn write_connection_snapshot(state_dir: &Path, status: &ConnectionStatus) -> Result<()> {
    let snapshot = ConnectionSnapshot {
        schema_version: CONNECTION_SNAPSHOT_SCHEMA_VERSION,
        status: status.clone(),
        updated_unix_ms: current_unix_timestamp_ms(),
    };
    write_json_atomic(&connection_snapshot_path(state_dir), &snapshot)
}

/// Offline recovery from `Failed`: purges credentials and rewrites an idle snapshot.
///
/// Must not be used while a supervisor for the same state dir is running.
pub fn reset_connection_state(state_dir: &Path) -> Result<bool> {
    let purged = CredentialStore::for_state_dir(state_dir).purge()?;
    write_connection_snapshot(state_dir, &ConnectionStatus::default())?;
    Ok(purged)
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Message-level transport events handed to the dispatcher.
pub enum MessageEvent {
    Upserted(Vec<RawInboundMessage>),
    StatusUpdated(Vec<MessageStatusUpdate>),
}

/// Resolves once cancellation is requested or the requesting side is gone.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let _ = cancel.wait_for(|cancelled| *cancelled).await;
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct HandleShared {
    status: watch::Sender<ConnectionStatus>,
    session: RwLock<Option<Arc<dyn TransportSession>>>,
}

#[derive(Clone)]
/// Explicit handle to the live connection, shared by every component that sends.
pub struct ConnectionHandle {
    shared: Arc<HandleShared>,
}

impl ConnectionHandle {
    pub(crate) fn new() -> Self {
        let (status, _) = watch::channel(ConnectionStatus::default());
        Self {
            shared: Arc::new(HandleShared {
                status,
                session: RwLock::new(None),
            }),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.status.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.status.borrow().state
    }

    pub fn pairing_challenge(&self) -> Option<String> {
        self.shared.status.borrow().pairing_challenge.clone()
    }

    pub fn own_identity(&self) -> Option<CanonicalIdentity> {
        self.shared.status.borrow().own_identity.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    pub async fn send_text(&self, target: &str, text: &str) -> Result<SentMessage, TransportError> {
        let session = self
            .current_session()
            .ok_or_else(|| TransportError::not_connected("no live transport session"))?;
        session.send_text(target, text).await
    }

    pub async fn group_metadata(&self, group_address: &str) -> Result<GroupMetadata, TransportError> {
        let session = self
            .current_session()
            .ok_or_else(|| TransportError::not_connected("no live transport session"))?;
        session.group_metadata(group_address).await
    }

    pub(crate) fn current_session(&self) -> Option<Arc<dyn TransportSession>> {
        self.shared
            .session
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub(crate) fn attach(&self, session: Arc<dyn TransportSession>) {
        *self
            .shared
            .session
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(session);
    }

    pub(crate) fn detach(&self) -> Option<Arc<dyn TransportSession>> {
        self.shared
            .session
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    pub(crate) fn update(&self, mutate: impl FnOnce(&mut ConnectionStatus)) -> bool {
        self.shared.status.send_if_modified(|status| {
            let before = status.clone();
            mutate(status);
            *status != before
        })
    }
}

#[derive(Debug, Clone)]
/// Public struct `SupervisorConfig` used across chatbridge components.
pub struct SupervisorConfig {
    pub state_dir: PathBuf,
    pub reconnect_delay: Duration,
    pub max_credential_resets: u32,
    pub session_cleanup_interval: Duration,
    pub session_max_idle: Duration,
}

impl SupervisorConfig {
    pub fn for_state_dir(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            reconnect_delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
            max_credential_resets: DEFAULT_MAX_CREDENTIAL_RESETS,
            session_cleanup_interval: DEFAULT_SESSION_CLEANUP_INTERVAL,
            session_max_idle: DEFAULT_SESSION_MAX_IDLE,
        }
    }
}

#[derive(Clone)]
/// Timers re-armed every time the session reaches `Connected`.
pub struct DependentTimers {
    pub conversations: Arc<dyn ConversationStore>,
    pub follow_ups: Arc<dyn FollowUpScheduler>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionOutcome {
    Retry,
    Terminal,
    Cancelled,
}

struct ActiveRun {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct SupervisorInner {
    config: SupervisorConfig,
    connector: Arc<dyn TransportConnector>,
    credentials: CredentialStore,
    handle: ConnectionHandle,
    timers: DependentTimers,
    message_events: mpsc::Sender<MessageEvent>,
    running: AtomicBool,
    active_run: Mutex<Option<ActiveRun>>,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
/// Owns the transport session and its reconnect policy.
pub struct ConnectionSupervisor {
    inner: Arc<SupervisorInner>,
}

impl ConnectionSupervisor {
    pub fn new(
        config: SupervisorConfig,
        connector: Arc<dyn TransportConnector>,
        timers: DependentTimers,
        message_events: mpsc::Sender<MessageEvent>,
    ) -> Self {
        let credentials = CredentialStore::for_state_dir(&config.state_dir);
        Self {
            inner: Arc::new(SupervisorInner {
                config,
                connector,
                credentials,
                handle: ConnectionHandle::new(),
                timers,
                message_events,
                running: AtomicBool::new(false),
                active_run: Mutex::new(None),
                cleanup_task: Mutex::new(None),
            }),
        }
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.inner.handle.clone()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Starts supervision. Returns false when a run is already in flight or the
    /// supervisor is `Failed` and needs [`Self::reset_and_restart`].
    pub fn start(&self) -> bool {
        if self.inner.handle.state() == ConnectionState::Failed {
            tracing::warn!("connection supervisor is failed; reset required before start");
            return false;
        }
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("connection supervisor already running");
            return false;
        }
        let (cancel, cancel_rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            inner.supervise(cancel_rx).await;
        });
        *lock_or_recover(&self.inner.active_run) = Some(ActiveRun { cancel, task });
        true
    }

    /// Ends the session and any pending reconnect. Credentials are kept.
    pub async fn stop(&self) {
        let active = lock_or_recover(&self.inner.active_run).take();
        if let Some(active) = active {
            let _ = active.cancel.send(true);
            if let Err(error) = active.task.await {
                tracing::warn!(error = %error, "connection supervision task ended abnormally");
            }
        }
        self.inner.stop_cleanup_timer();
        if let Some(session) = self.inner.handle.detach() {
            session.end().await;
        }
        self.inner.transition(|status| {
            if status.state != ConnectionState::Failed {
                status.state = ConnectionState::Idle;
            }
            status.pairing_challenge = None;
        });
    }

    /// Destroys persisted credentials and starts over with a fresh pairing.
    pub async fn reset_and_restart(&self) -> Result<bool> {
        self.stop().await;
        self.inner.credentials.purge()?;
        self.inner.transition(|status| {
            *status = ConnectionStatus::default();
        });
        tracing::info!("credentials reset; restarting connection supervisor");
        Ok(self.start())
    }

    /// Unlinks the device, cancels any pending reconnect, and purges credentials.
    pub async fn logout(&self, restart: bool) -> Result<bool> {
        if let Some(session) = self.inner.handle.current_session() {
            if let Err(error) = session.logout().await {
                tracing::warn!(error = %error, "transport logout failed; purging credentials anyway");
            }
        }
        self.stop().await;
        self.inner.credentials.purge()?;
        self.inner.transition(|status| {
            *status = ConnectionStatus::default();
        });
        tracing::info!(restart, "logged out of transport session");
        if restart {
            return Ok(self.start());
        }
        Ok(false)
    }
}

impl SupervisorInner {
    fn transition(&self, mutate: impl FnOnce(&mut ConnectionStatus)) {
        if !self.handle.update(mutate) {
            return;
        }
        let status = self.handle.status();
        tracing::debug!(
            state = status.state.as_str(),
            reconnect_counter = status.reconnect_counter,
            "connection state updated"
        );
        if let Err(error) = write_connection_snapshot(&self.config.state_dir, &status) {
            tracing::warn!(error = %error, "failed to persist connection snapshot");
        }
    }

    async fn supervise(self: Arc<Self>, mut cancel: watch::Receiver<bool>) {
        loop {
            match self.run_session(&mut cancel).await {
                SessionOutcome::Cancelled | SessionOutcome::Terminal => break,
                SessionOutcome::Retry => {
                    tracing::info!(
                        delay_ms = self.config.reconnect_delay.as_millis() as u64,
                        "scheduling transport reconnect"
                    );
                    tokio::select! {
                        _ = cancelled(&mut cancel) => break,
                        _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                    }
                }
            }
        }
        self.running.store(false, Ordering::SeqCst);
    }

    async fn run_session(&self, cancel: &mut watch::Receiver<bool>) -> SessionOutcome {
        let credentials = match self.credentials.load() {
            Ok(credentials) => credentials,
            Err(error) => {
                tracing::warn!(error = %error, "ignoring unreadable credentials");
                None
            }
        };
        let restored = credentials.is_some();
        self.transition(|status| {
            status.state = ConnectionState::Connecting;
            status.pairing_challenge = None;
        });

        let connected = tokio::select! {
            _ = cancelled(cancel) => return SessionOutcome::Cancelled,
            result = self.connector.connect(credentials) => result,
        };
        let TransportConnection {
            session,
            mut events,
        } = match connected {
            Ok(connection) => connection,
            Err(error) => {
                tracing::warn!(error = %error, "transport connect failed");
                self.transition(|status| {
                    status.last_close_code = None;
                    status.last_close_reason = Some(error.kind.as_str().to_string());
                });
                return SessionOutcome::Retry;
            }
        };

        loop {
            let event = tokio::select! {
                biased;
                _ = cancelled(cancel) => {
                    self.handle.detach();
                    session.end().await;
                    return SessionOutcome::Cancelled;
                }
                event = events.recv() => event,
            };
            let Some(event) = event else {
                tracing::warn!("transport event stream ended");
                self.handle.detach();
                self.stop_cleanup_timer();
                return self.on_closed(DisconnectCode::ConnectionLost, Some("event stream ended"));
            };
            match event {
                TransportEvent::Connection(ConnectionUpdate::Connecting) => {}
                TransportEvent::Connection(ConnectionUpdate::PairingRequired { challenge }) => {
                    if restored {
                        tracing::debug!("pairing challenge ignored while restoring credentials");
                        continue;
                    }
                    tracing::info!("pairing challenge available");
                    self.transition(|status| {
                        status.pairing_challenge = Some(challenge);
                    });
                }
                TransportEvent::Connection(ConnectionUpdate::Open { own_address }) => {
                    self.on_connected(Arc::clone(&session), own_address.as_deref())
                        .await;
                }
                TransportEvent::Connection(ConnectionUpdate::Closed { code, detail }) => {
                    self.handle.detach();
                    self.stop_cleanup_timer();
                    session.end().await;
                    return self.on_closed(code, detail.as_deref());
                }
                TransportEvent::CredentialsUpdated(credentials) => {
                    if let Err(error) = self.credentials.save(&credentials) {
                        tracing::warn!(error = %error, "failed to persist updated credentials");
                    }
                }
                TransportEvent::MessagesUpserted(messages) => {
                    self.forward(MessageEvent::Upserted(messages)).await;
                }
                TransportEvent::MessageStatusUpdated(updates) => {
                    self.forward(MessageEvent::StatusUpdated(updates)).await;
                }
            }
        }
    }

    async fn forward(&self, event: MessageEvent) {
        if self.message_events.send(event).await.is_err() {
            tracing::warn!("message dispatcher is not listening; dropping transport event");
        }
    }

    async fn on_connected(&self, session: Arc<dyn TransportSession>, own_address: Option<&str>) {
        self.handle.attach(session);
        let own_identity = own_address.and_then(canonical_identity);
        self.transition(|status| {
            status.state = ConnectionState::Connected;
            status.reconnect_counter = 0;
            status.pairing_challenge = None;
            status.own_identity = own_identity;
        });
        tracing::info!("transport session connected");
        self.rearm_session_cleanup();
        if let Err(error) = self
            .timers
            .follow_ups
            .start_follow_up_timer(self.handle.clone())
            .await
        {
            tracing::warn!(error = %error, "failed to arm follow-up timer");
        }
    }

    fn on_closed(&self, code: DisconnectCode, detail: Option<&str>) -> SessionOutcome {
        let reason = detail.unwrap_or(code.as_str()).to_string();
        match classify_disconnect(code) {
            DisconnectClass::LoggedOut => {
                tracing::info!(code = %code, "transport logged out; not reconnecting");
                self.transition(|status| {
                    status.state = ConnectionState::Idle;
                    status.pairing_challenge = None;
                    status.last_close_code = Some(code.status_code());
                    status.last_close_reason = Some(reason);
                });
                SessionOutcome::Terminal
            }
            DisconnectClass::CredentialRejected => {
                match self.credentials.purge() {
                    Ok(purged) => tracing::warn!(code = %code, purged, "credentials rejected"),
                    Err(error) => {
                        tracing::error!(code = %code, error = %error, "failed to purge rejected credentials")
                    }
                }
                let limit = self.config.max_credential_resets;
                let mut exhausted = false;
                self.transition(|status| {
                    status.reconnect_counter = status.reconnect_counter.saturating_add(1);
                    exhausted = status.reconnect_counter > limit;
                    status.state = if exhausted {
                        ConnectionState::Failed
                    } else {
                        ConnectionState::Connecting
                    };
                    status.pairing_challenge = None;
                    status.last_close_code = Some(code.status_code());
                    status.last_close_reason = Some(reason);
                });
                if exhausted {
                    tracing::error!(
                        limit,
                        "credential resets exhausted; manual re-pairing required"
                    );
                    return SessionOutcome::Terminal;
                }
                SessionOutcome::Retry
            }
            DisconnectClass::Transient => {
                tracing::info!(code = %code, "transport closed; will reconnect");
                self.transition(|status| {
                    status.state = ConnectionState::Connecting;
                    status.pairing_challenge = None;
                    status.last_close_code = Some(code.status_code());
                    status.last_close_reason = Some(reason);
                });
                SessionOutcome::Retry
            }
        }
    }

    fn rearm_session_cleanup(&self) {
        let conversations = Arc::clone(&self.timers.conversations);
        let period = self
            .config
            .session_cleanup_interval
            .max(Duration::from_millis(1));
        let max_idle = self.config.session_max_idle;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match conversations.purge_idle_sessions(max_idle).await {
                    Ok(0) => {}
                    Ok(removed) => tracing::info!(removed, "purged idle conversation sessions"),
                    Err(error) => tracing::warn!(error = %error, "session cleanup failed"),
                }
            }
        });
        if let Some(previous) = lock_or_recover(&self.cleanup_task).replace(task) {
            previous.abort();
        }
    }

    fn stop_cleanup_timer(&self) {
        if let Some(task) = lock_or_recover(&self.cleanup_task).take() {
            task.abort();
        }
    }
}
