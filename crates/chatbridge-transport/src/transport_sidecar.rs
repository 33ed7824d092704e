//! WebSocket client for the messaging-platform sidecar process.
//!
//! The sidecar owns the platform protocol and the device pairing; this side
//! speaks a small JSON frame protocol. Commands carry a `request_id` and are
//! answered by `response` frames; everything else is an event. When the socket
//! drops, outstanding requests fail with `not_connected` and a synthetic
//! `connection_lost` close is emitted so the supervisor can classify it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

use crate::transport_contract::{
    ConnectionUpdate, DisconnectCode, GroupMetadata, MessageStatusUpdate, RawInboundMessage,
    SentMessage, SessionCredentials, TransportConnection, TransportConnector, TransportError,
    TransportErrorKind, TransportEvent, TransportSession,
};

type PendingRequests = Arc<Mutex<HashMap<String, oneshot::Sender<Result<Value, TransportError>>>>>;

#[derive(Debug, Clone)]
/// Public struct `SidecarTransportConfig` used by the bridge binary.
pub struct SidecarTransportConfig {
    pub url: String,
    pub request_timeout_ms: u64,
    pub event_buffer: usize,
}

impl Default for SidecarTransportConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8790/bridge".to_string(),
            request_timeout_ms: 15_000,
            event_buffer: 256,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SidecarErrorBody {
    #[serde(default)]
    kind: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum SidecarFrame {
    #[serde(rename = "connection.update")]
    ConnectionUpdate {
        #[serde(default)]
        connection: Option<String>,
        #[serde(default)]
        qr: Option<String>,
        #[serde(default)]
        status_code: Option<u16>,
        #[serde(default)]
        detail: Option<String>,
        #[serde(default)]
        own_address: Option<String>,
    },
    #[serde(rename = "creds.update")]
    CredsUpdate { credentials: Value },
    #[serde(rename = "messages.upsert")]
    MessagesUpsert {
        #[serde(default)]
        messages: Vec<RawInboundMessage>,
    },
    #[serde(rename = "messages.update")]
    MessagesUpdate {
        #[serde(default)]
        updates: Vec<MessageStatusUpdate>,
    },
    #[serde(rename = "response")]
    Response {
        request_id: String,
        ok: bool,
        #[serde(default)]
        result: Value,
        #[serde(default)]
        error: Option<SidecarErrorBody>,
    },
}

#[derive(Debug)]
enum ParsedSidecarFrame {
    Events(Vec<TransportEvent>),
    Response {
        request_id: String,
        result: Result<Value, TransportError>,
    },
}

fn parse_sidecar_frame(raw: &str) -> Result<ParsedSidecarFrame, TransportError> {
    let frame = serde_json::from_str::<SidecarFrame>(raw).map_err(|error| {
        TransportError::new(
            TransportErrorKind::Protocol,
            format!("invalid sidecar frame: {error}"),
        )
    })?;
    let parsed = match frame {
        SidecarFrame::ConnectionUpdate {
            connection,
            qr,
            status_code,
            detail,
            own_address,
        } => {
            let mut events = Vec::new();
            if let Some(challenge) = qr.filter(|value| !value.trim().is_empty()) {
                events.push(TransportEvent::Connection(
                    ConnectionUpdate::PairingRequired { challenge },
                ));
            }
            match connection.as_deref().map(str::trim) {
                Some("connecting") => {
                    events.push(TransportEvent::Connection(ConnectionUpdate::Connecting))
                }
                Some("open") => events.push(TransportEvent::Connection(ConnectionUpdate::Open {
                    own_address,
                })),
                Some("close") => {
                    let code = status_code
                        .map(DisconnectCode::from_status_code)
                        .unwrap_or(DisconnectCode::ConnectionClosed);
                    events.push(TransportEvent::Connection(ConnectionUpdate::Closed {
                        code,
                        detail,
                    }));
                }
                Some(other) if !other.is_empty() => {
                    return Err(TransportError::new(
                        TransportErrorKind::Protocol,
                        format!("unsupported connection state '{other}'"),
                    ));
                }
                _ => {}
            }
            ParsedSidecarFrame::Events(events)
        }
        SidecarFrame::CredsUpdate { credentials } => ParsedSidecarFrame::Events(vec![
            TransportEvent::CredentialsUpdated(SessionCredentials(credentials)),
        ]),
        SidecarFrame::MessagesUpsert { messages } => {
            ParsedSidecarFrame::Events(vec![TransportEvent::MessagesUpserted(messages)])
        }
        SidecarFrame::MessagesUpdate { updates } => {
            ParsedSidecarFrame::Events(vec![TransportEvent::MessageStatusUpdated(updates)])
        }
        SidecarFrame::Response {
            request_id,
            ok,
            result,
            error,
        } => {
            let result = if ok {
                Ok(result)
            } else {
                let body = error.unwrap_or(SidecarErrorBody {
                    kind: String::new(),
                    message: "sidecar reported failure without detail".to_string(),
                });
                Err(TransportError::new(
                    TransportErrorKind::from_wire(&body.kind),
                    body.message,
                ))
            };
            ParsedSidecarFrame::Response { request_id, result }
        }
    };
    Ok(parsed)
}

fn fail_pending_requests(pending: &PendingRequests, detail: &str) {
    let drained = match pending.lock() {
        Ok(mut guard) => guard.drain().collect::<Vec<_>>(),
        Err(_) => return,
    };
    for (_, waiter) in drained {
        let _ = waiter.send(Err(TransportError::not_connected(detail)));
    }
}

/// Connector that opens one sidecar WebSocket per session attempt.
pub struct SidecarTransportConnector {
    config: SidecarTransportConfig,
}

impl SidecarTransportConnector {
    pub fn new(config: SidecarTransportConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl TransportConnector for SidecarTransportConnector {
    async fn connect(
        &self,
        credentials: Option<SessionCredentials>,
    ) -> Result<TransportConnection, TransportError> {
        let (stream, _response) = connect_async(self.config.url.as_str())
            .await
            .map_err(|error| {
                TransportError::not_connected(format!(
                    "failed to connect sidecar {}: {error}",
                    self.config.url
                ))
            })?;
        let (mut sink, mut source) = stream.split();
        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<WsMessage>();
        let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(self.config.event_buffer.max(1));
        let pending: PendingRequests = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                let closing = matches!(message, WsMessage::Close(_));
                if let Err(error) = sink.send(message).await {
                    tracing::debug!(%error, "sidecar socket write failed");
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let reader_pending = pending.clone();
        tokio::spawn(async move {
            let mut close_forwarded = false;
            while let Some(frame) = source.next().await {
                let message = match frame {
                    Ok(message) => message,
                    Err(error) => {
                        tracing::warn!(%error, "sidecar socket read failed");
                        break;
                    }
                };
                let text = match message {
                    WsMessage::Text(text) => text.as_str().to_string(),
                    WsMessage::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => text,
                        Err(_) => {
                            tracing::warn!("sidecar sent non utf-8 binary frame");
                            continue;
                        }
                    },
                    WsMessage::Close(_) => break,
                    WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => continue,
                };
                match parse_sidecar_frame(&text) {
                    Ok(ParsedSidecarFrame::Events(events)) => {
                        for event in events {
                            if matches!(
                                event,
                                TransportEvent::Connection(ConnectionUpdate::Closed { .. })
                            ) {
                                close_forwarded = true;
                            }
                            if event_tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                    Ok(ParsedSidecarFrame::Response { request_id, result }) => {
                        let waiter = reader_pending
                            .lock()
                            .ok()
                            .and_then(|mut guard| guard.remove(&request_id));
                        match waiter {
                            Some(waiter) => {
                                let _ = waiter.send(result);
                            }
                            None => {
                                tracing::debug!(request_id = %request_id, "dropping unmatched sidecar response")
                            }
                        }
                    }
                    Err(error) => tracing::warn!(%error, "ignoring malformed sidecar frame"),
                }
            }
            fail_pending_requests(&reader_pending, "sidecar socket closed");
            if !close_forwarded {
                let _ = event_tx
                    .send(TransportEvent::Connection(ConnectionUpdate::Closed {
                        code: DisconnectCode::ConnectionLost,
                        detail: Some("sidecar socket closed".to_string()),
                    }))
                    .await;
            }
        });

        let connect_frame = json!({
            "op": "connect",
            "credentials": credentials.map(|value| value.0),
        });
        outgoing_tx
            .send(WsMessage::Text(connect_frame.to_string().into()))
            .map_err(|_| TransportError::not_connected("sidecar writer stopped before connect"))?;

        let session = SidecarSession {
            outgoing: outgoing_tx,
            pending,
            next_request_id: AtomicU64::new(1),
            request_timeout: Duration::from_millis(self.config.request_timeout_ms.max(1)),
        };
        Ok(TransportConnection {
            session: Arc::new(session),
            events: event_rx,
        })
    }
}

struct SidecarSession {
    outgoing: mpsc::UnboundedSender<WsMessage>,
    pending: PendingRequests,
    next_request_id: AtomicU64,
    request_timeout: Duration,
}

impl SidecarSession {
    async fn request<F>(&self, build_frame: F) -> Result<Value, TransportError>
    where
        F: FnOnce(&str) -> Value,
    {
        let request_id = format!(
            "req-{}",
            self.next_request_id.fetch_add(1, Ordering::Relaxed)
        );
        let (waiter_tx, waiter_rx) = oneshot::channel();
        self.pending
            .lock()
            .map_err(|_| TransportError::new(TransportErrorKind::Io, "pending map is poisoned"))?
            .insert(request_id.clone(), waiter_tx);

        let frame = build_frame(&request_id);
        if self
            .outgoing
            .send(WsMessage::Text(frame.to_string().into()))
            .is_err()
        {
            self.forget(&request_id);
            return Err(TransportError::not_connected("sidecar writer is closed"));
        }

        match tokio::time::timeout(self.request_timeout, waiter_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::not_connected(
                "sidecar session closed before response",
            )),
            Err(_) => {
                self.forget(&request_id);
                Err(TransportError::new(
                    TransportErrorKind::Timeout,
                    format!(
                        "sidecar did not answer {request_id} within {} ms",
                        self.request_timeout.as_millis()
                    ),
                ))
            }
        }
    }

    fn forget(&self, request_id: &str) {
        if let Ok(mut guard) = self.pending.lock() {
            guard.remove(request_id);
        }
    }
}

#[async_trait]
impl TransportSession for SidecarSession {
    async fn send_text(&self, target: &str, text: &str) -> Result<SentMessage, TransportError> {
        let result = self
            .request(|request_id| {
                json!({
                    "op": "send_message",
                    "request_id": request_id,
                    "target": target,
                    "text": text,
                })
            })
            .await?;
        let message_id = result
            .get("message_id")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                TransportError::new(
                    TransportErrorKind::Protocol,
                    "send_message response missing message_id",
                )
            })?;
        Ok(SentMessage {
            message_id: message_id.to_string(),
        })
    }

    async fn group_metadata(&self, group_address: &str) -> Result<GroupMetadata, TransportError> {
        let result = self
            .request(|request_id| {
                json!({
                    "op": "group_metadata",
                    "request_id": request_id,
                    "group_id": group_address,
                })
            })
            .await?;
        let subject = result
            .get("subject")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string();
        Ok(GroupMetadata {
            group_address: group_address.to_string(),
            subject,
        })
    }

    async fn logout(&self) -> Result<(), TransportError> {
        self.request(|request_id| json!({"op": "logout", "request_id": request_id}))
            .await
            .map(|_| ())
    }

    async fn end(&self) {
        let _ = self.outgoing.send(WsMessage::Close(None));
        fail_pending_requests(&self.pending, "session ended locally");
    }
}
