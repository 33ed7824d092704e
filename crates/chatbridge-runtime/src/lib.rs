//! Connection-resilience and message-dispatch engine for the chatbridge.
//!
//! [`ConnectionSupervisor`] keeps the transport session alive and exposes it
//! through a [`ConnectionHandle`]; [`MessageDispatcher`] consumes message
//! events, consults [`ModeGate`], calls the AI collaborator, and replies.
//! [`StatusTracker`] keeps delivery statuses monotonic.

pub mod audit_log;
pub mod collaborators;
pub mod connection_supervisor;
pub mod credential_store;
pub mod file_stores;
pub mod handoff_marker;
pub mod message_dispatcher;
pub mod mode_gate;
pub mod openai_responder;
pub mod state_io;
pub mod status_tracker;

pub use audit_log::*;
pub use collaborators::*;
pub use connection_supervisor::*;
pub use credential_store::*;
pub use file_stores::*;
pub use handoff_marker::*;
pub use message_dispatcher::*;
pub use mode_gate::*;
pub use openai_responder::*;
pub use state_io::*;
pub use status_tracker::*;
