//! Messaging transport contract and clients for the chatbridge runtime.
//!
//! Provides the typed event/command contract, canonical identity
//! normalization, the WebSocket sidecar client used in production, and a
//! scripted in-process transport for deterministic replay.

pub mod transport_contract;
pub mod transport_identity;
pub mod transport_scripted;
pub mod transport_sidecar;

pub use transport_contract::*;
pub use transport_identity::*;
pub use transport_scripted::*;
pub use transport_sidecar::*;
