use std::sync::Arc;

use anyhow::Result;
use chatbridge_transport::CanonicalIdentity;

use crate::collaborators::{ConversationMode, ModeStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Result of a mode write, carrying both sides for audit logging.
pub struct ModeChange {
    pub previous: ConversationMode,
    pub current: ConversationMode,
    pub changed: bool,
}

#[derive(Clone)]
/// Decides whether automated replies are allowed for a contact.
///
/// Holds no state of its own; every decision is read through the backing
/// [`ModeStore`].
pub struct ModeGate {
    store: Arc<dyn ModeStore>,
}

impl ModeGate {
    pub fn new(store: Arc<dyn ModeStore>) -> Self {
        Self { store }
    }

    pub async fn mode(&self, identity: &CanonicalIdentity) -> Result<ConversationMode> {
        self.store.get_mode(identity).await
    }

    pub async fn allow_auto_reply(&self, identity: &CanonicalIdentity) -> Result<bool> {
        Ok(self.mode(identity).await? == ConversationMode::Ai)
    }

    pub async fn request_handoff(&self, identity: &CanonicalIdentity) -> Result<ModeChange> {
        self.set_mode(identity, ConversationMode::Support).await
    }

    /// Writes `mode` only when it differs from the stored value.
    pub async fn set_mode(
        &self,
        identity: &CanonicalIdentity,
        mode: ConversationMode,
    ) -> Result<ModeChange> {
        let previous = self.store.get_mode(identity).await?;
        let changed = previous != mode;
        if changed {
            self.store.set_mode(identity, mode).await?;
        }
        tracing::info!(
            identity = %identity,
            previous = previous.as_str(),
            current = mode.as_str(),
            changed,
            "conversation mode set"
        );
        Ok(ModeChange {
            previous,
            current: mode,
            changed,
        })
    }
}
