//! Monotonic delivery-status tracking for outbound messages.
//!
//! Status events arrive asynchronously and out of order. Each outbound message
//! id keeps the highest rank observed so far; regressions are discarded.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::collaborators::AuditLogger;

pub const DEFAULT_STATUS_TRACKER_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `DeliveryStatus` values, ordered by rank.
pub enum DeliveryStatus {
    Sent = 1,
    Delivered = 2,
    Read = 3,
}

impl DeliveryStatus {
    /// Maps the transport's ack code; pending/error codes carry no rank.
    pub fn from_transport_code(code: u8) -> Option<Self> {
        match code {
            2 => Some(Self::Sent),
            3 => Some(Self::Delivered),
            4 | 5 => Some(Self::Read),
            _ => None,
        }
    }

    pub fn rank(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Enumerates supported `StatusApplyOutcome` values.
pub enum StatusApplyOutcome {
    Applied(DeliveryStatus),
    Unchanged(DeliveryStatus),
    Regressed {
        stored: DeliveryStatus,
        observed: DeliveryStatus,
    },
    Unrecognized(u8),
}

#[derive(Default)]
struct TrackedStatuses {
    by_message_id: HashMap<String, DeliveryStatus>,
    insertion_order: VecDeque<String>,
}

/// Keeps the best-known status per outbound message id and persists upgrades.
pub struct StatusTracker {
    logger: Arc<dyn AuditLogger>,
    capacity: usize,
    statuses: Mutex<TrackedStatuses>,
}

impl StatusTracker {
    pub fn new(logger: Arc<dyn AuditLogger>) -> Self {
        Self::with_capacity(logger, DEFAULT_STATUS_TRACKER_CAPACITY)
    }

    pub fn with_capacity(logger: Arc<dyn AuditLogger>, capacity: usize) -> Self {
        Self {
            logger,
            capacity: capacity.max(1),
            statuses: Mutex::new(TrackedStatuses::default()),
        }
    }

    pub async fn status(&self, message_id: &str) -> Option<DeliveryStatus> {
        self.statuses
            .lock()
            .await
            .by_message_id
            .get(message_id)
            .copied()
    }

    pub async fn apply_status(
        &self,
        message_id: &str,
        observed_code: u8,
    ) -> Result<StatusApplyOutcome> {
        let Some(observed) = DeliveryStatus::from_transport_code(observed_code) else {
            return Ok(StatusApplyOutcome::Unrecognized(observed_code));
        };

        // Held across the persist call so concurrent updates for one id cannot interleave.
        let mut tracked = self.statuses.lock().await;
        if let Some(stored) = tracked.by_message_id.get(message_id).copied() {
            if observed < stored {
                tracing::debug!(
                    message_id,
                    stored = stored.as_str(),
                    observed = observed.as_str(),
                    "discarding delivery status regression"
                );
                return Ok(StatusApplyOutcome::Regressed { stored, observed });
            }
            if observed == stored {
                return Ok(StatusApplyOutcome::Unchanged(stored));
            }
        }
        // Only a persisted upgrade is cached; a failed write stays retryable.
        self.logger
            .update_message_status(message_id, observed)
            .await?;
        if tracked
            .by_message_id
            .insert(message_id.to_string(), observed)
            .is_none()
        {
            tracked.insertion_order.push_back(message_id.to_string());
        }
        while tracked.insertion_order.len() > self.capacity {
            if let Some(evicted) = tracked.insertion_order.pop_front() {
                tracked.by_message_id.remove(&evicted);
            }
        }
        Ok(StatusApplyOutcome::Applied(observed))
    }
}
