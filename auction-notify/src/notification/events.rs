//! Operational events.
//!
//! Failures that an operator should see but that never reach end users:
//! delivery failures, disabled channels, open circuits, store errors and
//! dropped events. Published on a `tokio::sync::broadcast` channel; nothing
//! blocks when there are no subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::database::models::DeliveryErrorKind;

/// Capacity of the ops broadcast channel.
pub const OPS_CHANNEL_CAPACITY: usize = 256;

/// Severity of an operational event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum OpsSeverity {
    /// Expected degradation, e.g. a user's chat went away.
    Warning,
    /// Something is broken and matches may go unnotified.
    Error,
}

impl std::fmt::Display for OpsSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Events on the operational error channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OpsEvent {
    /// A recorded match could not be delivered on one channel.
    DeliveryFailed {
        rule_id: String,
        listing_id: String,
        user_id: String,
        channel_id: String,
        channel_type: String,
        kind: DeliveryErrorKind,
        attempts: u32,
        error: String,
        timestamp: DateTime<Utc>,
    },
    /// A channel was disabled after its identifier was rejected.
    ChannelDisabled {
        channel_id: String,
        user_id: String,
        channel_type: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    /// Sends to a channel type are short-circuited until cooldown.
    CircuitOpened {
        channel_type: String,
        consecutive_failures: u32,
        timestamp: DateTime<Utc>,
    },
    /// A store operation failed while processing a listing.
    StoreError {
        operation: String,
        listing_id: String,
        rule_id: Option<String>,
        error: String,
        timestamp: DateTime<Utc>,
    },
    /// An event ran past its processing deadline.
    EventTimedOut {
        listing_id: String,
        timeout_secs: u64,
        timestamp: DateTime<Utc>,
    },
    /// An event was given up on after its replay budget.
    EventDropped {
        listing_id: String,
        attempts: u32,
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

impl OpsEvent {
    pub fn severity(&self) -> OpsSeverity {
        match self {
            Self::DeliveryFailed { kind, .. } => match kind {
                DeliveryErrorKind::Permanent | DeliveryErrorKind::Unsupported => {
                    OpsSeverity::Warning
                }
                DeliveryErrorKind::Transient
                | DeliveryErrorKind::CircuitOpen
                | DeliveryErrorKind::Aborted => OpsSeverity::Error,
            },
            Self::ChannelDisabled { .. } => OpsSeverity::Warning,
            Self::CircuitOpened { .. } => OpsSeverity::Error,
            Self::StoreError { .. } => OpsSeverity::Error,
            Self::EventTimedOut { .. } => OpsSeverity::Warning,
            Self::EventDropped { .. } => OpsSeverity::Error,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::DeliveryFailed { .. } => "delivery_failed",
            Self::ChannelDisabled { .. } => "channel_disabled",
            Self::CircuitOpened { .. } => "circuit_opened",
            Self::StoreError { .. } => "store_error",
            Self::EventTimedOut { .. } => "event_timed_out",
            Self::EventDropped { .. } => "event_dropped",
        }
    }

    /// One-line human-readable summary.
    pub fn description(&self) -> String {
        match self {
            Self::DeliveryFailed {
                rule_id,
                listing_id,
                channel_type,
                kind,
                attempts,
                error,
                ..
            } => format!(
                "{kind} delivery failure on {channel_type} for rule {rule_id}, listing {listing_id} after {attempts} attempt(s): {error}"
            ),
            Self::ChannelDisabled {
                channel_id,
                channel_type,
                reason,
                ..
            } => format!("{channel_type} channel {channel_id} disabled: {reason}"),
            Self::CircuitOpened {
                channel_type,
                consecutive_failures,
                ..
            } => format!(
                "circuit opened for {channel_type} after {consecutive_failures} consecutive failures"
            ),
            Self::StoreError {
                operation,
                listing_id,
                rule_id,
                error,
                ..
            } => match rule_id {
                Some(rule_id) => format!(
                    "{operation} failed for rule {rule_id}, listing {listing_id}: {error}"
                ),
                None => format!("{operation} failed for listing {listing_id}: {error}"),
            },
            Self::EventTimedOut {
                listing_id,
                timeout_secs,
                ..
            } => format!("listing {listing_id} exceeded the {timeout_secs}s processing deadline"),
            Self::EventDropped {
                listing_id,
                attempts,
                reason,
                ..
            } => format!("listing {listing_id} dropped after {attempts} attempt(s): {reason}"),
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::DeliveryFailed { timestamp, .. }
            | Self::ChannelDisabled { timestamp, .. }
            | Self::CircuitOpened { timestamp, .. }
            | Self::StoreError { timestamp, .. }
            | Self::EventTimedOut { timestamp, .. }
            | Self::EventDropped { timestamp, .. } => *timestamp,
        }
    }
}

/// Sending half of the ops channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct OpsPublisher {
    tx: broadcast::Sender<OpsEvent>,
}

impl OpsPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OpsEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Publish `event`. Dropped silently when nobody listens.
    pub fn publish(&self, event: OpsEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for OpsPublisher {
    fn default() -> Self {
        Self::new(OPS_CHANNEL_CAPACITY)
    }
}

/// Log every ops event until the channel closes.
pub async fn log_ops_events(mut rx: broadcast::Receiver<OpsEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => match event.severity() {
                OpsSeverity::Warning => {
                    tracing::warn!(event_type = event.event_type(), "{}", event.description())
                }
                OpsSeverity::Error => {
                    tracing::error!(event_type = event.event_type(), "{}", event.description())
                }
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "ops event logger lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
