//! Dispatch ledger and delivery failure database models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::now_ms;

/// Dispatch log database model.
/// The durable record that a rule matched a listing. Unique per
/// `(rule_id, listing_id)`. Besides `is_read`, only the delivery state
/// (`dispatched_at`, `lease_expires_at`) changes after insert.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct DispatchLogDbModel {
    pub id: i64,
    pub rule_id: String,
    pub listing_id: String,
    pub user_id: String,
    pub message: String,
    pub sent_at: i64,
    pub is_read: bool,
    /// Set once every channel has a final outcome.
    pub dispatched_at: Option<i64>,
    /// Delivery claim held until this time (ms). 0 when released.
    #[serde(skip)]
    pub lease_expires_at: i64,
}

impl DispatchLogDbModel {
    pub fn is_dispatched(&self) -> bool {
        self.dispatched_at.is_some()
    }
}

/// Final outcome of an entry on one channel.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Delivered,
    /// A failure row was written; the channel is not tried again.
    Failed,
}

impl DeliveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }
}

/// Ledger entry joined with a summary of the rule that produced it.
/// Rule columns are `None` once the rule has been deleted.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DispatchLogWithRule {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub entry: DispatchLogDbModel,
    pub rule_name: Option<String>,
    pub rule_category: Option<String>,
    pub rule_sido_code: Option<String>,
    pub rule_sigu_code: Option<String>,
}

/// Per-user notification statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationStats {
    /// Enabled rules.
    pub active_alerts: i64,
    /// All ledger entries.
    pub total_matches: i64,
    /// Ledger entries since the start of the current week.
    pub this_week: i64,
}

/// Why a delivery did not reach the user.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DeliveryErrorKind {
    /// Retry budget exhausted on retryable errors.
    Transient,
    /// Identifier rejected by the transport; the channel was disabled.
    Permanent,
    /// Channel type has no working transport.
    Unsupported,
    /// Circuit breaker for the channel type was open.
    CircuitOpen,
    /// Event processing hit its deadline before this channel was done.
    /// The entry stays pending and a replay delivers it.
    Aborted,
}

impl DeliveryErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::Unsupported => "unsupported",
            Self::CircuitOpen => "circuit_open",
            Self::Aborted => "aborted",
        }
    }
}

/// Delivery failure database model.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct DeliveryFailureDbModel {
    pub id: i64,
    pub dispatch_log_id: i64,
    pub rule_id: String,
    pub listing_id: String,
    pub user_id: String,
    pub channel_id: String,
    pub channel_type: String,
    pub error_kind: String,
    pub error_message: String,
    pub attempts: i64,
    pub created_at: i64,
}

impl DeliveryFailureDbModel {
    /// Build an unsaved failure row for `entry`; `id` is assigned on insert.
    pub fn new(
        entry: &DispatchLogDbModel,
        channel_id: impl Into<String>,
        channel_type: impl Into<String>,
        kind: DeliveryErrorKind,
        error_message: impl Into<String>,
        attempts: u32,
    ) -> Self {
        Self {
            id: 0,
            dispatch_log_id: entry.id,
            rule_id: entry.rule_id.clone(),
            listing_id: entry.listing_id.clone(),
            user_id: entry.user_id.clone(),
            channel_id: channel_id.into(),
            channel_type: channel_type.into(),
            error_kind: kind.as_str().to_string(),
            error_message: error_message.into(),
            attempts: i64::from(attempts),
            created_at: now_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_error_kind_strings() {
        assert_eq!(DeliveryErrorKind::CircuitOpen.as_str(), "circuit_open");
        assert_eq!(
            DeliveryErrorKind::from_str("circuit_open").unwrap(),
            DeliveryErrorKind::CircuitOpen
        );
        assert_eq!(DeliveryErrorKind::Transient.to_string(), "transient");
        assert_eq!(DeliveryErrorKind::Aborted.as_str(), "aborted");
        assert_eq!(DeliveryOutcome::Delivered.to_string(), "delivered");
    }

    #[test]
    fn test_failure_copies_entry_keys() {
        let entry = DispatchLogDbModel {
            id: 7,
            rule_id: "r1".into(),
            listing_id: "l1".into(),
            user_id: "u1".into(),
            message: "hi".into(),
            sent_at: 0,
            is_read: false,
            dispatched_at: None,
            lease_expires_at: 0,
        };
        let failure = DeliveryFailureDbModel::new(
            &entry,
            "c1",
            "telegram",
            DeliveryErrorKind::Transient,
            "timeout",
            3,
        );
        assert_eq!(failure.dispatch_log_id, 7);
        assert_eq!(failure.rule_id, "r1");
        assert_eq!(failure.attempts, 3);
        assert_eq!(failure.error_kind, "transient");
    }
}
