//! Delivery of one message to one channel.
//!
//! The Notifier is responsible for:
//! - Resolving the transport for the channel's type
//! - Retrying retryable failures with exponential backoff
//! - Disabling channels whose identifier was permanently rejected
//! - A circuit breaker per channel type, so a dead upstream fails fast

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::channels::{TransportError, TransportRegistry};
use super::events::{OpsEvent, OpsPublisher};
use super::message::NotificationMessage;
use super::retry::RetryPolicy;
use crate::database::models::{DeliveryErrorKind, NotificationChannelDbModel};
use crate::database::repositories::ChannelRepository;

/// Configuration for the notifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifierConfig {
    /// Per-delivery retry policy.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Consecutive exhausted deliveries that open a channel type's circuit.
    pub circuit_breaker_threshold: u32,
    /// Seconds an open circuit waits before letting a trial send through.
    pub circuit_breaker_cooldown_secs: u64,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            circuit_breaker_threshold: 5,
            circuit_breaker_cooldown_secs: 120,
        }
    }
}

/// Circuit breaker state for a channel type.
#[derive(Debug, Clone)]
struct CircuitBreakerState {
    /// Number of consecutive failures.
    failures: u32,
    /// Whether the circuit is open.
    is_open: bool,
    /// When the circuit was opened.
    opened_at: Option<DateTime<Utc>>,
    /// When the current half-open trial send started, if one is running.
    trial_started_at: Option<DateTime<Utc>>,
    cooldown: Duration,
}

impl CircuitBreakerState {
    fn new(cooldown_secs: u64) -> Self {
        Self {
            failures: 0,
            is_open: false,
            opened_at: None,
            trial_started_at: None,
            cooldown: Duration::from_secs(cooldown_secs),
        }
    }

    /// Returns true when this failure opened the circuit.
    fn record_failure(&mut self, threshold: u32) -> bool {
        self.failures = self.failures.saturating_add(1);
        self.trial_started_at = None;

        // A failed trial send while half-open restarts the cooldown.
        if self.is_open {
            self.opened_at = Some(Utc::now());
            return false;
        }

        if self.failures >= threshold.max(1) {
            self.is_open = true;
            self.opened_at = Some(Utc::now());
            return true;
        }
        false
    }

    fn record_success(&mut self) {
        self.failures = 0;
        self.is_open = false;
        self.opened_at = None;
        self.trial_started_at = None;
    }

    /// Whether a send may go out now.
    ///
    /// Once the cooldown has passed the circuit is half-open and admits a
    /// single trial send; everything else fails fast until that trial ends.
    /// A trial that never reports back (its task was aborted) expires after
    /// another cooldown.
    fn try_acquire(&mut self) -> bool {
        if !self.is_open {
            return true;
        }

        let now = Utc::now();
        if !self.opened_at.is_some_and(|at| self.elapsed(at, now)) {
            return false;
        }
        if self
            .trial_started_at
            .is_some_and(|at| !self.elapsed(at, now))
        {
            return false;
        }

        self.trial_started_at = Some(now);
        true
    }

    /// End a trial that said nothing about the upstream's health.
    fn end_trial(&mut self) {
        self.trial_started_at = None;
    }

    fn elapsed(&self, since: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let elapsed = now.signed_duration_since(since);
        elapsed.num_milliseconds().max(0) as u128 >= self.cooldown.as_millis()
    }
}

/// Successful delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub channel_id: String,
    pub channel_type: String,
    /// Attempts used, including the successful one.
    pub attempts: u32,
}

/// Why a delivery did not happen.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("delivery failed after {attempts} attempt(s): {message}")]
    Transient { attempts: u32, message: String },
    #[error("channel identifier rejected: {message}")]
    Permanent { message: String },
    #[error("no transport available for channel type '{channel_type}'")]
    Unsupported { channel_type: String },
    #[error("circuit open for channel type '{channel_type}'")]
    CircuitOpen { channel_type: String },
    /// The identifier was rejected but the channel could not be disabled.
    #[error("channel identifier rejected ({message}); disabling the channel failed: {source}")]
    Store {
        message: String,
        #[source]
        source: crate::Error,
    },
}

impl ChannelError {
    pub fn kind(&self) -> DeliveryErrorKind {
        match self {
            Self::Transient { .. } => DeliveryErrorKind::Transient,
            Self::Permanent { .. } | Self::Store { .. } => DeliveryErrorKind::Permanent,
            Self::Unsupported { .. } => DeliveryErrorKind::Unsupported,
            Self::CircuitOpen { .. } => DeliveryErrorKind::CircuitOpen,
        }
    }

    /// Transport attempts made before giving up.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Transient { attempts, .. } => *attempts,
            Self::Permanent { .. } | Self::Unsupported { .. } | Self::Store { .. } => 1,
            Self::CircuitOpen { .. } => 0,
        }
    }
}

/// Sends rendered messages through the registered transports.
pub struct Notifier {
    transports: TransportRegistry,
    channels: Arc<dyn ChannelRepository>,
    config: NotifierConfig,
    /// Channel type -> breaker. Never held across an await.
    circuit_breakers: DashMap<String, CircuitBreakerState>,
    ops: OpsPublisher,
}

impl Notifier {
    pub fn new(
        transports: TransportRegistry,
        channels: Arc<dyn ChannelRepository>,
        config: NotifierConfig,
        ops: OpsPublisher,
    ) -> Self {
        Self {
            transports,
            channels,
            config,
            circuit_breakers: DashMap::new(),
            ops,
        }
    }

    pub fn config(&self) -> &NotifierConfig {
        &self.config
    }

    /// Deliver `message` to `channel`, retrying per the retry policy.
    pub async fn send(
        &self,
        channel: &NotificationChannelDbModel,
        message: &NotificationMessage,
    ) -> Result<DeliveryReceipt, ChannelError> {
        let channel_type = channel
            .kind()
            .map(|kind| kind.as_str().to_string())
            .unwrap_or_else(|| channel.channel_type.trim().to_ascii_lowercase());

        if !self.circuit_allows(&channel_type) {
            debug!(channel_id = %channel.id, %channel_type, "circuit open, skipping send");
            return Err(ChannelError::CircuitOpen { channel_type });
        }

        let transport = self.transports.get(&channel_type);
        let retry = &self.config.retry;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match transport.send(&channel.identifier, message).await {
                Ok(()) => {
                    self.record_success(&channel_type);
                    debug!(channel_id = %channel.id, %channel_type, attempts, "message delivered");
                    return Ok(DeliveryReceipt {
                        channel_id: channel.id.clone(),
                        channel_type,
                        attempts,
                    });
                }
                Err(TransportError::Unsupported { channel_type }) => {
                    self.end_trial(&channel_type);
                    return Err(ChannelError::Unsupported { channel_type });
                }
                Err(TransportError::Permanent { message }) => {
                    self.end_trial(&channel_type);
                    return Err(self.disable_channel(channel, &channel_type, message).await);
                }
                Err(TransportError::Retryable {
                    message,
                    retry_after,
                }) => {
                    if !retry.should_retry(attempts) {
                        self.record_failure(&channel_type);
                        return Err(ChannelError::Transient { attempts, message });
                    }
                    let delay = retry.delay_for(attempts, retry_after);
                    debug!(
                        channel_id = %channel.id,
                        %channel_type,
                        attempt = attempts,
                        max = retry.max_attempts,
                        ?delay,
                        error = %message,
                        "delivery failed, retrying"
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    /// Open/closed state per channel type.
    pub fn circuit_states(&self) -> HashMap<String, bool> {
        self.circuit_breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().is_open))
            .collect()
    }

    async fn disable_channel(
        &self,
        channel: &NotificationChannelDbModel,
        channel_type: &str,
        message: String,
    ) -> ChannelError {
        match self.channels.disable(&channel.id, &channel.identifier).await {
            Ok(false) => {
                info!(
                    channel_id = %channel.id,
                    %channel_type,
                    reason = %message,
                    "rejected identifier was already replaced, channel left enabled"
                );
                ChannelError::Permanent { message }
            }
            Ok(true) => {
                warn!(
                    channel_id = %channel.id,
                    user_id = %channel.user_id,
                    %channel_type,
                    reason = %message,
                    "channel disabled after permanent delivery error"
                );
                self.ops.publish(OpsEvent::ChannelDisabled {
                    channel_id: channel.id.clone(),
                    user_id: channel.user_id.clone(),
                    channel_type: channel_type.to_string(),
                    reason: message.clone(),
                    timestamp: Utc::now(),
                });
                ChannelError::Permanent { message }
            }
            Err(source) => {
                tracing::error!(
                    channel_id = %channel.id,
                    error = %source,
                    "failed to disable rejected channel"
                );
                ChannelError::Store { message, source }
            }
        }
    }

    fn circuit_allows(&self, channel_type: &str) -> bool {
        self.circuit_breakers
            .get_mut(channel_type)
            .is_none_or(|mut state| state.try_acquire())
    }

    fn end_trial(&self, channel_type: &str) {
        if let Some(mut state) = self.circuit_breakers.get_mut(channel_type) {
            state.end_trial();
        }
    }

    fn record_success(&self, channel_type: &str) {
        if let Some(mut state) = self.circuit_breakers.get_mut(channel_type)
            && (state.failures > 0 || state.is_open)
        {
            if state.is_open {
                info!(%channel_type, "circuit closed after successful delivery");
            }
            state.record_success();
        }
    }

    fn record_failure(&self, channel_type: &str) {
        let threshold = self.config.circuit_breaker_threshold;
        let (opened, failures) = {
            let mut state = self
                .circuit_breakers
                .entry(channel_type.to_string())
                .or_insert_with(|| {
                    CircuitBreakerState::new(self.config.circuit_breaker_cooldown_secs)
                });
            let opened = state.record_failure(threshold);
            (opened, state.failures)
        };

        if opened {
            warn!(%channel_type, failures, "circuit breaker opened");
            self.ops.publish(OpsEvent::CircuitOpened {
                channel_type: channel_type.to_string(),
                consecutive_failures: failures,
                timestamp: Utc::now(),
            });
        }
    }
}
