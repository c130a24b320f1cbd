//! Delivery transports.
//!
//! One transport per channel type:
//! - Telegram Bot API (identifier is a chat id)
//! - Discord webhooks (identifier is the webhook URL)
//! - Slack and Kakao are declared but have no working transport yet

mod discord;
mod telegram;
mod unsupported;

pub use discord::{DiscordConfig, DiscordTransport};
pub use telegram::{TelegramConfig, TelegramTransport};
pub use unsupported::UnsupportedTransport;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::message::NotificationMessage;
use crate::database::models::ChannelType;

/// Why a single transport attempt failed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    /// Worth another attempt. `retry_after` is the transport's own hint.
    #[error("{message}")]
    Retryable {
        message: String,
        retry_after: Option<Duration>,
    },
    /// The identifier was rejected; retrying cannot help.
    #[error("{message}")]
    Permanent { message: String },
    #[error("no transport available for channel type '{channel_type}'")]
    Unsupported { channel_type: String },
}

impl TransportError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    pub fn unsupported(channel_type: impl Into<String>) -> Self {
        Self::Unsupported {
            channel_type: channel_type.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }

    /// Network errors and timeouts are always worth another attempt.
    pub(crate) fn from_request(transport: &str, err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            "timed out"
        } else if err.is_connect() {
            "connect failed"
        } else {
            "request failed"
        };
        Self::retryable(format!("{transport} {kind}: {err}"))
    }
}

/// Trait for delivery transports.
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    /// Channel type name, e.g. `"telegram"`.
    fn channel_type(&self) -> &'static str;

    /// Make exactly one delivery attempt to `identifier`.
    async fn send(
        &self,
        identifier: &str,
        message: &NotificationMessage,
    ) -> Result<(), TransportError>;
}

/// Channel type to transport lookup.
///
/// Types without a registered transport resolve to [`UnsupportedTransport`],
/// so a send to them fails with [`TransportError::Unsupported`] instead of
/// being silently dropped.
#[derive(Clone, Default)]
pub struct TransportRegistry {
    transports: HashMap<String, Arc<dyn ChannelTransport>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Telegram (when a bot token is configured) and Discord; every other
    /// type is unsupported.
    pub fn with_defaults(
        telegram: TelegramConfig,
        discord: DiscordConfig,
        client: reqwest::Client,
    ) -> Self {
        let mut registry = Self::new();
        if telegram.is_configured() {
            registry.register(Arc::new(TelegramTransport::new(telegram, client.clone())));
        } else {
            tracing::warn!("TELEGRAM_BOT_TOKEN not set; telegram channels are unsupported");
        }
        registry.register(Arc::new(DiscordTransport::new(discord, client)));
        registry
    }

    /// Register `transport` under its own channel type, replacing any
    /// previous one.
    pub fn register(&mut self, transport: Arc<dyn ChannelTransport>) {
        self.transports
            .insert(transport.channel_type().to_string(), transport);
    }

    /// Transport for `channel_type`, falling back to an unsupported one.
    pub fn get(&self, channel_type: &str) -> Arc<dyn ChannelTransport> {
        let key = registry_key(channel_type);
        match self.transports.get(&key) {
            Some(transport) => transport.clone(),
            None => Arc::new(UnsupportedTransport::new(key)),
        }
    }

    pub fn is_supported(&self, channel_type: &str) -> bool {
        self.transports.contains_key(&registry_key(channel_type))
    }
}

/// Lookup key for a stored channel type: the canonical name when known.
fn registry_key(channel_type: &str) -> String {
    ChannelType::parse(channel_type)
        .map(|kind| kind.as_str().to_string())
        .unwrap_or_else(|| channel_type.trim().to_ascii_lowercase())
}

/// Cut `text` to at most `limit` characters, marking the cut.
pub(crate) fn truncate_message(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let suffix = "\n\n[truncated]";
    let budget = limit.saturating_sub(suffix.chars().count());
    let truncated: String = text.chars().take(budget).collect();
    format!("{truncated}{suffix}")
}
