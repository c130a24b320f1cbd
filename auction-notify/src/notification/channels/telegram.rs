//! Telegram Bot API transport.
//!
//! Sends messages via the Telegram Bot API (`POST /bot<token>/sendMessage`).
//! A 429 carries `parameters.retry_after` in the JSON body; it is passed up
//! as a retry hint rather than slept on here.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::{ChannelTransport, TransportError, truncate_message};
use crate::notification::message::NotificationMessage;

/// Telegram `sendMessage` text limit (UTF-8 characters).
const TELEGRAM_MESSAGE_LIMIT: usize = 4096;

/// Telegram bot configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    /// Telegram Bot API token. Empty disables the transport.
    #[serde(default)]
    pub bot_token: String,
    /// Bot username, used for `t.me` deep links.
    #[serde(default = "default_bot_name")]
    pub bot_name: String,
    /// Bot API base URL, without trailing slash.
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

fn default_bot_name() -> String {
    "AuctionAlertBot".to_string()
}

fn default_api_base() -> String {
    "https://api.telegram.org".to_string()
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            bot_name: default_bot_name(),
            api_base: default_api_base(),
        }
    }
}

impl TelegramConfig {
    pub fn is_configured(&self) -> bool {
        !self.bot_token.trim().is_empty()
    }

    /// Deep link that starts the bot with `payload`.
    pub fn deep_link(&self, payload: &str) -> String {
        format!("https://t.me/{}?start={}", self.bot_name, payload)
    }
}

/// Telegram transport. The channel identifier is a chat id.
pub struct TelegramTransport {
    config: TelegramConfig,
    client: Client,
}

impl TelegramTransport {
    pub fn new(config: TelegramConfig, client: Client) -> Self {
        Self { config, client }
    }

    fn send_message_url(&self) -> String {
        format!(
            "{}/bot{}/sendMessage",
            self.config.api_base.trim_end_matches('/'),
            self.config.bot_token
        )
    }
}

#[async_trait]
impl ChannelTransport for TelegramTransport {
    fn channel_type(&self) -> &'static str {
        "telegram"
    }

    async fn send(
        &self,
        identifier: &str,
        message: &NotificationMessage,
    ) -> Result<(), TransportError> {
        let text = truncate_message(&message.to_html(), TELEGRAM_MESSAGE_LIMIT);
        let payload = json!({
            "chat_id": identifier,
            "text": text,
            "parse_mode": "HTML",
            "disable_web_page_preview": true,
        });

        let response = self
            .client
            .post(self.send_message_url())
            .json(&payload)
            .send()
            .await
            .map_err(|e| TransportError::from_request("Telegram", e))?;

        let status = response.status();
        if status.is_success() {
            debug!(chat_id = %identifier, "Telegram message sent");
            return Ok(());
        }

        let body: serde_json::Value = response.json().await.unwrap_or_default();
        Err(classify_failure(status, &body))
    }
}

/// Map a failed `sendMessage` response to a transport error.
///
/// 400 (chat not found) and 403 (bot blocked or kicked) mean the chat id is
/// no longer deliverable.
fn classify_failure(status: StatusCode, body: &serde_json::Value) -> TransportError {
    let description = body
        .get("description")
        .and_then(|v| v.as_str())
        .unwrap_or("no description");
    let message = format!("Telegram sendMessage failed: {status} - {description}");

    match status {
        StatusCode::TOO_MANY_REQUESTS => TransportError::Retryable {
            message,
            retry_after: body
                .get("parameters")
                .and_then(|p| p.get("retry_after"))
                .and_then(|v| v.as_u64())
                .map(Duration::from_secs),
        },
        StatusCode::BAD_REQUEST | StatusCode::FORBIDDEN => TransportError::permanent(message),
        _ => TransportError::retryable(message),
    }
}
