//! Discord webhook transport.
//!
//! The channel identifier is the webhook URL itself. Rate limits follow
//! Discord's guidance: no hardcoded limits, honour `Retry-After` (or
//! `X-RateLimit-Reset-After`, or the JSON `retry_after`) on 429.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::{ChannelTransport, TransportError, truncate_message};
use crate::notification::message::NotificationMessage;

/// Embed limits.
const EMBED_TITLE_LIMIT: usize = 256;
const EMBED_FIELD_VALUE_LIMIT: usize = 1024;
const EMBED_MAX_FIELDS: usize = 25;

/// Discord webhook configuration shared by every user's webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscordConfig {
    /// Username shown on webhook posts.
    pub username: Option<String>,
    /// Avatar URL shown on webhook posts.
    pub avatar_url: Option<String>,
    /// Embed color.
    pub color: u32,
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            username: Some("Auction Alert".to_string()),
            avatar_url: None,
            color: 0x3498db,
        }
    }
}

/// Discord webhook transport.
pub struct DiscordTransport {
    config: DiscordConfig,
    client: Client,
}

impl DiscordTransport {
    pub fn new(config: DiscordConfig, client: Client) -> Self {
        Self { config, client }
    }

    fn build_payload(&self, message: &NotificationMessage) -> serde_json::Value {
        let fields: Vec<serde_json::Value> = message
            .fields
            .iter()
            .take(EMBED_MAX_FIELDS)
            .map(|(name, value)| {
                json!({
                    "name": name,
                    "value": truncate_message(value, EMBED_FIELD_VALUE_LIMIT),
                    "inline": true,
                })
            })
            .collect();

        let mut embed = json!({
            "title": truncate_message(&message.title, EMBED_TITLE_LIMIT),
            "color": self.config.color,
            "fields": fields,
        });
        if let Some(thumbnail) = &message.thumbnail {
            embed["thumbnail"] = json!({ "url": thumbnail });
        }

        let mut payload = json!({ "embeds": [embed] });
        if let Some(username) = &self.config.username {
            payload["username"] = json!(username);
        }
        if let Some(avatar_url) = &self.config.avatar_url {
            payload["avatar_url"] = json!(avatar_url);
        }
        payload
    }
}

#[async_trait]
impl ChannelTransport for DiscordTransport {
    fn channel_type(&self) -> &'static str {
        "discord"
    }

    async fn send(
        &self,
        identifier: &str,
        message: &NotificationMessage,
    ) -> Result<(), TransportError> {
        let url = parse_webhook_url(identifier)?;
        let payload = self.build_payload(message);

        let response = self
            .client
            .post(url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| TransportError::from_request("Discord", e))?;

        let status = response.status();
        if status.is_success() {
            debug!("Discord webhook delivered");
            return Ok(());
        }

        let header_retry_after = parse_retry_after_headers(response.headers());
        let body = response.text().await.unwrap_or_default();
        let message = format!("Discord webhook failed: {status} - {body}");

        Err(match status {
            StatusCode::TOO_MANY_REQUESTS => TransportError::Retryable {
                retry_after: header_retry_after.or_else(|| parse_retry_after_body(&body)),
                message,
            },
            // Webhook deleted or its token revoked.
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
                TransportError::permanent(message)
            }
            _ => TransportError::retryable(message),
        })
    }
}

fn parse_webhook_url(identifier: &str) -> Result<Url, TransportError> {
    let url = Url::parse(identifier.trim())
        .map_err(|e| TransportError::permanent(format!("invalid Discord webhook URL: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(TransportError::permanent(format!(
            "invalid Discord webhook URL scheme '{}'",
            url.scheme()
        )));
    }
    Ok(url)
}

fn parse_retry_after_headers(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    ["Retry-After", "X-RateLimit-Reset-After"]
        .iter()
        .filter_map(|name| headers.get(*name))
        .filter_map(|value| value.to_str().ok()?.trim().parse::<f64>().ok())
        .find(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

fn parse_retry_after_body(body: &str) -> Option<Duration> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .get("retry_after")
        .and_then(|v| v.as_f64())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}
