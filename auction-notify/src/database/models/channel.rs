//! Notification channel database models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::now_ms;

/// Notification channel database model.
/// A delivery transport plus the user's address on it (e.g. a Telegram chat id).
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct NotificationChannelDbModel {
    pub id: String,
    pub user_id: String,
    /// Channel type: telegram, discord, slack, kakao
    pub channel_type: String,
    /// Opaque transport address.
    pub identifier: String,
    pub enabled: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl NotificationChannelDbModel {
    pub fn new(
        user_id: impl Into<String>,
        channel_type: ChannelType,
        identifier: impl Into<String>,
    ) -> Self {
        let now = now_ms();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            channel_type: channel_type.as_str().to_string(),
            identifier: identifier.into(),
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// Parsed channel type, `None` for rows written by a newer version.
    pub fn kind(&self) -> Option<ChannelType> {
        ChannelType::parse(&self.channel_type)
    }
}

/// Notification channel types.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    Telegram,
    Discord,
    Slack,
    Kakao,
}

impl ChannelType {
    pub const ALL: [ChannelType; 4] = [
        ChannelType::Telegram,
        ChannelType::Discord,
        ChannelType::Slack,
        ChannelType::Kakao,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Telegram => "telegram",
            Self::Discord => "discord",
            Self::Slack => "slack",
            Self::Kakao => "kakao",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "telegram" => Some(Self::Telegram),
            "discord" => Some(Self::Discord),
            "slack" => Some(Self::Slack),
            "kakao" => Some(Self::Kakao),
            _ => None,
        }
    }
}

/// Single-use token issued when a user starts linking a channel.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct ChannelLinkTokenDbModel {
    pub token: String,
    pub user_id: String,
    pub channel_type: String,
    pub created_at: i64,
    pub expires_at: i64,
}

impl ChannelLinkTokenDbModel {
    pub fn new(user_id: impl Into<String>, channel_type: ChannelType, ttl_ms: i64) -> Self {
        let now = now_ms();
        Self {
            token: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            channel_type: channel_type.as_str().to_string(),
            created_at: now,
            expires_at: now.saturating_add(ttl_ms),
        }
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_channel_type_roundtrip() {
        for kind in ChannelType::ALL {
            assert_eq!(ChannelType::parse(kind.as_str()), Some(kind));
            assert_eq!(ChannelType::from_str(&kind.to_string()).unwrap(), kind);
        }
        assert_eq!(ChannelType::parse(" Telegram "), Some(ChannelType::Telegram));
        assert_eq!(ChannelType::parse("email"), None);
    }

    #[test]
    fn test_new_channel_is_enabled() {
        let channel = NotificationChannelDbModel::new("u1", ChannelType::Telegram, "12345");
        assert!(channel.enabled);
        assert_eq!(channel.kind(), Some(ChannelType::Telegram));
    }

    #[test]
    fn test_link_token_expiry() {
        let token = ChannelLinkTokenDbModel::new("u1", ChannelType::Telegram, 1_000);
        assert!(!token.is_expired(token.created_at));
        assert!(token.is_expired(token.created_at + 1_000));
    }
}
