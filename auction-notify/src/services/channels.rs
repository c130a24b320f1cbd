//! Channel listing and the link handshake.
//!
//! Linking is two-step: [`ChannelService::begin_link`] issues a single-use
//! token that the user hands to the bot (for Telegram, through a
//! `https://t.me/<bot>?start=<token>` deep link), and the bot side calls
//! [`ChannelService::confirm_link`] with the token and the chat identifier.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::database::models::{ChannelLinkTokenDbModel, ChannelType, NotificationChannelDbModel};
use crate::database::repositories::ChannelRepository;
use crate::database::time::now_ms;
use crate::domain::UserId;
use crate::notification::channels::TelegramConfig;
use crate::{Error, Result};

/// Default lifetime of a link token.
pub const DEFAULT_LINK_TOKEN_TTL: Duration = Duration::from_secs(900);

/// What the user needs to finish linking a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkInvitation {
    pub token: String,
    pub channel_type: ChannelType,
    /// Bot deep link; only Telegram has one.
    pub deep_link: Option<String>,
    pub expires_at: i64,
}

pub struct ChannelService {
    channels: Arc<dyn ChannelRepository>,
    telegram: TelegramConfig,
    link_token_ttl: Duration,
}

impl ChannelService {
    pub fn new(
        channels: Arc<dyn ChannelRepository>,
        telegram: TelegramConfig,
        link_token_ttl: Duration,
    ) -> Self {
        Self {
            channels,
            telegram,
            link_token_ttl,
        }
    }

    /// All of the user's channels, enabled or not, newest first.
    pub async fn list(&self, user: &UserId) -> Result<Vec<NotificationChannelDbModel>> {
        self.channels.list_for_user(user.as_str()).await
    }

    /// Issue a link token for `channel_type`.
    pub async fn begin_link(
        &self,
        user: &UserId,
        channel_type: ChannelType,
    ) -> Result<LinkInvitation> {
        let ttl_ms = i64::try_from(self.link_token_ttl.as_millis()).unwrap_or(i64::MAX);
        let token = ChannelLinkTokenDbModel::new(user.as_str(), channel_type, ttl_ms);
        self.channels.create_link_token(&token).await?;

        let deep_link = match channel_type {
            ChannelType::Telegram => Some(self.telegram.deep_link(&token.token)),
            _ => None,
        };

        debug!(user_id = %user, %channel_type, "Issued channel link token");
        Ok(LinkInvitation {
            token: token.token,
            channel_type,
            deep_link,
            expires_at: token.expires_at,
        })
    }

    /// Redeem a link token and store `identifier` as the user's channel for
    /// the token's type, enabled.
    ///
    /// A blank identifier is rejected before the token is consumed so the
    /// caller can retry. Unknown, already used and expired tokens are errors.
    pub async fn confirm_link(
        &self,
        token: &str,
        identifier: &str,
    ) -> Result<NotificationChannelDbModel> {
        let identifier = identifier.trim();
        if identifier.is_empty() {
            return Err(Error::validation("channel identifier must not be empty"));
        }

        let Some(link) = self.channels.consume_link_token(token.trim()).await? else {
            return Err(Error::not_found("ChannelLinkToken", token));
        };
        if link.is_expired(now_ms()) {
            warn!(user_id = %link.user_id, "Rejected expired channel link token");
            return Err(Error::validation("link token has expired"));
        }
        let channel_type = ChannelType::parse(&link.channel_type).ok_or_else(|| {
            Error::Database(format!("unknown channel type '{}'", link.channel_type))
        })?;

        let channel = NotificationChannelDbModel::new(&link.user_id, channel_type, identifier);
        let stored = self.channels.upsert(&channel).await?;

        info!(
            user_id = %stored.user_id,
            channel_id = %stored.id,
            %channel_type,
            "Linked notification channel"
        );
        Ok(stored)
    }

    /// Register a channel whose identifier the user already holds, such as a
    /// Discord webhook URL.
    pub async fn register(
        &self,
        user: &UserId,
        channel_type: ChannelType,
        identifier: &str,
    ) -> Result<NotificationChannelDbModel> {
        let identifier = identifier.trim();
        if identifier.is_empty() {
            return Err(Error::validation("channel identifier must not be empty"));
        }
        let channel = NotificationChannelDbModel::new(user.as_str(), channel_type, identifier);
        let stored = self.channels.upsert(&channel).await?;
        info!(user_id = %user, channel_id = %stored.id, %channel_type, "Registered notification channel");
        Ok(stored)
    }

    pub async fn set_enabled(
        &self,
        user: &UserId,
        id: &str,
        enabled: bool,
    ) -> Result<NotificationChannelDbModel> {
        self.channels.set_enabled(user.as_str(), id, enabled).await
    }

    /// Delete link tokens past their expiry.
    pub async fn purge_expired_link_tokens(&self) -> Result<u64> {
        self.channels.purge_expired_link_tokens().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repositories::SqlxChannelRepository;
    use crate::database::test_support::memory_pool;

    async fn service(ttl: Duration) -> ChannelService {
        let pool = memory_pool().await;
        let telegram = TelegramConfig {
            bot_token: "123:abc".to_string(),
            bot_name: "TestBot".to_string(),
            ..Default::default()
        };
        ChannelService::new(Arc::new(SqlxChannelRepository::new(pool)), telegram, ttl)
    }

    #[tokio::test]
    async fn test_link_handshake() {
        let service = service(DEFAULT_LINK_TOKEN_TTL).await;
        let user = UserId::new("u1").unwrap();

        let invitation = service
            .begin_link(&user, ChannelType::Telegram)
            .await
            .unwrap();
        assert_eq!(
            invitation.deep_link.as_deref(),
            Some(format!("https://t.me/TestBot?start={}", invitation.token).as_str())
        );

        let channel = service
            .confirm_link(&invitation.token, " 987654 ")
            .await
            .unwrap();
        assert_eq!(channel.user_id, "u1");
        assert_eq!(channel.identifier, "987654");
        assert!(channel.enabled);

        // Single use.
        assert!(matches!(
            service.confirm_link(&invitation.token, "987654").await,
            Err(Error::NotFound { .. })
        ));
        assert_eq!(service.list(&user).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_relink_overwrites_and_reenables() {
        let service = service(DEFAULT_LINK_TOKEN_TTL).await;
        let user = UserId::new("u1").unwrap();

        let first = service
            .register(&user, ChannelType::Telegram, "111")
            .await
            .unwrap();
        service.set_enabled(&user, &first.id, false).await.unwrap();

        let invitation = service
            .begin_link(&user, ChannelType::Telegram)
            .await
            .unwrap();
        let relinked = service.confirm_link(&invitation.token, "222").await.unwrap();

        assert_eq!(relinked.id, first.id);
        assert_eq!(relinked.identifier, "222");
        assert!(relinked.enabled);
    }

    #[tokio::test]
    async fn test_expired_token_rejected() {
        let service = service(Duration::ZERO).await;
        let user = UserId::new("u1").unwrap();

        let invitation = service
            .begin_link(&user, ChannelType::Telegram)
            .await
            .unwrap();
        assert!(matches!(
            service.confirm_link(&invitation.token, "1").await,
            Err(Error::Validation(_))
        ));
        assert!(service.list(&user).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_blank_identifier_keeps_token() {
        let service = service(DEFAULT_LINK_TOKEN_TTL).await;
        let user = UserId::new("u1").unwrap();

        let invitation = service
            .begin_link(&user, ChannelType::Discord)
            .await
            .unwrap();
        assert!(invitation.deep_link.is_none());

        assert!(service.confirm_link(&invitation.token, "  ").await.is_err());
        let channel = service
            .confirm_link(&invitation.token, "https://discord.com/api/webhooks/1/abc")
            .await
            .unwrap();
        assert_eq!(channel.channel_type, "discord");
    }
}
