//! Notification channel repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::{ChannelLinkTokenDbModel, NotificationChannelDbModel};
use crate::database::time::now_ms;
use crate::{Error, Result};

/// Notification channel repository trait.
#[async_trait]
pub trait ChannelRepository: Send + Sync {
    async fn get(&self, id: &str) -> Result<NotificationChannelDbModel>;
    /// All channels of a user, newest first.
    async fn list_for_user(&self, user_id: &str) -> Result<Vec<NotificationChannelDbModel>>;
    async fn list_enabled_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<NotificationChannelDbModel>>;
    /// Insert the user's channel of this type, or re-point and re-enable the
    /// existing one. Returns the stored row.
    async fn upsert(
        &self,
        channel: &NotificationChannelDbModel,
    ) -> Result<NotificationChannelDbModel>;
    async fn set_enabled(
        &self,
        user_id: &str,
        id: &str,
        enabled: bool,
    ) -> Result<NotificationChannelDbModel>;
    /// Disable a channel whose identifier the transport rejected, but only
    /// while it still points at that identifier.
    /// Returns false when the channel was re-linked in the meantime.
    async fn disable(&self, id: &str, identifier: &str) -> Result<bool>;
    async fn create_link_token(&self, token: &ChannelLinkTokenDbModel) -> Result<()>;
    /// Delete and return a link token. `None` if it never existed or was
    /// already consumed.
    async fn consume_link_token(&self, token: &str) -> Result<Option<ChannelLinkTokenDbModel>>;
    /// Remove expired link tokens. Returns the number removed.
    async fn purge_expired_link_tokens(&self) -> Result<u64>;
}

/// SQLx implementation of ChannelRepository.
pub struct SqlxChannelRepository {
    pool: SqlitePool,
}

impl SqlxChannelRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChannelRepository for SqlxChannelRepository {
    async fn get(&self, id: &str) -> Result<NotificationChannelDbModel> {
        sqlx::query_as::<_, NotificationChannelDbModel>(
            "SELECT * FROM notification_channel WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::not_found("NotificationChannel", id))
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<NotificationChannelDbModel>> {
        let channels = sqlx::query_as::<_, NotificationChannelDbModel>(
            "SELECT * FROM notification_channel WHERE user_id = ? ORDER BY created_at DESC, id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(channels)
    }

    async fn list_enabled_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<NotificationChannelDbModel>> {
        let channels = sqlx::query_as::<_, NotificationChannelDbModel>(
            "SELECT * FROM notification_channel WHERE user_id = ? AND enabled = 1 ORDER BY created_at, id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(channels)
    }

    async fn upsert(
        &self,
        channel: &NotificationChannelDbModel,
    ) -> Result<NotificationChannelDbModel> {
        let stored = sqlx::query_as::<_, NotificationChannelDbModel>(
            r#"
            INSERT INTO notification_channel (
                id, user_id, channel_type, identifier, enabled, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id, channel_type) DO UPDATE SET
                identifier = excluded.identifier,
                enabled = excluded.enabled,
                updated_at = excluded.updated_at
            RETURNING *
            "#,
        )
        .bind(&channel.id)
        .bind(&channel.user_id)
        .bind(&channel.channel_type)
        .bind(&channel.identifier)
        .bind(channel.enabled)
        .bind(channel.created_at)
        .bind(channel.updated_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(stored)
    }

    async fn set_enabled(
        &self,
        user_id: &str,
        id: &str,
        enabled: bool,
    ) -> Result<NotificationChannelDbModel> {
        sqlx::query_as::<_, NotificationChannelDbModel>(
            r#"
            UPDATE notification_channel SET enabled = ?, updated_at = ?
            WHERE id = ? AND user_id = ?
            RETURNING *
            "#,
        )
        .bind(enabled)
        .bind(now_ms())
        .bind(id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::not_found("NotificationChannel", id))
    }

    async fn disable(&self, id: &str, identifier: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE notification_channel SET enabled = 0, updated_at = ?
            WHERE id = ? AND identifier = ?
            "#,
        )
        .bind(now_ms())
        .bind(id)
        .bind(identifier)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Gone entirely, or still there under a new identifier.
            self.get(id).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn create_link_token(&self, token: &ChannelLinkTokenDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO channel_link_token (token, user_id, channel_type, created_at, expires_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&token.token)
        .bind(&token.user_id)
        .bind(&token.channel_type)
        .bind(token.created_at)
        .bind(token.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn consume_link_token(&self, token: &str) -> Result<Option<ChannelLinkTokenDbModel>> {
        let consumed = sqlx::query_as::<_, ChannelLinkTokenDbModel>(
            "DELETE FROM channel_link_token WHERE token = ? RETURNING *",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;
        Ok(consumed)
    }

    async fn purge_expired_link_tokens(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM channel_link_token WHERE expires_at <= ?")
            .bind(now_ms())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
