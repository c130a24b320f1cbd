//! Dispatch ledger repository.
//!
//! The `(rule_id, listing_id)` unique key is what makes a match notify at
//! most once, across concurrent tasks and across processes sharing the file.
//!
//! Delivery of an entry is tracked separately. The writer of an entry holds
//! a lease on it while it fans out; per-channel outcomes are recorded as they
//! land and the entry is marked dispatched once all channels are done. An
//! entry left pending (lease released or expired) can be reclaimed and
//! delivered to the channels that have no outcome yet.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use crate::database::models::{
    DeliveryFailureDbModel, DeliveryOutcome, DispatchLogDbModel, DispatchLogWithRule,
    NotificationStats,
};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::now_ms;
use crate::{Error, Result};

const MS_PER_DAY: i64 = 86_400_000;

/// Default delivery claim lease. Longer than the default event deadline.
pub const DEFAULT_CLAIM_LEASE: Duration = Duration::from_secs(65);

/// Dispatch ledger repository trait.
#[async_trait]
pub trait DispatchLogRepository: Send + Sync {
    /// Record `(rule_id, listing_id)` unless it is already recorded.
    ///
    /// Returns `(true, entry)` for the single caller that created the entry
    /// and `(false, existing)` for everyone else. A created entry is pending
    /// and leased to its creator.
    async fn insert_if_absent(
        &self,
        rule_id: &str,
        listing_id: &str,
        user_id: &str,
        message: &str,
    ) -> Result<(bool, DispatchLogDbModel)>;
    /// Take over a pending entry whose lease was released or has expired.
    /// `None` when it is dispatched or someone else holds it.
    async fn reclaim(&self, id: i64) -> Result<Option<DispatchLogDbModel>>;
    /// Give up the lease on a pending entry so it can be reclaimed at once.
    async fn release_claim(&self, id: i64) -> Result<()>;
    async fn mark_dispatched(&self, id: i64) -> Result<()>;
    /// Record the final outcome on one channel. The first outcome sticks.
    async fn record_channel_outcome(
        &self,
        dispatch_log_id: i64,
        channel_id: &str,
        channel_type: &str,
        outcome: DeliveryOutcome,
        attempts: u32,
    ) -> Result<()>;
    /// Channels of the entry that already have an outcome.
    async fn completed_channels(&self, dispatch_log_id: i64) -> Result<Vec<String>>;
    async fn get(&self, id: i64) -> Result<DispatchLogDbModel>;
    /// Mark the user's entries among `ids` as read. Ids owned by other users
    /// are ignored. Returns the number of matched entries.
    async fn mark_read(&self, user_id: &str, ids: &[i64]) -> Result<u64>;
    /// Newest entries first, joined with the producing rule.
    async fn list_for_user(&self, user_id: &str, limit: i64)
    -> Result<Vec<DispatchLogWithRule>>;
    async fn list_for_rule(&self, rule_id: &str, limit: i64) -> Result<Vec<DispatchLogDbModel>>;
    /// Counts for the user; `week_start_ms` bounds `this_week`.
    async fn stats(&self, user_id: &str, week_start_ms: i64) -> Result<NotificationStats>;

    // Delivery failures
    async fn record_delivery_failure(&self, failure: &DeliveryFailureDbModel) -> Result<i64>;
    async fn list_delivery_failures(
        &self,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<DeliveryFailureDbModel>>;
    async fn cleanup_old_delivery_failures(&self, retention_days: u32) -> Result<u64>;
}

/// SQLx implementation of DispatchLogRepository.
pub struct SqlxDispatchLogRepository {
    pool: SqlitePool,
    claim_lease: Duration,
}

impl SqlxDispatchLogRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self::with_claim_lease(pool, DEFAULT_CLAIM_LEASE)
    }

    /// `claim_lease` must outlast the event deadline, or a live delivery
    /// could be reclaimed by a concurrent replay.
    pub fn with_claim_lease(pool: SqlitePool, claim_lease: Duration) -> Self {
        Self { pool, claim_lease }
    }

    fn lease_until(&self, now: i64) -> i64 {
        let lease_ms = i64::try_from(self.claim_lease.as_millis()).unwrap_or(i64::MAX);
        now.saturating_add(lease_ms)
    }
}

#[async_trait]
impl DispatchLogRepository for SqlxDispatchLogRepository {
    async fn insert_if_absent(
        &self,
        rule_id: &str,
        listing_id: &str,
        user_id: &str,
        message: &str,
    ) -> Result<(bool, DispatchLogDbModel)> {
        let pool = &self.pool;
        let sent_at = now_ms();
        let lease_expires_at = self.lease_until(sent_at);

        retry_on_sqlite_busy("dispatch_log.insert_if_absent", move || async move {
            let inserted = sqlx::query_as::<_, DispatchLogDbModel>(
                r#"
                INSERT INTO dispatch_log (
                    rule_id, listing_id, user_id, message, sent_at, is_read,
                    dispatched_at, lease_expires_at
                )
                VALUES (?, ?, ?, ?, ?, 0, NULL, ?)
                ON CONFLICT(rule_id, listing_id) DO NOTHING
                RETURNING *
                "#,
            )
            .bind(rule_id)
            .bind(listing_id)
            .bind(user_id)
            .bind(message)
            .bind(sent_at)
            .bind(lease_expires_at)
            .fetch_optional(pool)
            .await?;

            if let Some(entry) = inserted {
                return Ok((true, entry));
            }

            let existing = sqlx::query_as::<_, DispatchLogDbModel>(
                "SELECT * FROM dispatch_log WHERE rule_id = ? AND listing_id = ?",
            )
            .bind(rule_id)
            .bind(listing_id)
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| {
                Error::Database(format!(
                    "dispatch_log conflict for ({rule_id}, {listing_id}) but no row found"
                ))
            })?;
            Ok((false, existing))
        })
        .await
    }

    async fn reclaim(&self, id: i64) -> Result<Option<DispatchLogDbModel>> {
        let pool = &self.pool;
        let now = now_ms();
        let lease_expires_at = self.lease_until(now);

        retry_on_sqlite_busy("dispatch_log.reclaim", move || async move {
            let claimed = sqlx::query_as::<_, DispatchLogDbModel>(
                r#"
                UPDATE dispatch_log SET lease_expires_at = ?
                WHERE id = ? AND dispatched_at IS NULL AND lease_expires_at <= ?
                RETURNING *
                "#,
            )
            .bind(lease_expires_at)
            .bind(id)
            .bind(now)
            .fetch_optional(pool)
            .await?;
            Ok(claimed)
        })
        .await
    }

    async fn release_claim(&self, id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE dispatch_log SET lease_expires_at = 0 WHERE id = ? AND dispatched_at IS NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_dispatched(&self, id: i64) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE dispatch_log SET dispatched_at = COALESCE(dispatched_at, ?), lease_expires_at = 0
            WHERE id = ?
            "#,
        )
        .bind(now_ms())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("DispatchLog", id.to_string()));
        }
        Ok(())
    }

    async fn record_channel_outcome(
        &self,
        dispatch_log_id: i64,
        channel_id: &str,
        channel_type: &str,
        outcome: DeliveryOutcome,
        attempts: u32,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO dispatch_delivery (
                dispatch_log_id, channel_id, channel_type, outcome, attempts, completed_at
            ) VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(dispatch_log_id, channel_id) DO NOTHING
            "#,
        )
        .bind(dispatch_log_id)
        .bind(channel_id)
        .bind(channel_type)
        .bind(outcome.as_str())
        .bind(i64::from(attempts))
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn completed_channels(&self, dispatch_log_id: i64) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT channel_id FROM dispatch_delivery WHERE dispatch_log_id = ?")
                .bind(dispatch_log_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(channel_id,)| channel_id).collect())
    }

    async fn get(&self, id: i64) -> Result<DispatchLogDbModel> {
        sqlx::query_as::<_, DispatchLogDbModel>("SELECT * FROM dispatch_log WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("DispatchLog", id.to_string()))
    }

    async fn mark_read(&self, user_id: &str, ids: &[i64]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut builder =
            QueryBuilder::<Sqlite>::new("UPDATE dispatch_log SET is_read = 1 WHERE user_id = ");
        builder.push_bind(user_id);
        builder.push(" AND id IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");

        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn list_for_user(
        &self,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<DispatchLogWithRule>> {
        let entries = sqlx::query_as::<_, DispatchLogWithRule>(
            r#"
            SELECT d.*,
                   r.name AS rule_name,
                   r.category AS rule_category,
                   r.sido_code AS rule_sido_code,
                   r.sigu_code AS rule_sigu_code
            FROM dispatch_log d
            LEFT JOIN notification_rule r ON r.id = d.rule_id
            WHERE d.user_id = ?
            ORDER BY d.sent_at DESC, d.id DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }

    async fn list_for_rule(&self, rule_id: &str, limit: i64) -> Result<Vec<DispatchLogDbModel>> {
        let entries = sqlx::query_as::<_, DispatchLogDbModel>(
            "SELECT * FROM dispatch_log WHERE rule_id = ? ORDER BY sent_at DESC, id DESC LIMIT ?",
        )
        .bind(rule_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }

    async fn stats(&self, user_id: &str, week_start_ms: i64) -> Result<NotificationStats> {
        let (active_alerts, total_matches, this_week): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                (SELECT COUNT(*) FROM notification_rule WHERE user_id = ?1 AND enabled = 1),
                (SELECT COUNT(*) FROM dispatch_log WHERE user_id = ?1),
                (SELECT COUNT(*) FROM dispatch_log WHERE user_id = ?1 AND sent_at >= ?2)
            "#,
        )
        .bind(user_id)
        .bind(week_start_ms)
        .fetch_one(&self.pool)
        .await?;

        Ok(NotificationStats {
            active_alerts,
            total_matches,
            this_week,
        })
    }

    async fn record_delivery_failure(&self, failure: &DeliveryFailureDbModel) -> Result<i64> {
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO delivery_failure (
                dispatch_log_id, rule_id, listing_id, user_id, channel_id, channel_type,
                error_kind, error_message, attempts, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(failure.dispatch_log_id)
        .bind(&failure.rule_id)
        .bind(&failure.listing_id)
        .bind(&failure.user_id)
        .bind(&failure.channel_id)
        .bind(&failure.channel_type)
        .bind(&failure.error_kind)
        .bind(&failure.error_message)
        .bind(failure.attempts)
        .bind(failure.created_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn list_delivery_failures(
        &self,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<DeliveryFailureDbModel>> {
        let failures = sqlx::query_as::<_, DeliveryFailureDbModel>(
            "SELECT * FROM delivery_failure WHERE user_id = ? ORDER BY created_at DESC, id DESC LIMIT ?",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(failures)
    }

    async fn cleanup_old_delivery_failures(&self, retention_days: u32) -> Result<u64> {
        let cutoff = now_ms().saturating_sub(i64::from(retention_days).saturating_mul(MS_PER_DAY));

        let result = sqlx::query("DELETE FROM delivery_failure WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::DeliveryErrorKind;
    use crate::database::test_support::memory_pool;

    #[tokio::test]
    async fn test_insert_if_absent_is_idempotent() {
        let repo = SqlxDispatchLogRepository::new(memory_pool().await);

        let (created, first) = repo
            .insert_if_absent("r1", "l1", "u1", "first message")
            .await
            .unwrap();
        assert!(created);
        assert!(!first.is_read);

        let (created, second) = repo
            .insert_if_absent("r1", "l1", "u1", "second message")
            .await
            .unwrap();
        assert!(!created);
        // Existing entry is returned untouched.
        assert_eq!(second, first);
        assert_eq!(second.message, "first message");

        let (created, _) = repo
            .insert_if_absent("r1", "l2", "u1", "other listing")
            .await
            .unwrap();
        assert!(created);
    }

    #[tokio::test]
    async fn test_claim_lease_blocks_reclaim_until_released() {
        let repo = SqlxDispatchLogRepository::new(memory_pool().await);
        let (created, entry) = repo.insert_if_absent("r1", "l1", "u1", "m").await.unwrap();
        assert!(created);
        assert!(!entry.is_dispatched());
        assert!(entry.lease_expires_at > entry.sent_at);

        // The creator still holds the lease.
        assert!(repo.reclaim(entry.id).await.unwrap().is_none());

        repo.release_claim(entry.id).await.unwrap();
        let reclaimed = repo.reclaim(entry.id).await.unwrap().unwrap();
        assert_eq!(reclaimed.id, entry.id);
        assert!(repo.reclaim(entry.id).await.unwrap().is_none());

        repo.mark_dispatched(entry.id).await.unwrap();
        repo.release_claim(entry.id).await.unwrap();
        assert!(repo.reclaim(entry.id).await.unwrap().is_none());
        assert!(repo.get(entry.id).await.unwrap().is_dispatched());
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_reclaimed() {
        let repo = SqlxDispatchLogRepository::with_claim_lease(memory_pool().await, Duration::ZERO);
        let (_, entry) = repo.insert_if_absent("r1", "l1", "u1", "m").await.unwrap();
        assert!(repo.reclaim(entry.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_channel_outcomes_first_one_sticks() {
        let repo = SqlxDispatchLogRepository::new(memory_pool().await);
        let (_, entry) = repo.insert_if_absent("r1", "l1", "u1", "m").await.unwrap();
        assert!(repo.completed_channels(entry.id).await.unwrap().is_empty());

        repo.record_channel_outcome(entry.id, "c1", "telegram", DeliveryOutcome::Delivered, 1)
            .await
            .unwrap();
        repo.record_channel_outcome(entry.id, "c1", "telegram", DeliveryOutcome::Failed, 3)
            .await
            .unwrap();
        repo.record_channel_outcome(entry.id, "c2", "discord", DeliveryOutcome::Failed, 3)
            .await
            .unwrap();

        let mut done = repo.completed_channels(entry.id).await.unwrap();
        done.sort();
        assert_eq!(done, vec!["c1".to_string(), "c2".to_string()]);

        let (outcome,): (String,) = sqlx::query_as(
            "SELECT outcome FROM dispatch_delivery WHERE dispatch_log_id = ? AND channel_id = 'c1'",
        )
        .bind(entry.id)
        .fetch_one(&repo.pool)
        .await
        .unwrap();
        assert_eq!(outcome, "delivered");
    }

    #[tokio::test]
    async fn test_mark_read_scoped_and_idempotent() {
        let repo = SqlxDispatchLogRepository::new(memory_pool().await);
        let (_, mine) = repo.insert_if_absent("r1", "l1", "u1", "m").await.unwrap();
        let (_, theirs) = repo.insert_if_absent("r2", "l1", "u2", "m").await.unwrap();

        assert_eq!(repo.mark_read("u1", &[]).await.unwrap(), 0);
        assert_eq!(
            repo.mark_read("u1", &[mine.id, theirs.id]).await.unwrap(),
            1
        );
        assert!(repo.get(mine.id).await.unwrap().is_read);
        assert!(!repo.get(theirs.id).await.unwrap().is_read);

        // Repeating changes nothing observable.
        repo.mark_read("u1", &[mine.id]).await.unwrap();
        let after = repo.get(mine.id).await.unwrap();
        assert!(after.is_read);
        assert_eq!(after.message, mine.message);
        assert_eq!(after.sent_at, mine.sent_at);
    }

    #[tokio::test]
    async fn test_list_for_user_survives_rule_deletion() {
        let repo = SqlxDispatchLogRepository::new(memory_pool().await);
        repo.insert_if_absent("gone-rule", "l1", "u1", "m")
            .await
            .unwrap();

        let entries = repo.list_for_user("u1", 100).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].entry.rule_id, "gone-rule");
        assert!(entries[0].rule_name.is_none());
        assert!(repo.list_for_user("u2", 100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_limits() {
        let repo = SqlxDispatchLogRepository::new(memory_pool().await);
        for i in 0..5 {
            repo.insert_if_absent("r1", &format!("l{i}"), "u1", "m")
                .await
                .unwrap();
        }
        assert_eq!(repo.list_for_user("u1", 3).await.unwrap().len(), 3);
        assert_eq!(repo.list_for_rule("r1", 100).await.unwrap().len(), 5);
        assert!(repo.list_for_rule("r2", 100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stats_week_boundary() {
        let pool = memory_pool().await;
        let repo = SqlxDispatchLogRepository::new(pool.clone());
        repo.insert_if_absent("r1", "l1", "u1", "m").await.unwrap();
        sqlx::query(
            "INSERT INTO dispatch_log (rule_id, listing_id, user_id, message, sent_at) VALUES ('r1', 'old', 'u1', 'm', 1000)",
        )
        .execute(&pool)
        .await
        .unwrap();

        let stats = repo.stats("u1", 2000).await.unwrap();
        assert_eq!(stats.total_matches, 2);
        assert_eq!(stats.this_week, 1);
        assert_eq!(stats.active_alerts, 0);
    }

    #[tokio::test]
    async fn test_delivery_failures() {
        let repo = SqlxDispatchLogRepository::new(memory_pool().await);
        let (_, entry) = repo.insert_if_absent("r1", "l1", "u1", "m").await.unwrap();

        let mut old = DeliveryFailureDbModel::new(
            &entry,
            "c1",
            "telegram",
            DeliveryErrorKind::Transient,
            "timeout",
            3,
        );
        old.created_at = 0;
        let recent = DeliveryFailureDbModel::new(
            &entry,
            "c1",
            "telegram",
            DeliveryErrorKind::Permanent,
            "chat not found",
            1,
        );
        assert!(repo.record_delivery_failure(&old).await.unwrap() > 0);
        repo.record_delivery_failure(&recent).await.unwrap();

        assert_eq!(repo.list_delivery_failures("u1", 10).await.unwrap().len(), 2);
        assert_eq!(repo.cleanup_old_delivery_failures(30).await.unwrap(), 1);

        let left = repo.list_delivery_failures("u1", 10).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].error_kind, "permanent");
        assert_eq!(left[0].dispatch_log_id, entry.id);
    }
}
