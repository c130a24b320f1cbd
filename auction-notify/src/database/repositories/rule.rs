//! Notification rule repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::{NotificationRuleDbModel, RuleWithMatchCount};
use crate::database::time::now_ms;
use crate::{Error, Result};

/// Notification rule repository trait.
#[async_trait]
pub trait RuleRepository: Send + Sync {
    async fn create(&self, rule: &NotificationRuleDbModel) -> Result<()>;
    async fn get(&self, id: &str) -> Result<NotificationRuleDbModel>;
    /// Like [`RuleRepository::get`], but rules owned by someone else are `NotFound`.
    async fn get_for_user(&self, user_id: &str, id: &str) -> Result<NotificationRuleDbModel>;
    async fn list_for_user(&self, user_id: &str) -> Result<Vec<RuleWithMatchCount>>;
    /// Candidate prefilter for the pipeline.
    async fn list_enabled_for_region(
        &self,
        sido_code: &str,
        sigu_code: &str,
    ) -> Result<Vec<NotificationRuleDbModel>>;
    /// Replace the filter fields of an owned rule.
    async fn update(&self, rule: &NotificationRuleDbModel) -> Result<()>;
    async fn set_enabled(
        &self,
        user_id: &str,
        id: &str,
        enabled: bool,
    ) -> Result<NotificationRuleDbModel>;
    /// Delete an owned rule. Its dispatch history is left in place.
    async fn delete(&self, user_id: &str, id: &str) -> Result<()>;
    async fn count_enabled_for_user(&self, user_id: &str) -> Result<i64>;
}

/// SQLx implementation of RuleRepository.
pub struct SqlxRuleRepository {
    pool: SqlitePool,
}

impl SqlxRuleRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RuleRepository for SqlxRuleRepository {
    async fn create(&self, rule: &NotificationRuleDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO notification_rule (
                id, user_id, name, enabled, sido_code, sigu_code, category,
                price_min, price_max, area_min, area_max, keyword, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&rule.id)
        .bind(&rule.user_id)
        .bind(&rule.name)
        .bind(rule.enabled)
        .bind(&rule.sido_code)
        .bind(&rule.sigu_code)
        .bind(&rule.category)
        .bind(rule.price_min)
        .bind(rule.price_max)
        .bind(rule.area_min)
        .bind(rule.area_max)
        .bind(&rule.keyword)
        .bind(rule.created_at)
        .bind(rule.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<NotificationRuleDbModel> {
        sqlx::query_as::<_, NotificationRuleDbModel>(
            "SELECT * FROM notification_rule WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::not_found("NotificationRule", id))
    }

    async fn get_for_user(&self, user_id: &str, id: &str) -> Result<NotificationRuleDbModel> {
        sqlx::query_as::<_, NotificationRuleDbModel>(
            "SELECT * FROM notification_rule WHERE id = ? AND user_id = ?",
        )
        .bind(id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::not_found("NotificationRule", id))
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<RuleWithMatchCount>> {
        let rules = sqlx::query_as::<_, RuleWithMatchCount>(
            r#"
            SELECT r.*,
                   (SELECT COUNT(*) FROM dispatch_log d WHERE d.rule_id = r.id) AS match_item_count
            FROM notification_rule r
            WHERE r.user_id = ?
            ORDER BY r.created_at DESC, r.id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rules)
    }

    async fn list_enabled_for_region(
        &self,
        sido_code: &str,
        sigu_code: &str,
    ) -> Result<Vec<NotificationRuleDbModel>> {
        let rules = sqlx::query_as::<_, NotificationRuleDbModel>(
            r#"
            SELECT * FROM notification_rule
            WHERE enabled = 1 AND sido_code = ? AND sigu_code = ?
            ORDER BY created_at, id
            "#,
        )
        .bind(sido_code)
        .bind(sigu_code)
        .fetch_all(&self.pool)
        .await?;
        Ok(rules)
    }

    async fn update(&self, rule: &NotificationRuleDbModel) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE notification_rule SET
                name = ?,
                sido_code = ?,
                sigu_code = ?,
                category = ?,
                price_min = ?,
                price_max = ?,
                area_min = ?,
                area_max = ?,
                keyword = ?,
                updated_at = ?
            WHERE id = ? AND user_id = ?
            "#,
        )
        .bind(&rule.name)
        .bind(&rule.sido_code)
        .bind(&rule.sigu_code)
        .bind(&rule.category)
        .bind(rule.price_min)
        .bind(rule.price_max)
        .bind(rule.area_min)
        .bind(rule.area_max)
        .bind(&rule.keyword)
        .bind(rule.updated_at)
        .bind(&rule.id)
        .bind(&rule.user_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("NotificationRule", &rule.id));
        }
        Ok(())
    }

    async fn set_enabled(
        &self,
        user_id: &str,
        id: &str,
        enabled: bool,
    ) -> Result<NotificationRuleDbModel> {
        sqlx::query_as::<_, NotificationRuleDbModel>(
            r#"
            UPDATE notification_rule SET enabled = ?, updated_at = ?
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
        .ok_or_else(|| Error::not_found("NotificationRule", id))
    }

    async fn delete(&self, user_id: &str, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM notification_rule WHERE id = ? AND user_id = ?")
            .bind(id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("NotificationRule", id));
        }
        Ok(())
    }

    async fn count_enabled_for_user(&self, user_id: &str) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM notification_rule WHERE user_id = ? AND enabled = 1",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}
