//! Dispatch log listing, read state and statistics.

use std::sync::Arc;

use chrono::Utc;
use chrono_tz::Tz;
use tracing::{debug, info};

use crate::Result;
use crate::database::models::{DeliveryFailureDbModel, DispatchLogWithRule, NotificationStats};
use crate::database::repositories::DispatchLogRepository;
use crate::database::time::start_of_week_ms;
use crate::domain::UserId;

/// Maximum dispatch log entries returned per listing.
pub const DISPATCH_LOG_LIMIT: i64 = 100;

pub struct LogService {
    ledger: Arc<dyn DispatchLogRepository>,
    stats_timezone: Tz,
}

impl LogService {
    /// `stats_timezone` decides where "this week" starts.
    pub fn new(ledger: Arc<dyn DispatchLogRepository>, stats_timezone: Tz) -> Self {
        Self {
            ledger,
            stats_timezone,
        }
    }

    /// The user's most recent dispatch log entries, newest first.
    pub async fn list(&self, user: &UserId) -> Result<Vec<DispatchLogWithRule>> {
        self.ledger
            .list_for_user(user.as_str(), DISPATCH_LOG_LIMIT)
            .await
    }

    /// Mark entries as read. Ids that are unknown or owned by someone else
    /// are ignored. Returns how many of the user's entries matched.
    pub async fn mark_read(&self, user: &UserId, ids: &[i64]) -> Result<u64> {
        let marked = self.ledger.mark_read(user.as_str(), ids).await?;
        debug!(user_id = %user, requested = ids.len(), marked, "Marked dispatch log entries read");
        Ok(marked)
    }

    pub async fn stats(&self, user: &UserId) -> Result<NotificationStats> {
        let week_start = start_of_week_ms(Utc::now(), self.stats_timezone);
        self.ledger.stats(user.as_str(), week_start).await
    }

    /// Recent deliveries that did not reach the user.
    pub async fn delivery_failures(
        &self,
        user: &UserId,
        limit: i64,
    ) -> Result<Vec<DeliveryFailureDbModel>> {
        self.ledger
            .list_delivery_failures(user.as_str(), limit.clamp(1, DISPATCH_LOG_LIMIT))
            .await
    }

    /// Remove failure rows older than `retention_days`.
    pub async fn cleanup_delivery_failures(&self, retention_days: u32) -> Result<u64> {
        let removed = self
            .ledger
            .cleanup_old_delivery_failures(retention_days)
            .await?;
        if removed > 0 {
            info!(removed, retention_days, "Cleaned up old delivery failures");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::{DeliveryErrorKind, NotificationRuleDbModel};
    use crate::database::repositories::{
        RuleRepository, SqlxDispatchLogRepository, SqlxRuleRepository,
    };
    use crate::database::test_support::memory_pool;
    use crate::domain::RuleDraft;

    fn draft() -> RuleDraft {
        RuleDraft {
            name: "r".to_string(),
            sido_code: "11".to_string(),
            sigu_code: "110".to_string(),
            category: None,
            price_min: None,
            price_max: None,
            area_min: None,
            area_max: None,
            keyword: None,
        }
    }

    #[tokio::test]
    async fn test_list_mark_read_and_stats() {
        let pool = memory_pool().await;
        let rules = SqlxRuleRepository::new(pool.clone());
        let ledger = Arc::new(SqlxDispatchLogRepository::new(pool));
        let service = LogService::new(ledger.clone(), chrono_tz::Asia::Seoul);
        let user = UserId::new("u1").unwrap();

        let rule = NotificationRuleDbModel::new("u1", draft());
        rules.create(&rule).await.unwrap();
        let (_, first) = ledger
            .insert_if_absent(&rule.id, "L1", "u1", "one")
            .await
            .unwrap();
        let (_, foreign) = ledger
            .insert_if_absent(&rule.id, "L2", "u2", "two")
            .await
            .unwrap();

        let entries = service.list(&user).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].rule_name.as_deref(), Some("r"));

        assert_eq!(service.mark_read(&user, &[first.id, foreign.id]).await.unwrap(), 1);
        assert_eq!(service.mark_read(&user, &[]).await.unwrap(), 0);
        assert!(ledger.get(first.id).await.unwrap().is_read);
        assert!(!ledger.get(foreign.id).await.unwrap().is_read);

        let stats = service.stats(&user).await.unwrap();
        assert_eq!(stats.active_alerts, 1);
        assert_eq!(stats.total_matches, 1);
        assert_eq!(stats.this_week, 1);
    }

    #[tokio::test]
    async fn test_delivery_failures() {
        let pool = memory_pool().await;
        let ledger = Arc::new(SqlxDispatchLogRepository::new(pool));
        let service = LogService::new(ledger.clone(), chrono_tz::Asia::Seoul);
        let user = UserId::new("u1").unwrap();

        let (_, entry) = ledger
            .insert_if_absent("r1", "L1", "u1", "msg")
            .await
            .unwrap();
        let failure = DeliveryFailureDbModel::new(
            &entry,
            "c1",
            "telegram",
            DeliveryErrorKind::Transient,
            "timeout",
            3,
        );
        ledger.record_delivery_failure(&failure).await.unwrap();

        let failures = service.delivery_failures(&user, 0).await.unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].attempts, 3);

        assert_eq!(service.cleanup_delivery_failures(30).await.unwrap(), 0);
    }
}
