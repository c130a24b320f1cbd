//! Rule management for one user at a time.

use std::sync::Arc;

use tracing::{debug, info};

use crate::Result;
use crate::database::models::{DispatchLogDbModel, NotificationRuleDbModel, RuleWithMatchCount};
use crate::database::repositories::{DispatchLogRepository, RuleRepository};
use crate::domain::{RuleDraft, UserId};

/// Maximum ledger entries returned for one rule.
pub const RULE_MATCHES_LIMIT: i64 = 100;

/// Create, edit, toggle and delete notification rules.
///
/// Rules owned by another user behave as if they did not exist.
pub struct RuleService {
    rules: Arc<dyn RuleRepository>,
    ledger: Arc<dyn DispatchLogRepository>,
}

impl RuleService {
    pub fn new(rules: Arc<dyn RuleRepository>, ledger: Arc<dyn DispatchLogRepository>) -> Self {
        Self { rules, ledger }
    }

    /// The user's rules with their match counts, newest first.
    pub async fn list(&self, user: &UserId) -> Result<Vec<RuleWithMatchCount>> {
        self.rules.list_for_user(user.as_str()).await
    }

    pub async fn get(&self, user: &UserId, id: &str) -> Result<NotificationRuleDbModel> {
        self.rules.get_for_user(user.as_str(), id).await
    }

    /// Validate and store a new rule. New rules start enabled.
    pub async fn create(&self, user: &UserId, draft: RuleDraft) -> Result<NotificationRuleDbModel> {
        let draft = draft.validate()?;
        let rule = NotificationRuleDbModel::new(user.as_str(), draft);
        self.rules.create(&rule).await?;

        info!(
            rule_id = %rule.id,
            user_id = %user,
            sido_code = %rule.sido_code,
            sigu_code = %rule.sigu_code,
            "Created notification rule"
        );
        Ok(rule)
    }

    /// Replace every filter field of an owned rule. `enabled` is untouched.
    pub async fn update(
        &self,
        user: &UserId,
        id: &str,
        draft: RuleDraft,
    ) -> Result<NotificationRuleDbModel> {
        let draft = draft.validate()?;
        let mut rule = self.rules.get_for_user(user.as_str(), id).await?;
        rule.apply_draft(draft);
        self.rules.update(&rule).await?;

        debug!(rule_id = %rule.id, user_id = %user, "Updated notification rule");
        Ok(rule)
    }

    pub async fn set_enabled(
        &self,
        user: &UserId,
        id: &str,
        enabled: bool,
    ) -> Result<NotificationRuleDbModel> {
        let rule = self.rules.set_enabled(user.as_str(), id, enabled).await?;
        info!(rule_id = %rule.id, user_id = %user, enabled, "Toggled notification rule");
        Ok(rule)
    }

    /// Flip the enabled flag and return the stored rule.
    pub async fn toggle(&self, user: &UserId, id: &str) -> Result<NotificationRuleDbModel> {
        let current = self.rules.get_for_user(user.as_str(), id).await?;
        self.set_enabled(user, id, !current.enabled).await
    }

    /// Delete an owned rule. Dispatch history for it is kept.
    pub async fn delete(&self, user: &UserId, id: &str) -> Result<()> {
        self.rules.delete(user.as_str(), id).await?;
        info!(rule_id = %id, user_id = %user, "Deleted notification rule");
        Ok(())
    }

    /// Ledger entries recorded for an owned rule, newest first.
    pub async fn matches(&self, user: &UserId, id: &str) -> Result<Vec<DispatchLogDbModel>> {
        let rule = self.rules.get_for_user(user.as_str(), id).await?;
        self.ledger.list_for_rule(&rule.id, RULE_MATCHES_LIMIT).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use crate::database::repositories::{SqlxDispatchLogRepository, SqlxRuleRepository};
    use crate::database::test_support::memory_pool;

    async fn service() -> (RuleService, Arc<SqlxDispatchLogRepository>) {
        let pool = memory_pool().await;
        let ledger = Arc::new(SqlxDispatchLogRepository::new(pool.clone()));
        let service = RuleService::new(Arc::new(SqlxRuleRepository::new(pool)), ledger.clone());
        (service, ledger)
    }

    fn draft(name: &str) -> RuleDraft {
        RuleDraft {
            name: name.to_string(),
            sido_code: "11".to_string(),
            sigu_code: "440".to_string(),
            category: Some("아파트".to_string()),
            price_min: None,
            price_max: Some(300_000_000),
            area_min: None,
            area_max: None,
            keyword: None,
        }
    }

    #[tokio::test]
    async fn test_create_validates_and_enables() {
        let (service, _) = service().await;
        let user = UserId::new("u1").unwrap();

        let rule = service.create(&user, draft(" Mapo ")).await.unwrap();
        assert!(rule.enabled);
        assert_eq!(rule.name, "Mapo");

        let mut bad = draft("x");
        bad.sido_code = String::new();
        assert!(matches!(
            service.create(&user, bad).await,
            Err(Error::Validation(_))
        ));
        assert_eq!(service.list(&user).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_replaces_fields_keeps_enabled() {
        let (service, _) = service().await;
        let user = UserId::new("u1").unwrap();
        let rule = service.create(&user, draft("a")).await.unwrap();
        service.set_enabled(&user, &rule.id, false).await.unwrap();

        let mut edit = draft("b");
        edit.category = None;
        edit.keyword = Some("래미안".to_string());
        let updated = service.update(&user, &rule.id, edit).await.unwrap();

        assert_eq!(updated.name, "b");
        assert_eq!(updated.category, None);
        assert_eq!(updated.keyword.as_deref(), Some("래미안"));
        assert!(!updated.enabled);
        assert_eq!(updated.created_at, rule.created_at);
        assert_eq!(service.get(&user, &rule.id).await.unwrap(), updated);
    }

    #[tokio::test]
    async fn test_toggle_twice_restores_state() {
        let (service, _) = service().await;
        let user = UserId::new("u1").unwrap();
        let rule = service.create(&user, draft("a")).await.unwrap();

        assert!(!service.toggle(&user, &rule.id).await.unwrap().enabled);
        assert!(service.toggle(&user, &rule.id).await.unwrap().enabled);
    }

    #[tokio::test]
    async fn test_other_users_rules_are_not_found() {
        let (service, _) = service().await;
        let owner = UserId::new("owner").unwrap();
        let other = UserId::new("other").unwrap();
        let rule = service.create(&owner, draft("a")).await.unwrap();

        for result in [
            service.get(&other, &rule.id).await.map(|_| ()),
            service.toggle(&other, &rule.id).await.map(|_| ()),
            service.update(&other, &rule.id, draft("b")).await.map(|_| ()),
            service.delete(&other, &rule.id).await,
            service.matches(&other, &rule.id).await.map(|_| ()),
        ] {
            assert!(matches!(result, Err(Error::NotFound { .. })));
        }
        assert!(service.get(&owner, &rule.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_matches_newest_first() {
        let (service, ledger) = service().await;
        let user = UserId::new("u1").unwrap();
        let rule = service.create(&user, draft("a")).await.unwrap();

        for listing in ["L1", "L2"] {
            ledger
                .insert_if_absent(&rule.id, listing, "u1", "msg")
                .await
                .unwrap();
        }

        let matches = service.matches(&user, &rule.id).await.unwrap();
        assert_eq!(matches.len(), 2);
        assert!(matches[0].id > matches[1].id);

        service.delete(&user, &rule.id).await.unwrap();
        assert!(service.list(&user).await.unwrap().is_empty());
    }
}
