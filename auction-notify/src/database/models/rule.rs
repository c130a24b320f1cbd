//! Notification rule database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::now_ms;
use crate::domain::rule::RuleDraft;

/// Notification rule database model.
/// A user-defined listing filter plus an enabled flag.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct NotificationRuleDbModel {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub enabled: bool,
    pub sido_code: String,
    pub sigu_code: String,
    /// `None` matches any category.
    pub category: Option<String>,
    /// Lower bound on the listing's minimum price, in currency minor units.
    pub price_min: Option<i64>,
    pub price_max: Option<i64>,
    pub area_min: Option<f64>,
    pub area_max: Option<f64>,
    /// Case-insensitive substring matched against the listing address fields.
    pub keyword: Option<String>,
    /// Epoch milliseconds; never changes after creation.
    pub created_at: i64,
    pub updated_at: i64,
}

impl NotificationRuleDbModel {
    /// Build a new, enabled rule owned by `user_id` from a validated draft.
    pub fn new(user_id: impl Into<String>, draft: RuleDraft) -> Self {
        let now = now_ms();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            name: draft.name,
            enabled: true,
            sido_code: draft.sido_code,
            sigu_code: draft.sigu_code,
            category: draft.category,
            price_min: draft.price_min,
            price_max: draft.price_max,
            area_min: draft.area_min,
            area_max: draft.area_max,
            keyword: draft.keyword,
            created_at: now,
            updated_at: now,
        }
    }

    /// Replace every filter field with the draft's, keeping id, owner,
    /// enabled flag and creation time.
    pub fn apply_draft(&mut self, draft: RuleDraft) {
        self.name = draft.name;
        self.sido_code = draft.sido_code;
        self.sigu_code = draft.sigu_code;
        self.category = draft.category;
        self.price_min = draft.price_min;
        self.price_max = draft.price_max;
        self.area_min = draft.area_min;
        self.area_max = draft.area_max;
        self.keyword = draft.keyword;
        self.updated_at = now_ms();
    }
}

/// A rule together with the number of ledger entries it produced.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct RuleWithMatchCount {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub rule: NotificationRuleDbModel,
    pub match_item_count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft() -> RuleDraft {
        RuleDraft {
            name: "Gangnam flats".to_string(),
            sido_code: "11".to_string(),
            sigu_code: "680".to_string(),
            category: Some("아파트".to_string()),
            price_min: None,
            price_max: Some(900_000_000),
            area_min: None,
            area_max: None,
            keyword: None,
        }
    }

    #[test]
    fn test_new_rule_is_enabled() {
        let rule = NotificationRuleDbModel::new("user-1", draft());
        assert!(rule.enabled);
        assert_eq!(rule.user_id, "user-1");
        assert_eq!(rule.created_at, rule.updated_at);
        assert!(uuid::Uuid::parse_str(&rule.id).is_ok());
    }

    #[test]
    fn test_apply_draft_keeps_identity() {
        let mut rule = NotificationRuleDbModel::new("user-1", draft());
        rule.enabled = false;
        let (id, created_at) = (rule.id.clone(), rule.created_at);

        let mut edited = draft();
        edited.category = None;
        edited.sigu_code = "650".to_string();
        rule.apply_draft(edited);

        assert_eq!(rule.id, id);
        assert_eq!(rule.created_at, created_at);
        assert!(!rule.enabled);
        assert_eq!(rule.sigu_code, "650");
        assert!(rule.category.is_none());
    }
}
