//! Rule matching.
//!
//! Decides whether one listing satisfies one rule. Pure: no I/O, no clock,
//! no shared state. All clauses are AND-ed; a rule field that is unset
//! leaves its clause vacuously true.

use serde::{Deserialize, Serialize};

use super::listing::Listing;
use crate::database::models::NotificationRuleDbModel;

/// Which listing field(s) a rule keyword is searched in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeywordField {
    Address,
    BuildingName,
    /// Address or building name.
    #[default]
    Either,
}

impl KeywordField {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "address" => Some(Self::Address),
            "building_name" | "building" => Some(Self::BuildingName),
            "either" | "any" => Some(Self::Either),
            _ => None,
        }
    }
}

/// First clause a listing failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Mismatch {
    Region,
    Category,
    Price,
    Area,
    Keyword,
}

/// Evaluates rules against listings.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleMatcher {
    keyword_field: KeywordField,
}

impl RuleMatcher {
    pub fn new(keyword_field: KeywordField) -> Self {
        Self { keyword_field }
    }

    pub fn keyword_field(&self) -> KeywordField {
        self.keyword_field
    }

    /// Whether `listing` satisfies every clause of `rule`.
    pub fn matches(&self, rule: &NotificationRuleDbModel, listing: &Listing) -> bool {
        self.explain(rule, listing).is_none()
    }

    /// The first failing clause, or `None` on a match.
    pub fn explain(&self, rule: &NotificationRuleDbModel, listing: &Listing) -> Option<Mismatch> {
        if listing.sido_code != rule.sido_code || listing.sigu_code != rule.sigu_code {
            return Some(Mismatch::Region);
        }
        if !category_matches(rule.category.as_deref(), listing.category.as_deref()) {
            return Some(Mismatch::Category);
        }
        if !in_range(rule.price_min, rule.price_max, listing.minimum_price) {
            return Some(Mismatch::Price);
        }
        if !in_range(rule.area_min, rule.area_max, listing.area) {
            return Some(Mismatch::Area);
        }
        if !self.keyword_matches(rule.keyword.as_deref(), listing) {
            return Some(Mismatch::Keyword);
        }
        None
    }

    fn keyword_matches(&self, keyword: Option<&str>, listing: &Listing) -> bool {
        let Some(keyword) = keyword.map(str::trim).filter(|k| !k.is_empty()) else {
            return true;
        };
        let needle = keyword.to_lowercase();
        let contains = |field: &Option<String>| {
            field
                .as_deref()
                .is_some_and(|value| value.to_lowercase().contains(&needle))
        };

        match self.keyword_field {
            KeywordField::Address => contains(&listing.address),
            KeywordField::BuildingName => contains(&listing.building_name),
            KeywordField::Either => contains(&listing.address) || contains(&listing.building_name),
        }
    }
}

fn category_matches(wanted: Option<&str>, actual: Option<&str>) -> bool {
    match wanted.map(str::trim).filter(|c| !c.is_empty()) {
        None => true,
        Some(wanted) => actual.is_some_and(|actual| actual.trim() == wanted),
    }
}

/// Range clause. A present bound with a missing value fails; an inverted
/// range can never be satisfied.
fn in_range<T: PartialOrd + Copy>(min: Option<T>, max: Option<T>, value: Option<T>) -> bool {
    if min.is_none() && max.is_none() {
        return true;
    }
    if let (Some(lo), Some(hi)) = (min, max)
        && lo > hi
    {
        return false;
    }
    let Some(value) = value else {
        return false;
    };
    min.is_none_or(|lo| value >= lo) && max.is_none_or(|hi| value <= hi)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule() -> NotificationRuleDbModel {
        NotificationRuleDbModel {
            id: "rule-1".to_string(),
            user_id: "user-1".to_string(),
            name: "test".to_string(),
            enabled: true,
            sido_code: "11".to_string(),
            sigu_code: "110".to_string(),
            category: None,
            price_min: None,
            price_max: Some(50_000_000),
            area_min: None,
            area_max: None,
            keyword: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn listing() -> Listing {
        Listing {
            id: "listing-1".to_string(),
            address: Some("서울특별시 종로구 평창동 10".to_string()),
            building_name: Some("Pyeongchang Hills".to_string()),
            category: Some("아파트".to_string()),
            area: Some(84.0),
            estimated_price: Some(60_000_000),
            minimum_price: Some(40_000_000),
            auction_date: None,
            status: None,
            sido_code: "11".to_string(),
            sigu_code: "110".to_string(),
            failed_auction_count: Some(1),
            thumbnail: None,
            created_at: None,
            updated_at: None,
        }
    }

    #[test]
    fn scenario_a_price_cap_matches() {
        assert!(RuleMatcher::default().matches(&rule(), &listing()));
    }

    #[test]
    fn scenario_b_other_sigu_never_matches() {
        let mut l = listing();
        l.sigu_code = "120".to_string();
        let matcher = RuleMatcher::default();
        assert!(!matcher.matches(&rule(), &l));
        assert_eq!(matcher.explain(&rule(), &l), Some(Mismatch::Region));
    }

    #[test]
    fn test_region_is_hard_filter_even_for_open_rule() {
        let mut r = rule();
        r.price_max = None;
        let mut l = listing();
        l.sido_code = "26".to_string();
        assert!(!RuleMatcher::default().matches(&r, &l));
    }

    #[test]
    fn test_null_category_ignores_listing_category() {
        let matcher = RuleMatcher::default();
        for category in [None, Some("아파트"), Some("토지"), Some("")] {
            let mut l = listing();
            l.category = category.map(str::to_string);
            assert!(matcher.matches(&rule(), &l), "category {category:?}");
        }
    }

    #[test]
    fn test_category_must_equal_when_set() {
        let mut r = rule();
        r.category = Some("토지".to_string());
        let matcher = RuleMatcher::default();
        assert_eq!(matcher.explain(&r, &listing()), Some(Mismatch::Category));

        let mut l = listing();
        l.category = None;
        assert!(!matcher.matches(&r, &l));

        l.category = Some("토지".to_string());
        assert!(matcher.matches(&r, &l));
    }

    #[test]
    fn test_inverted_price_range_never_matches() {
        let mut r = rule();
        r.price_min = Some(5000);
        r.price_max = Some(3000);
        let matcher = RuleMatcher::default();
        for price in [None, Some(0), Some(3000), Some(4000), Some(5000), Some(i64::MAX)] {
            let mut l = listing();
            l.minimum_price = price;
            assert!(!matcher.matches(&r, &l), "price {price:?}");
        }
    }

    #[test]
    fn test_inverted_area_range_never_matches() {
        let mut r = rule();
        r.price_max = None;
        r.area_min = Some(100.0);
        r.area_max = Some(50.0);
        assert_eq!(
            RuleMatcher::default().explain(&r, &listing()),
            Some(Mismatch::Area)
        );
    }

    #[test]
    fn test_null_listing_price_fails_bounded_rule() {
        let mut l = listing();
        l.minimum_price = None;
        assert_eq!(
            RuleMatcher::default().explain(&rule(), &l),
            Some(Mismatch::Price)
        );

        let mut open = rule();
        open.price_max = None;
        assert!(RuleMatcher::default().matches(&open, &l));
    }

    #[test]
    fn test_price_bounds_are_inclusive() {
        let mut r = rule();
        r.price_min = Some(40_000_000);
        r.price_max = Some(40_000_000);
        assert!(RuleMatcher::default().matches(&r, &listing()));
    }

    #[test]
    fn test_area_range() {
        let mut r = rule();
        r.area_min = Some(60.0);
        r.area_max = Some(85.0);
        let matcher = RuleMatcher::default();
        assert!(matcher.matches(&r, &listing()));

        let mut l = listing();
        l.area = Some(85.1);
        assert!(!matcher.matches(&r, &l));

        l.area = None;
        assert!(!matcher.matches(&r, &l));
    }

    #[test]
    fn test_keyword_is_case_insensitive_substring() {
        let mut r = rule();
        r.keyword = Some("HILLS".to_string());
        assert!(RuleMatcher::new(KeywordField::Either).matches(&r, &listing()));
        assert!(!RuleMatcher::new(KeywordField::Address).matches(&r, &listing()));
        assert!(RuleMatcher::new(KeywordField::BuildingName).matches(&r, &listing()));

        r.keyword = Some("평창동".to_string());
        assert!(RuleMatcher::new(KeywordField::Address).matches(&r, &listing()));
        assert!(!RuleMatcher::new(KeywordField::BuildingName).matches(&r, &listing()));
    }

    #[test]
    fn test_keyword_against_missing_field() {
        let mut r = rule();
        r.keyword = Some("평창".to_string());
        let mut l = listing();
        l.address = None;
        l.building_name = None;
        assert_eq!(
            RuleMatcher::default().explain(&r, &l),
            Some(Mismatch::Keyword)
        );

        r.keyword = Some("   ".to_string());
        assert!(RuleMatcher::default().matches(&r, &l));
    }

    #[test]
    fn test_keyword_field_parse() {
        assert_eq!(KeywordField::parse("Address"), Some(KeywordField::Address));
        assert_eq!(
            KeywordField::parse("building_name"),
            Some(KeywordField::BuildingName)
        );
        assert_eq!(KeywordField::parse("either"), Some(KeywordField::Either));
        assert_eq!(KeywordField::parse("title"), None);
    }
}
