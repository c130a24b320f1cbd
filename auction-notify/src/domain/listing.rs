//! Auction listings and the change events that carry them.
//!
//! Listings come from an external ingester as loosely-typed JSON
//! ([`RawListing`]). They are checked once at the boundary and converted to
//! [`Listing`], which the matcher and message renderer rely on.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Listing as delivered by the ingester. Every field is optional and ids may
/// be numbers or strings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawListing {
    #[serde(default)]
    pub id: Option<serde_json::Value>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub building_name: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub area: Option<f64>,
    #[serde(default)]
    pub estimated_price: Option<i64>,
    #[serde(default)]
    pub minimum_price: Option<i64>,
    #[serde(default)]
    pub auction_date: Option<NaiveDate>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub sido_code: Option<String>,
    #[serde(default)]
    pub sigu_code: Option<String>,
    #[serde(default)]
    pub failed_auction_count: Option<i32>,
    #[serde(default, alias = "thumbnail_src")]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// A validated court-auction listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: String,
    pub address: Option<String>,
    pub building_name: Option<String>,
    pub category: Option<String>,
    /// Floor area in square metres.
    pub area: Option<f64>,
    /// Appraised value, currency minor units.
    pub estimated_price: Option<i64>,
    /// Current minimum bid, currency minor units.
    pub minimum_price: Option<i64>,
    pub auction_date: Option<NaiveDate>,
    pub status: Option<String>,
    pub sido_code: String,
    pub sigu_code: String,
    pub failed_auction_count: Option<i32>,
    pub thumbnail: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl TryFrom<RawListing> for Listing {
    type Error = Error;

    fn try_from(raw: RawListing) -> Result<Self> {
        let id = match raw.id {
            Some(serde_json::Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => return Err(Error::validation("listing id is missing")),
        };

        let sido_code = non_blank(raw.sido_code)
            .ok_or_else(|| Error::validation(format!("listing {id}: sido_code is missing")))?;
        let sigu_code = non_blank(raw.sigu_code)
            .ok_or_else(|| Error::validation(format!("listing {id}: sigu_code is missing")))?;

        for (field, value) in [
            ("estimated_price", raw.estimated_price),
            ("minimum_price", raw.minimum_price),
        ] {
            if value.is_some_and(|v| v < 0) {
                return Err(Error::validation(format!(
                    "listing {id}: {field} is negative"
                )));
            }
        }
        if let Some(area) = raw.area
            && (!area.is_finite() || area < 0.0)
        {
            return Err(Error::validation(format!(
                "listing {id}: area is not a non-negative number"
            )));
        }

        Ok(Self {
            id,
            address: non_blank(raw.address),
            building_name: non_blank(raw.building_name),
            category: non_blank(raw.category),
            area: raw.area,
            estimated_price: raw.estimated_price,
            minimum_price: raw.minimum_price,
            auction_date: raw.auction_date,
            status: non_blank(raw.status),
            sido_code,
            sigu_code,
            failed_auction_count: raw.failed_auction_count,
            thumbnail: non_blank(raw.thumbnail),
            created_at: raw.created_at,
            updated_at: raw.updated_at,
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Kind of upsert the ingester observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    #[default]
    Updated,
}

/// Wire form of a change event.
#[derive(Debug, Clone, Deserialize)]
pub struct RawListingChangeEvent {
    #[serde(default)]
    pub change: ChangeKind,
    pub listing: RawListing,
}

/// A listing upsert pushed to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingChangeEvent {
    pub listing_id: String,
    pub change: ChangeKind,
    pub listing: Listing,
}

impl ListingChangeEvent {
    pub fn new(change: ChangeKind, listing: Listing) -> Self {
        Self {
            listing_id: listing.id.clone(),
            change,
            listing,
        }
    }

    /// Parse and validate one JSON-encoded event.
    pub fn from_json(input: &str) -> Result<Self> {
        let raw: RawListingChangeEvent = serde_json::from_str(input)?;
        let listing = Listing::try_from(raw.listing)?;
        Ok(Self::new(raw.change, listing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_event_with_numeric_id() {
        let event = ListingChangeEvent::from_json(
            r#"{
                "change": "created",
                "listing": {
                    "id": 42,
                    "address": "서울특별시 강남구 역삼동 123",
                    "category": "아파트",
                    "area": 84.9,
                    "minimum_price": 40000000,
                    "sido_code": "11",
                    "sigu_code": "680",
                    "auction_date": "2025-07-01",
                    "thumbnail_src": "https://img.example/42.jpg"
                }
            }"#,
        )
        .unwrap();

        assert_eq!(event.listing_id, "42");
        assert_eq!(event.change, ChangeKind::Created);
        assert_eq!(event.listing.minimum_price, Some(40_000_000));
        assert_eq!(
            event.listing.thumbnail.as_deref(),
            Some("https://img.example/42.jpg")
        );
    }

    #[test]
    fn test_change_defaults_to_updated() {
        let event = ListingChangeEvent::from_json(
            r#"{"listing": {"id": "a-1", "sido_code": "26", "sigu_code": "350"}}"#,
        )
        .unwrap();
        assert_eq!(event.change, ChangeKind::Updated);
        assert!(event.listing.minimum_price.is_none());
    }

    #[test]
    fn test_missing_region_is_rejected() {
        let err = ListingChangeEvent::from_json(
            r#"{"listing": {"id": "a-1", "sido_code": "26", "sigu_code": " "}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Validation(msg) if msg.contains("sigu_code")));
    }

    #[test]
    fn test_negative_price_is_rejected() {
        let raw = RawListing {
            id: Some(serde_json::json!("x")),
            sido_code: Some("11".into()),
            sigu_code: Some("110".into()),
            minimum_price: Some(-5),
            ..Default::default()
        };
        assert!(Listing::try_from(raw).is_err());
    }

    #[test]
    fn test_malformed_json_is_serialization_error() {
        let err = ListingChangeEvent::from_json("{not json").unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
