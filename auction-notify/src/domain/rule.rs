//! Rule input validation and the request-scoped user identity.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Identity of the user a management call acts for.
///
/// Every service operation takes one explicitly; there is no ambient session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let trimmed = id.trim();
        if trimmed.is_empty() {
            return Err(Error::validation("user id must not be empty"));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Filter fields of a rule as submitted for create or full edit.
///
/// Call [`RuleDraft::validate`] before persisting; it trims strings and turns
/// blank optional text into `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDraft {
    pub name: String,
    pub sido_code: String,
    pub sigu_code: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub price_min: Option<i64>,
    #[serde(default)]
    pub price_max: Option<i64>,
    #[serde(default)]
    pub area_min: Option<f64>,
    #[serde(default)]
    pub area_max: Option<f64>,
    #[serde(default)]
    pub keyword: Option<String>,
}

impl RuleDraft {
    /// Normalize and check the draft.
    ///
    /// Inverted ranges are accepted: the matcher treats them as unsatisfiable.
    pub fn validate(self) -> Result<Self> {
        let name = required("name", self.name)?;
        let sido_code = required("sido_code", self.sido_code)?;
        let sigu_code = required("sigu_code", self.sigu_code)?;

        for (field, value) in [("price_min", self.price_min), ("price_max", self.price_max)] {
            if value.is_some_and(|v| v < 0) {
                return Err(Error::validation(format!("{field} must not be negative")));
            }
        }
        for (field, value) in [("area_min", self.area_min), ("area_max", self.area_max)] {
            if let Some(v) = value
                && (!v.is_finite() || v < 0.0)
            {
                return Err(Error::validation(format!(
                    "{field} must be a non-negative number"
                )));
            }
        }

        Ok(Self {
            name,
            sido_code,
            sigu_code,
            category: optional(self.category),
            price_min: self.price_min,
            price_max: self.price_max,
            area_min: self.area_min,
            area_max: self.area_max,
            keyword: optional(self.keyword),
        })
    }
}

fn required(field: &str, value: String) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(Error::validation(format!("{field} is required")));
    }
    Ok(trimmed.to_string())
}

fn optional(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
