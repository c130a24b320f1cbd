//! Domain layer.
//!
//! Listings, rule input validation and the matcher.

pub mod listing;
pub mod matcher;
pub mod rule;

pub use listing::{ChangeKind, Listing, ListingChangeEvent, RawListing};
pub use matcher::{KeywordField, Mismatch, RuleMatcher};
pub use rule::{RuleDraft, UserId};
