//! Repository layer for database access.
//!
//! Each repository is a trait plus an sqlx implementation, so the pipeline
//! and services can be exercised against the real schema in tests.

pub mod channel;
pub mod dispatch_log;
pub mod rule;

pub use channel::*;
pub use dispatch_log::*;
pub use rule::*;
