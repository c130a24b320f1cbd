//! Database models.
//!
//! These models map directly to the database schema.

pub mod channel;
pub mod dispatch_log;
pub mod rule;

pub use channel::*;
pub use dispatch_log::*;
pub use rule::*;
