//! auction-notify library crate.
//!
//! Matches court-auction listing change events against user notification
//! rules, records each match once in a dispatch ledger and delivers the
//! message to the rule owner's channels.

pub mod config;
pub mod database;
pub mod domain;
pub mod error;
pub mod logging;
pub mod notification;
pub mod scheduler;
pub mod services;
pub mod utils;

pub use error::{Error, Result};
