//! Management services and their wiring.
//!
//! Every operation takes the acting [`UserId`](crate::domain::UserId)
//! explicitly; records owned by someone else are reported as not found.

pub mod channels;
pub mod container;
pub mod logs;
pub mod rules;

pub use channels::{ChannelService, LinkInvitation};
pub use container::{ServiceContainer, ServiceStats};
pub use logs::LogService;
pub use rules::RuleService;
