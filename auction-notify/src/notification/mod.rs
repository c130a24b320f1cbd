//! Notification delivery.
//!
//! Renders match messages and delivers them through per-type transports
//! (Telegram, Discord) with retry and a circuit breaker per channel type.
//! Operator-facing failures go out on the ops broadcast channel.
//!
//! # Example
//!
//! ```ignore
//! use auction_notify::notification::{Notifier, NotifierConfig, OpsPublisher};
//! use auction_notify::notification::channels::{DiscordConfig, TelegramConfig, TransportRegistry};
//!
//! let registry = TransportRegistry::with_defaults(telegram, DiscordConfig::default(), client);
//! let notifier = Notifier::new(registry, channel_repo, NotifierConfig::default(), OpsPublisher::default());
//! let receipt = notifier.send(&channel, &message).await?;
//! ```

pub mod channels;
pub mod events;
pub mod message;
pub mod notifier;
pub mod retry;

pub use channels::{ChannelTransport, TransportError, TransportRegistry};
pub use events::{OpsEvent, OpsPublisher, OpsSeverity};
pub use message::NotificationMessage;
pub use notifier::{ChannelError, DeliveryReceipt, Notifier, NotifierConfig};
pub use retry::RetryPolicy;
