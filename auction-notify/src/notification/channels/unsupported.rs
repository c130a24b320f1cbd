//! Placeholder transport for channel types that cannot deliver yet.

use async_trait::async_trait;

use super::{ChannelTransport, TransportError};
use crate::notification::message::NotificationMessage;

/// Rejects every send with [`TransportError::Unsupported`].
pub struct UnsupportedTransport {
    channel_type: String,
}

impl UnsupportedTransport {
    pub fn new(channel_type: impl Into<String>) -> Self {
        Self {
            channel_type: channel_type.into(),
        }
    }
}

#[async_trait]
impl ChannelTransport for UnsupportedTransport {
    fn channel_type(&self) -> &'static str {
        "unsupported"
    }

    async fn send(
        &self,
        _identifier: &str,
        _message: &NotificationMessage,
    ) -> Result<(), TransportError> {
        Err(TransportError::unsupported(self.channel_type.clone()))
    }
}
