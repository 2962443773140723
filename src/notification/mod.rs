pub mod log;
pub mod render;
pub mod webhook;

use async_trait::async_trait;
use serde::Serialize;

use crate::errors::TransportError;

/// A rendered email ready for delivery.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OutboundMessage {
    pub to: String,
    pub subject: String,
    pub html: String,
}

/// Hands rendered messages to whatever actually delivers mail.
///
/// Delivery is best-effort: `Ok` means the transport accepted the message,
/// not that it reached an inbox.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> Result<(), TransportError>;
}
