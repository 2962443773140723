use async_trait::async_trait;

use super::{OutboundMessage, Transport};
use crate::errors::TransportError;

/// Writes messages to the log instead of sending them. Used for local runs
/// and environments without a mail relay.
#[derive(Debug, Clone, Default)]
pub struct LogTransport;

#[async_trait]
impl Transport for LogTransport {
    async fn send(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        tracing::info!(to = %message.to, subject = %message.subject, "[mock email]");
        tracing::debug!(body = %message.html, "[mock email] content");
        Ok(())
    }
}
