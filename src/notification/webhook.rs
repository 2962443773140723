use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use std::time::Duration;
use tracing::{info, warn};

use super::{OutboundMessage, Transport};
use crate::errors::TransportError;

// ── Relay payload ─────────────────────────────────────────────

/// JSON body posted to the mail relay.
#[derive(Debug, Clone, Serialize)]
pub struct MailEnvelope<'a> {
    pub from: &'a str,
    pub to: &'a str,
    pub subject: &'a str,
    pub html: &'a str,
}

// ── HMAC Signing ─────────────────────────────────────────────

/// Compute HMAC-SHA256 of `payload` using `secret`.
/// Returns lowercase hex digest (e.g. "sha256=<hex>").
fn hmac_sha256_hex(secret: &str, payload: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(payload);
    let bytes = mac.finalize().into_bytes();
    format!("sha256={}", hex::encode(bytes))
}

// ── Webhook Transport ─────────────────────────────────────────

/// Delivers messages by POSTing them to an HTTP mail relay.
///
/// - HMAC-SHA256 signing (`x-rbox-signature`) when a secret is configured
/// - Bounded retries with back-off (default 0s → 1s → 5s → 25s)
/// - One `x-rbox-delivery-id` per message, reused across attempts so the
///   relay can drop duplicates
#[derive(Clone)]
pub struct WebhookTransport {
    client: reqwest::Client,
    url: String,
    from: String,
    signing_secret: Option<String>,
    backoff: Vec<Duration>,
}

impl WebhookTransport {
    pub fn new(
        url: &str,
        from: &str,
        signing_secret: Option<String>,
    ) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent("RBox-Notifier/1.0")
            .build()?;
        Ok(Self {
            client,
            url: url.to_string(),
            from: from.to_string(),
            signing_secret,
            backoff: [0, 1, 5, 25].into_iter().map(Duration::from_secs).collect(),
        })
    }

    /// Replace the retry schedule. The first entry is the delay before the
    /// first attempt (normally zero).
    pub fn with_backoff(mut self, backoff: Vec<Duration>) -> Self {
        if !backoff.is_empty() {
            self.backoff = backoff;
        }
        self
    }
}

fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS
}

#[async_trait]
impl Transport for WebhookTransport {
    async fn send(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        let envelope = MailEnvelope {
            from: &self.from,
            to: &message.to,
            subject: &message.subject,
            html: &message.html,
        };
        let payload = serde_json::to_vec(&envelope)?;
        let delivery_id = uuid::Uuid::new_v4().to_string();
        let timestamp = chrono::Utc::now().timestamp().to_string();
        let signature = self
            .signing_secret
            .as_deref()
            .map(|s| hmac_sha256_hex(s, &payload));

        for (attempt, delay) in self.backoff.iter().enumerate() {
            if !delay.is_zero() {
                tracing::debug!(
                    url = %self.url,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retrying mail relay delivery"
                );
                tokio::time::sleep(*delay).await;
            }

            let mut req = self
                .client
                .post(&self.url)
                .header("content-type", "application/json")
                .header("x-rbox-delivery-id", &delivery_id)
                .header("x-rbox-timestamp", &timestamp);

            if let Some(ref sig) = signature {
                req = req.header("x-rbox-signature", sig.as_str());
            }

            match req.body(payload.clone()).send().await {
                Ok(resp) if resp.status().is_success() => {
                    info!(
                        to = %message.to,
                        delivery_id = %delivery_id,
                        attempt,
                        status = %resp.status(),
                        "mail relay accepted message"
                    );
                    return Ok(());
                }
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    if !is_retryable_status(status) {
                        warn!(delivery_id = %delivery_id, status = %status, body = %body, "mail relay rejected message");
                        return Err(TransportError::Rejected {
                            status: status.as_u16(),
                            body,
                        });
                    }
                    warn!(
                        delivery_id = %delivery_id,
                        attempt,
                        status = %status,
                        "mail relay delivery failed, will retry"
                    );
                }
                Err(e) => {
                    warn!(
                        delivery_id = %delivery_id,
                        attempt,
                        error = %e,
                        "mail relay request error, will retry"
                    );
                }
            }
        }

        warn!(delivery_id = %delivery_id, "mail relay delivery failed after all retries");
        Err(TransportError::Exhausted {
            attempts: self.backoff.len(),
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────
