use std::sync::Arc;
use std::time::Duration;

use super::MAX_TOKEN_LEN;
use crate::clock::Clock;
use crate::errors::AppError;
use crate::models::token::{redact_token, Action, Decision, TokenStatus};
use crate::store::{with_timeout, ConsumeOutcome, TokenStore};

/// Validates and redeems capability tokens.
///
/// Holds no state of its own: every decision is made by the store's
/// conditional consume, so any number of consumers may run side by side.
#[derive(Clone)]
pub struct TokenConsumer {
    store: Arc<dyn TokenStore>,
    clock: Arc<dyn Clock>,
    store_timeout: Duration,
}

impl TokenConsumer {
    pub fn new(store: Arc<dyn TokenStore>, clock: Arc<dyn Clock>, store_timeout: Duration) -> Self {
        Self {
            store,
            clock,
            store_timeout,
        }
    }

    /// Redeem `token` for `expected`. Succeeds at most once per token, and at
    /// most once per approve/reject pair.
    ///
    /// The returned [`Decision`] only authorizes the action; applying it to
    /// the expense is the caller's job.
    pub async fn consume(&self, token: &str, expected: Action) -> Result<Decision, AppError> {
        if !plausible_token(token) {
            return Err(AppError::TokenNotFound);
        }

        let now = self.clock.now();
        let outcome = with_timeout(
            self.store_timeout,
            self.store.conditional_consume(token, expected, now),
        )
        .await?;

        match outcome {
            ConsumeOutcome::Consumed(record) => {
                tracing::info!(
                    token = %record.redacted(),
                    subject_id = %record.subject_id,
                    principal_id = %record.principal_id,
                    action = %record.action,
                    "token consumed"
                );
                Ok(Decision::from(&record))
            }
            ConsumeOutcome::NotFound => {
                tracing::warn!(token = %redact_token(token), "token not found");
                Err(AppError::TokenNotFound)
            }
            ConsumeOutcome::ActionMismatch { stored } => {
                tracing::warn!(
                    token = %redact_token(token),
                    presented = %expected,
                    stored = %stored,
                    "token presented for the wrong action"
                );
                Err(AppError::ActionMismatch { expected, stored })
            }
            ConsumeOutcome::Expired => {
                tracing::info!(token = %redact_token(token), "token expired");
                Err(AppError::TokenExpired)
            }
            ConsumeOutcome::AlreadyConsumed => {
                tracing::info!(token = %redact_token(token), "token already consumed");
                Err(AppError::TokenAlreadyConsumed)
            }
        }
    }

    /// Current derived status of `token`, without consuming it.
    pub async fn status(&self, token: &str) -> Result<TokenStatus, AppError> {
        if !plausible_token(token) {
            return Err(AppError::TokenNotFound);
        }
        let record = with_timeout(self.store_timeout, self.store.find(token))
            .await?
            .ok_or(AppError::TokenNotFound)?;
        Ok(record.status(self.clock.now()))
    }

    /// Expire every outstanding token for one reviewer on one expense, e.g.
    /// after the expense was decided through another channel.
    pub async fn revoke(&self, subject_id: &str, principal_id: &str) -> Result<u64, AppError> {
        // Ids are stored trimmed by the issuer.
        let subject_id = subject_id.trim();
        let principal_id = principal_id.trim();
        if subject_id.is_empty() || principal_id.is_empty() {
            return Err(AppError::Validation(
                "subject and reviewer ids must not be empty".into(),
            ));
        }
        let now = self.clock.now();
        let count = with_timeout(
            self.store_timeout,
            self.store.invalidate_sibling(subject_id, principal_id, None, now),
        )
        .await?;
        tracing::info!(subject_id, principal_id, count, "revoked outstanding tokens");
        Ok(count)
    }
}

fn plausible_token(token: &str) -> bool {
    !token.is_empty() && token.len() <= MAX_TOKEN_LEN
}
