use std::sync::Arc;
use std::time::Duration;

use super::generate_token;
use crate::clock::Clock;
use crate::errors::{AppError, StoreError};
use crate::models::token::{Action, CapabilityToken, TokenPair};
use crate::store::{with_timeout, TokenStore};

/// Default lifetime of an approval link.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Attempts before giving up on a token-value collision.
const MAX_MINT_ATTEMPTS: usize = 3;

/// Mints approve/reject token pairs for a pending review.
#[derive(Clone)]
pub struct TokenIssuer {
    store: Arc<dyn TokenStore>,
    clock: Arc<dyn Clock>,
    store_timeout: Duration,
}

impl TokenIssuer {
    pub fn new(store: Arc<dyn TokenStore>, clock: Arc<dyn Clock>, store_timeout: Duration) -> Self {
        Self {
            store,
            clock,
            store_timeout,
        }
    }

    /// Issue the two tokens of one review cycle for `subject_id`, usable only
    /// by `principal_id`, both expiring `ttl` from now.
    ///
    /// Both records are written in a single store insert. If that fails,
    /// nothing is issued and the error is returned.
    pub async fn issue(
        &self,
        subject_id: &str,
        principal_id: &str,
        ttl: Duration,
    ) -> Result<TokenPair, AppError> {
        let subject_id = subject_id.trim();
        let principal_id = principal_id.trim();
        if subject_id.is_empty() {
            return Err(AppError::Validation("subject id must not be empty".into()));
        }
        if principal_id.is_empty() {
            return Err(AppError::Validation("reviewer id must not be empty".into()));
        }
        if ttl.is_zero() {
            return Err(AppError::Validation("token ttl must be positive".into()));
        }
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|_| AppError::Validation("token ttl is out of range".into()))?;

        let now = self.clock.now();
        let expires_at = now
            .checked_add_signed(ttl)
            .ok_or_else(|| AppError::Validation("token ttl is out of range".into()))?;

        for attempt in 1..=MAX_MINT_ATTEMPTS {
            let approve_token = generate_token();
            let mut reject_token = generate_token();
            while reject_token == approve_token {
                reject_token = generate_token();
            }

            let make = |token: String, action: Action| CapabilityToken {
                token,
                subject_id: subject_id.to_string(),
                principal_id: principal_id.to_string(),
                action,
                expires_at,
                consumed_at: None,
                created_at: now,
            };
            let pair = TokenPair {
                approve: make(approve_token, Action::Approve),
                reject: make(reject_token, Action::Reject),
            };

            let records = [pair.approve.clone(), pair.reject.clone()];
            match with_timeout(self.store_timeout, self.store.insert(&records)).await {
                Ok(()) => {
                    tracing::info!(
                        subject_id,
                        principal_id,
                        expires_at = %expires_at,
                        "issued approval token pair"
                    );
                    return Ok(pair);
                }
                Err(StoreError::DuplicateToken) => {
                    tracing::warn!(subject_id, attempt, "token value collision, minting again");
                }
                Err(e) => {
                    tracing::error!(subject_id, principal_id, error = %e, "failed to persist token pair");
                    return Err(AppError::Store(e));
                }
            }
        }

        Err(AppError::Store(StoreError::DuplicateToken))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::memory::MemoryTokenStore;
    use crate::store::ConsumeOutcome;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 2, 15, 30, 0).unwrap()
    }

    fn issuer_with(store: Arc<dyn TokenStore>) -> TokenIssuer {
        TokenIssuer::new(store, Arc::new(ManualClock::new(t0())), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_pair_shares_binding_and_expiry() {
        let store = Arc::new(MemoryTokenStore::new());
        let issuer = issuer_with(store.clone());

        let pair = issuer.issue("EXP-100", "mgr-1", DEFAULT_TOKEN_TTL).await.unwrap();

        assert_ne!(pair.approve.token, pair.reject.token);
        assert_ne!(pair.approve.action, pair.reject.action);
        assert_eq!(pair.approve.subject_id, pair.reject.subject_id);
        assert_eq!(pair.approve.principal_id, pair.reject.principal_id);
        assert_eq!(pair.approve.expires_at, pair.reject.expires_at);
        assert_eq!(pair.expires_at(), t0() + chrono::Duration::days(7));
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_rejects_blank_ids_and_zero_ttl() {
        let issuer = issuer_with(Arc::new(MemoryTokenStore::new()));

        assert!(matches!(
            issuer.issue(" ", "mgr-1", DEFAULT_TOKEN_TTL).await,
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            issuer.issue("EXP-1", "", DEFAULT_TOKEN_TTL).await,
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            issuer.issue("EXP-1", "mgr-1", Duration::ZERO).await,
            Err(AppError::Validation(_))
        ));
    }

    struct FailingStore;

    #[async_trait]
    impl TokenStore for FailingStore {
        async fn insert(&self, _records: &[CapabilityToken]) -> Result<(), StoreError> {
            Err(StoreError::Corrupt("disk full".into()))
        }
        async fn find(&self, _token: &str) -> Result<Option<CapabilityToken>, StoreError> {
            Ok(None)
        }
        async fn conditional_consume(
            &self,
            _token: &str,
            _expected: Action,
            _now: DateTime<Utc>,
        ) -> Result<ConsumeOutcome, StoreError> {
            Ok(ConsumeOutcome::NotFound)
        }
        async fn invalidate_sibling(
            &self,
            _subject_id: &str,
            _principal_id: &str,
            _exclude: Option<&str>,
            _now: DateTime<Utc>,
        ) -> Result<u64, StoreError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_store_failure_fails_whole_issue() {
        let issuer = issuer_with(Arc::new(FailingStore));
        let err = issuer.issue("EXP-1", "mgr-1", DEFAULT_TOKEN_TTL).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
