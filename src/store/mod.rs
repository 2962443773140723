pub mod memory;
pub mod postgres;
pub mod redis;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;

use crate::errors::StoreError;
use crate::models::token::{Action, CapabilityToken};

/// Result of one conditional consume attempt, decided atomically by the store.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsumeOutcome {
    /// This caller won: `consumed_at` is now set and the sibling invalidated.
    Consumed(CapabilityToken),
    NotFound,
    AlreadyConsumed,
    /// Stored action differs from the presented one. Nothing was written.
    ActionMismatch { stored: Action },
    Expired,
}

/// Durable storage for capability tokens.
///
/// Implementations: PgTokenStore (PostgreSQL), RedisTokenStore, MemoryTokenStore.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Persist all records or none of them. A token value that already
    /// exists fails the whole batch.
    async fn insert(&self, records: &[CapabilityToken]) -> Result<(), StoreError>;

    /// Read-only lookup.
    async fn find(&self, token: &str) -> Result<Option<CapabilityToken>, StoreError>;

    /// Atomically classify `token` against `expected` at `now` and, if it is
    /// pending and matches, set `consumed_at = now` and invalidate its
    /// sibling in the same critical section.
    async fn conditional_consume(
        &self,
        token: &str,
        expected: Action,
        now: DateTime<Utc>,
    ) -> Result<ConsumeOutcome, StoreError>;

    /// Expire every pending token of `(subject_id, principal_id)`. With
    /// `exclude` set, only tokens of the opposite action to the excluded
    /// token are touched. Returns the number of tokens invalidated.
    async fn invalidate_sibling(
        &self,
        subject_id: &str,
        principal_id: &str,
        exclude: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;
}

/// Decide the outcome for `record` without mutating it. Shared by backends
/// that classify in process while holding their lock.
pub(crate) fn classify(
    record: &CapabilityToken,
    expected: Action,
    now: DateTime<Utc>,
) -> Option<ConsumeOutcome> {
    if record.consumed_at.is_some() {
        return Some(ConsumeOutcome::AlreadyConsumed);
    }
    if record.action != expected {
        return Some(ConsumeOutcome::ActionMismatch {
            stored: record.action,
        });
    }
    if now >= record.expires_at {
        return Some(ConsumeOutcome::Expired);
    }
    None
}

/// Whether an opposite-action token of `record`'s pair was already consumed.
/// Must be checked under the pair lock: a sibling expired by a consumer whose
/// clock runs ahead can still look pending to one whose clock lags.
pub(crate) fn sibling_consumed<'a, I>(record: &CapabilityToken, group: I) -> bool
where
    I: IntoIterator<Item = &'a CapabilityToken>,
{
    group
        .into_iter()
        .any(|candidate| candidate.consumed_at.is_some() && candidate.is_sibling_of(record))
}

/// Whether `candidate` should be expired when `consumed` is redeemed (or,
/// with no consumed token, when the whole pair is revoked).
pub(crate) fn should_invalidate(
    candidate: &CapabilityToken,
    exclude: Option<&CapabilityToken>,
    now: DateTime<Utc>,
) -> bool {
    if candidate.consumed_at.is_some() || now >= candidate.expires_at {
        return false;
    }
    match exclude {
        Some(consumed) => candidate.is_sibling_of(consumed),
        None => true,
    }
}

/// Bound a store call by `limit`; elapsed calls become [`StoreError::Timeout`].
/// Dropping the inner future on timeout must leave no usable partial write,
/// which every backend guarantees by committing in a single step.
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .unwrap_or(Err(StoreError::Timeout(limit)))
}
