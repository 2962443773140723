use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;

use super::{classify, should_invalidate, sibling_consumed, ConsumeOutcome, TokenStore};
use crate::errors::StoreError;
use crate::models::token::{Action, CapabilityToken};

type PairKey = (String, String);

/// In-process token store.
///
/// Records are grouped by `(subject_id, principal_id)`. Holding a pair's
/// entry guard serializes every consume and invalidation touching that pair,
/// while different pairs live in independent shards.
#[derive(Clone, Default)]
pub struct MemoryTokenStore {
    pairs: Arc<DashMap<PairKey, Vec<CapabilityToken>>>,
    index: Arc<DashMap<String, PairKey>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored records (for tests / debugging).
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn insert(&self, records: &[CapabilityToken]) -> Result<(), StoreError> {
        // Reserve every token value first so a collision leaves nothing behind.
        let mut reserved: Vec<&str> = Vec::with_capacity(records.len());
        for record in records {
            let key = (record.subject_id.clone(), record.principal_id.clone());
            let fresh = match self.index.entry(record.token.clone()) {
                dashmap::mapref::entry::Entry::Occupied(_) => false,
                dashmap::mapref::entry::Entry::Vacant(slot) => {
                    slot.insert(key);
                    true
                }
            };
            if !fresh {
                for token in reserved {
                    self.index.remove(token);
                }
                return Err(StoreError::DuplicateToken);
            }
            reserved.push(&record.token);
        }

        for record in records {
            self.pairs
                .entry((record.subject_id.clone(), record.principal_id.clone()))
                .or_default()
                .push(record.clone());
        }
        Ok(())
    }

    async fn find(&self, token: &str) -> Result<Option<CapabilityToken>, StoreError> {
        let key = match self.index.get(token) {
            Some(k) => k.value().clone(),
            None => return Ok(None),
        };
        Ok(self
            .pairs
            .get(&key)
            .and_then(|group| group.iter().find(|r| r.token == token).cloned()))
    }

    async fn conditional_consume(
        &self,
        token: &str,
        expected: Action,
        now: DateTime<Utc>,
    ) -> Result<ConsumeOutcome, StoreError> {
        let key = match self.index.get(token) {
            Some(k) => k.value().clone(),
            None => return Ok(ConsumeOutcome::NotFound),
        };

        // Exclusive guard over the whole pair for the rest of this call.
        let mut group = match self.pairs.get_mut(&key) {
            Some(g) => g,
            None => return Ok(ConsumeOutcome::NotFound),
        };

        let pos = match group.iter().position(|r| r.token == token) {
            Some(p) => p,
            None => return Ok(ConsumeOutcome::NotFound),
        };

        if let Some(outcome) = classify(&group[pos], expected, now) {
            return Ok(outcome);
        }
        if sibling_consumed(&group[pos], group.iter()) {
            return Ok(ConsumeOutcome::Expired);
        }

        group[pos].consumed_at = Some(now);
        let consumed = group[pos].clone();
        for candidate in group.iter_mut() {
            if should_invalidate(candidate, Some(&consumed), now) {
                candidate.expires_at = now;
            }
        }

        Ok(ConsumeOutcome::Consumed(consumed))
    }

    async fn invalidate_sibling(
        &self,
        subject_id: &str,
        principal_id: &str,
        exclude: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let key = (subject_id.to_string(), principal_id.to_string());
        let mut group = match self.pairs.get_mut(&key) {
            Some(g) => g,
            None => return Ok(0),
        };

        let excluded = exclude.and_then(|t| group.iter().find(|r| r.token == t).cloned());
        if exclude.is_some() && excluded.is_none() {
            return Ok(0);
        }

        let mut count = 0;
        for candidate in group.iter_mut() {
            if should_invalidate(candidate, excluded.as_ref(), now) {
                candidate.expires_at = now;
                count += 1;
            }
        }
        Ok(count)
    }
}
