use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, Postgres};
use sqlx::PgPool;
use std::time::Duration;

use super::{classify, sibling_consumed, ConsumeOutcome, TokenStore};
use crate::errors::StoreError;
use crate::models::token::{Action, CapabilityToken};

const TOKEN_COLUMNS: &str =
    "token, subject_id, principal_id, action, expires_at, consumed_at, created_at";

#[derive(Clone)]
pub struct PgTokenStore {
    pool: PgPool,
}

impl PgTokenStore {
    pub async fn connect(database_url: &str, acquire_timeout: Duration) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(acquire_timeout)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run pending migrations from the migrations/ directory.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

/// Expire the pending tokens of one pair, optionally only those whose action
/// differs from `keep_action`.
async fn expire_pending<'e, E>(
    executor: E,
    subject_id: &str,
    principal_id: &str,
    keep_action: Option<Action>,
    now: DateTime<Utc>,
) -> Result<u64, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let result = sqlx::query(
        r#"UPDATE capability_tokens
           SET expires_at = $3
           WHERE subject_id = $1 AND principal_id = $2
             AND ($4::VARCHAR IS NULL OR action <> $4::VARCHAR)
             AND consumed_at IS NULL
             AND expires_at > $3"#,
    )
    .bind(subject_id)
    .bind(principal_id)
    .bind(now)
    .bind(keep_action.map(|a| a.as_str()))
    .execute(executor)
    .await?;
    Ok(result.rows_affected())
}

fn map_insert_error(e: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &e {
        if db.is_unique_violation() {
            return StoreError::DuplicateToken;
        }
    }
    StoreError::Database(e)
}

#[async_trait]
impl TokenStore for PgTokenStore {
    async fn insert(&self, records: &[CapabilityToken]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            sqlx::query(
                r#"INSERT INTO capability_tokens (token, subject_id, principal_id, action, expires_at, consumed_at, created_at)
                   VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
            )
            .bind(&record.token)
            .bind(&record.subject_id)
            .bind(&record.principal_id)
            .bind(record.action)
            .bind(record.expires_at)
            .bind(record.consumed_at)
            .bind(record.created_at)
            .execute(&mut *tx)
            .await
            .map_err(map_insert_error)?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn find(&self, token: &str) -> Result<Option<CapabilityToken>, StoreError> {
        let row = sqlx::query_as::<_, CapabilityToken>(&format!(
            "SELECT {} FROM capability_tokens WHERE token = $1",
            TOKEN_COLUMNS
        ))
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn conditional_consume(
        &self,
        token: &str,
        expected: Action,
        now: DateTime<Utc>,
    ) -> Result<ConsumeOutcome, StoreError> {
        // Dropping `tx` before commit rolls back, so a cancelled call never
        // leaves a half-applied consume.
        let mut tx = self.pool.begin().await?;

        let pair = sqlx::query_as::<_, (String, String)>(
            "SELECT subject_id, principal_id FROM capability_tokens WHERE token = $1",
        )
        .bind(token)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((subject_id, principal_id)) = pair else {
            return Ok(ConsumeOutcome::NotFound);
        };

        // Lock every row of the pair in a fixed order so concurrent consumes
        // of a token and its sibling serialize here.
        let rows = sqlx::query_as::<_, CapabilityToken>(&format!(
            "SELECT {} FROM capability_tokens WHERE subject_id = $1 AND principal_id = $2 ORDER BY token FOR UPDATE",
            TOKEN_COLUMNS
        ))
        .bind(&subject_id)
        .bind(&principal_id)
        .fetch_all(&mut *tx)
        .await?;

        let Some(record) = rows.iter().find(|r| r.token == token).cloned() else {
            return Ok(ConsumeOutcome::NotFound);
        };

        if let Some(outcome) = classify(&record, expected, now) {
            tx.rollback().await?;
            return Ok(outcome);
        }
        if sibling_consumed(&record, &rows) {
            tx.rollback().await?;
            return Ok(ConsumeOutcome::Expired);
        }

        let updated = sqlx::query(
            "UPDATE capability_tokens SET consumed_at = $2 WHERE token = $1 AND consumed_at IS NULL",
        )
        .bind(token)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(ConsumeOutcome::AlreadyConsumed);
        }

        let invalidated =
            expire_pending(&mut *tx, &subject_id, &principal_id, Some(record.action), now).await?;
        tx.commit().await?;

        tracing::debug!(
            token = %record.redacted(),
            subject_id = %subject_id,
            invalidated,
            "consumed token"
        );

        Ok(ConsumeOutcome::Consumed(CapabilityToken {
            consumed_at: Some(now),
            ..record
        }))
    }

    async fn invalidate_sibling(
        &self,
        subject_id: &str,
        principal_id: &str,
        exclude: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let keep_action = match exclude {
            Some(token) => match self.find(token).await? {
                Some(r) if r.subject_id == subject_id && r.principal_id == principal_id => {
                    Some(r.action)
                }
                _ => return Ok(0),
            },
            None => None,
        };

        let count = expire_pending(&self.pool, subject_id, principal_id, keep_action, now).await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    //! Live tests: `DATABASE_URL=postgres://... cargo test -- --ignored`

    use super::*;
    use chrono::Duration as ChronoDuration;

    async fn store() -> PgTokenStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let store = PgTokenStore::connect(&url, Duration::from_secs(5)).await.unwrap();
        store.migrate().await.unwrap();
        store
    }

    fn pair(subject: &str) -> Vec<CapabilityToken> {
        let now = Utc::now();
        [Action::Approve, Action::Reject]
            .into_iter()
            .map(|action| CapabilityToken {
                token: format!("{}-{}", uuid::Uuid::new_v4(), action),
                subject_id: subject.into(),
                principal_id: "mgr-pg".into(),
                action,
                expires_at: now + ChronoDuration::days(7),
                consumed_at: None,
                created_at: now,
            })
            .collect()
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL at DATABASE_URL"]
    async fn test_pg_consume_once_and_expire_sibling() {
        let store = store().await;
        let subject = format!("EXP-{}", uuid::Uuid::new_v4());
        let records = pair(&subject);
        store.insert(&records).await.unwrap();

        let now = Utc::now();
        let first = store
            .conditional_consume(&records[0].token, Action::Approve, now)
            .await
            .unwrap();
        assert!(matches!(first, ConsumeOutcome::Consumed(_)));

        let again = store
            .conditional_consume(&records[0].token, Action::Approve, now)
            .await
            .unwrap();
        assert_eq!(again, ConsumeOutcome::AlreadyConsumed);

        let sibling = store
            .conditional_consume(&records[1].token, Action::Reject, now)
            .await
            .unwrap();
        assert_eq!(sibling, ConsumeOutcome::Expired);
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL at DATABASE_URL"]
    async fn test_pg_consumed_sibling_blocks_lagging_clock() {
        let store = store().await;
        let subject = format!("EXP-{}", uuid::Uuid::new_v4());
        let records = pair(&subject);
        store.insert(&records).await.unwrap();

        let ahead = Utc::now() + ChronoDuration::seconds(5);
        let behind = ahead - ChronoDuration::seconds(2);
        store
            .conditional_consume(&records[0].token, Action::Approve, ahead)
            .await
            .unwrap();
        let sibling = store
            .conditional_consume(&records[1].token, Action::Reject, behind)
            .await
            .unwrap();
        assert_eq!(sibling, ConsumeOutcome::Expired);
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL at DATABASE_URL"]
    async fn test_pg_duplicate_token_rolls_back_batch() {
        let store = store().await;
        let subject = format!("EXP-{}", uuid::Uuid::new_v4());
        let records = pair(&subject);
        store.insert(&records[..1]).await.unwrap();

        let batch = vec![records[1].clone(), records[0].clone()];
        let err = store.insert(&batch).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateToken));
        assert!(store.find(&records[1].token).await.unwrap().is_none());
    }
}
