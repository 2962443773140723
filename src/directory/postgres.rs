use async_trait::async_trait;
use sqlx::PgPool;
use std::time::Duration;

use super::Directory;
use crate::errors::{AppError, StoreError};
use crate::models::expense::{ExpenseDetails, Identity};
use crate::store::with_timeout;

/// Reads the expense app's `profiles` and `expenses` tables.
#[derive(Clone)]
pub struct PgDirectory {
    pool: PgPool,
    query_timeout: Duration,
}

impl PgDirectory {
    pub fn new(pool: PgPool, query_timeout: Duration) -> Self {
        Self {
            pool,
            query_timeout,
        }
    }
}

#[async_trait]
impl Directory for PgDirectory {
    async fn get_identity(&self, id: &str) -> Result<Option<Identity>, AppError> {
        let row = with_timeout(self.query_timeout, async {
            sqlx::query_as::<_, Identity>("SELECT name, email FROM profiles WHERE id::text = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(StoreError::from)
        })
        .await?;
        Ok(row)
    }

    async fn get_subject_details(&self, subject_id: &str) -> Result<Option<ExpenseDetails>, AppError> {
        let row = with_timeout(self.query_timeout, async {
            sqlx::query_as::<_, ExpenseDetails>(
                r#"SELECT title, tracking_id, amount, currency, date, project, category
                   FROM expenses
                   WHERE id::text = $1"#,
            )
            .bind(subject_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::from)
        })
        .await?;
        Ok(row)
    }
}
