use async_trait::async_trait;
use serde::Serialize;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::{AppError, StoreError};
use crate::models::expense::ExpenseStatus;
use crate::models::token::{Action, Decision};
use crate::store::with_timeout;
use crate::token::consumer::TokenConsumer;
use crate::token::link::ActionLink;

/// Applies an authorized decision to the expense it names.
///
/// Returns `true` if the expense changed, `false` if it had already left
/// the pending state (decided through the app, or by an earlier link).
#[async_trait]
pub trait WorkflowEffect: Send + Sync {
    async fn apply(&self, decision: &Decision) -> Result<bool, AppError>;
}

impl From<Action> for ExpenseStatus {
    fn from(action: Action) -> Self {
        match action {
            Action::Approve => ExpenseStatus::Approved,
            Action::Reject => ExpenseStatus::Rejected,
        }
    }
}

/// Writes decisions to the expense app's `expenses` table.
#[derive(Clone)]
pub struct PgWorkflowEffect {
    pool: PgPool,
    query_timeout: Duration,
}

impl PgWorkflowEffect {
    pub fn new(pool: PgPool, query_timeout: Duration) -> Self {
        Self {
            pool,
            query_timeout,
        }
    }
}

#[async_trait]
impl WorkflowEffect for PgWorkflowEffect {
    async fn apply(&self, decision: &Decision) -> Result<bool, AppError> {
        let status = ExpenseStatus::from(decision.action);
        let result = with_timeout(self.query_timeout, async {
            sqlx::query(
                "UPDATE expenses SET status = $2 WHERE id::text = $1 AND status = 'pending'",
            )
            .bind(&decision.subject_id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await
            .map_err(StoreError::from)
        })
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

/// Result of visiting an action link.
#[derive(Debug, Clone, Serialize)]
pub struct Redemption {
    pub decision: Decision,
    pub status: ExpenseStatus,
    /// False when the expense was no longer pending.
    pub applied: bool,
}

impl Redemption {
    pub fn summary(&self) -> String {
        if self.applied {
            format!("Expense {} has been {}.", self.decision.subject_id, self.status.as_str())
        } else {
            format!(
                "Expense {} had already been decided; no change was made.",
                self.decision.subject_id
            )
        }
    }
}

/// Handles a visit to an action link: redeem the token, then apply the
/// decision it authorizes.
#[derive(Clone)]
pub struct ActionLinkHandler {
    consumer: TokenConsumer,
    effect: Arc<dyn WorkflowEffect>,
}

impl ActionLinkHandler {
    pub fn new(consumer: TokenConsumer, effect: Arc<dyn WorkflowEffect>) -> Self {
        Self { consumer, effect }
    }

    pub async fn redeem(&self, url: &str) -> Result<Redemption, AppError> {
        let link = ActionLink::parse(url)?;
        let decision = self.consumer.consume(&link.token, link.action).await?;

        // The stored record is authoritative; a link whose expense_id was
        // edited still only acts on the expense the token was minted for.
        if decision.subject_id != link.subject_id {
            tracing::warn!(
                link_subject = %link.subject_id,
                token_subject = %decision.subject_id,
                "action link expense_id does not match token"
            );
        }

        let applied = self.effect.apply(&decision).await?;
        if !applied {
            tracing::info!(subject_id = %decision.subject_id, "expense no longer pending, decision not applied");
        }
        Ok(Redemption {
            status: decision.action.into(),
            decision,
            applied,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::memory::MemoryTokenStore;
    use crate::store::TokenStore;
    use crate::token::issuer::{TokenIssuer, DEFAULT_TOKEN_TTL};
    use chrono::{TimeZone, Utc};
    use tokio::sync::Mutex;
    use url::Url;

    #[derive(Default)]
    struct RecordingEffect {
        applied: Mutex<Vec<Decision>>,
    }

    #[async_trait]
    impl WorkflowEffect for RecordingEffect {
        async fn apply(&self, decision: &Decision) -> Result<bool, AppError> {
            let mut applied = self.applied.lock().await;
            if applied.iter().any(|d| d.subject_id == decision.subject_id) {
                return Ok(false);
            }
            applied.push(decision.clone());
            Ok(true)
        }
    }

    async fn links() -> (ActionLinkHandler, Arc<RecordingEffect>, String, String) {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 2, 8, 0, 0).unwrap()));
        let store: Arc<dyn TokenStore> = Arc::new(MemoryTokenStore::new());
        let timeout = Duration::from_secs(1);
        let issuer = TokenIssuer::new(store.clone(), clock.clone(), timeout);
        let consumer = TokenConsumer::new(store, clock, timeout);

        let pair = issuer.issue("e-7", "mgr-1", DEFAULT_TOKEN_TTL).await.unwrap();
        let base = Url::parse("https://rbox.example.com").unwrap();
        let url_for = |action: Action| {
            ActionLink::new(action, "e-7", Some("EXP-7"), &pair.get(action).token)
                .to_url(&base)
                .to_string()
        };

        let effect = Arc::new(RecordingEffect::default());
        let handler = ActionLinkHandler::new(consumer, effect.clone());
        (handler, effect, url_for(Action::Approve), url_for(Action::Reject))
    }

    #[test]
    fn test_action_maps_to_status() {
        assert_eq!(ExpenseStatus::from(Action::Approve), ExpenseStatus::Approved);
        assert_eq!(ExpenseStatus::from(Action::Reject), ExpenseStatus::Rejected);
    }

    #[tokio::test]
    async fn test_redeem_applies_decision_once() {
        let (handler, effect, approve, reject) = links().await;

        let redemption = handler.redeem(&approve).await.unwrap();
        assert!(redemption.applied);
        assert_eq!(redemption.status, ExpenseStatus::Approved);
        assert_eq!(redemption.summary(), "Expense e-7 has been approved.");

        let again = handler.redeem(&approve).await.unwrap_err();
        assert!(matches!(again, AppError::TokenAlreadyConsumed));

        let sibling = handler.redeem(&reject).await.unwrap_err();
        assert!(matches!(sibling, AppError::TokenExpired));

        assert_eq!(effect.applied.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_tampered_action_is_rejected_without_effect() {
        let (handler, effect, approve, _) = links().await;
        let tampered = approve.replace("action=approve", "action=reject");

        let err = handler.redeem(&tampered).await.unwrap_err();
        assert!(matches!(err, AppError::ActionMismatch { .. }));
        assert!(effect.applied.lock().await.is_empty());

        // The genuine link still works afterwards.
        assert!(handler.redeem(&approve).await.unwrap().applied);
    }

    #[tokio::test]
    async fn test_malformed_link_is_validation_error() {
        let (handler, _, _, _) = links().await;
        let err = handler.redeem("not a url").await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }
}
