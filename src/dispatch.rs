//! Turns expense-workflow events into emails.
//!
//! A submission resolves the author and reviewer, mints an approve/reject
//! token pair for the reviewer, and mails them both links. A status change
//! mails the author. Dispatch reports success or failure to its caller and
//! never retries.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::directory::Directory;
use crate::errors::AppError;
use crate::models::event::{NotificationEvent, StatusChangeEvent, SubmissionEvent};
use crate::models::expense::Identity;
use crate::models::token::Action;
use crate::notification::render::{ApprovalRequestView, Renderer, StatusChangeView};
use crate::notification::{OutboundMessage, Transport};
use crate::token::issuer::TokenIssuer;
use crate::token::link::ActionLink;

/// What a successful dispatch did.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchReceipt {
    pub event: &'static str,
    pub recipient: String,
    pub subject_line: String,
    pub tokens_issued: usize,
}

pub struct Dispatcher {
    directory: Arc<dyn Directory>,
    issuer: TokenIssuer,
    renderer: Arc<dyn Renderer>,
    transport: Arc<dyn Transport>,
    base_url: Url,
    token_ttl: Duration,
}

impl Dispatcher {
    pub fn new(
        directory: Arc<dyn Directory>,
        issuer: TokenIssuer,
        renderer: Arc<dyn Renderer>,
        transport: Arc<dyn Transport>,
        base_url: Url,
        token_ttl: Duration,
    ) -> Self {
        Self {
            directory,
            issuer,
            renderer,
            transport,
            base_url,
            token_ttl,
        }
    }

    pub async fn dispatch(&self, event: &NotificationEvent) -> Result<DispatchReceipt, AppError> {
        event.validate()?;
        let result = match event {
            NotificationEvent::Submission(e) => self.dispatch_submission(e).await,
            NotificationEvent::StatusChange(e) => self.dispatch_status_change(e).await,
        };

        match &result {
            Ok(receipt) => tracing::info!(
                event = receipt.event,
                subject_id = %event.subject_id(),
                recipient = %receipt.recipient,
                "notification dispatched"
            ),
            Err(e) => tracing::warn!(
                event = event.kind(),
                subject_id = %event.subject_id(),
                error = %e,
                retryable = e.is_retryable(),
                "notification dispatch failed"
            ),
        }
        result
    }

    async fn identity(&self, id: &str, role: &str) -> Result<Identity, AppError> {
        self.directory
            .get_identity(id)
            .await?
            .ok_or_else(|| AppError::IdentityNotFound(format!("{} '{}'", role, id)))
    }

    async fn dispatch_submission(&self, e: &SubmissionEvent) -> Result<DispatchReceipt, AppError> {
        let author = self.identity(&e.author_id, "employee").await?;
        let reviewer = self.identity(&e.reviewer_id, "manager").await?;

        let pair = self
            .issuer
            .issue(&e.subject_id, &e.reviewer_id, self.token_ttl)
            .await?;

        let link_for = |action: Action| {
            ActionLink::new(
                action,
                &pair.approve.subject_id,
                Some(&e.details.tracking_id),
                &pair.get(action).token,
            )
            .to_url(&self.base_url)
        };
        let approve_url = link_for(Action::Approve);
        let reject_url = link_for(Action::Reject);

        let message = self.renderer.approval_request(&ApprovalRequestView {
            reviewer: &reviewer,
            author: &author,
            details: &e.details,
            approve_url: &approve_url,
            reject_url: &reject_url,
        });

        self.deliver("submission", message, 2).await
    }

    async fn dispatch_status_change(
        &self,
        e: &StatusChangeEvent,
    ) -> Result<DispatchReceipt, AppError> {
        let author = self.identity(&e.author_id, "employee").await?;
        let details = self
            .directory
            .get_subject_details(&e.subject_id)
            .await?
            .ok_or_else(|| AppError::SubjectNotFound(e.subject_id.clone()))?;

        let message = self.renderer.status_change(&StatusChangeView {
            author: &author,
            details: &details,
            status: e.new_status,
            approver_name: &e.approver_name,
            reason: e.reason.as_deref(),
        });

        self.deliver("status_update", message, 0).await
    }

    async fn deliver(
        &self,
        event: &'static str,
        message: OutboundMessage,
        tokens_issued: usize,
    ) -> Result<DispatchReceipt, AppError> {
        self.transport.send(&message).await?;
        Ok(DispatchReceipt {
            event,
            recipient: message.to,
            subject_line: message.subject,
            tokens_issued,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::directory::MemoryDirectory;
    use crate::errors::TransportError;
    use crate::models::expense::{ExpenseDetails, ExpenseStatus};
    use crate::notification::render::HtmlRenderer;
    use crate::store::memory::MemoryTokenStore;
    use crate::store::TokenStore;
    use async_trait::async_trait;
    use chrono::{NaiveDate, TimeZone, Utc};
    use rust_decimal::Decimal;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<OutboundMessage>>,
        fail: bool,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send(&self, message: &OutboundMessage) -> Result<(), TransportError> {
            if self.fail {
                return Err(TransportError::Exhausted { attempts: 1 });
            }
            self.sent.lock().await.push(message.clone());
            Ok(())
        }
    }

    fn details() -> ExpenseDetails {
        ExpenseDetails {
            title: "Flight".into(),
            amount: Decimal::new(45000, 2),
            currency: "USD".into(),
            date: NaiveDate::from_ymd_opt(2024, 2, 20).unwrap(),
            category: "Travel".into(),
            project: "Apollo".into(),
            description: None,
            tracking_id: "EXP-100".into(),
            receipt_url: None,
        }
    }

    fn setup(transport: Arc<RecordingTransport>) -> (Dispatcher, MemoryDirectory, Arc<MemoryTokenStore>) {
        let directory = MemoryDirectory::new();
        directory.add_identity("emp-1", "Sam", "sam@example.com");
        directory.add_identity("mgr-1", "Mina", "mina@example.com");

        let store = Arc::new(MemoryTokenStore::new());
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 2, 21, 9, 0, 0).unwrap()));
        let issuer = TokenIssuer::new(store.clone() as Arc<dyn TokenStore>, clock, Duration::from_secs(1));

        let dispatcher = Dispatcher::new(
            Arc::new(directory.clone()),
            issuer,
            Arc::new(HtmlRenderer::default()),
            transport,
            Url::parse("https://rbox.example.com").unwrap(),
            crate::token::issuer::DEFAULT_TOKEN_TTL,
        );
        (dispatcher, directory, store)
    }

    fn submission(reviewer: &str) -> NotificationEvent {
        NotificationEvent::Submission(SubmissionEvent {
            subject_id: "e-1".into(),
            author_id: "emp-1".into(),
            reviewer_id: reviewer.into(),
            details: details(),
        })
    }

    #[tokio::test]
    async fn test_submission_mails_reviewer_two_links() {
        let transport = Arc::new(RecordingTransport::default());
        let (dispatcher, _, store) = setup(transport.clone());

        let receipt = dispatcher.dispatch(&submission("mgr-1")).await.unwrap();
        assert_eq!(receipt.recipient, "mina@example.com");
        assert_eq!(receipt.tokens_issued, 2);
        assert_eq!(store.len(), 2);

        let sent = transport.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert!(sent[0].html.contains("action=approve"));
        assert!(sent[0].html.contains("action=reject"));
        assert!(sent[0].html.contains("tracking_id=EXP-100"));
    }

    #[tokio::test]
    async fn test_link_carries_stored_expense_id() {
        let transport = Arc::new(RecordingTransport::default());
        let (dispatcher, _, _) = setup(transport.clone());
        let event = NotificationEvent::Submission(SubmissionEvent {
            subject_id: " e-1 ".into(),
            ..match submission("mgr-1") {
                NotificationEvent::Submission(s) => s,
                other => panic!("unexpected event: {:?}", other),
            }
        });

        dispatcher.dispatch(&event).await.unwrap();
        let sent = transport.sent.lock().await;
        assert!(sent[0].html.contains("expense_id=e-1&amp;"));
    }

    #[tokio::test]
    async fn test_missing_reviewer_issues_nothing() {
        let transport = Arc::new(RecordingTransport::default());
        let (dispatcher, _, store) = setup(transport.clone());

        let err = dispatcher.dispatch(&submission("mgr-404")).await.unwrap_err();
        assert!(matches!(err, AppError::IdentityNotFound(ref m) if m.contains("mgr-404")));
        assert!(store.is_empty());
        assert!(transport.sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_status_change_requires_known_expense() {
        let transport = Arc::new(RecordingTransport::default());
        let (dispatcher, directory, _) = setup(transport.clone());
        let event = NotificationEvent::StatusChange(StatusChangeEvent {
            subject_id: "e-1".into(),
            author_id: "emp-1".into(),
            new_status: ExpenseStatus::Rejected,
            approver_name: "Mina".into(),
            reason: Some("Duplicate".into()),
        });

        let err = dispatcher.dispatch(&event).await.unwrap_err();
        assert!(matches!(err, AppError::SubjectNotFound(_)));

        directory.add_expense("e-1", details());
        let receipt = dispatcher.dispatch(&event).await.unwrap();
        assert_eq!(receipt.recipient, "sam@example.com");
        assert_eq!(receipt.subject_line, "Expense Rejected: Flight (EXP-100)");
        assert_eq!(receipt.tokens_issued, 0);
    }

    #[tokio::test]
    async fn test_transport_failure_is_reported() {
        let transport = Arc::new(RecordingTransport {
            fail: true,
            ..Default::default()
        });
        let (dispatcher, _, _) = setup(transport);

        let err = dispatcher.dispatch(&submission("mgr-1")).await.unwrap_err();
        assert!(matches!(err, AppError::Transport(_)));
        assert!(err.is_retryable());
    }
}
