use serde::{Deserialize, Serialize};

use super::expense::{ExpenseDetails, ExpenseStatus};
use crate::errors::AppError;

/// An expense-workflow event that should produce a notification.
///
/// Wire format matches the JSON the expense app posts:
/// `{"type": "submission", "expenseId": ..., ...}` or
/// `{"type": "status_update", ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationEvent {
    Submission(SubmissionEvent),
    #[serde(rename = "status_update")]
    StatusChange(StatusChangeEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionEvent {
    #[serde(rename = "expenseId")]
    pub subject_id: String,
    #[serde(rename = "employeeId")]
    pub author_id: String,
    #[serde(rename = "managerId")]
    pub reviewer_id: String,
    #[serde(rename = "expenseDetails")]
    pub details: ExpenseDetails,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusChangeEvent {
    #[serde(rename = "expenseId")]
    pub subject_id: String,
    #[serde(rename = "employeeId")]
    pub author_id: String,
    #[serde(rename = "status")]
    pub new_status: ExpenseStatus,
    #[serde(rename = "approverName")]
    pub approver_name: String,
    #[serde(rename = "rejectionReason", default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl NotificationEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            NotificationEvent::Submission(_) => "submission",
            NotificationEvent::StatusChange(_) => "status_update",
        }
    }

    pub fn subject_id(&self) -> &str {
        match self {
            NotificationEvent::Submission(e) => &e.subject_id,
            NotificationEvent::StatusChange(e) => &e.subject_id,
        }
    }

    /// Parse an event body, reporting malformed JSON as a validation error.
    pub fn from_json(body: &str) -> Result<Self, AppError> {
        serde_json::from_str(body)
            .map_err(|e| AppError::Validation(format!("invalid notification event: {}", e)))
    }

    /// Reject events whose identifiers are blank.
    pub fn validate(&self) -> Result<(), AppError> {
        let required: Vec<(&str, &str)> = match self {
            NotificationEvent::Submission(e) => vec![
                ("expenseId", e.subject_id.as_str()),
                ("employeeId", e.author_id.as_str()),
                ("managerId", e.reviewer_id.as_str()),
                ("expenseDetails.tracking_id", e.details.tracking_id.as_str()),
                ("expenseDetails.title", e.details.title.as_str()),
            ],
            NotificationEvent::StatusChange(e) => vec![
                ("expenseId", e.subject_id.as_str()),
                ("employeeId", e.author_id.as_str()),
                ("approverName", e.approver_name.as_str()),
            ],
        };

        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(AppError::Validation(format!("{} must not be empty", field)));
            }
        }
        Ok(())
    }
}
