use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::models::token::Action;

/// Failures of a token store backend. All are infrastructure failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("token store timed out after {0:?}")]
    Timeout(Duration),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("duplicate token value")]
    DuplicateToken,

    #[error("corrupt token record: {0}")]
    Corrupt(String),
}

/// Failures of the outbound message transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport rejected message: status={status}, body={body}")]
    Rejected { status: u16, body: String },

    #[error("transport request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("transport failed after {attempts} attempts")]
    Exhausted { attempts: usize },

    #[error("transport serialize error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("identity not found: {0}")]
    IdentityNotFound(String),

    #[error("expense not found: {0}")]
    SubjectNotFound(String),

    #[error("token not found")]
    TokenNotFound,

    #[error("token is for '{stored}', not '{expected}'")]
    ActionMismatch { expected: Action, stored: Action },

    #[error("token expired")]
    TokenExpired,

    #[error("token already used")]
    TokenAlreadyConsumed,

    #[error("token store unavailable: {0}")]
    Store(#[from] StoreError),

    #[error("transport unavailable: {0}")]
    Transport(#[from] TransportError),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Coarse classification used by callers to decide how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    TokenState,
    StoreUnavailable,
    TransportUnavailable,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation_error",
            ErrorKind::NotFound => "not_found_error",
            ErrorKind::TokenState => "token_state_error",
            ErrorKind::StoreUnavailable => "store_unavailable",
            ErrorKind::TransportUnavailable => "transport_unavailable",
            ErrorKind::Internal => "internal_error",
        }
    }
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Validation(_) => ErrorKind::Validation,
            AppError::IdentityNotFound(_)
            | AppError::SubjectNotFound(_)
            | AppError::TokenNotFound => ErrorKind::NotFound,
            AppError::ActionMismatch { .. }
            | AppError::TokenExpired
            | AppError::TokenAlreadyConsumed => ErrorKind::TokenState,
            AppError::Store(_) => ErrorKind::StoreUnavailable,
            AppError::Transport(_) => ErrorKind::TransportUnavailable,
            AppError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the caller may retry with backoff. A retried consume must
    /// re-run the full conditional check; it may find the token already used.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::StoreUnavailable | ErrorKind::TransportUnavailable
        )
    }

    /// True for token outcomes that mean "this link can no longer be used".
    pub fn is_terminal_token_state(&self) -> bool {
        matches!(self, AppError::TokenExpired | AppError::TokenAlreadyConsumed)
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "invalid_request",
            AppError::IdentityNotFound(_) => "identity_not_found",
            AppError::SubjectNotFound(_) => "expense_not_found",
            AppError::TokenNotFound => "token_not_found",
            AppError::ActionMismatch { .. } => "action_mismatch",
            AppError::TokenExpired => "token_expired",
            AppError::TokenAlreadyConsumed => "token_already_used",
            AppError::Store(_) => "store_unavailable",
            AppError::Transport(_) => "transport_unavailable",
            AppError::Internal(_) => "internal_error",
        }
    }

    /// Message safe to show to the person who clicked a link. Infrastructure
    /// details are logged, not returned.
    pub fn public_message(&self) -> String {
        match self {
            AppError::Store(e) => {
                tracing::error!("Token store error: {}", e);
                "service temporarily unavailable".to_string()
            }
            AppError::Transport(e) => {
                tracing::error!("Transport error: {}", e);
                "notification could not be delivered".to_string()
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {}", e);
                "internal error".to_string()
            }
            AppError::TokenExpired | AppError::TokenAlreadyConsumed => {
                "this link is no longer valid".to_string()
            }
            other => other.to_string(),
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            error: ErrorDetail {
                message: self.public_message(),
                r#type: self.kind().as_str(),
                code: self.code(),
            },
        }
    }
}

/// `{"error": {"message": ..., "type": ..., "code": ...}}`
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub message: String,
    pub r#type: &'static str,
    pub code: &'static str,
}
