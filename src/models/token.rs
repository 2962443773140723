use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The action a capability token authorizes on its subject.
#[derive(Debug, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Hash, Clone, Copy)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
pub enum Action {
    Approve,
    Reject,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Approve => "approve",
            Action::Reject => "reject",
        }
    }

    /// The action carried by the other token of the same pair.
    pub fn opposite(&self) -> Action {
        match self {
            Action::Approve => Action::Reject,
            Action::Reject => Action::Approve,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "approve" => Ok(Action::Approve),
            "reject" => Ok(Action::Reject),
            other => Err(format!("unknown action '{}'", other)),
        }
    }
}

/// Derived lifecycle state of a token at a given instant. Never stored.
#[derive(Debug, Serialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum TokenStatus {
    Pending,
    Expired,
    Consumed,
}

/// A single-use, time-bounded bearer credential for one action on one subject.
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone, PartialEq)]
pub struct CapabilityToken {
    pub token: String,
    /// Expense the token authorizes action on.
    pub subject_id: String,
    /// Reviewer allowed to redeem the token.
    pub principal_id: String,
    pub action: Action,
    pub expires_at: DateTime<Utc>,
    pub consumed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl CapabilityToken {
    pub fn status(&self, now: DateTime<Utc>) -> TokenStatus {
        if self.consumed_at.is_some() {
            TokenStatus::Consumed
        } else if now >= self.expires_at {
            TokenStatus::Expired
        } else {
            TokenStatus::Pending
        }
    }

    /// True if `other` is the opposite-action token for the same subject and
    /// reviewer.
    pub fn is_sibling_of(&self, other: &CapabilityToken) -> bool {
        self.token != other.token
            && self.subject_id == other.subject_id
            && self.principal_id == other.principal_id
            && self.action != other.action
    }

    /// Short, log-safe prefix of the token value.
    pub fn redacted(&self) -> String {
        redact_token(&self.token)
    }
}

pub fn redact_token(token: &str) -> String {
    let prefix: String = token.chars().take(6).collect();
    format!("{}…", prefix)
}

/// The approve/reject tokens minted for one review cycle.
#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub approve: CapabilityToken,
    pub reject: CapabilityToken,
}

impl TokenPair {
    pub fn get(&self, action: Action) -> &CapabilityToken {
        match action {
            Action::Approve => &self.approve,
            Action::Reject => &self.reject,
        }
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.approve.expires_at
    }
}

/// What a successful consumption authorizes. Applying it to the expense is
/// left to a [`crate::workflow::WorkflowEffect`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Decision {
    pub subject_id: String,
    pub principal_id: String,
    pub action: Action,
}

impl From<&CapabilityToken> for Decision {
    fn from(record: &CapabilityToken) -> Self {
        Self {
            subject_id: record.subject_id.clone(),
            principal_id: record.principal_id.clone(),
            action: record.action,
        }
    }
}
