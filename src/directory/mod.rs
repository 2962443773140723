pub mod postgres;

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

use crate::errors::AppError;
use crate::models::expense::{ExpenseDetails, Identity};

/// Lookup of user profiles and expense records owned by the expense app.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn get_identity(&self, id: &str) -> Result<Option<Identity>, AppError>;

    async fn get_subject_details(&self, subject_id: &str) -> Result<Option<ExpenseDetails>, AppError>;
}

/// In-process directory for tests and local runs.
#[derive(Clone, Default)]
pub struct MemoryDirectory {
    identities: Arc<DashMap<String, Identity>>,
    expenses: Arc<DashMap<String, ExpenseDetails>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_identity(&self, id: &str, name: &str, email: &str) {
        self.identities.insert(
            id.to_string(),
            Identity {
                name: name.to_string(),
                email: email.to_string(),
            },
        );
    }

    pub fn add_expense(&self, subject_id: &str, details: ExpenseDetails) {
        self.expenses.insert(subject_id.to_string(), details);
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn get_identity(&self, id: &str) -> Result<Option<Identity>, AppError> {
        Ok(self.identities.get(id).map(|e| e.value().clone()))
    }

    async fn get_subject_details(&self, subject_id: &str) -> Result<Option<ExpenseDetails>, AppError> {
        Ok(self.expenses.get(subject_id).map(|e| e.value().clone()))
    }
}
