use chrono::{DateTime, NaiveDate};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};

/// A user profile as far as notifications care.
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone, PartialEq)]
pub struct Identity {
    pub name: String,
    pub email: String,
}

/// Expense fields shown in notifications. Submission events carry these
/// inline; status-change notifications load them through the directory.
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone, PartialEq)]
pub struct ExpenseDetails {
    pub title: String,
    pub amount: Decimal,
    pub currency: String,
    #[serde(deserialize_with = "deserialize_expense_date")]
    pub date: NaiveDate,
    pub category: String,
    pub project: String,
    #[serde(default)]
    #[sqlx(default)]
    pub description: Option<String>,
    /// Human-facing reference, e.g. "EXP-2024-0042".
    pub tracking_id: String,
    #[serde(default)]
    #[sqlx(default)]
    pub receipt_url: Option<String>,
}

impl ExpenseDetails {
    /// "March 5, 2024"
    pub fn formatted_date(&self) -> String {
        self.date.format("%B %-d, %Y").to_string()
    }

    /// "USD 42.50"
    pub fn formatted_amount(&self) -> String {
        format!("{} {:.2}", self.currency, self.amount.round_dp(2))
    }
}

#[derive(Debug, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
pub enum ExpenseStatus {
    Approved,
    Rejected,
}

impl ExpenseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExpenseStatus::Approved => "approved",
            ExpenseStatus::Rejected => "rejected",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            ExpenseStatus::Approved => "Approved",
            ExpenseStatus::Rejected => "Rejected",
        }
    }
}

/// Accepts either a plain `YYYY-MM-DD` date or a full RFC 3339 timestamp.
fn deserialize_expense_date<'de, D>(deserializer: D) -> Result<NaiveDate, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_expense_date(&raw).map_err(serde::de::Error::custom)
}

pub fn parse_expense_date(raw: &str) -> Result<NaiveDate, String> {
    let raw = raw.trim();
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Ok(date);
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.date_naive())
        .map_err(|_| format!("invalid expense date '{}'", raw))
}
