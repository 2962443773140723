use std::fmt::Write;
use url::Url;

use super::OutboundMessage;
use crate::models::expense::{ExpenseDetails, ExpenseStatus, Identity};

/// Everything needed to ask a reviewer for a decision.
pub struct ApprovalRequestView<'a> {
    pub reviewer: &'a Identity,
    pub author: &'a Identity,
    pub details: &'a ExpenseDetails,
    pub approve_url: &'a Url,
    pub reject_url: &'a Url,
}

/// Everything needed to tell the author their expense was decided.
pub struct StatusChangeView<'a> {
    pub author: &'a Identity,
    pub details: &'a ExpenseDetails,
    pub status: ExpenseStatus,
    pub approver_name: &'a str,
    pub reason: Option<&'a str>,
}

/// Turns notification data into a message. Pure: no I/O.
pub trait Renderer: Send + Sync {
    fn approval_request(&self, view: &ApprovalRequestView<'_>) -> OutboundMessage;

    fn status_change(&self, view: &StatusChangeView<'_>) -> OutboundMessage;
}

/// HTML emails in the Reimbursement Box house style.
#[derive(Debug, Clone)]
pub struct HtmlRenderer {
    team_name: String,
}

impl HtmlRenderer {
    pub fn new(team_name: &str) -> Self {
        Self {
            team_name: team_name.to_string(),
        }
    }
}

impl Default for HtmlRenderer {
    fn default() -> Self {
        Self::new("Reimbursement Box Team")
    }
}

/// Escape text for HTML element content and double-quoted attributes.
pub fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// The shared title/tracking/amount/category/project/date block.
fn detail_rows(details: &ExpenseDetails) -> String {
    let mut rows = String::new();
    let _ = write!(
        rows,
        r#"      <h3 style="margin-top: 0;">{title}</h3>
      <p><strong>Tracking ID:</strong> {tracking}</p>
      <p><strong>Amount:</strong> {amount}</p>
      <p><strong>Category:</strong> {category}</p>
      <p><strong>Project:</strong> {project}</p>
      <p><strong>Date:</strong> {date}</p>
"#,
        title = escape_html(&details.title),
        tracking = escape_html(&details.tracking_id),
        amount = escape_html(&details.formatted_amount()),
        category = escape_html(&details.category),
        project = escape_html(&details.project),
        date = details.formatted_date(),
    );
    rows
}

impl Renderer for HtmlRenderer {
    fn approval_request(&self, view: &ApprovalRequestView<'_>) -> OutboundMessage {
        let d = view.details;
        let subject = format!(
            "Expense Approval Required: {} ({})",
            d.title, d.tracking_id
        );

        let mut html = String::new();
        let _ = write!(
            html,
            r#"<h2>Expense Approval Required</h2>
<p>Hello {reviewer},</p>
<p>An expense has been submitted that requires your approval:</p>
<div style="margin: 20px 0; padding: 15px; border: 1px solid #ddd; border-radius: 5px;">
{rows}      <p><strong>Submitted By:</strong> {author} ({author_email})</p>
"#,
            reviewer = escape_html(&view.reviewer.name),
            rows = detail_rows(d),
            author = escape_html(&view.author.name),
            author_email = escape_html(&view.author.email),
        );
        if let Some(description) = d.description.as_deref().filter(|s| !s.is_empty()) {
            let _ = writeln!(
                html,
                "      <p><strong>Description:</strong> {}</p>",
                escape_html(description)
            );
        }
        if let Some(receipt) = d.receipt_url.as_deref().filter(|s| !s.is_empty()) {
            let _ = write!(
                html,
                r#"      <div style="margin-top: 15px;">
        <p><strong>Receipt:</strong></p>
        <img src="{}" alt="Receipt" style="max-width: 300px; max-height: 200px;" />
      </div>
"#,
                escape_html(receipt)
            );
        }
        let _ = write!(
            html,
            r#"</div>
<div style="margin: 25px 0;">
  <a href="{approve}" style="display: inline-block; padding: 10px 20px; margin-right: 10px; background-color: #4CAF50; color: white; text-decoration: none; border-radius: 4px;">Approve</a>
  <a href="{reject}" style="display: inline-block; padding: 10px 20px; background-color: #f44336; color: white; text-decoration: none; border-radius: 4px;">Reject</a>
</div>
<p>You can also review this expense in detail by logging into the expense management system.</p>
<p>Thank you,<br>{team}</p>
"#,
            approve = escape_html(view.approve_url.as_str()),
            reject = escape_html(view.reject_url.as_str()),
            team = escape_html(&self.team_name),
        );

        OutboundMessage {
            to: view.reviewer.email.clone(),
            subject,
            html,
        }
    }

    fn status_change(&self, view: &StatusChangeView<'_>) -> OutboundMessage {
        let d = view.details;
        let status_text = view.status.title();
        let subject = format!("Expense {}: {} ({})", status_text, d.title, d.tracking_id);
        let (background, colour) = match view.status {
            ExpenseStatus::Approved => ("#f1f8e9", "green"),
            ExpenseStatus::Rejected => ("#ffebee", "red"),
        };

        let mut html = String::new();
        let _ = write!(
            html,
            r#"<h2>Expense {status_text}</h2>
<p>Hello {author},</p>
<p>Your expense <strong>{title}</strong> ({tracking}) has been <strong>{status}</strong> by {approver}.</p>
<div style="margin: 20px 0; padding: 15px; border: 1px solid #ddd; border-radius: 5px; background-color: {background}">
{rows}      <p><strong>Status:</strong> <span style="color: {colour}; font-weight: bold;">{status_text}</span></p>
"#,
            author = escape_html(&view.author.name),
            title = escape_html(&d.title),
            tracking = escape_html(&d.tracking_id),
            status = view.status.as_str(),
            approver = escape_html(view.approver_name),
            rows = detail_rows(d),
        );

        let reason = view.reason.filter(|r| !r.trim().is_empty());
        if let (ExpenseStatus::Rejected, Some(reason)) = (view.status, reason) {
            let _ = write!(
                html,
                r#"      <div style="margin-top: 15px; padding: 10px; background-color: #ffebee; border-left: 4px solid #f44336;">
        <p><strong>Reason for Rejection:</strong></p>
        <p>{}</p>
      </div>
"#,
                escape_html(reason)
            );
        }
        let _ = write!(
            html,
            r#"</div>
<p>You can view the details of this expense in the Reimbursement Box app.</p>
<p>Thank you,<br>{}</p>
"#,
            escape_html(&self.team_name)
        );

        OutboundMessage {
            to: view.author.email.clone(),
            subject,
            html,
        }
    }
}
