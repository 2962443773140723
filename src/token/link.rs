use url::Url;

use crate::errors::AppError;
use crate::models::token::Action;

/// Path of the endpoint that redeems action links.
pub const ACTION_PATH: &str = "/api/expense-action";

/// An approve/reject link as embedded in a reviewer email:
/// `{base}/api/expense-action?action=..&expense_id=..&tracking_id=..&token=..`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionLink {
    pub action: Action,
    pub subject_id: String,
    pub tracking_id: Option<String>,
    pub token: String,
}

impl ActionLink {
    pub fn new(action: Action, subject_id: &str, tracking_id: Option<&str>, token: &str) -> Self {
        Self {
            action,
            subject_id: subject_id.to_string(),
            tracking_id: tracking_id.map(str::to_string),
            token: token.to_string(),
        }
    }

    /// Render against `base_url`. Any path on the base is kept as a prefix.
    pub fn to_url(&self, base_url: &Url) -> Url {
        let prefix = base_url.path().trim_end_matches('/');
        let mut url = base_url.clone();
        url.set_path(&format!("{}{}", prefix, ACTION_PATH));
        url.set_fragment(None);
        {
            let mut query = url.query_pairs_mut();
            query.clear();
            query.append_pair("action", self.action.as_str());
            query.append_pair("expense_id", &self.subject_id);
            if let Some(tracking_id) = &self.tracking_id {
                query.append_pair("tracking_id", tracking_id);
            }
            query.append_pair("token", &self.token);
        }
        url
    }

    /// Extract the link parameters from a visited URL.
    pub fn parse(raw: &str) -> Result<Self, AppError> {
        let url = Url::parse(raw.trim())
            .map_err(|e| AppError::Validation(format!("invalid action link: {}", e)))?;

        let mut action = None;
        let mut subject_id = None;
        let mut tracking_id = None;
        let mut token = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "action" => action = Some(value.into_owned()),
                "expense_id" => subject_id = Some(value.into_owned()),
                "tracking_id" => tracking_id = Some(value.into_owned()),
                "token" => token = Some(value.into_owned()),
                _ => {}
            }
        }

        let required = |name: &str, v: Option<String>| {
            v.filter(|s| !s.trim().is_empty())
                .ok_or_else(|| AppError::Validation(format!("action link is missing '{}'", name)))
        };

        let action = required("action", action)?
            .parse::<Action>()
            .map_err(AppError::Validation)?;

        Ok(Self {
            action,
            subject_id: required("expense_id", subject_id)?,
            tracking_id: tracking_id.filter(|s| !s.is_empty()),
            token: required("token", token)?,
        })
    }
}
