use crondeck_core::JobRun;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{
    error::Result,
    truncate::{fit_message, DISCORD_MAX_CHARS, SLACK_MAX_CHARS},
};

/// Payload flavor of a webhook, fixed when the schedule is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookKind {
    /// The full JobRun as JSON.
    Generic,
    /// `{"text": ...}` summary.
    Slack,
    /// `{"content": ...}` summary, capped at Discord's limit.
    Discord,
}

impl WebhookKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookKind::Generic => "generic",
            WebhookKind::Slack => "slack",
            WebhookKind::Discord => "discord",
        }
    }

    /// Render the request body for `run`.
    pub fn render(&self, run: &JobRun) -> Result<Value> {
        match self {
            WebhookKind::Generic => Ok(serde_json::to_value(run)?),
            WebhookKind::Slack => Ok(json!({
                "text": fit_message(&summary_header(run), &run.log, SLACK_MAX_CHARS),
            })),
            WebhookKind::Discord => Ok(json!({
                "content": fit_message(&summary_header(run), &run.log, DISCORD_MAX_CHARS),
            })),
        }
    }
}

impl std::fmt::Display for WebhookKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn summary_header(run: &JobRun) -> String {
    format!("{} (exitcode {}):\n", run.name, run.status_label())
}

/// One configured notification target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Webhook {
    pub kind: WebhookKind,
    pub url: String,
}

impl Webhook {
    pub fn new(kind: WebhookKind, url: impl Into<String>) -> Self {
        Self {
            kind,
            url: url.into(),
        }
    }
}
