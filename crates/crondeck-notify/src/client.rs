use std::time::Duration;

use crondeck_core::JobRun;
use tracing::{debug, warn};

use crate::{
    error::{NotifyError, Result},
    types::Webhook,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Response bodies quoted in errors are cut to this many characters.
const ERROR_BODY_MAX: usize = 200;

/// Posts rendered run summaries to webhook endpoints. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct WebhookClient {
    http: reqwest::Client,
}

impl WebhookClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// POST `run` to `hook` as JSON.
    pub async fn post(&self, hook: &Webhook, run: &JobRun) -> Result<()> {
        let body = hook.kind.render(run)?;
        let resp = self
            .http
            .post(&hook.url)
            .timeout(REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(NotifyError::Rejected {
                status: status.as_u16(),
                body: text.chars().take(ERROR_BODY_MAX).collect(),
            });
        }

        debug!(kind = %hook.kind, url = %hook.url, job = %run.name, "webhook delivered");
        Ok(())
    }

    /// Like [`post`](Self::post) but failures only produce a warning.
    pub async fn notify(&self, hook: &Webhook, run: &JobRun) {
        if let Err(e) = self.post(hook, run).await {
            warn!(kind = %hook.kind, url = %hook.url, job = %run.name, "webhook failed: {e}");
        }
    }
}
