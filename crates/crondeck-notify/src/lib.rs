//! Outbound notifications for finished job runs.
//!
//! Three webhook flavors share one dispatch path; they differ only in how a
//! [`crondeck_core::JobRun`] is rendered into a request body.

pub mod client;
pub mod error;
pub mod truncate;
pub mod types;

pub use client::WebhookClient;
pub use error::{NotifyError, Result};
pub use types::{Webhook, WebhookKind};
