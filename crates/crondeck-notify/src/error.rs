use thiserror::Error;

#[derive(Debug, Error)]
pub enum NotifyError {
    /// Connection, TLS or timeout failure talking to the endpoint.
    #[error("Webhook transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The endpoint answered with a non-2xx status.
    #[error("Webhook rejected with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, NotifyError>;
