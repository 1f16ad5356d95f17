//! Shared fixtures for scheduler tests.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::post,
    Json, Router,
};
use crondeck_core::CrondeckConfig;
use crondeck_runlog::SqliteRunLog;
use parking_lot::Mutex;
use serde_json::Value;

use crate::engine::ScheduleContext;

/// Context with an in-memory run log, no retry backoff and no output echo.
pub fn context() -> (ScheduleContext, Arc<SqliteRunLog>) {
    let sink = Arc::new(SqliteRunLog::open_in_memory().unwrap());
    let config = CrondeckConfig {
        retry_backoff_secs: 0,
        suppress_logs: true,
        ..CrondeckConfig::default()
    };
    (ScheduleContext::new(config).with_sink(sink.clone()), sink)
}

type Hits = Arc<Mutex<Vec<(String, Value)>>>;

/// Local HTTP endpoint recording every JSON body posted to `/{name}`.
pub struct Receiver {
    pub base: String,
    hits: Hits,
}

impl Receiver {
    pub async fn start() -> Self {
        async fn record(
            State(hits): State<Hits>,
            Path(name): Path<String>,
            Json(body): Json<Value>,
        ) -> StatusCode {
            hits.lock().push((name, body));
            StatusCode::OK
        }

        let hits: Hits = Arc::default();
        let app = Router::new()
            .route("/{name}", post(record))
            .with_state(hits.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            base: format!("http://{addr}"),
            hits,
        }
    }

    pub fn url(&self, name: &str) -> String {
        format!("{}/{name}", self.base)
    }

    /// Bodies received on `/{name}`, in arrival order.
    pub fn hits(&self, name: &str) -> Vec<Value> {
        self.hits
            .lock()
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, body)| body.clone())
            .collect()
    }
}
