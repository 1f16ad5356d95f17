use std::time::Duration;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

/// Exit status recorded for a process that exited cleanly.
pub const STATUS_OK: i32 = 0;
/// Status recorded when a process never started, was killed by a signal, or
/// was cancelled. Positive statuses are real exit codes.
pub const STATUS_ERROR: i32 = -1;

/// One execution attempt of a job.
///
/// `status` stays `None` while the attempt is running; once set, the run is
/// finalized and the log is complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRun {
    /// Row id assigned by the run-log sink, when one is attached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub name: String,
    pub status: Option<i32>,
    #[serde(default)]
    pub log: String,
    pub triggered_at: DateTime<FixedOffset>,
    pub triggered_by: String,
    /// Jobs started by this run's event cascade.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub triggered: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_by_job_run: Option<Box<JobRun>>,
    /// Wall-clock time of the attempt, in milliseconds on the wire.
    #[serde(default, with = "duration_ms")]
    pub duration: Option<Duration>,
    #[serde(default)]
    pub retry_attempt: u32,
    #[serde(default)]
    pub retries_exhausted: bool,
    /// Set when the attempt was cut short by shutdown. Never serialized.
    #[serde(skip)]
    pub cancelled: bool,
}

impl JobRun {
    /// A fresh, unfinalized run.
    pub fn started(
        name: impl Into<String>,
        triggered_at: DateTime<FixedOffset>,
        triggered_by: impl Into<String>,
        retry_attempt: u32,
        parent: Option<Box<JobRun>>,
    ) -> Self {
        Self {
            id: None,
            name: name.into(),
            status: None,
            log: String::new(),
            triggered_at,
            triggered_by: triggered_by.into(),
            triggered: Vec::new(),
            triggered_by_job_run: parent,
            duration: None,
            retry_attempt,
            retries_exhausted: false,
            cancelled: false,
        }
    }

    /// Seal the run with its outcome. The log is appended, not replaced, so
    /// anything written before the process started is kept.
    pub fn finalize(&mut self, status: i32, log: &str, duration: Duration) {
        self.log.push_str(log);
        self.status = Some(status);
        self.duration = Some(duration);
    }

    pub fn is_finalized(&self) -> bool {
        self.status.is_some()
    }

    pub fn is_success(&self) -> bool {
        self.status == Some(STATUS_OK)
    }

    /// Status rendered for humans; `-` while still running.
    pub fn status_label(&self) -> String {
        match self.status {
            Some(code) => code.to_string(),
            None => "-".to_string(),
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
