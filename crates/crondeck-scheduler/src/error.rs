use thiserror::Error;

/// Errors that can occur while loading or driving a schedule.
///
/// Everything here is a configuration problem surfaced at load time or a
/// lookup miss; failures of individual job attempts are recorded on the
/// run instead.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("cannot read schedule {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid schedule document: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("job {job}: invalid cron expression {expr:?}: {reason}")]
    InvalidCron {
        job: String,
        expr: String,
        reason: String,
    },

    /// An `on_*` block names a job that the schedule does not define.
    #[error("{source_name}: trigger_job refers to unknown job {target:?}")]
    UnknownTrigger { source_name: String, target: String },

    #[error("invalid timezone {name:?}: {reason}")]
    InvalidTimezone { name: String, reason: String },

    #[error("invalid command: {0}")]
    Command(String),

    #[error("Job not found: {name}")]
    JobNotFound { name: String },

    #[error("cannot export job spec: {0}")]
    Export(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
