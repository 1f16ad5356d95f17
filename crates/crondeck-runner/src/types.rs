use std::{collections::BTreeMap, path::PathBuf, time::Duration};

use crondeck_core::STATUS_ERROR;

use crate::error::RunnerError;

/// Everything needed to launch one attempt.
#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    /// Program followed by its arguments. Never passed through a shell.
    pub command: Vec<String>,
    /// Added on top of the inherited host environment; later layers have
    /// already been merged in by the caller.
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

/// How an attempt ended.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecOutcome {
    pub status: i32,
    /// Interleaved stdout/stderr followed by any trailer the runner adds.
    pub log: String,
    pub duration: Duration,
    pub cancelled: bool,
}

impl ExecOutcome {
    pub(crate) fn failed(err: RunnerError, duration: Duration) -> Self {
        Self {
            status: STATUS_ERROR,
            log: format!("{err}\n"),
            duration,
            cancelled: false,
        }
    }
}
