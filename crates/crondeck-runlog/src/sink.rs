use crondeck_core::JobRun;

use crate::error::Result;

/// Where finished and in-flight runs are recorded.
///
/// Rows are keyed by `(name, triggered_at, triggered_by)`: writing the same
/// run twice updates the existing row. Implementations must be safe to call
/// from many concurrently running jobs.
pub trait RunLogSink: Send + Sync {
    /// Insert or update the row for `run`, returning its id.
    fn upsert(&self, run: &JobRun) -> Result<i64>;

    fn last_run(&self, job: &str) -> Result<Option<JobRun>>;

    fn run_by_id(&self, id: i64) -> Result<Option<JobRun>>;

    /// Newest first. Logs are left empty unless `include_log` is set.
    fn recent_runs(&self, job: &str, limit: usize, include_log: bool) -> Result<Vec<JobRun>>;

    /// Record that `run` began. Status is still empty at this point.
    fn record_started(&self, run: &JobRun) -> Result<i64> {
        self.upsert(run)
    }

    /// Record the outcome of `run`, replacing the started row.
    fn record_finalized(&self, run: &JobRun) -> Result<i64> {
        self.upsert(run)
    }
}
