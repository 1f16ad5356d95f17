//! Reactions to a finalized run: downstream jobs and webhook calls.
//!
//! Actions come from the job's own `on_*` block and the schedule-level one
//! for the same outcome. Each action is its own task; the caller gets them
//! back through a [`TaskTracker`] and decides whether to wait.

use std::sync::Arc;

use crondeck_core::JobRun;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::{engine::Schedule, job::JobSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Error,
    RetriesExhausted,
}

impl Outcome {
    /// Success or error, from the run's status.
    pub fn of(run: &JobRun) -> Self {
        if run.is_success() {
            Outcome::Success
        } else {
            Outcome::Error
        }
    }
}

/// Trigger label given to jobs started by `origin`'s cascade.
pub fn cascade_label(origin: &str, outcome: Outcome) -> String {
    match outcome {
        Outcome::RetriesExhausted => format!("retries_exhausted[{origin}]"),
        Outcome::Success | Outcome::Error => format!("job[{origin}]"),
    }
}

/// Spawn every action configured for `outcome` onto `join`.
///
/// Returns the names of the downstream jobs that were started.
pub(crate) fn fire(
    schedule: &Arc<Schedule>,
    job: &JobSpec,
    run: &JobRun,
    outcome: Outcome,
    join: &TaskTracker,
) -> Vec<String> {
    let own = job.definition().event(outcome);
    let global = schedule.event(outcome);
    let label = cascade_label(job.name(), outcome);
    let mut triggered = Vec::new();

    for target in own.trigger_job.iter().chain(global.trigger_job.iter()) {
        let Some(downstream) = schedule.job(target) else {
            // load-time validation makes this unreachable for parsed documents
            warn!(job = %job.name(), %target, "cascade target missing");
            continue;
        };
        debug!(job = %job.name(), %target, ?outcome, "triggering downstream job");
        join.spawn(
            schedule
                .tracker()
                .track_future(Arc::clone(downstream).exec_boxed(label.clone(), run.clone())),
        );
        triggered.push(target.clone());
    }

    for hook in own.webhooks().chain(global.webhooks()) {
        let client = schedule.webhooks().clone();
        let payload = run.clone();
        debug!(job = %job.name(), kind = %hook.kind, url = %hook.url, ?outcome, "sending webhook");
        join.spawn(schedule.tracker().track_future(async move {
            client.notify(&hook, &payload).await;
        }));
    }

    triggered
}
