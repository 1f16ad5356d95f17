//! `JobSpec` — a named job inside a loaded schedule, and the attempt/retry
//! state machine that runs it.

use std::{
    collections::VecDeque,
    fmt,
    future::Future,
    pin::Pin,
    sync::{Arc, Weak},
    time::Duration,
};

use chrono::{DateTime, Utc};
use crondeck_core::{JobRun, STATUS_ERROR};
use crondeck_runner::ExecRequest;
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::{
    cascade::{self, Outcome},
    engine::Schedule,
    error::{Result, SchedulerError},
    schedule::{next_tick_after, ScheduleTz},
    types::JobDefinition,
};

/// Trigger label for runs started by the tick loop.
pub const TRIGGER_CRON: &str = "cron";
/// Trigger label for runs started by a person.
pub const TRIGGER_MANUAL: &str = "manual";

pub(crate) type RunFuture = Pin<Box<dyn Future<Output = JobRun> + Send + 'static>>;

/// Label of the `attempt`-th try of a run started by `trigger`.
pub fn attempt_label(trigger: &str, attempt: u32) -> String {
    if attempt == 0 {
        trigger.to_string()
    } else {
        format!("{trigger}[retry={attempt}]")
    }
}

pub struct JobSpec {
    name: String,
    def: JobDefinition,
    /// Owning schedule. Weak so the schedule can be dropped while detached
    /// tasks still hold a job.
    schedule: Weak<Schedule>,
    /// Held for a whole retry sequence when concurrent runs are disabled.
    exclusive: tokio::sync::Mutex<()>,
    next_tick: Mutex<Option<DateTime<Utc>>>,
    /// Oldest first, capped at `tail_len`.
    runs: Mutex<VecDeque<JobRun>>,
    tail_len: usize,
}

impl fmt::Debug for JobSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobSpec")
            .field("name", &self.name)
            .field("def", &self.def)
            .field("next_tick", &*self.next_tick.lock())
            .finish_non_exhaustive()
    }
}

impl JobSpec {
    pub(crate) fn new(
        name: String,
        def: JobDefinition,
        schedule: Weak<Schedule>,
        tail_len: usize,
    ) -> Self {
        Self {
            name,
            def,
            schedule,
            exclusive: tokio::sync::Mutex::new(()),
            next_tick: Mutex::new(None),
            runs: Mutex::new(VecDeque::new()),
            tail_len,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn definition(&self) -> &JobDefinition {
        &self.def
    }

    /// When the tick loop will next start this job; `None` if never.
    pub fn next_tick(&self) -> Option<DateTime<Utc>> {
        *self.next_tick.lock()
    }

    pub(crate) fn set_next_tick(&self, reference: DateTime<Utc>, tz: ScheduleTz, include_ref: bool) {
        let next = self
            .def
            .cron_expr()
            .and_then(|expr| next_tick_after(expr, reference, tz, include_ref));
        *self.next_tick.lock() = next;
    }

    pub(crate) fn is_due(&self, now: DateTime<Utc>) -> bool {
        matches!(*self.next_tick.lock(), Some(at) if at <= now)
    }

    /// The job definition as YAML, with its name and secrets masked.
    pub fn to_yaml(&self) -> Result<String> {
        #[derive(Serialize)]
        struct Exported<'a> {
            name: &'a str,
            #[serde(flatten)]
            def: &'a JobDefinition,
        }

        serde_yaml::to_string(&Exported {
            name: &self.name,
            def: &self.def,
        })
        .map_err(|e| SchedulerError::Export(e.to_string()))
    }

    /// Newest first. Reads the run log when one is attached, otherwise the
    /// in-memory tail.
    pub fn recent_runs(&self, limit: usize, include_log: bool) -> Vec<JobRun> {
        if let Some(sink) = self.schedule.upgrade().and_then(|s| s.sink()) {
            match sink.recent_runs(&self.name, limit, include_log) {
                Ok(runs) => return runs,
                Err(e) => warn!(job = %self.name, "run log read failed, using in-memory runs: {e}"),
            }
        }
        self.runs
            .lock()
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .map(|mut run| {
                if !include_log {
                    run.log.clear();
                }
                run
            })
            .collect()
    }

    pub fn last_run(&self) -> Option<JobRun> {
        self.recent_runs(1, true).into_iter().next()
    }

    /// Seed the tail from previously recorded runs (newest first).
    pub(crate) fn hydrate(&self, mut newest_first: Vec<JobRun>) {
        newest_first.truncate(self.tail_len);
        newest_first.reverse();
        *self.runs.lock() = newest_first.into();
    }

    fn remember(&self, run: &JobRun) {
        let mut runs = self.runs.lock();
        // concurrent runs of one job interleave, so the match may not be last
        if let Some(same) = runs
            .iter_mut()
            .rev()
            .find(|r| r.triggered_at == run.triggered_at && r.triggered_by == run.triggered_by)
        {
            *same = run.clone();
            return;
        }
        runs.push_back(run.clone());
        while runs.len() > self.tail_len {
            runs.pop_front();
        }
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    /// Run the job: up to `retries + 1` sequential attempts, stopping at the
    /// first success or on shutdown. Returns the last attempt's run.
    ///
    /// With `wait_cascade`, also waits for every downstream job and webhook
    /// the attempts set off.
    pub async fn exec_with_retry(
        self: &Arc<Self>,
        trigger: &str,
        parent: Option<JobRun>,
        wait_cascade: bool,
    ) -> JobRun {
        let parent = parent.map(Box::new);
        let Some(schedule) = self.schedule.upgrade() else {
            warn!(job = %self.name, %trigger, "schedule no longer loaded; run skipped");
            let mut run = JobRun::started(&self.name, Utc::now().fixed_offset(), trigger, 0, parent);
            run.finalize(STATUS_ERROR, "schedule is no longer loaded\n", Duration::ZERO);
            return run;
        };

        let cascades = TaskTracker::new();
        let run = {
            let _exclusive = if self.def.disable_concurrent_execution {
                Some(match self.exclusive.try_lock() {
                    Ok(guard) => guard,
                    Err(_) => {
                        info!(job = %self.name, %trigger, "previous run still active, waiting");
                        self.exclusive.lock().await
                    }
                })
            } else {
                None
            };
            self.run_attempts(&schedule, trigger, parent, &cascades).await
        };

        // joined outside the exclusive section so a cascade back into this
        // job cannot deadlock on it
        cascades.close();
        if wait_cascade {
            cascades.wait().await;
        }
        run
    }

    /// [`exec_with_retry`](Self::exec_with_retry) for a cascade-started run,
    /// boxed so it can be spawned from inside another run.
    pub(crate) fn exec_boxed(self: Arc<Self>, trigger: String, parent: JobRun) -> RunFuture {
        Box::pin(async move { self.exec_with_retry(&trigger, Some(parent), true).await })
    }

    async fn run_attempts(
        &self,
        schedule: &Arc<Schedule>,
        trigger: &str,
        parent: Option<Box<JobRun>>,
        cascades: &TaskTracker,
    ) -> JobRun {
        let retries = self.def.retries;
        let mut attempt = 0;

        let (mut run, exhausted) = loop {
            let label = attempt_label(trigger, attempt);
            let run = self
                .attempt(schedule, &label, attempt, parent.clone(), cascades)
                .await;

            if run.is_success() || run.cancelled {
                break (run, false);
            }
            if self.def.command.is_empty() {
                // nothing a retry could change
                break (run, false);
            }
            if attempt >= retries {
                break (run, retries > 0);
            }

            debug!(job = %self.name, attempt, "retrying after backoff");
            tokio::select! {
                _ = tokio::time::sleep(schedule.config().retry_backoff()) => {}
                _ = schedule.cancel_token().cancelled() => {
                    info!(job = %self.name, "shutdown during retry backoff; remaining retries skipped");
                    break (run, false);
                }
            }
            attempt += 1;
        };

        if exhausted {
            warn!(job = %self.name, attempts = retries + 1, "retries exhausted");
            run.retries_exhausted = true;
            schedule.record(&mut run);
            let more = cascade::fire(schedule, self, &run, Outcome::RetriesExhausted, cascades);
            run.triggered.extend(more);
            self.remember(&run);
        }
        run
    }

    async fn attempt(
        &self,
        schedule: &Arc<Schedule>,
        label: &str,
        attempt: u32,
        parent: Option<Box<JobRun>>,
        cascades: &TaskTracker,
    ) -> JobRun {
        let mut run = JobRun::started(&self.name, schedule.now(), label, attempt, parent);

        if schedule.cancel_token().is_cancelled() {
            info!(job = %self.name, trigger = %label, "shutdown in progress; attempt skipped");
            run.cancelled = true;
            run.finalize(STATUS_ERROR, "job cancelled before start\n", Duration::ZERO);
            schedule.record(&mut run);
            self.remember(&run);
            return run;
        }

        schedule.record(&mut run);
        info!(job = %self.name, trigger = %label, attempt, "job started");

        let outcome = schedule
            .runner()
            .run(&self.exec_request(schedule), schedule.cancel_token())
            .await;
        run.cancelled = outcome.cancelled;
        run.finalize(outcome.status, &outcome.log, outcome.duration);
        schedule.record(&mut run);

        let duration_ms = outcome.duration.as_millis() as u64;
        if run.is_success() {
            info!(job = %self.name, trigger = %label, duration_ms, "job finished");
        } else {
            warn!(job = %self.name, trigger = %label, status = outcome.status, duration_ms, "job failed");
        }

        if !run.cancelled {
            run.triggered = cascade::fire(schedule, self, &run, Outcome::of(&run), cascades);
        }
        self.remember(&run);
        run
    }

    /// Environment layers, lowest precedence first: host (inherited by the
    /// child), schedule, job.
    fn exec_request(&self, schedule: &Schedule) -> ExecRequest {
        let env = schedule
            .env()
            .iter()
            .chain(self.def.env.iter())
            .map(|(k, v)| (k.clone(), v.expose().to_string()))
            .collect();
        ExecRequest {
            command: self.def.command.args().to_vec(),
            env,
            working_dir: self.def.working_directory.clone(),
        }
    }
}
