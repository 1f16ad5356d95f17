use std::{collections::BTreeMap, fmt, path::Path, sync::Arc, time::Duration};

use chrono::{DateTime, FixedOffset, Utc};
use crondeck_core::{CrondeckConfig, JobRun};
use crondeck_notify::WebhookClient;
use crondeck_runlog::RunLogSink;
use crondeck_runner::ProcessRunner;
use parking_lot::RwLock;
use serde::Serialize;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

use crate::{
    cascade::Outcome,
    error::{Result, SchedulerError},
    job::{JobSpec, TRIGGER_CRON, TRIGGER_MANUAL},
    schedule::ScheduleTz,
    types::{OnEvent, ScheduleDocument, Secret},
};

/// How often the loop checks for due jobs.
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Everything a schedule needs from the process around it.
#[derive(Clone)]
pub struct ScheduleContext {
    pub config: Arc<CrondeckConfig>,
    /// Optional persistent run log; without one, runs live only in memory.
    pub sink: Option<Arc<dyn RunLogSink>>,
    /// Process-wide shutdown signal.
    pub cancel: CancellationToken,
}

impl ScheduleContext {
    pub fn new(config: CrondeckConfig) -> Self {
        Self {
            config: Arc::new(config),
            sink: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn RunLogSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Per-job last status, as shown on a dashboard.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScheduleStatus {
    /// Last recorded status of each job that has run at least once.
    pub status: BTreeMap<String, Option<i32>>,
    pub failed_run_count: usize,
    pub has_failed_runs: bool,
}

/// A loaded schedule: its jobs, shared event reactions, and the loop that
/// starts jobs when their cron time arrives.
///
/// Always handled through an `Arc`; jobs hold a weak reference back to it.
pub struct Schedule {
    jobs: BTreeMap<String, Arc<JobSpec>>,
    on_success: OnEvent,
    on_error: OnEvent,
    on_retries_exhausted: OnEvent,
    env: BTreeMap<String, Secret>,
    tz: RwLock<ScheduleTz>,
    ctx: ScheduleContext,
    runner: ProcessRunner,
    webhooks: WebhookClient,
    /// Every task spawned on behalf of this schedule, drained on shutdown.
    inflight: TaskTracker,
}

impl fmt::Debug for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schedule")
            .field("jobs", &self.jobs.keys().collect::<Vec<_>>())
            .field("tz", &*self.tz.read())
            .finish_non_exhaustive()
    }
}

impl Schedule {
    /// Read, parse and validate a schedule file.
    pub fn load(path: &Path, ctx: ScheduleContext) -> Result<Arc<Self>> {
        let raw = std::fs::read_to_string(path).map_err(|source| SchedulerError::Read {
            path: path.display().to_string(),
            source,
        })?;
        info!(path = %path.display(), "loading schedule");
        Self::from_yaml(&raw, ctx)
    }

    pub fn from_yaml(raw: &str, ctx: ScheduleContext) -> Result<Arc<Self>> {
        Self::from_document(ScheduleDocument::from_yaml(raw)?, ctx)
    }

    /// Validate `doc` and build the runtime schedule. Next ticks are
    /// computed from now, counting now itself.
    pub fn from_document(doc: ScheduleDocument, ctx: ScheduleContext) -> Result<Arc<Self>> {
        doc.validate()?;
        let tz = ScheduleTz::parse(doc.tz_location.as_deref().unwrap_or_default())?;

        let ScheduleDocument {
            jobs,
            on_success,
            on_error,
            on_retries_exhausted,
            env,
            ..
        } = doc;
        let tail_len = ctx.config.run_tail;
        let runner = ProcessRunner::new(!ctx.config.suppress_logs);

        let schedule = Arc::new_cyclic(|weak| Schedule {
            jobs: jobs
                .into_iter()
                .map(|(name, def)| {
                    let job = JobSpec::new(name.clone(), def, weak.clone(), tail_len);
                    (name, Arc::new(job))
                })
                .collect(),
            on_success,
            on_error,
            on_retries_exhausted,
            env,
            tz: RwLock::new(tz),
            ctx,
            runner,
            webhooks: WebhookClient::new(),
            inflight: TaskTracker::new(),
        });

        schedule.hydrate_runs();
        schedule.refresh_next_ticks(Utc::now());
        info!(jobs = schedule.jobs.len(), %tz, "schedule loaded");
        Ok(schedule)
    }

    pub fn job(&self, name: &str) -> Option<&Arc<JobSpec>> {
        self.jobs.get(name)
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Arc<JobSpec>> {
        self.jobs.values()
    }

    /// Current time in the schedule's zone.
    pub fn now(&self) -> DateTime<FixedOffset> {
        self.tz.read().now()
    }

    pub fn timezone(&self) -> ScheduleTz {
        *self.tz.read()
    }

    /// Switch zones and recompute every job's next tick.
    pub fn set_timezone(&self, tz: ScheduleTz) {
        *self.tz.write() = tz;
        info!(%tz, "schedule timezone changed");
        self.refresh_next_ticks(Utc::now());
    }

    /// Recompute next ticks from `reference`, which itself counts.
    pub fn refresh_next_ticks(&self, reference: DateTime<Utc>) {
        let tz = self.timezone();
        for job in self.jobs.values() {
            job.set_next_tick(reference, tz, true);
        }
    }

    /// Schedule-level reactions for `outcome`.
    pub fn event(&self, outcome: Outcome) -> &OnEvent {
        match outcome {
            Outcome::Success => &self.on_success,
            Outcome::Error => &self.on_error,
            Outcome::RetriesExhausted => &self.on_retries_exhausted,
        }
    }

    pub(crate) fn env(&self) -> &BTreeMap<String, Secret> {
        &self.env
    }

    pub(crate) fn config(&self) -> &CrondeckConfig {
        &self.ctx.config
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.ctx.cancel
    }

    pub(crate) fn sink(&self) -> Option<Arc<dyn RunLogSink>> {
        self.ctx.sink.clone()
    }

    pub(crate) fn runner(&self) -> &ProcessRunner {
        &self.runner
    }

    pub(crate) fn webhooks(&self) -> &WebhookClient {
        &self.webhooks
    }

    pub(crate) fn tracker(&self) -> &TaskTracker {
        &self.inflight
    }

    /// Write `run` to the run log, started or finalized depending on its
    /// status. Failures are logged and otherwise ignored.
    pub(crate) fn record(&self, run: &mut JobRun) {
        let Some(sink) = &self.ctx.sink else {
            return;
        };
        let written = if run.is_finalized() {
            sink.record_finalized(run)
        } else {
            sink.record_started(run)
        };
        match written {
            Ok(id) => run.id = Some(id),
            Err(e) => warn!(job = %run.name, trigger = %run.triggered_by, "run log write failed: {e}"),
        }
    }

    fn hydrate_runs(&self) {
        let Some(sink) = &self.ctx.sink else {
            return;
        };
        for job in self.jobs.values() {
            match sink.recent_runs(job.name(), self.ctx.config.run_tail, false) {
                Ok(runs) => job.hydrate(runs),
                Err(e) => warn!(job = %job.name(), "could not load previous runs: {e}"),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Tick loop
    // -----------------------------------------------------------------------

    /// Start every job whose next tick is at or before `now`, advancing its
    /// next tick past `now` first. Returns the names started.
    pub fn tick(&self, now: DateTime<Utc>) -> Vec<String> {
        let tz = self.timezone();
        let mut started = Vec::new();
        for job in self.jobs.values() {
            if !job.is_due(now) {
                continue;
            }
            job.set_next_tick(now, tz, false);
            debug!(job = %job.name(), next_tick = ?job.next_tick(), "job due");
            started.push(job.name().to_string());

            let job = Arc::clone(job);
            self.inflight.spawn(async move {
                job.exec_with_retry(TRIGGER_CRON, None, false).await;
            });
        }
        started
    }

    /// Tick once a second until the context's cancellation token fires, then
    /// wait for in-flight work to finish.
    pub async fn run(&self) {
        info!(jobs = self.jobs.len(), tz = %self.timezone(), "scheduler started");
        let cancel = self.ctx.cancel.clone();
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("shutdown requested; no further ticks");
                    break;
                }
                _ = interval.tick() => {
                    self.tick(Utc::now());
                }
            }
        }
        self.drain().await;
        info!("scheduler stopped");
    }

    /// Wait until every job attempt, downstream job and webhook call spawned
    /// so far (and anything they spawn) has finished.
    pub async fn drain(&self) {
        self.inflight.close();
        self.inflight.wait().await;
    }

    /// Run `name` now, retries included, and wait for its cascade.
    pub async fn trigger(&self, name: &str, trigger: &str) -> Result<JobRun> {
        let job = self.job(name).ok_or_else(|| SchedulerError::JobNotFound {
            name: name.to_string(),
        })?;
        info!(job = %name, %trigger, "job triggered");
        Ok(job.exec_with_retry(trigger, None, true).await)
    }

    pub fn status(&self) -> ScheduleStatus {
        let mut summary = ScheduleStatus::default();
        for job in self.jobs.values() {
            let Some(last) = job.last_run() else {
                continue;
            };
            if last.is_finalized() && !last.is_success() {
                summary.failed_run_count += 1;
            }
            summary.status.insert(job.name().to_string(), last.status);
        }
        summary.has_failed_runs = summary.failed_run_count > 0;
        summary
    }
}

/// Load the schedule at `source` and run `job_name` once, as a manual trigger.
pub async fn run_job(ctx: ScheduleContext, source: &Path, job_name: &str) -> Result<JobRun> {
    let schedule = Schedule::load(source, ctx)?;
    let run = schedule.trigger(job_name, TRIGGER_MANUAL).await?;
    schedule.drain().await;
    Ok(run)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{context, Receiver};
    use chrono::TimeDelta;
    use crondeck_core::{STATUS_ERROR, STATUS_OK};

    fn load(yaml: &str) -> (Arc<Schedule>, Arc<crondeck_runlog::SqliteRunLog>) {
        let (ctx, sink) = context();
        (Schedule::from_yaml(yaml, ctx).unwrap(), sink)
    }

    #[tokio::test]
    async fn manual_trigger() {
        let (schedule, _) = load("jobs:\n  foo:\n    cron: '* * * * *'\n    command: [echo, bar]\n");
        let run = schedule.trigger("foo", TRIGGER_MANUAL).await.unwrap();
        assert_eq!(run.name, "foo");
        assert_eq!(run.status, Some(STATUS_OK));
        assert_eq!(run.log, "bar\n");
        assert_eq!(run.triggered_by, "manual");
        assert_eq!(run.retry_attempt, 0);

        assert!(matches!(
            schedule.trigger("nope", TRIGGER_MANUAL).await,
            Err(SchedulerError::JobNotFound { ref name }) if name == "nope"
        ));
    }

    #[tokio::test]
    async fn tick_starts_due_jobs_and_advances() {
        let (schedule, sink) = load(
            "jobs:\n  every-second:\n    cron: '* * * * * *'\n    command: echo tick\n  never:\n    command: echo no\n",
        );
        let job = schedule.job("every-second").unwrap().clone();
        assert!(job.next_tick().is_some());
        assert!(schedule.job("never").unwrap().next_tick().is_none());

        let now = Utc::now() + TimeDelta::seconds(2);
        assert_eq!(schedule.tick(now), ["every-second"]);
        assert!(job.next_tick().unwrap() > now);
        // not due again until the next tick
        assert!(schedule.tick(now).is_empty());

        schedule.drain().await;
        let runs = sink.recent_runs("every-second", 10, true).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].triggered_by, TRIGGER_CRON);
        assert_eq!(runs[0].log, "tick\n");
        assert!(sink.recent_runs("never", 10, false).unwrap().is_empty());
    }

    #[tokio::test]
    async fn success_cascades_to_downstream_job() {
        let recv = Receiver::start().await;
        let yaml = format!(
            "jobs:\n  a:\n    command: echo a\n    on_success:\n      trigger_job: [b]\n  b:\n    command: echo b\n    on_success:\n      notify_webhook: [{}]\n",
            recv.url("b-done")
        );
        let (schedule, sink) = load(&yaml);

        let run = schedule.trigger("a", TRIGGER_MANUAL).await.unwrap();
        assert_eq!(run.triggered, ["b"]);

        let downstream = sink.last_run("b").unwrap().unwrap();
        assert_eq!(downstream.triggered_by, "job[a]");
        assert!(downstream.is_success());

        let hits = recv.hits("b-done");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0]["name"], "b");
        assert_eq!(hits[0]["triggered_by"], "job[a]");
        assert_eq!(hits[0]["triggered_by_job_run"]["name"], "a");
        assert_eq!(hits[0]["log"], "b\n");
    }

    #[tokio::test]
    async fn error_cascade_only_on_failure() {
        let yaml = "jobs:\n  ok:\n    command: 'true'\n    on_error:\n      trigger_job: [cleanup]\n  bad:\n    command: 'false'\n    on_error:\n      trigger_job: [cleanup]\n  cleanup:\n    command: echo cleaned\n";
        let (schedule, sink) = load(yaml);

        let run = schedule.trigger("ok", TRIGGER_MANUAL).await.unwrap();
        assert!(run.triggered.is_empty());
        assert!(sink.last_run("cleanup").unwrap().is_none());

        let run = schedule.trigger("bad", TRIGGER_MANUAL).await.unwrap();
        assert_eq!(run.triggered, ["cleanup"]);
        assert_eq!(sink.last_run("cleanup").unwrap().unwrap().triggered_by, "job[bad]");
    }

    #[tokio::test]
    async fn global_and_job_reactions_both_fire() {
        let recv = Receiver::start().await;
        let yaml = format!(
            "on_error:\n  notify_webhook: [{global}]\n  notify_slack_webhook: [{slack}]\njobs:\n  broken:\n    command: [sh, -c, 'echo oops; exit 4']\n    on_error:\n      notify_webhook: [{own}]\n",
            global = recv.url("global"),
            slack = recv.url("slack"),
            own = recv.url("own"),
        );
        let (schedule, _) = load(&yaml);
        let run = schedule.trigger("broken", TRIGGER_MANUAL).await.unwrap();
        assert_eq!(run.status, Some(4));

        assert_eq!(recv.hits("global").len(), 1);
        assert_eq!(recv.hits("own").len(), 1);
        let slack = recv.hits("slack");
        assert_eq!(slack.len(), 1);
        assert_eq!(slack[0]["text"], "broken (exitcode 4):\noops\nExit code: 4\n");
    }

    #[tokio::test]
    async fn unreachable_webhook_does_not_fail_the_run() {
        let (schedule, _) = load(
            "jobs:\n  a:\n    command: 'true'\n    on_success:\n      notify_webhook: ['http://127.0.0.1:9/hook']\n",
        );
        let run = schedule.trigger("a", TRIGGER_MANUAL).await.unwrap();
        assert!(run.is_success());
    }

    #[tokio::test]
    async fn cancellation_kills_running_job() {
        let recv = Receiver::start().await;
        let yaml = format!(
            "jobs:\n  slow:\n    command: sleep 10\n    retries: 3\n    on_error:\n      notify_webhook: [{}]\n",
            recv.url("error")
        );
        let (schedule, sink) = load(&yaml);
        let cancel = schedule.cancel_token().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.cancel();
        });

        let started = std::time::Instant::now();
        let run = schedule.trigger("slow", TRIGGER_MANUAL).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(run.status, Some(STATUS_ERROR));
        assert!(run.log.contains("job was cancelled"), "{}", run.log);
        assert!(!run.retries_exhausted);
        assert_eq!(sink.recent_runs("slow", 10, false).unwrap().len(), 1);
        assert!(recv.hits("error").is_empty());

        // after shutdown nothing new starts
        let run = schedule.trigger("slow", TRIGGER_MANUAL).await.unwrap();
        assert!(run.log.contains("job cancelled before start"));
    }

    #[tokio::test]
    async fn run_loop_stops_on_cancel() {
        let (schedule, _) = load("jobs:\n  idle:\n    cron: '0 0 1 1 *'\n    command: 'true'\n");
        let cancel = schedule.cancel_token().clone();
        let looping = {
            let schedule = schedule.clone();
            tokio::spawn(async move { schedule.run().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), looping)
            .await
            .expect("loop did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn run_loop_drains_dispatched_jobs() {
        let (schedule, sink) = load("jobs:\n  slow:\n    cron: '* * * * * *'\n    command: sleep 10\n");
        let cancel = schedule.cancel_token().clone();
        let looping = {
            let schedule = schedule.clone();
            tokio::spawn(async move { schedule.run().await })
        };

        tokio::time::timeout(Duration::from_secs(5), async {
            while sink.last_run("slow").unwrap().is_none() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("job was never dispatched");

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(8), looping)
            .await
            .expect("loop did not stop")
            .unwrap();

        // run() returned only after every dispatched attempt was finalized
        let runs = sink.recent_runs("slow", 50, true).unwrap();
        assert!(!runs.is_empty());
        for run in &runs {
            assert_eq!(run.status, Some(STATUS_ERROR), "{run:?}");
            assert!(run.log.contains("cancelled"), "{}", run.log);
        }
        assert!(runs.iter().any(|r| r.log.contains("job was cancelled")));
    }

    #[test]
    fn timezone_changes_now() {
        let (tokyo, _) = load("tz_location: Asia/Tokyo\njobs: {}\n");
        let (bangui, _) = load("tz_location: Africa/Bangui\njobs: {}\n");
        let offset = |s: &Schedule| s.now().offset().local_minus_utc();
        assert_eq!(offset(&tokyo) - offset(&bangui), 8 * 3600);

        bangui.set_timezone(ScheduleTz::parse("Asia/Tokyo").unwrap());
        assert_eq!(offset(&bangui), offset(&tokyo));
        assert_eq!(bangui.timezone().to_string(), "Asia/Tokyo");
    }

    #[test]
    fn timezone_moves_next_tick() {
        let (schedule, _) = load(
            "tz_location: UTC\njobs:\n  morning:\n    cron: '0 9 * * *'\n    command: 'true'\n",
        );
        let reference = DateTime::parse_from_rfc3339("2024-01-01T08:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        schedule.refresh_next_ticks(reference);
        let job = schedule.job("morning").unwrap();
        assert_eq!(job.next_tick().unwrap().to_rfc3339(), "2024-01-01T09:00:00+00:00");

        *schedule.tz.write() = ScheduleTz::parse("Asia/Tokyo").unwrap();
        schedule.refresh_next_ticks(reference);
        assert_eq!(job.next_tick().unwrap().to_rfc3339(), "2024-01-02T00:00:00+00:00");
    }

    #[test]
    fn load_errors() {
        let (ctx, _) = context();
        let missing = Schedule::load(Path::new("/nonexistent/schedule.yml"), ctx.clone());
        assert!(matches!(missing, Err(SchedulerError::Read { .. })));

        let garbage = Schedule::from_yaml("jobs: [", ctx.clone());
        assert!(matches!(garbage, Err(SchedulerError::Parse(_))));

        let bad_cron = Schedule::from_yaml("jobs:\n  a:\n    cron: '99 * * * *'\n", ctx.clone());
        assert!(matches!(bad_cron, Err(SchedulerError::InvalidCron { .. })));

        let bad_tz = Schedule::from_yaml("tz_location: Mars/Olympus\njobs: {}\n", ctx);
        assert!(matches!(bad_tz, Err(SchedulerError::InvalidTimezone { .. })));
    }

    #[tokio::test]
    async fn run_job_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schedule.yml");
        std::fs::write(&path, "jobs:\n  hello:\n    command: echo hello\n").unwrap();

        let (ctx, _) = context();
        let run = run_job(ctx.clone(), &path, "hello").await.unwrap();
        assert_eq!(run.log, "hello\n");
        assert!(matches!(
            run_job(ctx, &path, "missing").await,
            Err(SchedulerError::JobNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn status_summary() {
        let yaml = "jobs:\n  good:\n    command: 'true'\n  bad:\n    command: 'false'\n  idle:\n    command: 'true'\n";
        let (ctx, _) = context();
        let schedule = Schedule::from_yaml(yaml, ctx.clone()).unwrap();
        assert_eq!(schedule.status(), ScheduleStatus::default());

        schedule.trigger("good", TRIGGER_MANUAL).await.unwrap();
        schedule.trigger("bad", TRIGGER_MANUAL).await.unwrap();

        let status = schedule.status();
        assert_eq!(status.status.len(), 2);
        assert_eq!(status.status["good"], Some(STATUS_OK));
        assert_eq!(status.status["bad"], Some(1));
        assert_eq!(status.failed_run_count, 1);
        assert!(status.has_failed_runs);

        // a reload over the same run log sees the history
        let reloaded = Schedule::from_yaml(yaml, ctx).unwrap();
        assert_eq!(reloaded.status(), status);
    }
}
