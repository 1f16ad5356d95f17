use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use clap::{Parser, Subcommand};
use crondeck_core::CrondeckConfig;
use crondeck_runlog::{RunLogSink, SqliteRunLog};
use crondeck_scheduler::{run_job, Schedule, ScheduleContext};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod logging;

#[derive(Parser, Debug)]
#[command(name = "crondeck", version, about = "Declarative cron job scheduler")]
struct Cli {
    /// Path to crondeck.toml (defaults to ~/.crondeck/crondeck.toml)
    #[arg(long, global = true, env = "CRONDECK_CONFIG")]
    config: Option<String>,

    /// Human-readable console logs instead of JSON lines
    #[arg(long, global = true)]
    pretty: bool,

    /// Capture job output without echoing it and keep the console quiet
    #[arg(long, global = true)]
    suppress_logs: bool,

    /// Log level for crondeck's own crates (overridden by RUST_LOG)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the scheduler until interrupted
    Run {
        /// Schedule document (YAML)
        schedule: PathBuf,
    },
    /// Run one job now, retries and cascade included, then exit
    Trigger {
        schedule: PathBuf,
        job: String,
    },
    /// Check a schedule document and print each job's next run
    Validate { schedule: PathBuf },
}

impl Cli {
    /// Command-line flags win over file and environment values.
    fn apply_overrides(&self, config: &mut CrondeckConfig) {
        if self.pretty {
            config.pretty = true;
        }
        if self.suppress_logs {
            config.suppress_logs = true;
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // logging needs the config, so a load failure is reported once it is up
    let (mut config, load_err) = match CrondeckConfig::load(cli.config.as_deref()) {
        Ok(config) => (config, None),
        Err(e) => (CrondeckConfig::default(), Some(e)),
    };
    cli.apply_overrides(&mut config);

    let _log_guard = logging::init(&config)?;
    if let Some(e) = load_err {
        warn!("config load failed ({e}), using defaults");
    }

    match &cli.command {
        Commands::Run { schedule } => run(config, schedule).await,
        Commands::Trigger { schedule, job } => trigger(config, schedule, job).await,
        Commands::Validate { schedule } => validate(config, schedule),
    }
}

async fn run(config: CrondeckConfig, path: &Path) -> anyhow::Result<()> {
    let ctx = context(config);
    let schedule = Schedule::load(path, ctx.clone())
        .with_context(|| format!("loading schedule {}", path.display()))?;

    tokio::spawn(shutdown_signal(ctx.cancel.clone()));
    schedule.run().await;
    Ok(())
}

async fn trigger(config: CrondeckConfig, path: &Path, job: &str) -> anyhow::Result<()> {
    let echoed = !config.suppress_logs;
    let ctx = context(config);
    tokio::spawn(shutdown_signal(ctx.cancel.clone()));

    let run = run_job(ctx, path, job).await?;
    if !echoed {
        print!("{}", run.log);
    }
    println!(
        "{} ({}) finished with status {}",
        run.name,
        run.triggered_by,
        run.status_label()
    );
    if !run.is_success() {
        anyhow::bail!("job {} failed with status {}", run.name, run.status_label());
    }
    Ok(())
}

fn validate(config: CrondeckConfig, path: &Path) -> anyhow::Result<()> {
    let schedule = Schedule::load(path, ScheduleContext::new(config))
        .with_context(|| format!("loading schedule {}", path.display()))?;

    let tz = schedule.timezone();
    for job in schedule.jobs() {
        let cron = job.definition().cron_expr().unwrap_or("-");
        let next = job
            .next_tick()
            .map(|t| tz.localize(t).to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        println!("{}\t{cron}\t{next}", job.name());
    }
    println!("schedule ok ({tz})");
    Ok(())
}

/// Schedule context with the SQLite run log attached when enabled. A run log
/// that cannot be opened is not fatal; runs are then kept in memory only.
fn context(config: CrondeckConfig) -> ScheduleContext {
    let sink: Option<Arc<dyn RunLogSink>> = if config.database.enabled {
        let path = config.db_path();
        match SqliteRunLog::open(&path) {
            Ok(log) => Some(Arc::new(log)),
            Err(e) => {
                warn!(path = %path.display(), "run log unavailable, keeping runs in memory: {e}");
                None
            }
        }
    } else {
        None
    };

    let ctx = ScheduleContext::new(config);
    match sink {
        Some(sink) => ctx.with_sink(sink),
        None => ctx,
    }
}

/// Cancel `token` on Ctrl-C or SIGTERM.
async fn shutdown_signal(token: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::pin!(terminate);

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                warn!("cannot listen for Ctrl-C: {e}");
                (&mut terminate).await;
            }
        }
        _ = &mut terminate => {}
    }

    info!("shutdown signal received, waiting for running jobs");
    token.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn flags_override_config() {
        let cli = Cli::try_parse_from([
            "crondeck",
            "run",
            "jobs.yml",
            "--pretty",
            "--log-level",
            "debug",
        ])
        .unwrap();
        let mut config = CrondeckConfig::default();
        cli.apply_overrides(&mut config);
        assert!(config.pretty);
        assert!(!config.suppress_logs);
        assert_eq!(config.log_level, "debug");
        assert!(matches!(cli.command, Commands::Run { ref schedule } if schedule == &PathBuf::from("jobs.yml")));
    }

    #[test]
    fn trigger_takes_schedule_and_job() {
        let cli = Cli::try_parse_from(["crondeck", "--suppress-logs", "trigger", "jobs.yml", "backup"])
            .unwrap();
        assert!(cli.suppress_logs);
        match cli.command {
            Commands::Trigger { job, .. } => assert_eq!(job, "backup"),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn unopenable_run_log_falls_back_to_memory() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "").unwrap();
        let config = CrondeckConfig {
            database: crondeck_core::config::DatabaseConfig {
                enabled: true,
                path: Some(blocker.join("db.sqlite3").display().to_string()),
            },
            ..CrondeckConfig::default()
        };
        assert!(context(config).sink.is_none());

        let config = CrondeckConfig {
            database: crondeck_core::config::DatabaseConfig {
                enabled: true,
                path: Some(dir.path().join("runs.sqlite3").display().to_string()),
            },
            ..CrondeckConfig::default()
        };
        assert!(context(config).sink.is_some());
    }
}
