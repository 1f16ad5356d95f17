use anyhow::Context;
use crondeck_core::CrondeckConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global subscriber: JSON lines into the core log file, plus a
/// stderr layer unless logs are suppressed.
///
/// The returned guard flushes the file writer on drop; keep it alive for the
/// life of the process.
pub fn init(config: &CrondeckConfig) -> anyhow::Result<WorkerGuard> {
    let path = config.core_log_path();
    let dir = path
        .parent()
        .context("core log path has no parent directory")?;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("creating log directory {}", dir.display()))?;
    let file_name = path
        .file_name()
        .context("core log path has no file name")?;

    let file_appender = tracing_appender::rolling::never(dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(&config.log_level)));

    let file_layer = fmt::layer().json().with_writer(non_blocking);
    let console = (!config.suppress_logs).then(|| {
        if config.pretty {
            fmt::layer().with_writer(std::io::stderr).boxed()
        } else {
            fmt::layer().json().with_writer(std::io::stderr).boxed()
        }
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console)
        .try_init()
        .context("installing tracing subscriber")?;

    Ok(guard)
}

/// `level` for our own crates, warnings for everything else.
fn default_directives(level: &str) -> String {
    format!("warn,crondeck_core={level},crondeck_runner={level},crondeck_notify={level},crondeck_runlog={level},crondeck_scheduler={level},crondeck={level}")
}
