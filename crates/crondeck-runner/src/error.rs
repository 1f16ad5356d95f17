use thiserror::Error;

/// Failures that stop a command from producing an exit status. They are
/// rendered into the run log rather than returned to callers.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("job unable to start: no command specified")]
    EmptyCommand,

    #[error("job unable to start: {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("job failed while waiting for process: {0}")]
    Wait(#[source] std::io::Error),
}
