//! Process runner: spawns a job's command, captures stdout and stderr into a
//! single log, and classifies how the process ended.

pub mod error;
pub mod runner;
pub mod types;

pub use error::RunnerError;
pub use runner::ProcessRunner;
pub use types::{ExecOutcome, ExecRequest};
