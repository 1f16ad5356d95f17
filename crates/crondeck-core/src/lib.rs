//! Shared building blocks for crondeck: the [`JobRun`] record every crate
//! passes around, process status conventions, and configuration loading.

pub mod config;
pub mod error;
pub mod types;

pub use config::CrondeckConfig;
pub use error::{CrondeckError, Result};
pub use types::{JobRun, STATUS_ERROR, STATUS_OK};
