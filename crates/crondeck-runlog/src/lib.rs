//! Persistent record of job runs.
//!
//! Writers go through [`RunLogSink`]; a run is written once when it starts and
//! again when it finishes, and both writes land on the same row.

pub mod db;
pub mod error;
pub mod sink;
pub mod sqlite;

pub use error::{Result, RunLogError};
pub use sink::RunLogSink;
pub use sqlite::SqliteRunLog;
