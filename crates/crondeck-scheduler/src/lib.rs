//! Declarative cron scheduler.
//!
//! A YAML [`ScheduleDocument`] is loaded into a [`Schedule`]; its tick loop
//! starts jobs when their cron time arrives, each [`JobSpec`] retries failed
//! attempts, and finished runs fan out to downstream jobs and webhooks.

pub mod cascade;
pub mod command;
pub mod engine;
pub mod error;
pub mod job;
pub mod schedule;
pub mod types;

#[cfg(test)]
mod testutil;

pub use cascade::Outcome;
pub use engine::{run_job, Schedule, ScheduleContext, ScheduleStatus, TICK_INTERVAL};
pub use error::{Result, SchedulerError};
pub use job::{JobSpec, TRIGGER_CRON, TRIGGER_MANUAL};
pub use schedule::ScheduleTz;
pub use types::{CommandLine, JobDefinition, OnEvent, ScheduleDocument, Secret};
