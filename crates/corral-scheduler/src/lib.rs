//! corral-scheduler - scheduled task execution
//!
//! This crate provides functionality for:
//! - Validating cron, interval and one-shot schedules
//! - Computing the next occurrence of a task
//! - Polling the store for due tasks and running them through a `TaskExecutor`

pub mod runner;
pub mod schedule;

pub use runner::{Scheduler, SchedulerConfig, TaskExecutor, TaskOutcome};
pub use schedule::{
    ScheduleError, first_run, new_task_id, next_run_after, parse_cron, parse_interval,
    parse_once, parse_schedule_type, parse_timezone, summarize_result,
};
