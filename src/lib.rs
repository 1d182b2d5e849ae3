//! Library to run recurring backups from cron.
//!
//! A pass of the [Runner](runner::Runner) reads the active
//! [schedules](schedule::BackupSchedule) from a [ScheduleStore](store::ScheduleStore),
//! dispatches the due ones to a [BackupService](backends::BackupService) and
//! writes back when each one runs next.
//! The backup modules are located in the [`backends`] module.

#![forbid(unsafe_code)]

pub mod backends;
pub mod cli;
pub mod runner;
pub mod schedule;
pub mod store;
pub mod util;
