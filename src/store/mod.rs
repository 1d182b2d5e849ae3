//! Durable storage of [BackupSchedule]s.

use std::{io, path::PathBuf};

use chrono::{DateTime, Utc};
use derive_more::{Display, Error, From};

use crate::schedule::{BackupSchedule, InvalidTimeOfDay, UnknownInterval};

pub mod json;

pub use json::{JsonStore, NewSchedule};

/// Storage the runner reads schedules from and writes run bookkeeping back to.
pub trait ScheduleStore {
    /// All schedules with [ScheduleStatus::Active](crate::schedule::ScheduleStatus::Active),
    /// in storage order.
    fn list_active_schedules(&self) -> Result<Vec<BackupSchedule>, StoreError>;

    /// Writes `last_run_at` and `next_run_at` of `schedule` to the stored
    /// record with the same id. Every other stored field is left as is.
    ///
    /// The write only happens while the stored record is still active and its
    /// `next_run_at` equals `expected_next_run_at`. Otherwise
    /// [StoreError::Conflict] is returned. A record that no longer exists
    /// yields [StoreError::NotFound]. Nothing is written on error.
    fn record_run(
        &self,
        schedule: &BackupSchedule,
        expected_next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;
}

impl<T: ScheduleStore + ?Sized> ScheduleStore for &T {
    fn list_active_schedules(&self) -> Result<Vec<BackupSchedule>, StoreError> {
        (**self).list_active_schedules()
    }

    fn record_run(
        &self,
        schedule: &BackupSchedule,
        expected_next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        (**self).record_run(schedule, expected_next_run_at)
    }
}

#[derive(Debug, Display, Error, From)]
/// Errors on reading or writing schedules.
pub enum StoreError {
    /// Reading or writing the store file failed.
    #[display("Accessing schedule store {} failed: {source}", path.display())]
    Io {
        path: PathBuf,
        source: io::Error,
    },
    /// The store file isn't valid.
    #[display("Schedule store {} is malformed: {source}", path.display())]
    Malformed {
        path: PathBuf,
        source: serde_json::Error,
    },
    /// The schedules couldn't be serialized for writing.
    #[display("Serializing schedules for {} failed: {source}", path.display())]
    Serialize {
        path: PathBuf,
        source: serde_json::Error,
    },
    /// The schedule was paused or advanced since it was read.
    #[display("Schedule {_0} was updated concurrently")]
    Conflict(#[error(ignore)] u64),
    /// No schedule with the id exists.
    #[display("Schedule {_0} not found")]
    NotFound(#[error(ignore)] u64),
    /// The schedule's interval is unknown.
    #[from]
    #[display("Invalid schedule: {_0}")]
    UnknownInterval(UnknownInterval),
    /// The schedule's time of day is malformed.
    #[from]
    #[display("Invalid schedule: {_0}")]
    InvalidTimeOfDay(InvalidTimeOfDay),
}
