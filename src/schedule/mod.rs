//! Recurring backup definitions.
//!
//! A [BackupSchedule] only carries what the runner needs to decide *when* to
//! back up. *What* gets backed up (`paths`, `disk`, `backup_type`) is passed
//! through to the [BackupService](crate::backends::BackupService) untouched.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveTime, Utc};
use clap::ValueEnum;
use derive_more::{Display, Error};
use regex::Regex;

pub mod next_run;

pub use next_run::{compute_next_run_at, is_due};

static TIME_OF_DAY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([01][0-9]|2[0-3]):([0-5][0-9])$").unwrap());

/// A recurring backup definition.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BackupSchedule {
    /// Identifier assigned on creation.
    pub id: u64,
    pub interval: Interval,
    /// Time of day (`HH:MM`, UTC) the backup should run at.
    ///
    /// Ignored for [Interval::Hourly].
    #[serde(default)]
    pub time_of_day: Option<String>,
    pub backup_type: BackupType,
    /// Paths to include in [BackupType::Files] and [BackupType::Both] backups.
    #[serde(default)]
    pub paths: Vec<PathBuf>,
    /// Name of the storage destination.
    pub disk: String,
    pub status: ScheduleStatus,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    /// Next instant the schedule fires at. [None] means the schedule never ran and is due.
    #[serde(default)]
    pub next_run_at: Option<DateTime<Utc>>,
}

impl BackupSchedule {
    /// Parsed [time_of_day](Self::time_of_day), [None] if unset.
    pub fn time_of_day(&self) -> Result<Option<NaiveTime>, InvalidTimeOfDay> {
        self.time_of_day.as_deref().map(parse_time_of_day).transpose()
    }

    pub fn is_active(&self) -> bool {
        self.status == ScheduleStatus::Active
    }
}

/// How often a [BackupSchedule] fires.
///
/// Stored values that aren't known are kept as [Interval::Other] so a single
/// bad record doesn't prevent reading all the others.
#[derive(Clone, Debug, Display, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Interval {
    #[display("hourly")]
    Hourly,
    #[display("daily")]
    Daily,
    #[display("weekly")]
    Weekly,
    #[display("monthly")]
    Monthly,
    /// Unrecognized stored value.
    #[display("{_0}")]
    Other(String),
}

/// Interval is unknown.
#[derive(Debug, Display, Error)]
#[display("Interval is unknown: {_0}")]
pub struct UnknownInterval(#[error(ignore)] String);

impl FromStr for Interval {
    type Err = UnknownInterval;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hourly" => Ok(Self::Hourly),
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            "monthly" => Ok(Self::Monthly),
            other => Err(UnknownInterval(other.to_string())),
        }
    }
}

impl Interval {
    /// Rejects [Interval::Other].
    pub fn known(self) -> Result<Self, UnknownInterval> {
        match self {
            Self::Other(other) => Err(UnknownInterval(other)),
            known => Ok(known),
        }
    }
}

impl From<String> for Interval {
    fn from(value: String) -> Self {
        value.parse().unwrap_or(Self::Other(value))
    }
}

impl From<Interval> for String {
    fn from(value: Interval) -> Self {
        value.to_string()
    }
}

/// What a backup covers.
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq, ValueEnum, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    /// Archive of the schedule's paths.
    #[display("files")]
    Files,
    /// Dump of the application database.
    #[display("database")]
    Database,
    /// Files and database.
    #[display("both")]
    Both,
}

impl BackupType {
    pub fn includes_files(self) -> bool {
        matches!(self, Self::Files | Self::Both)
    }

    pub fn includes_database(self) -> bool {
        matches!(self, Self::Database | Self::Both)
    }
}

/// Only [ScheduleStatus::Active] schedules are evaluated by the runner.
#[derive(Copy, Clone, Debug, Display, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleStatus {
    #[default]
    #[display("active")]
    Active,
    #[display("paused")]
    Paused,
}

/// Time of day doesn't match `HH:MM` in 24-hour time.
#[derive(Debug, Display, Error)]
#[display("Time of day is not a valid HH:MM value: {_0}")]
pub struct InvalidTimeOfDay(#[error(ignore)] String);

/// Parses a `HH:MM` time of day.
pub fn parse_time_of_day(s: &str) -> Result<NaiveTime, InvalidTimeOfDay> {
    let captures = TIME_OF_DAY
        .captures(s)
        .ok_or_else(|| InvalidTimeOfDay(s.to_string()))?;

    // the regex limits both fields to valid ranges
    let hour = captures[1].parse().map_err(|_| InvalidTimeOfDay(s.to_string()))?;
    let minute = captures[2].parse().map_err(|_| InvalidTimeOfDay(s.to_string()))?;
    NaiveTime::from_hms_opt(hour, minute, 0).ok_or_else(|| InvalidTimeOfDay(s.to_string()))
}
