//! Deciding whether a [BackupSchedule] fires and when it fires next.
//!
//! Both functions take the reference instant explicitly and never read a
//! clock, so they are deterministic for a given input.

use chrono::{DateTime, Duration, Months, NaiveTime, Utc};

use super::{BackupSchedule, Interval};

/// Returns if the [BackupSchedule] should fire at `now`.
///
/// A schedule that never ran (no `next_run_at`) is always due.
/// The status of the schedule is not checked.
pub fn is_due(schedule: &BackupSchedule, now: DateTime<Utc>) -> bool {
    schedule
        .next_run_at
        .is_none_or(|next_run_at| now >= next_run_at)
}

enum Period {
    Days(i64),
    Months(u32),
}

/// Computes the next instant after `from` the [BackupSchedule] fires at.
///
/// Hourly schedules fire one hour after `from`. Every other interval fires at
/// the schedule's time of day (`00:00` if unset): today if that is still
/// ahead of `from`, otherwise one day, week or calendar month later. Adding a
/// month clamps to the last day of the target month, so Jan 31 is followed by
/// Feb 28 (or Feb 29 in leap years).
///
/// Unknown intervals and malformed times of day fall back to `from + 1 day`.
///
/// The result is always strictly after `from`.
pub fn compute_next_run_at(schedule: &BackupSchedule, from: DateTime<Utc>) -> DateTime<Utc> {
    let fallback = from + Duration::days(1);

    let period = match &schedule.interval {
        Interval::Hourly => return from + Duration::hours(1),
        Interval::Daily => Period::Days(1),
        Interval::Weekly => Period::Days(7),
        Interval::Monthly => Period::Months(1),
        Interval::Other(interval) => {
            log::warn!(target: "schedule", "Schedule {} has unknown interval '{interval}', running again in one day", schedule.id);
            return fallback;
        }
    };

    let time_of_day = match schedule.time_of_day() {
        Ok(time_of_day) => time_of_day.unwrap_or(NaiveTime::MIN),
        Err(e) => {
            log::warn!(target: "schedule", "Schedule {}: {e}, running again in one day", schedule.id);
            return fallback;
        }
    };

    let candidate = from.date_naive().and_time(time_of_day).and_utc();
    if from < candidate {
        return candidate;
    }

    match period {
        Period::Days(days) => candidate + Duration::days(days),
        Period::Months(months) => candidate
            .checked_add_months(Months::new(months))
            .unwrap_or(fallback),
    }
}
