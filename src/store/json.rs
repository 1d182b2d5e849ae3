//! [ScheduleStore] backed by a single JSON file.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use super::{ScheduleStore, StoreError};
use crate::schedule::{parse_time_of_day, BackupSchedule, BackupType, Interval, ScheduleStatus};

/// Schedules stored as a JSON array in one file.
///
/// The file is re-read on every operation so separate processes see each
/// other's writes. Writes go to a temporary file that is renamed over the
/// store, a crash never leaves a half-written store behind.
#[derive(Debug, Clone)]
pub struct JsonStore {
    path: PathBuf,
}

/// A schedule to be created by [JsonStore::create].
#[derive(Debug, Clone)]
pub struct NewSchedule {
    pub interval: Interval,
    pub time_of_day: Option<String>,
    pub backup_type: BackupType,
    pub paths: Vec<PathBuf>,
    pub disk: String,
}

impl JsonStore {
    /// Opens the store at `path`. A missing file is an empty store.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if path.is_relative() {
            log::warn!(target: "store::json", "Schedule store path is relative: {}", path.display());
        }

        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn malformed(&self, source: serde_json::Error) -> StoreError {
        StoreError::Malformed {
            path: self.path.clone(),
            source,
        }
    }

    fn read(&self) -> Result<Vec<BackupSchedule>, StoreError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::debug!(target: "store::json", "Schedule store {} doesn't exist yet", self.path.display());
                return Ok(Vec::new());
            }
            Err(e) => return Err(self.io_error(e)),
        };

        serde_json::from_reader(BufReader::new(file)).map_err(|e| self.malformed(e))
    }

    fn write(&self, schedules: &[BackupSchedule]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }

        let mut tmp_name = self.path.clone().into_os_string();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        let file = File::create(&tmp_path).map_err(|e| self.io_error(e))?;
        let written = self
            .write_to(file, schedules)
            .and_then(|()| fs::rename(&tmp_path, &self.path).map_err(|e| self.io_error(e)));
        if let Err(e) = written {
            if let Err(remove_err) = fs::remove_file(&tmp_path) {
                log::warn!(target: "store::json", "Removing {} failed: {remove_err}", tmp_path.display());
            }
            return Err(e);
        }
        log::trace!(target: "store::json", "Wrote {} schedule(s) to {}", schedules.len(), self.path.display());

        Ok(())
    }

    fn write_to(&self, file: File, schedules: &[BackupSchedule]) -> Result<(), StoreError> {
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, schedules).map_err(|source| {
            if source.is_io() {
                self.io_error(source.into())
            } else {
                StoreError::Serialize {
                    path: self.path.clone(),
                    source,
                }
            }
        })?;
        writer.flush().map_err(|e| self.io_error(e))?;
        writer
            .into_inner()
            .map_err(|e| self.io_error(e.into_error()))?
            .sync_all()
            .map_err(|e| self.io_error(e))
    }

    fn modify<T>(
        &self,
        f: impl FnOnce(&mut Vec<BackupSchedule>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut schedules = self.read()?;
        let value = f(&mut schedules)?;
        self.write(&schedules)?;
        Ok(value)
    }

    /// Every stored schedule, in storage order.
    pub fn all(&self) -> Result<Vec<BackupSchedule>, StoreError> {
        self.read()
    }

    pub fn get(&self, id: u64) -> Result<BackupSchedule, StoreError> {
        self.read()?
            .into_iter()
            .find(|s| s.id == id)
            .ok_or(StoreError::NotFound(id))
    }

    /// Creates an active schedule that is due right away.
    ///
    /// Unknown intervals and malformed times of day are rejected.
    pub fn create(&self, new: NewSchedule) -> Result<BackupSchedule, StoreError> {
        let interval = new.interval.known()?;
        if let Some(time_of_day) = &new.time_of_day {
            parse_time_of_day(time_of_day)?;
        }

        self.modify(|schedules| {
            let id = schedules.iter().map(|s| s.id).max().unwrap_or(0) + 1;
            let schedule = BackupSchedule {
                id,
                interval,
                time_of_day: new.time_of_day,
                backup_type: new.backup_type,
                paths: new.paths,
                disk: new.disk,
                status: ScheduleStatus::Active,
                last_run_at: None,
                next_run_at: None,
            };
            log::info!(target: "store::json", "Created schedule {id}: {} {} backup to disk '{}'", schedule.interval, schedule.backup_type, schedule.disk);
            schedules.push(schedule.clone());
            Ok(schedule)
        })
    }

    /// Pauses or resumes a schedule.
    pub fn set_status(&self, id: u64, status: ScheduleStatus) -> Result<(), StoreError> {
        self.modify(|schedules| {
            let schedule = schedules
                .iter_mut()
                .find(|s| s.id == id)
                .ok_or(StoreError::NotFound(id))?;
            schedule.status = status;
            log::info!(target: "store::json", "Schedule {id} is now {status}");
            Ok(())
        })
    }

    pub fn remove(&self, id: u64) -> Result<BackupSchedule, StoreError> {
        self.modify(|schedules| {
            let index = schedules
                .iter()
                .position(|s| s.id == id)
                .ok_or(StoreError::NotFound(id))?;
            log::info!(target: "store::json", "Removed schedule {id}");
            Ok(schedules.remove(index))
        })
    }
}

impl ScheduleStore for JsonStore {
    fn list_active_schedules(&self) -> Result<Vec<BackupSchedule>, StoreError> {
        let schedules = self.read()?;
        Ok(schedules.into_iter().filter(BackupSchedule::is_active).collect())
    }

    fn record_run(
        &self,
        schedule: &BackupSchedule,
        expected_next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        self.modify(|schedules| {
            let stored = schedules
                .iter_mut()
                .find(|s| s.id == schedule.id)
                .ok_or(StoreError::NotFound(schedule.id))?;
            if !stored.is_active() || stored.next_run_at != expected_next_run_at {
                return Err(StoreError::Conflict(schedule.id));
            }
            stored.last_run_at = schedule.last_run_at;
            stored.next_run_at = schedule.next_run_at;
            Ok(())
        })
    }
}
