//! Backend modules for performing individual backup tasks.
//!
//! Currently the following backends are implemented:
//!
//! - [Files]: Compressed tar archive of a list of paths.
//! - [MariaDb]: Compressed dump of the application's MariaDB database.
//!
//! [LocalBackupService] combines both into a [BackupService] writing to
//! local directories ("disks").

pub mod files;
pub mod mariadb;

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use derive_more::{Display, Error};

pub use files::Files;
pub use mariadb::MariaDb;

use crate::schedule::BackupType;

const FILES_BACKUP_DEST: &str = "files/";
const DB_DUMP_DEST: &str = "db/";
const DEFAULT_DISK: &str = "local";
const DEFAULT_DISK_ROOT: &str = "/var/backups/backup_cron/";

/// What to back up and where to.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct BackupRequest {
    pub backup_type: BackupType,
    pub paths: Vec<PathBuf>,
    pub disk: String,
}

/// Outcome of a backup that was started.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct BackupResult {
    pub succeeded: bool,
    pub message: String,
}

impl BackupResult {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            succeeded: true,
            message: message.into(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            message: message.into(),
        }
    }
}

/// Performs backups on behalf of the runner.
pub trait BackupService {
    /// Performs the requested backup.
    ///
    /// Failures of a backup that already started are reported as an
    /// unsuccessful [BackupResult]. A [DispatchError] means nothing was started.
    fn create_backup(&self, request: &BackupRequest) -> Result<BackupResult, DispatchError>;
}

impl<T: BackupService + ?Sized> BackupService for &T {
    fn create_backup(&self, request: &BackupRequest) -> Result<BackupResult, DispatchError> {
        (**self).create_backup(request)
    }
}

#[derive(Debug, Display, Error)]
/// Errors that prevent a backup from being started.
pub enum DispatchError {
    /// No disk with this name is configured.
    #[display("Disk '{_0}' is not configured")]
    UnknownDisk(#[error(ignore)] String),
    /// The disk's directory can't be created.
    #[display("Disk '{disk}' is unavailable: {source}")]
    DiskUnavailable { disk: String, source: io::Error },
}

#[allow(missing_docs)]
/// Generic backup backend.
pub trait Backup {
    /// Error that may happen on backup.
    type Error;

    /// Backups data described by `request` into the directory `dest`.
    ///
    /// Returns the path of the created backup file.
    ///
    /// # Dry Run
    ///
    /// On a dry run (`dry_run=true`) no files are altered.
    /// This does include folders and other special files.
    ///
    /// Instead the backup is produced and discarded to determine if a "real"
    /// backup would succeed under the present conditions.
    fn backup(
        &self,
        request: &BackupRequest,
        dest: &Path,
        dry_run: bool,
    ) -> Result<PathBuf, Self::Error>;
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
/// Configuration of all available backends.
pub struct BackendsConfig {
    /// Directories backups are written to, by disk name.
    pub disks: BTreeMap<String, PathBuf>,

    /// Configuration of the [MariaDb] backend.
    #[serde(default)]
    pub database: MariaDb,
}

impl Default for BackendsConfig {
    fn default() -> Self {
        Self {
            disks: BTreeMap::from([(DEFAULT_DISK.to_string(), PathBuf::from(DEFAULT_DISK_ROOT))]),
            database: MariaDb::default(),
        }
    }
}

/// [BackupService] running the [Files] and [MariaDb] backends on the local machine.
pub struct LocalBackupService {
    disks: BTreeMap<String, PathBuf>,
    files: Files,
    database: MariaDb,
    dry_run: bool,
}

impl LocalBackupService {
    pub fn with_config(config: BackendsConfig, dry_run: bool) -> Self {
        for (disk, root) in &config.disks {
            if root.is_relative() {
                log::warn!(target: "backend", "Root of disk '{disk}' is relative: {}", root.display());
            }
        }

        Self {
            disks: config.disks,
            files: Files,
            database: config.database,
            dry_run,
        }
    }

    fn run<B>(&self, backend: &B, name: &str, request: &BackupRequest, dest: &Path) -> Result<String, String>
    where
        B: Backup,
        B::Error: fmt::Display,
    {
        match backend.backup(request, dest, self.dry_run) {
            Ok(file) => Ok(format!("{name} backed up to {}", file.display())),
            Err(e) => {
                log::error!(target: "backend", "{name} backup to disk '{}' failed: {e}", request.disk);
                Err(format!("{name} backup failed: {e}"))
            }
        }
    }
}

impl BackupService for LocalBackupService {
    fn create_backup(&self, request: &BackupRequest) -> Result<BackupResult, DispatchError> {
        let root = self
            .disks
            .get(&request.disk)
            .ok_or_else(|| DispatchError::UnknownDisk(request.disk.clone()))?;

        if !self.dry_run {
            fs::create_dir_all(root).map_err(|source| DispatchError::DiskUnavailable {
                disk: request.disk.clone(),
                source,
            })?;
        }

        let mut results = Vec::new();
        if request.backup_type.includes_files() {
            results.push(self.run(&self.files, "files", request, &root.join(FILES_BACKUP_DEST)));
        }
        if request.backup_type.includes_database() {
            results.push(self.run(&self.database, "database", request, &root.join(DB_DUMP_DEST)));
        }

        let succeeded = results.iter().all(Result::is_ok);
        let message = results
            .into_iter()
            .map(|r| r.unwrap_or_else(|e| e))
            .collect::<Vec<_>>()
            .join("; ");

        Ok(BackupResult { succeeded, message })
    }
}
