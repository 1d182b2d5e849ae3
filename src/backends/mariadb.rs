//! Implements backup of the application database using [MariaDb].

use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};

use chrono::Utc;
use derive_more::{Display, Error, From};
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::backends::{Backup, BackupRequest};

const DEFAULT_DUMP_COMMAND: &str = "mariadb-dump";
const DEFAULT_DB: &str = "app";

/// The [MariaDb] backend dumps a database with `mariadb-dump` and compresses it.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MariaDb {
    /// Dump program, invoked as `<command> --opt --single-transaction --user=<user> <name>`.
    #[serde(default = "default_command")]
    pub command: String,
    /// Database to dump.
    pub name: String,
    /// Database user to dump as.
    pub user: String,
}

impl Default for MariaDb {
    fn default() -> Self {
        Self {
            command: default_command(),
            name: DEFAULT_DB.to_string(),
            user: DEFAULT_DB.to_string(),
        }
    }
}

fn default_command() -> String {
    DEFAULT_DUMP_COMMAND.to_string()
}

#[derive(Debug, Display, Error, From)]
/// Errors on backup of the database.
pub enum MariaDbBackupError {
    /// The dump program couldn't be started.
    #[display("Running {command} failed: {source}")]
    DumpNotRun { command: String, source: io::Error },
    /// The dump program exited unsuccessfully.
    #[display("{command} exited unsuccessfully: {status}")]
    DumpFailed { command: String, status: ExitStatus },
    /// Writing the dump failed.
    #[from]
    #[display("Writing the database dump failed: {_0}")]
    Io(io::Error),
}

impl MariaDb {
    fn generate_db_dump_filename(dest: &Path) -> PathBuf {
        let timestamp = Utc::now().format("%Y-%m-%dT%H-%M-%S%.3f");

        dest.join(format!("database-{timestamp}.sql.gz"))
    }

    fn dump(&self, db_dump_file: &Path, dry_run: bool) -> Result<(), MariaDbBackupError> {
        log::trace!(
            target: "backend::mariadb",
            "Running: {} --opt --single-transaction --user={} {}",
            self.command,
            self.user,
            self.name
        );

        let mut dump_process = Command::new(&self.command)
            .arg("--opt") // sensible dump defaults
            .arg("--single-transaction")
            .arg(format!("--user={}", self.user))
            .arg(&self.name)
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|source| MariaDbBackupError::DumpNotRun {
                command: self.command.clone(),
                source,
            })?;
        log::trace!(target: "backend::mariadb", "Started {} process.", self.command);

        // compress and capture stdout of the dump
        let stdout = dump_process
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("stdout of the dump process is not captured"))?;
        let mut reader = BufReader::new(stdout);
        let copied = if dry_run {
            log::trace!(target: "backend::mariadb", "Discarding output of {} on dry-run", self.command);
            io::copy(&mut reader, &mut io::sink()).map(|_| ())
        } else {
            File::create_new(db_dump_file).and_then(|file| {
                let mut encoder = GzEncoder::new(file, Compression::default());
                io::copy(&mut reader, &mut encoder)?;
                encoder.finish()?.sync_all()
            })
        };
        // closing the pipe lets a dump blocked on a full pipe exit
        drop(reader);

        if let Err(e) = copied {
            if let Err(kill_err) = dump_process.kill() {
                log::debug!(target: "backend::mariadb", "Killing {} failed: {kill_err}", self.command);
            }
            dump_process.wait()?;
            return Err(e.into());
        }

        let exit_status = dump_process.wait()?;

        if !exit_status.success() {
            return Err(MariaDbBackupError::DumpFailed {
                command: self.command.clone(),
                status: exit_status,
            });
        }

        Ok(())
    }
}

impl Backup for MariaDb {
    type Error = MariaDbBackupError;

    fn backup(
        &self,
        _request: &BackupRequest,
        dest: &Path,
        dry_run: bool,
    ) -> Result<PathBuf, Self::Error> {
        log::info!(target: "backend::mariadb", "Create database dump of: {}", self.name);
        log::trace!(target: "backend::mariadb", "Using user '{}' for backup", self.user);

        if !dry_run {
            fs::create_dir_all(dest)?;
        }
        let db_dump_file = Self::generate_db_dump_filename(dest);
        log::debug!(target: "backend::mariadb", "Save database dump at: {}", db_dump_file.display());

        if let Err(e) = self.dump(&db_dump_file, dry_run) {
            if !dry_run && db_dump_file.exists() {
                let _ = fs::remove_file(&db_dump_file);
            }
            return Err(e);
        }

        log::info!(target: "backend::mariadb", "Finished database dump of: {}", self.name);

        Ok(db_dump_file)
    }
}
