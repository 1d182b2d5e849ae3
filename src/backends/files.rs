//! Implements backup of arbitrary paths using [Files].

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use chrono::Utc;
use derive_more::{Display, Error, From};
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::backends::{Backup, BackupRequest};

/// The [Files] backend archives the requested paths into a `.tar.gz`.
///
/// Directories are added recursively. Inside the archive every path keeps its
/// location relative to the filesystem root, so `/srv/app/storage` is stored
/// as `srv/app/storage`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Files;

#[derive(Debug, Display, Error, From)]
/// Errors on backup of files.
pub enum FilesBackupError {
    /// The request doesn't contain any path.
    #[display("No paths to back up")]
    NoPaths,
    /// A requested path doesn't exist.
    #[display("Path to back up doesn't exist: {}", _0.display())]
    MissingPath(#[error(ignore)] PathBuf),
    /// Writing the archive failed.
    #[from]
    #[display("Writing the archive failed: {_0}")]
    Io(io::Error),
}

impl Files {
    fn generate_archive_filename(dest: &Path) -> PathBuf {
        let timestamp = Utc::now().format("%Y-%m-%dT%H-%M-%S%.3f");

        dest.join(format!("files-{timestamp}.tar.gz"))
    }

    fn archive_name(path: &Path) -> PathBuf {
        let name: PathBuf = path
            .components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .collect();

        if name.as_os_str().is_empty() {
            PathBuf::from(".")
        } else {
            name
        }
    }

    fn write_archive<W: Write>(paths: &[PathBuf], writer: W) -> io::Result<()> {
        let encoder = GzEncoder::new(writer, Compression::default());
        let mut archive = tar::Builder::new(encoder);
        archive.follow_symlinks(false);

        for path in paths {
            let name = Self::archive_name(path);
            if path.is_dir() {
                log::trace!(target: "backend::files", "Add directory {} as {}", path.display(), name.display());
                archive.append_dir_all(&name, path)?;
            } else {
                log::trace!(target: "backend::files", "Add file {} as {}", path.display(), name.display());
                archive.append_path_with_name(path, &name)?;
            }
        }

        archive.into_inner()?.finish()?;
        Ok(())
    }
}

impl Backup for Files {
    type Error = FilesBackupError;

    fn backup(
        &self,
        request: &BackupRequest,
        dest: &Path,
        dry_run: bool,
    ) -> Result<PathBuf, Self::Error> {
        if request.paths.is_empty() {
            return Err(FilesBackupError::NoPaths);
        }
        if let Some(missing) = request.paths.iter().find(|p| !p.exists()) {
            return Err(FilesBackupError::MissingPath(missing.clone()));
        }
        log::info!(target: "backend::files", "Create archive of {} path(s) on disk '{}'", request.paths.len(), request.disk);

        let archive_file = Self::generate_archive_filename(dest);
        log::debug!(target: "backend::files", "Save archive at: {}", archive_file.display());

        if dry_run {
            log::trace!(target: "backend::files", "Discarding archive on dry-run");
            Self::write_archive(&request.paths, io::sink())?;
        } else {
            fs::create_dir_all(dest)?;
            let file = File::create_new(&archive_file)?;
            if let Err(e) = Self::write_archive(&request.paths, &file) {
                drop(file);
                let _ = fs::remove_file(&archive_file);
                return Err(e.into());
            }
            file.sync_all()?;
        }

        log::info!(target: "backend::files", "Finished archive of {} path(s)", request.paths.len());

        Ok(archive_file)
    }
}
