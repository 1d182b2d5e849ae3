//! Single-instance lock for overlapping cron invocations.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use derive_more::{Display, Error};

const ACQUIRE_ATTEMPTS: usize = 3;

/// A lock file containing the PID of its holder.
///
/// The PID is written to a temporary file that is hard linked into place, so
/// the lock file never exists without it. The file is removed when the [PidLock] is dropped. A lock file left behind
/// by a process that no longer exists is taken over.
#[derive(Debug)]
pub struct PidLock {
    path: PathBuf,
}

#[derive(Debug, Display, Error)]
#[display("Acquiring lock {} failed: {source}", path.display())]
/// Lock file can't be read or written.
pub struct LockError {
    path: PathBuf,
    source: io::Error,
}

impl PidLock {
    /// Acquires the lock at `path`.
    ///
    /// Returns [None] if another live process holds it.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Option<Self>, LockError> {
        let path = path.into();
        let pid = std::process::id().to_string();

        for _ in 0..ACQUIRE_ATTEMPTS {
            match publish(&path, &pid) {
                Ok(()) => {
                    log::debug!(target: "lock", "Acquired lock {}", path.display());
                    return Ok(Some(Self { path }));
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    let holder = match fs::read_to_string(&path) {
                        Ok(text) => text,
                        Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                        Err(e) => return Err(lock_error(&path, e)),
                    };

                    if let Some(holder_pid) = holder
                        .trim()
                        .parse::<u32>()
                        .ok()
                        .filter(|holder_pid| is_alive(*holder_pid))
                    {
                        log::debug!(target: "lock", "Lock {} is held by process {holder_pid}", path.display());
                        return Ok(None);
                    }

                    log::warn!(target: "lock", "Removing stale lock {}", path.display());
                    remove_stale(&path, &holder, &pid).map_err(|e| lock_error(&path, e))?;
                }
                Err(e) => return Err(lock_error(&path, e)),
            }
        }

        Ok(None)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        let ours = fs::read_to_string(&self.path)
            .is_ok_and(|pid| pid.trim() == std::process::id().to_string());
        if ours {
            if let Err(e) = fs::remove_file(&self.path) {
                log::warn!(target: "lock", "Removing lock {} failed: {e}", self.path.display());
            }
        }
    }
}

/// `<lock>.<pid>.<suffix>` next to the lock file.
fn sibling(path: &Path, pid: &str, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{pid}.{suffix}"));
    PathBuf::from(name)
}

/// Links a complete lock file into place, the lock file is never seen without
/// its PID.
fn publish(path: &Path, pid: &str) -> io::Result<()> {
    let tmp = sibling(path, pid, "tmp");
    let published = fs::write(&tmp, format!("{pid}\n")).and_then(|()| fs::hard_link(&tmp, path));
    match fs::remove_file(&tmp) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => log::warn!(target: "lock", "Removing {} failed: {e}", tmp.display()),
    }
    published
}

/// Removes the lock file if it still holds the `stale` contents.
///
/// The file is renamed aside before it is checked. A lock another process
/// published in the meantime is linked back into place.
fn remove_stale(path: &Path, stale: &str, pid: &str) -> io::Result<()> {
    let aside = sibling(path, pid, "stale");
    match fs::rename(path, &aside) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    }

    let restored = match fs::read_to_string(&aside) {
        Ok(text) if text == stale => Ok(()),
        Ok(_) => match fs::hard_link(&aside, path) {
            Err(e) if e.kind() != io::ErrorKind::AlreadyExists => Err(e),
            _ => Ok(()),
        },
        Err(e) => Err(e),
    };
    fs::remove_file(&aside)?;
    restored
}

fn lock_error(path: &Path, source: io::Error) -> LockError {
    LockError {
        path: path.to_path_buf(),
        source,
    }
}

fn is_alive(pid: u32) -> bool {
    let proc = Path::new("/proc");
    // without procfs there is no way to tell, assume the holder is alive
    !proc.is_dir() || proc.join(pid.to_string()).exists()
}
