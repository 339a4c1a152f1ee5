//! Cross-process advisory lock on one document.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;

use crate::error::{FleetError, FleetResult};

/// Upper bound of the random delay added to each poll.
const POLL_JITTER_MS: u64 = 20;

/// Exclusive lock held for the lifetime of the guard.
///
/// The underlying `flock` is released when the file handle closes, so every
/// exit path (including unwinding) releases it.
#[derive(Debug)]
pub struct DocumentLock {
    file: File,
    path: PathBuf,
}

impl DocumentLock {
    /// Poll for the lock until `timeout` elapses.
    ///
    /// Blocks the calling thread; async callers go through
    /// [`ConfigStore::load_async`](super::ConfigStore::load_async).
    pub fn acquire(path: &Path, timeout: Duration, poll_interval: Duration) -> FleetResult<Self> {
        let mut file = open_lock_file(path)?;

        let start = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) if still_linked(&file, path)? => {
                    tracing::trace!(path = %path.display(), "document lock acquired");
                    return Ok(Self {
                        file,
                        path: path.to_path_buf(),
                    });
                }
                Ok(()) => {
                    // A remover unlinked the file while we waited on it.
                    tracing::trace!(path = %path.display(), "lock file replaced, reopening");
                    file = open_lock_file(path)?;
                    continue;
                }
                Err(e) if is_contended(&e) => {}
                Err(e) => return Err(FleetError::io(path, e)),
            }

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(FleetError::LockTimeout {
                    path: path.to_path_buf(),
                    elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                });
            }
            let jitter = Duration::from_millis(rand::random::<u64>() % (POLL_JITTER_MS + 1));
            std::thread::sleep((poll_interval + jitter).min(timeout - elapsed));
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DocumentLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release document lock");
        }
    }
}

fn open_lock_file(path: &Path) -> FleetResult<File> {
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(|e| FleetError::io(path, e))
}

/// Whether `path` still names the file we hold open.
#[cfg(unix)]
fn still_linked(file: &File, path: &Path) -> FleetResult<bool> {
    use std::os::unix::fs::MetadataExt;

    let held = file.metadata().map_err(|e| FleetError::io(path, e))?;
    match std::fs::metadata(path) {
        Ok(current) => Ok(current.dev() == held.dev() && current.ino() == held.ino()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(FleetError::io(path, e)),
    }
}

#[cfg(not(unix))]
fn still_linked(_file: &File, _path: &Path) -> FleetResult<bool> {
    Ok(true)
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_times_out_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frpc.lock");

        let held = DocumentLock::acquire(&path, Duration::from_millis(200), Duration::from_millis(10)).unwrap();
        let err = DocumentLock::acquire(&path, Duration::from_millis(60), Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, FleetError::LockTimeout { .. }));

        drop(held);
        assert!(DocumentLock::acquire(&path, Duration::from_millis(60), Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn test_waiter_gets_lock_after_holder_finishes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frpc.lock");
        let held = DocumentLock::acquire(&path, Duration::from_secs(1), Duration::from_millis(10)).unwrap();

        let waiter_path = path.clone();
        let waiter = std::thread::spawn(move || {
            DocumentLock::acquire(&waiter_path, Duration::from_secs(2), Duration::from_millis(10)).is_ok()
        });
        std::thread::sleep(Duration::from_millis(50));
        drop(held);
        assert!(waiter.join().unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn test_waiter_on_unlinked_file_relocks_current_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frpc.lock");
        let held = DocumentLock::acquire(&path, Duration::from_secs(1), Duration::from_millis(10)).unwrap();

        let waiter_path = path.clone();
        let waiter = std::thread::spawn(move || {
            DocumentLock::acquire(&waiter_path, Duration::from_secs(2), Duration::from_millis(10)).unwrap()
        });
        std::thread::sleep(Duration::from_millis(50));
        std::fs::remove_file(&path).unwrap();
        drop(held);

        let relocked = waiter.join().unwrap();
        assert!(path.exists());
        // Only one holder: a newcomer on the current file must wait.
        let err = DocumentLock::acquire(&path, Duration::from_millis(60), Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, FleetError::LockTimeout { .. }));
        drop(relocked);
        assert!(DocumentLock::acquire(&path, Duration::from_millis(60), Duration::from_millis(10)).is_ok());
    }
}
