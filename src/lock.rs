//! System-wide mutual exclusion for mutating operations.
//!
//! Upgrade and gc both take the same `flock(2)` lock before touching the ESP
//! or the btrfs volume. Contention fails immediately: there is no waiting and
//! no queue, the operator re-runs the command later.
//!
//! The lock belongs to the open file description, so the kernel drops it if
//! the process dies. [`LockGuard`] additionally unlocks when it goes out of
//! scope.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Held lock. Dropping it releases the lock.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    path: PathBuf,
}

impl LockGuard {
    /// Take the lock at `path` without blocking.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyRunning`] if another holder exists, [`Error::Io`] if
    /// the lock file cannot be created.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::io(format!("creating {}", parent.display()), e))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::io(format!("opening lock {}", path.display()), e))?;

        match try_flock_exclusive(&file) {
            Ok(true) => {
                log::debug!("acquired lock {}", path.display());
                Ok(Self {
                    file,
                    path: path.to_path_buf(),
                })
            }
            Ok(false) => Err(Error::AlreadyRunning {
                path: path.to_path_buf(),
            }),
            Err(e) => Err(Error::io(format!("locking {}", path.display()), e)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // SAFETY: the descriptor is owned by `self.file` and still open.
        let rc = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
        if rc != 0 {
            log::warn!(
                "failed to unlock {}: {}",
                self.path.display(),
                io::Error::last_os_error()
            );
        }
    }
}

/// Non-blocking exclusive flock. `Ok(false)` means someone else holds it.
fn try_flock_exclusive(file: &File) -> io::Result<bool> {
    // SAFETY: flock only inspects the descriptor, which `file` keeps open.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        return Ok(false);
    }
    Err(err)
}
