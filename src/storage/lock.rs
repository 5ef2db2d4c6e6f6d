//! Cross-process segment lock.
//!
//! The lock is an advisory `flock(2)` on a sibling lock file. The file is
//! opened fresh for every acquisition so that two threads of the same process
//! contend exactly like two processes do.

use crate::core::error::{PoolError, PoolResult};
use std::fs::{File, OpenOptions};
use std::path::Path;

/// Lock mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Many readers.
    Shared,
    /// One writer, no readers.
    Exclusive,
}

/// Held segment lock. Released on drop.
#[derive(Debug)]
pub struct SegmentLock {
    file: File,
    mode: LockMode,
}

impl SegmentLock {
    /// Block until the lock is acquired in the requested mode.
    pub fn acquire(path: &Path, mode: LockMode) -> PoolResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(|e| PoolError::io(format!("cannot open lock {}", path.display()), e))?;

        flock(&file, mode).map_err(|e| {
            PoolError::io(format!("cannot acquire lock {}", path.display()), e)
        })?;

        Ok(Self { file, mode })
    }

    /// Mode this lock was acquired in.
    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for SegmentLock {
    fn drop(&mut self) {
        // Closing the descriptor releases the lock too; unlock explicitly so
        // the release does not wait on the close.
        let _ = unlock(&self.file);
    }
}

#[cfg(unix)]
fn flock(file: &File, mode: LockMode) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let op = match mode {
        LockMode::Shared => libc::LOCK_SH,
        LockMode::Exclusive => libc::LOCK_EX,
    };
    loop {
        let rc = unsafe { libc::flock(file.as_raw_fd(), op) };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(unix)]
fn unlock(file: &File) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn flock(_file: &File, _mode: LockMode) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "segment locking requires flock(2)",
    ))
}

#[cfg(not(unix))]
fn unlock(_file: &File) -> std::io::Result<()> {
    Ok(())
}
