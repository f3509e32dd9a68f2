//! Exclusive ownership of a spool directory.
//!
//! The queue keeps its index in memory, so two processes mutating one spool
//! directory would each act on a stale view. Opening a queue for writing takes
//! an advisory `flock` on `<spool_dir>/.lock` and holds it for the life of the
//! [`DurableQueue`](crate::spool::DurableQueue). The holder's pid is written
//! into the file so a refused opener can say who owns the spool.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

/// Name of the lock file inside the spool directory.
pub const LOCK_FILE: &str = ".lock";

#[derive(Debug)]
pub enum LockError {
    /// Another open file description holds the lock.
    Held { pid: Option<u32> },
    Io(io::Error),
}

impl From<io::Error> for LockError {
    fn from(err: io::Error) -> Self {
        LockError::Io(err)
    }
}

/// Held exclusive lock on a spool directory. Released on drop.
#[derive(Debug)]
pub struct SpoolLock {
    file: File,
    path: PathBuf,
}

impl SpoolLock {
    /// Take the lock without blocking.
    pub fn acquire(dir: &Path) -> Result<Self, LockError> {
        let path = dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        if !try_lock(&file)? {
            return Err(LockError::Held {
                pid: read_pid(&path),
            });
        }

        file.set_len(0)?;
        let mut writer = &file;
        let _ = writer.write_all(std::process::id().to_string().as_bytes());
        let _ = writer.flush();

        Ok(SpoolLock { file, path })
    }

    /// Pid of the process holding the lock on `dir`, if any.
    ///
    /// Returns `None` when nobody holds it or the holder is unknown.
    pub fn holder(dir: &Path) -> Option<u32> {
        let path = dir.join(LOCK_FILE);
        let file = File::open(&path).ok()?;
        match try_lock(&file) {
            Ok(true) => {
                unlock(&file);
                None
            }
            Ok(false) => read_pid(&path),
            Err(_) => None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SpoolLock {
    fn drop(&mut self) {
        // The file stays: deleting it would let a waiter lock an unlinked inode
        unlock(&self.file);
    }
}

#[cfg(unix)]
fn try_lock(file: &File) -> io::Result<bool> {
    use std::os::unix::io::AsRawFd;

    // SAFETY: the fd is owned by `file` and stays open for the call
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.kind() == io::ErrorKind::WouldBlock {
        Ok(false)
    } else {
        Err(err)
    }
}

#[cfg(not(unix))]
fn try_lock(_file: &File) -> io::Result<bool> {
    Ok(true)
}

#[cfg(unix)]
fn unlock(file: &File) {
    use std::os::unix::io::AsRawFd;

    // SAFETY: as in `try_lock`
    unsafe {
        libc::flock(file.as_raw_fd(), libc::LOCK_UN);
    }
}

#[cfg(not(unix))]
fn unlock(_file: &File) {}

fn read_pid(path: &Path) -> Option<u32> {
    let mut contents = String::new();
    File::open(path).ok()?.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_acquire_is_refused_with_pid() {
        let dir = TempDir::new().unwrap();
        let held = SpoolLock::acquire(dir.path()).unwrap();

        match SpoolLock::acquire(dir.path()) {
            Err(LockError::Held { pid }) => assert_eq!(pid, Some(std::process::id())),
            other => panic!("expected lock contention, got {:?}", other),
        }
        assert_eq!(SpoolLock::holder(dir.path()), Some(std::process::id()));

        drop(held);
        assert_eq!(SpoolLock::holder(dir.path()), None);
        assert!(SpoolLock::acquire(dir.path()).is_ok());
    }

    #[test]
    fn test_holder_without_lock_file() {
        let dir = TempDir::new().unwrap();
        assert_eq!(SpoolLock::holder(dir.path()), None);
    }

    #[test]
    fn test_lock_file_survives_release() {
        let dir = TempDir::new().unwrap();
        let lock = SpoolLock::acquire(dir.path()).unwrap();
        let path = lock.path().to_path_buf();
        drop(lock);
        assert!(path.exists());
    }
}
