//! Directory locks serializing writers of one cache scope.
//!
//! A scope directory holds the entries of a single report, combination or
//! merged table, so locking it serializes every writer of the same
//! fingerprint, across threads and processes alike.
//!
//! # Safety
//! - Lock is released when `FileLock` is dropped
//! - Lock file is created if it doesn't exist

use std::fs::{File, OpenOptions};
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::path::{Path, PathBuf};

/// Name of the lock file inside a locked directory.
pub const LOCK_FILE: &str = ".lock";

/// Exclusive lock on a directory.
///
/// Held for the lifetime of this struct.
#[derive(Debug)]
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    /// Acquires the lock, waiting for the current holder to release it.
    pub fn acquire(dir: &Path) -> IoResult<Self> {
        Self::open(dir, true)
    }

    /// Attempts to acquire the lock without waiting.
    ///
    /// # Errors
    /// - `ErrorKind::WouldBlock` if another holder has the lock
    pub fn try_acquire(dir: &Path) -> IoResult<Self> {
        Self::open(dir, false)
    }

    fn open(dir: &Path, wait: bool) -> IoResult<Self> {
        let lock_path = dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;

        Self::lock(&file, wait)?;

        Ok(Self {
            _file: file,
            path: lock_path,
        })
    }

    /// Returns the path to the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(unix)]
    fn lock(file: &File, wait: bool) -> IoResult<()> {
        use std::os::unix::io::AsRawFd;

        let fd = file.as_raw_fd();
        let flags = if wait { libc::LOCK_EX } else { libc::LOCK_EX | libc::LOCK_NB };
        loop {
            let result = unsafe { libc::flock(fd, flags) };
            if result == 0 {
                return Ok(());
            }
            let errno = IoError::last_os_error();
            match errno.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EWOULDBLOCK) => {
                    return Err(IoError::new(
                        ErrorKind::WouldBlock,
                        "cache scope is locked by another writer",
                    ))
                }
                _ => return Err(errno),
            }
        }
    }

    #[cfg(windows)]
    fn lock(file: &File, wait: bool) -> IoResult<()> {
        use std::os::windows::io::AsRawHandle;
        use windows_sys::Win32::Foundation::HANDLE;
        use windows_sys::Win32::Storage::FileSystem::{
            LockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
        };

        let handle = file.as_raw_handle() as HANDLE;
        let flags = if wait {
            LOCKFILE_EXCLUSIVE_LOCK
        } else {
            LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY
        };
        let result = unsafe {
            let mut overlapped = std::mem::zeroed::<windows_sys::Win32::System::IO::OVERLAPPED>();
            LockFileEx(handle, flags, 0, 1, 0, &mut overlapped)
        };

        if result == 0 {
            let err = IoError::last_os_error();
            return Err(IoError::new(
                ErrorKind::WouldBlock,
                format!("cache scope is locked by another writer: {err}"),
            ));
        }
        Ok(())
    }

    #[cfg(not(any(unix, windows)))]
    fn lock(_file: &File, _wait: bool) -> IoResult<()> {
        Err(IoError::new(
            ErrorKind::Unsupported,
            "file locking not supported on this platform",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn test_lock_acquire_release() {
        let dir = tempdir().unwrap();
        {
            let lock = FileLock::acquire(dir.path()).unwrap();
            assert!(lock.path().exists());
        }
        // Released on drop
        let _again = FileLock::try_acquire(dir.path()).unwrap();
    }

    #[test]
    fn test_try_acquire_fails_while_held() {
        let dir = tempdir().unwrap();
        let _lock = FileLock::acquire(dir.path()).unwrap();

        let err = FileLock::try_acquire(dir.path()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WouldBlock);
    }

    #[test]
    fn test_acquire_waits_for_release() {
        let dir = tempdir().unwrap();
        let lock = FileLock::acquire(dir.path()).unwrap();

        let (tx, rx) = mpsc::channel();
        let path = dir.path().to_path_buf();
        let waiter = thread::spawn(move || {
            let _lock = FileLock::acquire(&path).unwrap();
            tx.send(()).unwrap();
        });

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        drop(lock);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        waiter.join().unwrap();
    }
}
