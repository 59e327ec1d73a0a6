// src/lock.rs

//! Single-instance lock for the daemon
//!
//! Every mutating operation assumes it is the only writer of the session
//! store and the installed package root. Within one process that is
//! guaranteed by the daemon's mutex; across processes by this lock, an
//! `flock(LOCK_EX)` held on `lock_path` for the daemon's lifetime. The holder
//! writes its PID into the lock file so a blocked invocation can name it.

use crate::error::{Error, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Exclusive daemon lock, released on drop
pub struct DaemonLock {
    #[allow(dead_code)]
    file: File,
    path: PathBuf,
}

impl DaemonLock {
    /// Acquire the lock without blocking
    ///
    /// Fails with an error naming the holder when another daemon runs.
    pub fn acquire<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                let holder = Self::holder_pid(&path)
                    .map(|pid| format!(" (pid {})", pid))
                    .unwrap_or_default();
                return Err(Error::IoError(format!(
                    "Another apexd instance holds {}{}",
                    path.display(),
                    holder
                )));
            }
            Err(e) => {
                return Err(Error::IoError(format!(
                    "Failed to lock {}: {}",
                    path.display(),
                    e
                )));
            }
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        write!(file, "{}", std::process::id())?;
        file.flush()?;

        tracing::info!("Acquired daemon lock at {}", path.display());
        Ok(Self { file, path })
    }

    /// Check whether any process currently holds the lock
    pub fn is_held<P: AsRef<Path>>(path: P) -> bool {
        let Ok(file) = File::open(path.as_ref()) else {
            return false;
        };
        match file.try_lock_exclusive() {
            Ok(()) => {
                let _ = file.unlock();
                false
            }
            Err(_) => true,
        }
    }

    /// PID recorded by the current (or last) holder
    pub fn holder_pid<P: AsRef<Path>>(path: P) -> Option<u32> {
        fs::read_to_string(path.as_ref())
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DaemonLock {
    fn drop(&mut self) {
        tracing::info!("Released daemon lock at {}", self.path.display());
    }
}
