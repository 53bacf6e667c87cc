//! Advisory cross-process file locks on the canonical directory.
//!
//! One writer per workspace: the daemon holds `.opsd.lock` for its lifetime
//! (acquired with timeout 0, fail fast), offline CLI writes take `.ops.lock`
//! with a polled timeout. Locks are advisory coordination between opsbrain
//! processes, not a security boundary.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::time::{Duration, Instant};

use fd_lock::RwLock;

use obr_error::{OpsError, Result};

pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Held exclusive lock. The OS lock is tied to the file descriptor, which
/// lives inside `inner`; dropping the `FileLock` closes the fd and releases.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    _inner: RwLock<File>,
}

impl FileLock {
    /// Acquire the lock, retrying every [`POLL_INTERVAL`] until `timeout`
    /// elapses. A zero timeout makes a single attempt. The lock file is
    /// stamped with `pid=<pid>` on acquisition.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                OpsError::Io(format!("Failed to create {}: {e}", parent.display()))
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| OpsError::Io(format!("Failed to open lock {}: {e}", path.display())))?;

        let mut lock = RwLock::new(file);
        let start = Instant::now();
        loop {
            match lock.try_write() {
                Ok(mut guard) => {
                    guard.set_len(0).map_err(OpsError::from)?;
                    writeln!(&mut *guard, "pid={}", process::id()).map_err(OpsError::from)?;
                    guard.flush().map_err(OpsError::from)?;
                    // The guard's Drop would unlock; forget it so the lock
                    // survives this scope. Closing the fd releases it.
                    std::mem::forget(guard);
                    break;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if start.elapsed() >= timeout {
                        return Err(OpsError::Io(format!(
                            "Timeout acquiring lock: {}",
                            path.display()
                        )));
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(err) => {
                    return Err(OpsError::Io(format!(
                        "Failed to lock {}: {err}",
                        path.display()
                    )))
                }
            }
        }

        Ok(Self {
            path: path.to_path_buf(),
            _inner: lock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// CLI write-lock timeout: `OPS_LOCK_TIMEOUT` seconds, default 10.
pub fn cli_lock_timeout() -> Duration {
    std::env::var("OPS_LOCK_TIMEOUT")
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .map(Duration::from_secs_f64)
        .unwrap_or(Duration::from_secs(10))
}
