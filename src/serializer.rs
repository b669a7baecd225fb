use nix::fcntl::{flock, FlockArg};
use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("timed out acquiring lock for operation '{0}' after {1:?}")]
    Timeout(String, Duration),
}

/// cross-process mutual exclusion over a fixed-path lock file per operation
/// class, using a non-blocking `flock` with a polling retry loop. Grounded on
/// `original_source/trilio_dms/lock_manager.py`. One `Serializer` is
/// constructed per node (not a global singleton, per spec §9).
pub struct Serializer {
    lock_dir: PathBuf,
    timeout: Duration,
}

/// an acquired lock; dropping it releases the underlying flock.
pub struct Guard {
    _file: File,
}

impl Serializer {
    pub fn new(lock_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            lock_dir: lock_dir.into(),
            timeout,
        }
    }

    fn lock_path(&self, operation: &str) -> PathBuf {
        self.lock_dir.join(format!("dms_{operation}.lock"))
    }

    /// acquires the lock for `operation`, blocking the calling task (via a
    /// polling sleep, matching the original's `time.sleep(0.1)` loop) until
    /// acquired or `timeout` elapses.
    pub async fn acquire(&self, operation: &str) -> Result<Guard, Error> {
        std::fs::create_dir_all(&self.lock_dir)?;
        let path = self.lock_path(operation);
        let file = File::options().create(true).write(true).open(&path)?;

        let start = Instant::now();
        loop {
            let fd = file.as_raw_fd();
            match flock(fd, FlockArg::LockExclusiveNonblock) {
                Ok(()) => return Ok(Guard { _file: file }),
                Err(nix::errno::Errno::EWOULDBLOCK) => {
                    if start.elapsed() >= self.timeout {
                        return Err(Error::Timeout(operation.to_string(), self.timeout));
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                Err(e) => return Err(std::io::Error::from(e).into()),
            }
        }
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        let _ = flock(self._file.as_raw_fd(), FlockArg::Unlock);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn acquire_then_release_allows_reacquire() {
        let dir = tempfile::tempdir().unwrap();
        let serializer = Serializer::new(dir.path(), Duration::from_secs(1));

        let guard = serializer.acquire("mount_unmount").await.unwrap();
        drop(guard);

        let guard2 = serializer.acquire("mount_unmount").await.unwrap();
        drop(guard2);
    }

    #[tokio::test]
    async fn second_acquire_times_out_while_first_held() {
        let dir = tempfile::tempdir().unwrap();
        let serializer = Serializer::new(dir.path(), Duration::from_millis(300));

        let _guard = serializer.acquire("mount_unmount").await.unwrap();
        let err = serializer.acquire("mount_unmount").await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_, _)));
    }

    #[tokio::test]
    async fn distinct_operations_do_not_contend() {
        let dir = tempfile::tempdir().unwrap();
        let serializer = Serializer::new(dir.path(), Duration::from_millis(300));

        let _a = serializer.acquire("mount_unmount").await.unwrap();
        let _b = serializer.acquire("reconcile").await.unwrap();
    }
}
