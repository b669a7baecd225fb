use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::fs;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Nix(#[from] nix::Error),
    #[error("pid file for {0} is malformed")]
    MalformedPidFile(String),
}

/// what we know about a supervised child, independent of whether DMS
/// started it this run or adopted it from a PID file left by a previous run.
#[derive(Debug, Clone)]
pub struct ProcessRecord {
    pub pid: i32,
    pub mount_path: PathBuf,
    pub adopted: bool,
}

/// in-memory + PID-file-backed bookkeeping for user-space filesystem
/// children, one per target. Grounded on
/// `original_source/trilio_dms/s3vaultfuse_manager.py` (`self.processes`,
/// `_load_existing_pids`, `_write_pid_file`/`_read_pid_file`).
pub struct ProcessRegistry {
    pid_dir: PathBuf,
    processes: Mutex<HashMap<String, ProcessRecord>>,
}

impl ProcessRegistry {
    pub async fn new(pid_dir: impl Into<PathBuf>) -> Result<Self, Error> {
        let pid_dir = pid_dir.into();
        fs::create_dir_all(&pid_dir).await?;
        Ok(Self {
            pid_dir,
            processes: Mutex::new(HashMap::new()),
        })
    }

    fn pid_file_path(&self, target_id: &str) -> PathBuf {
        self.pid_dir.join(format!("{target_id}.pid"))
    }

    /// scans the PID directory at startup, adopting any PID file whose
    /// process is still alive into the in-memory registry.
    pub async fn load_existing(&self, mount_paths: &HashMap<String, PathBuf>) -> Result<(), Error> {
        let mut entries = fs::read_dir(&self.pid_dir).await?;
        let mut loaded = HashMap::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("pid") {
                continue;
            }
            let target_id = match path.file_stem().and_then(|s| s.to_str()) {
                Some(id) => id.to_string(),
                None => continue,
            };

            let pid = match self.read_pid_file(&target_id).await {
                Ok(pid) => pid,
                Err(e) => {
                    log::warn!("skipping malformed pid file for {}: {}", target_id, e);
                    continue;
                }
            };

            if !process_alive(pid) {
                log::info!("pid {} for {} is dead, removing stale pid file", pid, target_id);
                let _ = self.delete_pid_file(&target_id).await;
                continue;
            }

            let mount_path = match mount_paths
                .get(&target_id)
                .cloned()
                .or(mount_path_from_cmdline(pid).await)
            {
                Some(path) => path,
                None => {
                    log::warn!(
                        "could not recover mount path for adopted pid {} (target {}) from /proc or the ledger",
                        pid,
                        target_id
                    );
                    PathBuf::from("/")
                }
            };

            loaded.insert(
                target_id.clone(),
                ProcessRecord {
                    pid,
                    mount_path,
                    adopted: true,
                },
            );
            log::info!("adopted running process pid {} for target {}", pid, target_id);
        }

        self.processes.lock().unwrap().extend(loaded);
        Ok(())
    }

    pub fn get(&self, target_id: &str) -> Option<ProcessRecord> {
        self.processes.lock().unwrap().get(target_id).cloned()
    }

    pub fn is_alive(&self, target_id: &str) -> bool {
        match self.get(target_id) {
            Some(rec) => process_alive(rec.pid),
            None => false,
        }
    }

    /// waitpid-equivalent sweep: any registered target whose process has
    /// exited is logged and released. Adopted processes are not children of
    /// this process, so liveness is checked via `kill(pid, 0)` rather than a
    /// real `waitpid`, which only reaps this process's own children.
    pub async fn reap(&self) -> usize {
        let dead: Vec<String> = {
            let processes = self.processes.lock().unwrap();
            processes
                .iter()
                .filter(|(_, rec)| !process_alive(rec.pid))
                .map(|(target_id, _)| target_id.clone())
                .collect()
        };

        for target_id in &dead {
            log::info!("reaped exited process for target {}", target_id);
            if let Err(e) = self.forget(target_id).await {
                log::warn!("failed to clean up pid file for {} after reap: {}", target_id, e);
            }
        }

        dead.len()
    }

    pub async fn register(
        &self,
        target_id: &str,
        pid: i32,
        mount_path: &Path,
    ) -> Result<(), Error> {
        self.write_pid_file(target_id, pid).await?;
        self.processes.lock().unwrap().insert(
            target_id.to_string(),
            ProcessRecord {
                pid,
                mount_path: mount_path.to_path_buf(),
                adopted: false,
            },
        );
        Ok(())
    }

    pub async fn forget(&self, target_id: &str) -> Result<(), Error> {
        self.processes.lock().unwrap().remove(target_id);
        self.delete_pid_file(target_id).await
    }

    /// SIGTERM the process group, wait up to `grace` for exit, SIGKILL if
    /// still alive.
    pub async fn terminate(&self, target_id: &str, grace: Duration) -> Result<(), Error> {
        let pid = match self.get(target_id) {
            Some(rec) => rec.pid,
            None => return Ok(()),
        };

        let pgid = Pid::from_raw(pid);
        if signal::killpg(pgid, Signal::SIGTERM).is_err() {
            // already gone
            return self.forget(target_id).await;
        }

        let deadline = tokio::time::Instant::now() + grace;
        while tokio::time::Instant::now() < deadline {
            if !process_alive(pid) {
                return self.forget(target_id).await;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        if process_alive(pid) {
            log::warn!("target {} did not exit after SIGTERM, sending SIGKILL", target_id);
            let _ = signal::killpg(pgid, Signal::SIGKILL);
        }

        self.forget(target_id).await
    }

    async fn write_pid_file(&self, target_id: &str, pid: i32) -> Result<(), Error> {
        fs::write(self.pid_file_path(target_id), pid.to_string()).await?;
        Ok(())
    }

    async fn read_pid_file(&self, target_id: &str) -> Result<i32, Error> {
        let content = fs::read_to_string(self.pid_file_path(target_id)).await?;
        content
            .trim()
            .parse()
            .map_err(|_| Error::MalformedPidFile(target_id.to_string()))
    }

    async fn delete_pid_file(&self, target_id: &str) -> Result<(), Error> {
        match fs::remove_file(self.pid_file_path(target_id)).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn process_alive(pid: i32) -> bool {
    signal::kill(Pid::from_raw(pid), None).is_ok()
}

/// recovers the mount path a userfs child was spawned with by reading its
/// argv out of `/proc/<pid>/cmdline`: `UserFsDriver::mount` spawns the
/// binary with the mount path as its sole argument, so argv[1] is the path.
async fn mount_path_from_cmdline(pid: i32) -> Option<PathBuf> {
    let raw = fs::read(format!("/proc/{pid}/cmdline")).await.ok()?;
    let mut argv = raw.split(|b| *b == 0).filter(|s| !s.is_empty());
    argv.next()?; // argv[0]: the binary itself.
    let path_arg = argv.next()?;
    Some(PathBuf::from(std::str::from_utf8(path_arg).ok()?))
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn register_then_forget_round_trips_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ProcessRegistry::new(dir.path()).await.unwrap();

        registry.register("target-a", std::process::id() as i32, Path::new("/mnt/a")).await.unwrap();
        assert!(dir.path().join("target-a.pid").exists());
        assert!(registry.get("target-a").is_some());

        registry.forget("target-a").await.unwrap();
        assert!(!dir.path().join("target-a.pid").exists());
        assert!(registry.get("target-a").is_none());
    }

    #[tokio::test]
    async fn load_existing_adopts_live_process() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("target-a.pid"), std::process::id().to_string())
            .await
            .unwrap();

        let registry = ProcessRegistry::new(dir.path()).await.unwrap();
        registry.load_existing(&HashMap::new()).await.unwrap();

        let rec = registry.get("target-a").unwrap();
        assert!(rec.adopted);
        assert_eq!(rec.pid, std::process::id() as i32);
    }

    #[tokio::test]
    async fn load_existing_drops_dead_process() {
        let dir = tempfile::tempdir().unwrap();
        // pid 1 may be alive (root init) on some systems; use an unlikely huge pid instead.
        fs::write(dir.path().join("target-b.pid"), "999999").await.unwrap();

        let registry = ProcessRegistry::new(dir.path()).await.unwrap();
        registry.load_existing(&HashMap::new()).await.unwrap();

        assert!(registry.get("target-b").is_none());
        assert!(!dir.path().join("target-b.pid").exists());
    }
}
