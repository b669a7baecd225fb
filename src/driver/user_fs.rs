use super::{env_map::build_environment, Error};
use crate::process_registry::ProcessRegistry;
use crate::system::{Command, Spawner};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;

/// grace period for SIGTERM before escalating to SIGKILL.
const TERMINATE_GRACE: Duration = Duration::from_secs(10);

/// mounts a user-space filesystem by spawning a long-lived child process in
/// its own session, and supervises it via a `ProcessRegistry`. Grounded on
/// `original_source/trilio_dms/s3vaultfuse_manager.py`. The registry is
/// shared (`Arc`) so every `UserFsDriver` constructed against the same pid
/// directory within a process — e.g. one for the dispatcher, one for the
/// reconciler — observes the same in-memory bookkeeping.
pub struct UserFsDriver<S: Spawner> {
    spawner: S,
    registry: Arc<ProcessRegistry>,
    binary: String,
}

impl<S: Spawner> UserFsDriver<S> {
    pub fn new(spawner: S, registry: Arc<ProcessRegistry>, binary: impl Into<String>) -> Self {
        Self {
            spawner,
            registry,
            binary: binary.into(),
        }
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }
}

#[async_trait]
impl<S: Spawner + Send + Sync> super::MountDriver for UserFsDriver<S> {
    async fn mount(
        &self,
        target_id: &str,
        mount_path: &Path,
        export: &str,
        _options: &str,
        credentials: &HashMap<String, String>,
    ) -> Result<(), Error> {
        if self.registry.is_alive(target_id) {
            // already running for this target: nothing to do.
            return Ok(());
        }

        fs::create_dir_all(mount_path).await?;

        let env = build_environment(export, mount_path, credentials);
        let cmd = Command::new(&self.binary).arg(mount_path.as_os_str());

        let mut child = self.spawner.spawn(&cmd, &env).await?;

        // first check: did it exit immediately?
        tokio::time::sleep(Duration::from_millis(500)).await;
        if child.has_exited()? {
            return Err(Error::Other(format!(
                "{} exited immediately after spawn for target {}",
                self.binary, target_id
            )));
        }

        self.registry
            .register(target_id, child.pid, mount_path)
            .await
            .map_err(|e| Error::Other(e.to_string()))?;

        // second check: still alive and actually mounted after settling.
        tokio::time::sleep(Duration::from_secs(2)).await;
        if !self.registry.is_alive(target_id) || !self.is_mounted(mount_path).await {
            self.registry
                .forget(target_id)
                .await
                .map_err(|e| Error::Other(e.to_string()))?;
            return Err(Error::Other(format!(
                "{} for target {} died or never mounted {}",
                self.binary,
                target_id,
                mount_path.display()
            )));
        }

        Ok(())
    }

    async fn unmount(&self, target_id: &str, _mount_path: &Path) -> Result<(), Error> {
        self.registry
            .terminate(target_id, TERMINATE_GRACE)
            .await
            .map_err(|e| Error::Other(e.to_string()))
    }

    async fn is_mounted(&self, mount_path: &Path) -> bool {
        crate::mount_table::is_mounted(mount_path).await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::driver::MountDriver;
    use crate::system::MockSpawner;

    #[tokio::test]
    async fn mount_is_noop_when_already_alive() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ProcessRegistry::new(dir.path()).await.unwrap());
        registry
            .register("target-a", std::process::id() as i32, dir.path())
            .await
            .unwrap();

        let spawner = MockSpawner::default();
        let driver = UserFsDriver::new(spawner, registry, "/usr/bin/userfs");

        let result = driver
            .mount(
                "target-a",
                dir.path(),
                "export",
                "defaults",
                &Default::default(),
            )
            .await;

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn unmount_unknown_target_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ProcessRegistry::new(dir.path()).await.unwrap());
        let spawner = MockSpawner::default();
        let driver = UserFsDriver::new(spawner, registry, "/usr/bin/userfs");

        driver.unmount("never-mounted", dir.path()).await.unwrap();
    }
}
