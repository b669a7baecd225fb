use super::Error;
use crate::mount_table;
use crate::system::{Command, Executor};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use tokio::fs;

/// mounts kernel-level network filesystems (NFS, CIFS, ...) via the `mount`
/// and `umount` binaries. Grounded on
/// `original_source/trilio_dms/drivers/nfs.py`.
pub struct NetFsDriver<E: Executor> {
    executor: E,
    fstype: String,
}

impl<E: Executor> NetFsDriver<E> {
    pub fn new(executor: E, fstype: impl Into<String>) -> Self {
        Self {
            executor,
            fstype: fstype.into(),
        }
    }

    async fn cleanup_stale_mount(&self, mount_path: &Path) -> bool {
        let lazy = Command::new("umount").arg("-l").arg(mount_path);
        if self.executor.run(&lazy).await.is_ok() {
            return true;
        }
        let force = Command::new("umount").arg("-f").arg("-l").arg(mount_path);
        self.executor.run(&force).await.is_ok()
    }
}

#[async_trait]
impl<E: Executor + Send + Sync> super::MountDriver for NetFsDriver<E> {
    async fn mount(
        &self,
        _target_id: &str,
        mount_path: &Path,
        export: &str,
        options: &str,
        _credentials: &HashMap<String, String>,
    ) -> Result<(), Error> {
        fs::create_dir_all(mount_path).await?;

        if self.is_mounted(mount_path).await {
            if mount_table::is_reachable(mount_path).await {
                return Ok(());
            }
            log::warn!(
                "mount at {} is stale, cleaning up before remount",
                mount_path.display()
            );
            if !self.cleanup_stale_mount(mount_path).await {
                return Err(Error::Other(format!(
                    "failed to clean up stale mount at {}",
                    mount_path.display()
                )));
            }
        }

        let cmd = Command::new("mount")
            .arg("-t")
            .arg(&self.fstype)
            .arg("-o")
            .arg(options)
            .arg(export)
            .arg(mount_path);

        self.executor.run(&cmd).await?;

        if !self.is_mounted(mount_path).await {
            return Err(Error::Other(format!(
                "mount command succeeded but {} is not mounted",
                mount_path.display()
            )));
        }

        Ok(())
    }

    async fn unmount(&self, _target_id: &str, mount_path: &Path) -> Result<(), Error> {
        if !self.is_mounted(mount_path).await {
            return Ok(());
        }

        let plain = Command::new("umount").arg(mount_path);
        if self.executor.run(&plain).await.is_ok() {
            return Ok(());
        }

        let lazy = Command::new("umount").arg("-l").arg(mount_path);
        if self.executor.run(&lazy).await.is_ok() {
            return Ok(());
        }

        let force = Command::new("umount").arg("-f").arg("-l").arg(mount_path);
        self.executor.run(&force).await?;
        Ok(())
    }

    async fn is_mounted(&self, mount_path: &Path) -> bool {
        mount_table::is_mounted(mount_path).await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::driver::MountDriver;
    use crate::system::MockExecutor;

    #[tokio::test]
    async fn mount_builds_expected_command() {
        let mut executor = MockExecutor::default();
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target-a");

        let expected = Command::new("mount")
            .arg("-t")
            .arg("nfs")
            .arg("-o")
            .arg("defaults")
            .arg("10.0.0.5:/exports/backups")
            .arg(target.as_os_str());

        executor
            .expect_run()
            .times(1)
            .withf(move |cmd: &Command| cmd == &expected)
            .returning(|_| Ok(Vec::default()));

        let driver = NetFsDriver::new(executor, "nfs");
        // is_mounted() will read the real /proc/mounts and report false for
        // our tempdir target, so the post-mount verification in mount()
        // will surface as an error — assert on the specific failure mode
        // rather than success, since there is no real NFS server in tests.
        let result = driver
            .mount(
                "target-a",
                &target,
                "10.0.0.5:/exports/backups",
                "defaults",
                &Default::default(),
            )
            .await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn unmount_is_idempotent_when_not_mounted() {
        let executor = MockExecutor::default();
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("not-mounted");

        let driver = NetFsDriver::new(executor, "nfs");
        driver.unmount("target-a", &target).await.unwrap();
    }
}
