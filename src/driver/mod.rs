mod env_map;
mod net_fs;
mod user_fs;

pub use env_map::build_environment;
pub use net_fs::NetFsDriver;
pub use user_fs::UserFsDriver;

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    System(#[from] crate::system::Error),

    #[error("mount path escapes mount base directory")]
    PathTraversal,

    #[error("{0}")]
    Other(String),
}

/// common capability set for any mount driver, independent of the
/// underlying transport (kernel mount vs. spawned FUSE process). A driver
/// never retries or makes scheduling decisions — it reports outcome only;
/// `MountService` owns every retry/serialization policy.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MountDriver: Send + Sync {
    async fn mount(
        &self,
        target_id: &str,
        mount_path: &Path,
        export: &str,
        options: &str,
        credentials: &HashMap<String, String>,
    ) -> Result<(), Error>;

    async fn unmount(&self, target_id: &str, mount_path: &Path) -> Result<(), Error>;

    async fn is_mounted(&self, mount_path: &Path) -> bool;
}
