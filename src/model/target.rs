use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// which family of driver a backup target requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    /// a kernel-mounted network filesystem (NFS, CIFS, ...).
    NetFs,
    /// a user-space/FUSE filesystem spawned as a child process.
    UserFs,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::NetFs => "net_fs",
            TargetKind::UserFs => "user_fs",
        }
    }
}

impl std::str::FromStr for TargetKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "net_fs" => Ok(TargetKind::NetFs),
            "user_fs" => Ok(TargetKind::UserFs),
            other => anyhow::bail!("unknown target kind '{}'", other),
        }
    }
}

/// a registered, mountable backup target. Rows are soft-deleted, never
/// physically removed (`deleted`/`deleted_at`).
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct BackupTarget {
    pub id: String,
    #[sqlx(try_from = "String")]
    pub kind: TargetKindColumn,
    pub export: String,
    pub mount_path: String,
    pub mount_options: Option<String>,
    pub credential_ref: Option<String>,
    pub status: String,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// newtype so sqlx can `try_from` the raw TEXT column into a `TargetKind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetKindColumn(pub TargetKind);

impl std::ops::Deref for TargetKindColumn {
    type Target = TargetKind;
    fn deref(&self) -> &TargetKind {
        &self.0
    }
}

impl TryFrom<String> for TargetKindColumn {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Ok(TargetKindColumn(value.parse()?))
    }
}

impl BackupTarget {
    /// mount options to pass to the net-fs driver, defaulting to "defaults"
    /// when the operator has not set any (matches the original's
    /// `get_nfs_mount_options`).
    pub fn mount_options_or_default(&self) -> &str {
        self.mount_options.as_deref().unwrap_or("defaults")
    }

    pub fn kind(&self) -> TargetKind {
        self.kind.0
    }
}

#[cfg(test)]
mod test {
    use super::TargetKind;
    use std::str::FromStr;

    #[test]
    fn round_trips_as_str() {
        assert_eq!(TargetKind::from_str("net_fs").unwrap(), TargetKind::NetFs);
        assert_eq!(TargetKind::from_str("user_fs").unwrap(), TargetKind::UserFs);
        assert!(TargetKind::from_str("bogus").is_err());
        assert_eq!(TargetKind::NetFs.as_str(), "net_fs");
    }
}
