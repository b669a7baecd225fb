use anyhow::{Context, Result};
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use tokio::{fs::OpenOptions, io::AsyncBufRead, io::AsyncBufReadExt, io::BufReader};

const MOUNT_INFO: &str = "/proc/mounts";

/// bound on how long a stat+listdir staleness probe is allowed to take
/// before the mount is treated as stale/unreachable.
const STALE_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

pub struct Mount {
    pub source: String,
    pub target: PathBuf,
    pub filesystem: String,
    pub options: String,
    pub dump: u8,
    pub pass: u8,
}

impl Mount {
    /// read one of mount options. Returns Some(Value) if flag is set.
    /// if flag has a value set (say subvol=abc) the Value is of Some(&str), otherwise None
    ///
    /// if options = "ro,subvol=/abc"
    ///
    /// matches!(mount.option("rw"), None) == true
    /// matches!(mount.option("ro"), Some(None)) == true
    /// matches!(mount.option("subvol"), Some(Some(v)) if v == "/abc") == true
    pub fn option<K: AsRef<str>>(&self, key: K) -> Option<Option<&str>> {
        let key = key.as_ref();
        self.options
            .split(',')
            .map(|p| p.splitn(2, '=').collect::<Vec<&str>>())
            .filter(|i| i[0] == key)
            .map(|i| if i.len() == 2 { Some(i[1]) } else { None })
            .next()
    }
}

/// mountpoint returns mount information of target if mount exists
pub async fn mountpoint<P: AsRef<Path>>(target: P) -> Result<Option<Mount>> {
    let mounts = mounts().await?;
    let target = target.as_ref();
    Ok(mounts.into_iter().find(|m| m.target == target))
}

/// is_mounted is a plain presence check against /proc/mounts, no staleness probe.
pub async fn is_mounted<P: AsRef<Path>>(target: P) -> bool {
    matches!(mountpoint(target).await, Ok(Some(_)))
}

/// is_reachable performs a bounded stat+listdir probe on an already-mounted
/// path, to detect a mount whose backing process has died (stale handle).
/// Returns false on timeout or any I/O error, matching the "not accessible"
/// treatment of a hung NFS/FUSE mount.
pub async fn is_reachable<P: AsRef<Path>>(target: P) -> bool {
    let target = target.as_ref().to_path_buf();
    let probe = async {
        if tokio::fs::metadata(&target).await.is_err() {
            return false;
        }
        tokio::fs::read_dir(&target).await.is_ok()
    };

    matches!(tokio::time::timeout(STALE_PROBE_TIMEOUT, probe).await, Ok(true))
}

/// list all mounts on the system
pub async fn mounts() -> Result<Vec<Mount>> {
    let file = OpenOptions::new().read(true).open(MOUNT_INFO).await?;

    parser_reader(BufReader::new(file)).await
}

async fn parser_reader<R: AsyncBufRead + Unpin>(reader: R) -> Result<Vec<Mount>> {
    let mut lines = reader.lines();
    let mut mounts = vec![];
    while let Some(line) = lines.next_line().await? {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() != 6 {
            log::error!("invalid mount info line '{}'", line);
            continue;
        }
        let mount = Mount {
            source: parts[0].into(),
            target: parts[1].into(),
            filesystem: parts[2].into(),
            options: parts[3].into(),
            dump: parts[4]
                .parse()
                .with_context(|| format!("invalid dump value from line {}", line))?,
            pass: parts[5]
                .parse()
                .with_context(|| format!("invalid pass value from line {}", line))?,
        };
        mounts.push(mount);
    }

    Ok(mounts)
}

#[cfg(test)]
mod test {
    use super::Mount;
    use std::path::PathBuf;
    use tokio::io::BufReader;

    const MOUNTS: &str = r#"
tmpfs / tmpfs rw,relatime,size=1572864k 0 0
proc /proc proc rw,relatime 0 0
sysfs /sys sysfs rw,relatime 0 0
10.0.0.5:/exports/backups /mnt/trilio/target-a nfs rw,relatime,vers=4.2 0 0
none /run/dms/userfs tmpfs rw,relatime,size=1024k 0 0
fuse /mnt/trilio/target-b fuse.s3vaultfuse rw,nosuid,nodev,relatime,user_id=0,group_id=0,default_permissions,allow_other 0 0
    "#;

    #[test]
    fn mount_options() {
        let opt = Mount {
            options: "rw,relatime,vers=4.2".into(),
            filesystem: "nfs".into(),
            source: "10.0.0.5:/exports/backups".into(),
            target: "/mnt/trilio/target-a".into(),
            dump: 0,
            pass: 0,
        };

        assert!(matches!(opt.option("ro"), None));
        assert!(matches!(opt.option("rw"), Some(None)));
        assert!(matches!(opt.option("vers"), Some(Some(v)) if v == "4.2"));
    }

    #[tokio::test]
    async fn parser() {
        let mounts = super::parser_reader(BufReader::new(MOUNTS.as_bytes()))
            .await
            .expect("failed to parse mounts list");

        let nfs: Vec<&Mount> = mounts.iter().filter(|m| m.filesystem == "nfs").collect();
        assert_eq!(nfs.len(), 1);
        assert_eq!(nfs[0].target, PathBuf::from("/mnt/trilio/target-a"));

        let fuse: Vec<&Mount> = mounts
            .iter()
            .filter(|m| m.filesystem == "fuse.s3vaultfuse")
            .collect();
        assert_eq!(fuse.len(), 1);
    }

    #[tokio::test]
    async fn parse_local() {
        let mnt = super::mountpoint("/")
            .await
            .expect("failed to read mountpoints");

        let mnt = mnt.expect("mount at / not found");

        assert_eq!(mnt.target, PathBuf::from("/"));
    }
}
