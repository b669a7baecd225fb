use crate::driver::MountDriver;
use crate::ledger::Ledger;
use crate::model::TargetKind;
use std::path::PathBuf;

/// summary returned by `Reconciler::status`, matching
/// `original_source/trilio_dms/services/reconciliation.py::get_reconciliation_status`.
#[derive(Debug, Default, Clone)]
pub struct ReconciliationStatus {
    pub node_id: String,
    pub targets_checked: usize,
    pub inconsistencies_found: usize,
}

/// brings the ledger's `mounted` flags back in line with reality, at startup
/// and on a periodic interval. Grounded on
/// `original_source/trilio_dms/services/reconciliation.py`. Errors are
/// logged and never propagated — a broken target must not block
/// reconciliation of the rest.
pub struct Reconciler<L: Ledger, NF: MountDriver, UF: MountDriver> {
    ledger: L,
    net_fs: NF,
    user_fs: UF,
    node_id: String,
}

impl<L: Ledger, NF: MountDriver, UF: MountDriver> Reconciler<L, NF, UF> {
    pub fn new(ledger: L, net_fs: NF, user_fs: UF, node_id: impl Into<String>) -> Self {
        Self {
            ledger,
            net_fs,
            user_fs,
            node_id: node_id.into(),
        }
    }

    fn driver(&self, kind: TargetKind) -> &dyn MountDriver {
        match kind {
            TargetKind::NetFs => &self.net_fs,
            TargetKind::UserFs => &self.user_fs,
        }
    }

    /// runs one full convergence pass over every target with ledger rows on
    /// this node.
    pub async fn reconcile(&self) -> ReconciliationStatus {
        let mut status = ReconciliationStatus {
            node_id: self.node_id.clone(),
            ..Default::default()
        };

        let target_ids = match self.ledger.targets_with_ledger_rows(&self.node_id).await {
            Ok(ids) => ids,
            Err(e) => {
                log::error!("failed to list targets for reconciliation: {}", e);
                return status;
            }
        };

        for target_id in target_ids {
            status.targets_checked += 1;
            match self.reconcile_target(&target_id).await {
                Ok(changed) => {
                    if changed {
                        status.inconsistencies_found += 1;
                    }
                }
                Err(e) => {
                    log::error!("reconciliation failed for target {}: {}", target_id, e);
                }
            }
        }

        status
    }

    /// the 4-case convergence for a single target. Returns `Ok(true)` if an
    /// inconsistency was found and corrected.
    async fn reconcile_target(&self, target_id: &str) -> anyhow::Result<bool> {
        let target = match self.ledger.find_target(target_id).await? {
            Some(t) => t,
            None => {
                log::warn!("target {} referenced by ledger but no longer exists", target_id);
                return Ok(false);
            }
        };

        let active = self.ledger.active_count(target_id, &self.node_id).await?;
        let mount_path = PathBuf::from(&target.mount_path);
        let driver = self.driver(target.kind());
        let is_mounted = driver.is_mounted(&mount_path).await;

        match (active > 0, is_mounted) {
            (true, false) => {
                log::warn!(
                    "target {} has {} active jobs but is not mounted; cannot remount during reconciliation (no token available), jobs will retry on next operation",
                    target_id,
                    active
                );
                self.ledger.set_mounted(target_id, &self.node_id, false).await?;
                Ok(true)
            }
            (false, true) => {
                log::info!("target {} is mounted with no active jobs, unmounting", target_id);
                match driver.unmount(target_id, &mount_path).await {
                    Ok(()) => {
                        self.ledger.set_mounted(target_id, &self.node_id, false).await?;
                    }
                    Err(e) => {
                        log::error!("failed to unmount orphaned target {}: {}", target_id, e);
                    }
                }
                Ok(true)
            }
            (true, true) => {
                self.ledger.set_mounted(target_id, &self.node_id, true).await?;
                Ok(false)
            }
            (false, false) => {
                log::debug!("target {} consistent: no active jobs, not mounted", target_id);
                Ok(false)
            }
        }
    }

    pub async fn status(&self) -> ReconciliationStatus {
        self.reconcile().await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::driver::MockMountDriver;
    use crate::ledger::MockLedger;
    use crate::model::{BackupTarget, TargetKind, TargetKindColumn};
    use chrono::Utc;

    fn target() -> BackupTarget {
        BackupTarget {
            id: "target-a".into(),
            kind: TargetKindColumn(TargetKind::NetFs),
            export: "10.0.0.5:/exports/backups".into(),
            mount_path: "/mnt/trilio/target-a".into(),
            mount_options: None,
            credential_ref: None,
            status: "active".into(),
            deleted: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
        }
    }

    #[tokio::test]
    async fn orphaned_mount_gets_unmounted() {
        let mut ledger = MockLedger::new();
        let mut net_fs = MockMountDriver::new();
        let user_fs = MockMountDriver::new();

        ledger
            .expect_targets_with_ledger_rows()
            .returning(|_| Ok(vec!["target-a".to_string()]));
        ledger.expect_find_target().returning(|_| Ok(Some(target())));
        ledger.expect_active_count().returning(|_, _| Ok(0));
        ledger.expect_set_mounted().returning(|_, _, _| Ok(()));

        net_fs.expect_is_mounted().returning(|_| true);
        net_fs.expect_unmount().returning(|_, _| Ok(()));

        let reconciler = Reconciler::new(ledger, net_fs, user_fs, "node-1");
        let status = reconciler.reconcile().await;
        assert_eq!(status.targets_checked, 1);
        assert_eq!(status.inconsistencies_found, 1);
    }

    #[tokio::test]
    async fn consistent_target_reports_no_inconsistency() {
        let mut ledger = MockLedger::new();
        let mut net_fs = MockMountDriver::new();
        let user_fs = MockMountDriver::new();

        ledger
            .expect_targets_with_ledger_rows()
            .returning(|_| Ok(vec!["target-a".to_string()]));
        ledger.expect_find_target().returning(|_| Ok(Some(target())));
        ledger.expect_active_count().returning(|_, _| Ok(0));

        net_fs.expect_is_mounted().returning(|_| false);

        let reconciler = Reconciler::new(ledger, net_fs, user_fs, "node-1");
        let status = reconciler.reconcile().await;
        assert_eq!(status.inconsistencies_found, 0);
    }

    #[tokio::test]
    async fn active_but_unmounted_clears_flag_and_does_not_remount() {
        let mut ledger = MockLedger::new();
        let mut net_fs = MockMountDriver::new();
        let user_fs = MockMountDriver::new();

        ledger
            .expect_targets_with_ledger_rows()
            .returning(|_| Ok(vec!["target-a".to_string()]));
        ledger.expect_find_target().returning(|_| Ok(Some(target())));
        ledger.expect_active_count().returning(|_, _| Ok(2));
        ledger.expect_set_mounted().returning(|_, _, _| Ok(()));

        net_fs.expect_is_mounted().returning(|_| false);

        let reconciler = Reconciler::new(ledger, net_fs, user_fs, "node-1");
        let status = reconciler.reconcile().await;
        assert_eq!(status.inconsistencies_found, 1);
    }
}
