use crate::driver::MountDriver;
use crate::error::DmsError;
use crate::external::{CredentialSource, TokenVerifier};
use crate::ledger::{Ledger, LedgerTransaction};
use crate::model::{BackupTarget, TargetKind};

/// outcome of a successful mount call.
pub struct MountOutcome {
    pub mount_path: String,
    /// this job retried onto an existing, not-yet-deleted ledger entry
    /// rather than taking a fresh one.
    pub reused_existing: bool,
    /// this call actually performed the underlying mount, as opposed to
    /// finding the target already mounted or joining another active job.
    pub physically_mounted: bool,
}

/// outcome of a successful unmount call.
pub struct UnmountOutcome {
    /// this call actually tore down the underlying mount, as opposed to
    /// just dropping this job's reference while others remain active.
    pub physically_unmounted: bool,
    /// active jobs still holding the target after this call.
    pub active_mounts_remaining: i64,
}

/// orchestrates the insert-then-count / soft-delete-then-count state machine
/// that gives atomic first-mount/last-unmount semantics under the
/// serializer lock. Grounded on
/// `original_source/trilio_dms/services/mount_service.py`. The caller
/// (`NodeDispatcher`) is responsible for holding the `Serializer` guard
/// around each call.
pub struct MountService<L: Ledger, NF: MountDriver, UF: MountDriver, C: CredentialSource, V: TokenVerifier> {
    ledger: L,
    net_fs: NF,
    user_fs: UF,
    credentials: C,
    verifier: V,
    node_id: String,
}

impl<L: Ledger, NF: MountDriver, UF: MountDriver, C: CredentialSource, V: TokenVerifier>
    MountService<L, NF, UF, C, V>
{
    pub fn new(
        ledger: L,
        net_fs: NF,
        user_fs: UF,
        credentials: C,
        verifier: V,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            ledger,
            net_fs,
            user_fs,
            credentials,
            verifier,
            node_id: node_id.into(),
        }
    }

    /// picks the driver matching the target's kind. Two concrete driver
    /// types (one per mount kind) stand in for the dynamic, string-keyed
    /// driver lookup of the original implementation.
    fn driver(&self, kind: TargetKind) -> &dyn MountDriver {
        match kind {
            TargetKind::NetFs => &self.net_fs,
            TargetKind::UserFs => &self.user_fs,
        }
    }

    pub async fn mount(
        &self,
        job_id: i64,
        target_id: &str,
        token: &str,
    ) -> Result<MountOutcome, DmsError> {
        self.verifier
            .verify(token)
            .await
            .map_err(|e| DmsError::AuthFailed(e.to_string()))?;

        let target = self
            .ledger
            .find_target(target_id)
            .await?
            .ok_or_else(|| DmsError::TargetNotFound(target_id.to_string()))?;

        if let Some(existing) = self
            .ledger
            .find_entry(job_id, target_id, &self.node_id)
            .await?
        {
            log::info!(
                "job {} already holds a ledger entry on target {}, reusing (mounted={})",
                job_id,
                target_id,
                existing.mounted
            );
            return Ok(MountOutcome {
                mount_path: target.mount_path.clone(),
                reused_existing: true,
                physically_mounted: false,
            });
        }

        let mut tx = self.ledger.begin().await?;
        let outcome = self
            .mount_in_transaction(&mut *tx, job_id, target_id, token, &target)
            .await;

        match &outcome {
            Ok(_) => tx.commit().await?,
            Err(_) => {
                if let Err(e) = tx.rollback().await {
                    log::error!("failed to roll back mount transaction for target {}: {}", target_id, e);
                }
            }
        }

        outcome
    }

    /// the part of `mount` that runs inside the ledger transaction: the
    /// insert and every `mounted`-flag update commit or roll back together,
    /// so a failed mount never leaves a stray ledger row behind.
    async fn mount_in_transaction(
        &self,
        tx: &mut dyn LedgerTransaction,
        job_id: i64,
        target_id: &str,
        token: &str,
        target: &BackupTarget,
    ) -> Result<MountOutcome, DmsError> {
        tx.create_entry(job_id, target_id, &self.node_id).await?;

        let active = tx.active_count(target_id, &self.node_id).await?;
        let mount_path = std::path::PathBuf::from(&target.mount_path);
        let already_mounted = self.driver(target.kind()).is_mounted(&mount_path).await;

        if already_mounted {
            log::info!("target {} already mounted on this node, marking row mounted", target_id);
            tx.set_mounted(target_id, &self.node_id, true).await?;
            return Ok(MountOutcome {
                mount_path: target.mount_path.clone(),
                reused_existing: false,
                physically_mounted: false,
            });
        }

        if active > 1 {
            // another active job is presumed to already hold the mount;
            // this job just joins the reference count.
            log::info!(
                "target {} has {} active jobs, joining existing mount for target",
                target_id,
                active
            );
            tx.set_mounted(target_id, &self.node_id, true).await?;
            return Ok(MountOutcome {
                mount_path: target.mount_path.clone(),
                reused_existing: false,
                physically_mounted: false,
            });
        }

        let credentials = match target.kind() {
            TargetKind::UserFs => {
                let credential_ref = target.credential_ref.as_deref().ok_or_else(|| {
                    DmsError::MountFailed(format!("target {} has no credential_ref", target_id))
                })?;
                self.credentials
                    .fetch(credential_ref, token)
                    .await
                    .map_err(|e| DmsError::CredentialFetchFailed(e.to_string()))?
            }
            TargetKind::NetFs => Default::default(),
        };

        let options = target.mount_options_or_default().to_string();
        self.driver(target.kind())
            .mount(target_id, &mount_path, &target.export, &options, &credentials)
            .await
            .map_err(|e| DmsError::MountFailed(e.to_string()))?;

        tx.set_mounted(target_id, &self.node_id, true).await?;
        Ok(MountOutcome {
            mount_path: target.mount_path.clone(),
            reused_existing: false,
            physically_mounted: true,
        })
    }

    pub async fn unmount(
        &self,
        job_id: i64,
        target_id: &str,
    ) -> Result<UnmountOutcome, DmsError> {
        let target = self
            .ledger
            .find_target(target_id)
            .await?
            .ok_or_else(|| DmsError::TargetNotFound(target_id.to_string()))?;

        let mut tx = self.ledger.begin().await?;
        let outcome = self
            .unmount_in_transaction(&mut *tx, job_id, target_id, &target)
            .await;

        match &outcome {
            Ok(_) => tx.commit().await?,
            Err(_) => {
                if let Err(e) = tx.rollback().await {
                    log::error!("failed to roll back unmount transaction for target {}: {}", target_id, e);
                }
            }
        }

        outcome
    }

    /// the part of `unmount` that runs inside the ledger transaction: the
    /// soft-delete and the final `mounted`-flag update commit or roll back
    /// together, so a failed physical unmount leaves the job's reference
    /// intact instead of silently dropping it.
    async fn unmount_in_transaction(
        &self,
        tx: &mut dyn LedgerTransaction,
        job_id: i64,
        target_id: &str,
        target: &BackupTarget,
    ) -> Result<UnmountOutcome, DmsError> {
        tx.soft_delete_entry(job_id, target_id, &self.node_id).await?;

        let active = tx.active_count(target_id, &self.node_id).await?;
        if active > 0 {
            return Ok(UnmountOutcome {
                physically_unmounted: false,
                active_mounts_remaining: active,
            });
        }

        let mount_path = std::path::PathBuf::from(&target.mount_path);
        let driver = self.driver(target.kind());
        if !driver.is_mounted(&mount_path).await {
            tx.set_mounted(target_id, &self.node_id, false).await?;
            return Ok(UnmountOutcome {
                physically_unmounted: false,
                active_mounts_remaining: 0,
            });
        }

        driver
            .unmount(target_id, &mount_path)
            .await
            .map_err(|e| DmsError::UnmountFailed(e.to_string()))?;

        tx.set_mounted(target_id, &self.node_id, false).await?;
        Ok(UnmountOutcome {
            physically_unmounted: true,
            active_mounts_remaining: 0,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::driver::MockMountDriver;
    use crate::external::{MockCredentialSource, MockTokenVerifier};
    use crate::ledger::{MockLedger, MockLedgerTransaction};
    use crate::model::{LedgerEntry, TargetKindColumn};
    use chrono::Utc;

    fn target(kind: TargetKind) -> BackupTarget {
        BackupTarget {
            id: "target-a".into(),
            kind: TargetKindColumn(kind),
            export: "10.0.0.5:/exports/backups".into(),
            mount_path: "/mnt/trilio/target-a".into(),
            mount_options: None,
            credential_ref: Some("secret-1".into()),
            status: "active".into(),
            deleted: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
        }
    }

    fn entry(job_id: i64, mounted: bool) -> LedgerEntry {
        LedgerEntry {
            id: 1,
            job_id,
            target_id: "target-a".into(),
            node_id: "node-1".into(),
            mounted,
            deleted: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
        }
    }

    #[tokio::test]
    async fn first_mount_performs_real_mount() {
        let mut ledger = MockLedger::new();
        let mut net_fs = MockMountDriver::new();
        let user_fs = MockMountDriver::new();
        let mut verifier = MockTokenVerifier::new();
        let credentials = MockCredentialSource::new();

        verifier.expect_verify().returning(|_| Ok(()));
        ledger
            .expect_find_target()
            .returning(|_| Ok(Some(target(TargetKind::NetFs))));
        ledger.expect_find_entry().returning(|_, _, _| Ok(None));
        ledger.expect_begin().return_once(|| {
            let mut tx = MockLedgerTransaction::new();
            tx.expect_create_entry()
                .returning(|job_id, _, _| Ok(entry(job_id, false)));
            tx.expect_active_count().returning(|_, _| Ok(1));
            tx.expect_set_mounted().returning(|_, _, _| Ok(()));
            tx.expect_commit().returning(|| Ok(()));
            Ok(Box::new(tx) as Box<dyn crate::ledger::LedgerTransaction>)
        });

        net_fs.expect_is_mounted().returning(|_| false);
        net_fs.expect_mount().returning(|_, _, _, _, _| Ok(()));

        let service = MountService::new(ledger, net_fs, user_fs, credentials, verifier, "node-1");
        let outcome = service.mount(1, "target-a", "tok").await.unwrap();
        assert_eq!(outcome.mount_path, "/mnt/trilio/target-a");
        assert!(!outcome.reused_existing);
        assert!(outcome.physically_mounted);
    }

    #[tokio::test]
    async fn second_active_job_joins_without_remounting() {
        let mut ledger = MockLedger::new();
        let net_fs = MockMountDriver::new();
        let user_fs = MockMountDriver::new();
        let mut verifier = MockTokenVerifier::new();
        let credentials = MockCredentialSource::new();

        verifier.expect_verify().returning(|_| Ok(()));
        ledger
            .expect_find_target()
            .returning(|_| Ok(Some(target(TargetKind::NetFs))));
        ledger.expect_find_entry().returning(|_, _, _| Ok(None));
        ledger.expect_begin().return_once(|| {
            let mut tx = MockLedgerTransaction::new();
            tx.expect_create_entry()
                .returning(|job_id, _, _| Ok(entry(job_id, false)));
            tx.expect_active_count().returning(|_, _| Ok(2));
            tx.expect_set_mounted().returning(|_, _, _| Ok(()));
            tx.expect_commit().returning(|| Ok(()));
            Ok(Box::new(tx) as Box<dyn crate::ledger::LedgerTransaction>)
        });

        let service = MountService::new(ledger, net_fs, user_fs, credentials, verifier, "node-1");
        let outcome = service.mount(2, "target-a", "tok").await.unwrap();
        assert_eq!(outcome.mount_path, "/mnt/trilio/target-a");
        assert!(!outcome.physically_mounted);
    }

    #[tokio::test]
    async fn retrying_the_same_job_reuses_existing_entry() {
        let mut ledger = MockLedger::new();
        let net_fs = MockMountDriver::new();
        let user_fs = MockMountDriver::new();
        let mut verifier = MockTokenVerifier::new();
        let credentials = MockCredentialSource::new();

        verifier.expect_verify().returning(|_| Ok(()));
        ledger
            .expect_find_target()
            .returning(|_| Ok(Some(target(TargetKind::NetFs))));
        ledger
            .expect_find_entry()
            .returning(|job_id, _, _| Ok(Some(entry(job_id, true))));

        let service = MountService::new(ledger, net_fs, user_fs, credentials, verifier, "node-1");
        let outcome = service.mount(1, "target-a", "tok").await.unwrap();
        assert_eq!(outcome.mount_path, "/mnt/trilio/target-a");
        assert!(outcome.reused_existing);
        assert!(!outcome.physically_mounted);
    }

    #[tokio::test]
    async fn mount_failure_rolls_back_the_ledger_row() {
        let mut ledger = MockLedger::new();
        let mut net_fs = MockMountDriver::new();
        let user_fs = MockMountDriver::new();
        let mut verifier = MockTokenVerifier::new();
        let credentials = MockCredentialSource::new();

        verifier.expect_verify().returning(|_| Ok(()));
        ledger
            .expect_find_target()
            .returning(|_| Ok(Some(target(TargetKind::NetFs))));
        ledger.expect_find_entry().returning(|_, _, _| Ok(None));
        ledger.expect_begin().return_once(|| {
            let mut tx = MockLedgerTransaction::new();
            tx.expect_create_entry()
                .returning(|job_id, _, _| Ok(entry(job_id, false)));
            tx.expect_active_count().returning(|_, _| Ok(1));
            tx.expect_rollback().returning(|| Ok(()));
            Ok(Box::new(tx) as Box<dyn crate::ledger::LedgerTransaction>)
        });

        net_fs.expect_is_mounted().returning(|_| false);
        net_fs
            .expect_mount()
            .returning(|_, _, _, _, _| Err(crate::driver::Error::Other("boom".into())));

        let service = MountService::new(ledger, net_fs, user_fs, credentials, verifier, "node-1");
        let err = service.mount(1, "target-a", "tok").await.unwrap_err();
        assert!(matches!(err, DmsError::MountFailed(_)));
    }

    #[tokio::test]
    async fn unmount_with_remaining_active_jobs_does_not_unmount() {
        let mut ledger = MockLedger::new();
        let net_fs = MockMountDriver::new();
        let user_fs = MockMountDriver::new();
        let verifier = MockTokenVerifier::new();
        let credentials = MockCredentialSource::new();

        ledger
            .expect_find_target()
            .returning(|_| Ok(Some(target(TargetKind::NetFs))));
        ledger.expect_begin().return_once(|| {
            let mut tx = MockLedgerTransaction::new();
            tx.expect_soft_delete_entry().returning(|_, _, _| Ok(()));
            tx.expect_active_count().returning(|_, _| Ok(1));
            tx.expect_commit().returning(|| Ok(()));
            Ok(Box::new(tx) as Box<dyn crate::ledger::LedgerTransaction>)
        });

        let service = MountService::new(ledger, net_fs, user_fs, credentials, verifier, "node-1");
        let outcome = service.unmount(1, "target-a").await.unwrap();
        assert!(!outcome.physically_unmounted);
        assert_eq!(outcome.active_mounts_remaining, 1);
    }

    #[tokio::test]
    async fn last_unmount_calls_driver_and_clears_flag() {
        let mut ledger = MockLedger::new();
        let mut net_fs = MockMountDriver::new();
        let user_fs = MockMountDriver::new();
        let verifier = MockTokenVerifier::new();
        let credentials = MockCredentialSource::new();

        ledger
            .expect_find_target()
            .returning(|_| Ok(Some(target(TargetKind::NetFs))));
        ledger.expect_begin().return_once(|| {
            let mut tx = MockLedgerTransaction::new();
            tx.expect_soft_delete_entry().returning(|_, _, _| Ok(()));
            tx.expect_active_count().returning(|_, _| Ok(0));
            tx.expect_set_mounted().returning(|_, _, _| Ok(()));
            tx.expect_commit().returning(|| Ok(()));
            Ok(Box::new(tx) as Box<dyn crate::ledger::LedgerTransaction>)
        });

        net_fs.expect_is_mounted().returning(|_| true);
        net_fs.expect_unmount().returning(|_, _| Ok(()));

        let service = MountService::new(ledger, net_fs, user_fs, credentials, verifier, "node-1");
        let outcome = service.unmount(1, "target-a").await.unwrap();
        assert!(outcome.physically_unmounted);
        assert_eq!(outcome.active_mounts_remaining, 0);
    }
}
