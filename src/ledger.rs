use crate::model::{BackupTarget, LedgerEntry};
use async_trait::async_trait;
use sqlx::{PgPool, Postgres};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// durable store backing the mount ledger and backup target catalog.
/// Grounded on `original_source/trilio_dms/models/database.py`, re-expressed
/// as an explicitly constructed trait (no `DatabaseManager` singleton).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn find_target(&self, target_id: &str) -> Result<Option<BackupTarget>, Error>;

    /// the non-deleted ledger row for this exact (job, target, node), if any.
    async fn find_entry(
        &self,
        job_id: i64,
        target_id: &str,
        node_id: &str,
    ) -> Result<Option<LedgerEntry>, Error>;

    /// count of non-deleted ledger rows for (target, node) whose owning job
    /// is still active (STARTING/RUNNING and not deleted). Auto-commits;
    /// used standalone by the reconciler, which only ever performs single,
    /// independently idempotent corrections.
    async fn active_count(&self, target_id: &str, node_id: &str) -> Result<i64, Error>;

    /// set the `mounted` flag on every non-deleted ledger row for
    /// (target, node). Auto-commits; see `active_count`.
    async fn set_mounted(&self, target_id: &str, node_id: &str, mounted: bool) -> Result<(), Error>;

    /// distinct target ids with at least one non-deleted ledger row on this node.
    async fn targets_with_ledger_rows(&self, node_id: &str) -> Result<Vec<String>, Error>;

    /// opens a unit of work spanning the insert-then-count / soft-delete-
    /// then-count state machine `MountService` runs under the serializer
    /// lock. The caller must call exactly one of `commit`/`rollback` on the
    /// returned transaction before dropping it.
    async fn begin(&self) -> Result<Box<dyn LedgerTransaction>, Error>;
}

/// the mutating half of the ledger, scoped to one DB transaction. Grounded
/// on the same `original_source/trilio_dms/models/database.py` sequence as
/// `Ledger`, split out so `create_entry`/`active_count`/`set_mounted` commit
/// or roll back together instead of each auto-committing independently.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LedgerTransaction: Send {
    /// insert a new, not-yet-mounted ledger row.
    async fn create_entry(
        &mut self,
        job_id: i64,
        target_id: &str,
        node_id: &str,
    ) -> Result<LedgerEntry, Error>;

    /// soft-delete the ledger row for (job, target, node), if present.
    async fn soft_delete_entry(
        &mut self,
        job_id: i64,
        target_id: &str,
        node_id: &str,
    ) -> Result<(), Error>;

    async fn active_count(&mut self, target_id: &str, node_id: &str) -> Result<i64, Error>;

    async fn set_mounted(
        &mut self,
        target_id: &str,
        node_id: &str,
        mounted: bool,
    ) -> Result<(), Error>;

    async fn commit(&mut self) -> Result<(), Error>;

    async fn rollback(&mut self) -> Result<(), Error>;
}

/// `sqlx`-backed Postgres implementation.
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Ledger for PgLedger {
    async fn find_target(&self, target_id: &str) -> Result<Option<BackupTarget>, Error> {
        let target = sqlx::query_as::<_, BackupTarget>(
            "SELECT id, kind, export, mount_path, mount_options, credential_ref, status, deleted, created_at, updated_at, deleted_at \
             FROM backup_targets WHERE id = $1 AND deleted = FALSE",
        )
        .bind(target_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(target)
    }

    async fn find_entry(
        &self,
        job_id: i64,
        target_id: &str,
        node_id: &str,
    ) -> Result<Option<LedgerEntry>, Error> {
        let entry = sqlx::query_as::<_, LedgerEntry>(
            "SELECT id, job_id, target_id, node_id, mounted, deleted, created_at, updated_at, deleted_at \
             FROM backup_target_mount_ledger \
             WHERE job_id = $1 AND target_id = $2 AND node_id = $3 AND deleted = FALSE",
        )
        .bind(job_id)
        .bind(target_id)
        .bind(node_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(entry)
    }

    async fn active_count(&self, target_id: &str, node_id: &str) -> Result<i64, Error> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM backup_target_mount_ledger l \
             JOIN job j ON j.job_id = l.job_id \
             WHERE l.target_id = $1 AND l.node_id = $2 AND l.deleted = FALSE \
             AND j.deleted = FALSE AND j.status IN ('STARTING', 'RUNNING')",
        )
        .bind(target_id)
        .bind(node_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn set_mounted(&self, target_id: &str, node_id: &str, mounted: bool) -> Result<(), Error> {
        sqlx::query(
            "UPDATE backup_target_mount_ledger SET mounted = $1, updated_at = now() \
             WHERE target_id = $2 AND node_id = $3 AND deleted = FALSE",
        )
        .bind(mounted)
        .bind(target_id)
        .bind(node_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn targets_with_ledger_rows(&self, node_id: &str) -> Result<Vec<String>, Error> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT target_id FROM backup_target_mount_ledger \
             WHERE node_id = $1 AND deleted = FALSE",
        )
        .bind(node_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn begin(&self) -> Result<Box<dyn LedgerTransaction>, Error> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTransaction { tx: Some(tx) }))
    }
}

/// a single `backup_target_mount_ledger` unit of work. `tx` is `None` only
/// after `commit`/`rollback` has consumed it; every other method call on a
/// spent transaction is a logic error in the caller.
struct PgTransaction {
    tx: Option<sqlx::Transaction<'static, Postgres>>,
}

impl PgTransaction {
    fn conn(&mut self) -> &mut sqlx::Transaction<'static, Postgres> {
        self.tx
            .as_mut()
            .expect("ledger transaction used after commit/rollback")
    }
}

#[async_trait]
impl LedgerTransaction for PgTransaction {
    async fn create_entry(
        &mut self,
        job_id: i64,
        target_id: &str,
        node_id: &str,
    ) -> Result<LedgerEntry, Error> {
        let entry = sqlx::query_as::<_, LedgerEntry>(
            "INSERT INTO backup_target_mount_ledger (job_id, target_id, node_id, mounted, deleted) \
             VALUES ($1, $2, $3, FALSE, FALSE) \
             RETURNING id, job_id, target_id, node_id, mounted, deleted, created_at, updated_at, deleted_at",
        )
        .bind(job_id)
        .bind(target_id)
        .bind(node_id)
        .fetch_one(self.conn())
        .await?;
        Ok(entry)
    }

    async fn soft_delete_entry(
        &mut self,
        job_id: i64,
        target_id: &str,
        node_id: &str,
    ) -> Result<(), Error> {
        sqlx::query(
            "UPDATE backup_target_mount_ledger SET deleted = TRUE, deleted_at = now(), updated_at = now() \
             WHERE job_id = $1 AND target_id = $2 AND node_id = $3 AND deleted = FALSE",
        )
        .bind(job_id)
        .bind(target_id)
        .bind(node_id)
        .execute(self.conn())
        .await?;
        Ok(())
    }

    async fn active_count(&mut self, target_id: &str, node_id: &str) -> Result<i64, Error> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM backup_target_mount_ledger l \
             JOIN job j ON j.job_id = l.job_id \
             WHERE l.target_id = $1 AND l.node_id = $2 AND l.deleted = FALSE \
             AND j.deleted = FALSE AND j.status IN ('STARTING', 'RUNNING')",
        )
        .bind(target_id)
        .bind(node_id)
        .fetch_one(self.conn())
        .await?;
        Ok(count)
    }

    async fn set_mounted(
        &mut self,
        target_id: &str,
        node_id: &str,
        mounted: bool,
    ) -> Result<(), Error> {
        sqlx::query(
            "UPDATE backup_target_mount_ledger SET mounted = $1, updated_at = now() \
             WHERE target_id = $2 AND node_id = $3 AND deleted = FALSE",
        )
        .bind(mounted)
        .bind(target_id)
        .bind(node_id)
        .execute(self.conn())
        .await?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), Error> {
        self.tx
            .take()
            .expect("ledger transaction used after commit/rollback")
            .commit()
            .await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), Error> {
        self.tx
            .take()
            .expect("ledger transaction used after commit/rollback")
            .rollback()
            .await?;
        Ok(())
    }
}
