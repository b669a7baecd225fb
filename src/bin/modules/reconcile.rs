use dms::config::Config;
use dms::driver::{NetFsDriver, UserFsDriver};
use dms::ledger::PgLedger;
use dms::process_registry::ProcessRegistry;
use dms::reconciler::Reconciler;
use dms::system::System;
use sqlx::postgres::PgPoolOptions;
use std::error::Error;
use std::sync::Arc;

/// runs a single reconciliation pass and exits, matching the `dms reconcile`
/// CLI surface.
pub async fn run(config: Config) -> Result<(), Box<dyn Error>> {
    log::info!("running one-shot reconciliation for node {}", config.node_id);

    let pool = PgPoolOptions::new()
        .max_connections(config.db_pool_size)
        .connect(&config.db_url)
        .await?;
    let ledger = PgLedger::new(pool);

    let registry = Arc::new(ProcessRegistry::new(&config.userfs_pidfile_dir).await?);
    let net_fs = NetFsDriver::new(System, config.netfs_type.clone());
    let user_fs = UserFsDriver::new(System, registry, config.userfs_binary.clone());

    let reconciler = Reconciler::new(ledger, net_fs, user_fs, config.node_id.clone());
    let status = reconciler.reconcile().await;

    log::info!(
        "reconciliation complete: {} targets checked, {} inconsistencies found",
        status.targets_checked,
        status.inconsistencies_found
    );

    Ok(())
}
