use dms::config::Config;
use dms::dispatcher::NodeDispatcher;
use dms::driver::{NetFsDriver, UserFsDriver};
use dms::external::{HttpCredentialSource, NullTokenVerifier};
use dms::ledger::{Ledger, PgLedger};
use dms::process_registry::ProcessRegistry;
use dms::reconciler::Reconciler;
use dms::serializer::Serializer;
use dms::service::MountService;
use dms::system::System;
use sqlx::postgres::PgPoolOptions;
use std::collections::HashMap;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// runs the node's mount service: consumes the broker queue and runs
/// periodic reconciliation alongside it until either task exits. Grounded on
/// `examples/threefoldtech-zos-rs/src/bin/modules/storage/mod.rs`'s
/// `run()`.
pub async fn run(config: Config) -> Result<(), Box<dyn Error>> {
    log::info!("starting dms node {}", config.node_id);

    let pool = PgPoolOptions::new()
        .max_connections(config.db_pool_size)
        .connect(&config.db_url)
        .await?;
    let ledger = PgLedger::new(pool);

    let registry = Arc::new(ProcessRegistry::new(&config.userfs_pidfile_dir).await?);
    registry.load_existing(&known_mount_paths(&ledger, &config.node_id).await?).await?;

    let net_fs = NetFsDriver::new(System, config.netfs_type.clone());
    let user_fs = UserFsDriver::new(System, registry.clone(), config.userfs_binary.clone());

    let credentials = HttpCredentialSource::new(config.credential_store_url.clone());
    let verifier = NullTokenVerifier;

    let service = MountService::new(
        ledger,
        net_fs,
        user_fs,
        credentials,
        verifier,
        config.node_id.clone(),
    );

    let serializer = Serializer::new(&config.lock_dir, config.lock_timeout);

    let dispatcher = NodeDispatcher::connect(
        &config.rabbitmq_url,
        &config.rabbitmq_queue,
        config.node_id.clone(),
        config.rabbitmq_prefetch,
        service,
        serializer,
    )
    .await?;

    let reconcile_pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(&config.db_url)
        .await?;
    let reconcile_ledger = PgLedger::new(reconcile_pool);
    let reconcile_net_fs = NetFsDriver::new(System, config.netfs_type.clone());
    let reconcile_user_fs =
        UserFsDriver::new(System, registry.clone(), config.userfs_binary.clone());
    let reconciler = Reconciler::new(
        reconcile_ledger,
        reconcile_net_fs,
        reconcile_user_fs,
        config.node_id.clone(),
    );

    let reconcile_interval = config.reconcile_interval;
    let reconcile_loop = async move {
        let mut ticker = tokio::time::interval(reconcile_interval);
        ticker.tick().await; // first tick fires immediately; skip it.
        loop {
            ticker.tick().await;
            let status = reconciler.reconcile().await;
            if status.inconsistencies_found > 0 {
                log::warn!(
                    "reconciliation found {} inconsistenc{} across {} targets",
                    status.inconsistencies_found,
                    if status.inconsistencies_found == 1 { "y" } else { "ies" },
                    status.targets_checked
                );
            }
        }
    };

    let reap_registry = registry.clone();
    let reap_loop = async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        loop {
            ticker.tick().await;
            reap_registry.reap().await;
        }
    };

    tokio::select! {
        result = dispatcher.run() => {
            result.map_err(|e| -> Box<dyn Error> { Box::new(e) })
        }
        () = reconcile_loop => {
            unreachable!("reconcile loop never exits")
        }
        () = reap_loop => {
            unreachable!("reaper loop never exits")
        }
    }
}

/// mount paths for every target this node currently has ledger rows on, used
/// to cross-check adopted PIDs against the backup target catalog at startup.
async fn known_mount_paths(
    ledger: &PgLedger,
    node_id: &str,
) -> Result<HashMap<String, PathBuf>, Box<dyn Error>> {
    let mut paths = HashMap::new();
    for target_id in ledger.targets_with_ledger_rows(node_id).await? {
        if let Some(target) = ledger.find_target(&target_id).await? {
            paths.insert(target_id, PathBuf::from(target.mount_path));
        }
    }
    Ok(paths)
}
