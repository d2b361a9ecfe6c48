//! Main entry point for the Zeroth server.
//!
//! Wires storage, messaging and the consensus engine together, serves the
//! internal RPC endpoint and brings this node into group 0.

use std::sync::Arc;

use anyhow::anyhow;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use zeroth_api::{HttpMessagingService, MessagingService};
use zeroth_common::PrimaryContext;
use zeroth_consistency::raft::OpenRaftFactory;
use zeroth_consistency::{
    DirectFailureDetector, RaftAddressMap, RaftGroupRegistry, RocksSystemStorage, SystemKeyspace,
};
use zeroth_core::{Gossiper, RaftGroup0, StaticGossiper, register_ping_handler};
use zeroth_server::model::Configuration;
use zeroth_server::startup::{self, SetupOutcome, cancel_on_signal};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let configuration = Configuration::new()?;
    let _logging_guard = startup::init_logging(&configuration.logging_config())
        .map_err(|e| anyhow!("{}", e))?;

    let broadcast = configuration.broadcast_info();
    info!(
        "Starting zeroth-server at {} (raft enabled: {})",
        broadcast,
        configuration.raft_enabled()
    );

    // Group 0 state is only touched from this thread
    let (primary, primary_thread) = PrimaryContext::spawn_dedicated("zeroth-primary")?;

    let keyspace_dir = configuration.system_keyspace_dir();
    std::fs::create_dir_all(&keyspace_dir)?;
    let keyspace = SystemKeyspace::new(Arc::new(RocksSystemStorage::open(&keyspace_dir)?));

    let messaging: Arc<dyn MessagingService> =
        Arc::new(HttpMessagingService::new(broadcast.clone())?);
    register_ping_handler(messaging.as_ref());

    let direct_fd = Arc::new(DirectFailureDetector::new(configuration.fd_config()));
    let registry = Arc::new(RaftGroupRegistry::new(
        configuration.raft_enabled(),
        Arc::new(RaftAddressMap::new()),
        direct_fd.clone(),
    ));
    let factory = Arc::new(OpenRaftFactory::new(
        configuration.raft_config(),
        messaging.clone(),
        registry.address_map().clone(),
    ));
    let gossiper = Arc::new(StaticGossiper::new(
        configuration.seeds(),
        broadcast.clone(),
        messaging.clone(),
    ));

    let fd_stop = CancellationToken::new();
    let fd_task = tokio::spawn(
        direct_fd
            .clone()
            .run(gossiper.direct_fd_pinger(), fd_stop.clone()),
    );

    let abort = CancellationToken::new();
    let group0 = RaftGroup0::new(
        primary.clone(),
        abort.clone(),
        registry.clone(),
        messaging.clone(),
        gossiper.clone(),
        keyspace.clone(),
        factory.clone(),
    );

    let server = startup::rpc_server(
        messaging.clone(),
        configuration.server_address(),
        configuration.server_port(),
    )?;
    let server_handle = server.handle();
    let mut server_task = tokio::spawn(server);
    info!(
        "RPC endpoint listening on {}:{}",
        configuration.server_address(),
        configuration.server_port()
    );

    let signal_task = cancel_on_signal(abort.clone());

    let setup = {
        let group0 = group0.clone();
        let keyspace = keyspace.clone();
        primary.submit(async move {
            group0.setup_group0().await?;
            keyspace.set_bootstrap_complete().await
        })
    };
    // A failed setup leaves the node serving; only a shutdown signal ends it
    if startup::report_setup(setup.await, group0.group0_id()) == SetupOutcome::Failed {
        warn!("Serving at {} without group 0 membership", broadcast);
    }

    if let Some(result) = startup::run_with_shutdown(&mut server_task, &abort).await {
        warn!("RPC endpoint exited: {:?}", result);
        abort.cancel();
    }

    info!("Shutting down...");
    {
        let group0 = group0.clone();
        primary
            .submit(async move {
                group0.abort().await;
                Ok(())
            })
            .await?;
    }
    registry.abort().await;
    factory.shutdown();

    fd_stop.cancel();
    if let Err(e) = fd_task.await {
        warn!("Failure detector task failed: {}", e);
    }

    server_handle.stop(true).await;
    signal_task.abort();

    drop(group0);
    primary_thread.stop()?;
    info!("Shutdown complete");
    Ok(())
}
