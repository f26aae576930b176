//! Statesync Store Server
//!
//! Hosts the dice race application behind a coordinator connection.
//! Configuration comes from the environment, see `StoreConfig`.

use std::sync::Arc;

use anyhow::Context as _;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use statesync::{
    app::dice::DiceGame,
    network::coordinator::{self, CoordinatorConfig},
    Journal, StoreConfig, StoreSupervisor, VERSION,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = StoreConfig::from_env().context("invalid configuration")?;
    let store_id = Uuid::new_v4();

    info!("Statesync Store v{}", VERSION);
    info!("Store ID: {}", store_id);
    info!("Coordinator: {}", config.coordinator_addr());
    info!("Data dir: {}", config.data_dir.display());

    let journal = Journal::open(&config.data_dir, config.sync_writes)
        .context("cannot open data directory")?;
    let existing = journal.sessions().context("cannot list journals")?;
    info!("{} session journals on disk", existing.len());

    let (client, handle, events) =
        coordinator::client(CoordinatorConfig::from_store_config(&config, store_id));
    let supervisor = Arc::new(StoreSupervisor::new(Arc::new(DiceGame), journal, handle));

    let (shutdown_tx, _) = broadcast::channel(1);

    let mut client_task = tokio::spawn(client.run(shutdown_tx.subscribe()));
    let supervisor_task = {
        let supervisor = supervisor.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        let tick_interval = config.tick_interval;
        let publish_interval = config.publish_interval;
        tokio::spawn(async move {
            supervisor
                .run(events, tick_interval, publish_interval, shutdown_rx)
                .await
        })
    };

    let client_result = tokio::select! {
        result = &mut client_task => Some(result),
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            let _ = shutdown_tx.send(());
            None
        }
    };

    let client_result = match client_result {
        Some(result) => result,
        None => client_task.await,
    };

    // The client owns the event sender, so the supervisor stops once it exits
    let _ = shutdown_tx.send(());
    supervisor_task.await.context("supervisor task panicked")?;

    match client_result.context("coordinator task panicked")? {
        Ok(()) => {
            info!("Stopped");
            Ok(())
        }
        Err(e) => {
            error!("Coordinator link failed: {}", e);
            Err(e.into())
        }
    }
}
