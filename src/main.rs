use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use grid_engine::start_server;
use grid_engine::ChannelListener;
use grid_engine::Error;
use grid_engine::Grid;
use grid_engine::GridBuilder;
use grid_engine::GridConfig;
use grid_engine::ListenerEvent;
use grid_engine::LocalNetwork;
use grid_engine::NodeId;
use grid_engine::Result;
use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;

/// Topic of the greeting every member sends to the owner of the demo item.
const HELLO_TOPIC: u32 = 1;

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> Result<()> {
    let config = GridConfig::new()?.validate()?;

    // Initializing Logs
    let _guard = init_observability(config.cluster.node_id, &config.cluster.log_dir)?;

    // Initializing Shutdown Signal
    let shutdown = CancellationToken::new();

    if config.monitoring.prometheus_enabled {
        tokio::spawn(start_server(config.monitoring.prometheus_port, shutdown.clone()));
    }

    // Every node group of the local cluster runs in this process
    let members = start_members(&config, shutdown.clone())?;
    for grid in members.iter().filter(|g| g.is_master()) {
        grid.await_available().await?;
    }
    info!(members = members.len(), "local cluster started");

    if let Err(e) = demo(&members).await {
        error!("demo failed: {:?}", e);
    }

    info!("Application started. Waiting for CTRL+C signal...");
    if let Err(e) = graceful_shutdown(shutdown.clone()).await {
        error!("Failed to shutdown: {:?}", e);
    }

    for grid in &members {
        if let Err(e) = grid.shutdown().await {
            warn!(node = grid.node_id(), "member shutdown failed: {:?}", e);
        }
    }
    println!("Exiting program.");
    Ok(())
}

fn start_members(
    config: &GridConfig,
    shutdown: CancellationToken,
) -> Result<Vec<Grid>> {
    let net = LocalNetwork::new();
    let db = grid_engine::open_main_memory_db(config)?;
    let first = config.cluster.node_id;

    let mut members = Vec::new();
    for offset in 0..config.cluster.local_nodes {
        let node: NodeId = first + offset;
        // the master joins first, slaves after it
        for _ in 0..=config.cluster.slaves_per_node {
            let mut member_config = config.clone();
            member_config.cluster.node_id = node;
            members.push(
                GridBuilder::new(member_config)
                    .network(net.clone())
                    .storage(db.clone())
                    .shutdown_signal(shutdown.child_token())
                    .build()?,
            );
        }
    }
    Ok(members)
}

/// Creates an item on the first node, reads it everywhere, moves it around
/// and greets its owner through the messenger.
async fn demo(members: &[Grid]) -> Result<()> {
    let masters: Vec<&Grid> = members.iter().filter(|g| g.is_master()).collect();
    let Some(first) = masters.first() else {
        return Ok(());
    };

    let id = first.store().put(Bytes::from_static(b"hello grid")).await?;
    let (listener, mut events) = ChannelListener::new();
    first.store().listen(id, Arc::new(listener));
    info!(id, node = first.node_id(), "demo item created");

    for grid in &masters {
        let data = grid.store().get(id).await?;
        info!(id, node = grid.node_id(), data = ?data, "read");
    }

    if let Some(last) = masters.last() {
        let version = last
            .store()
            .set(id, Bytes::from(format!("written by node {}", last.node_id())), None)
            .await?;
        info!(id, node = last.node_id(), version, "ownership moved");
        if let Ok(Some(ListenerEvent::Invalidated(_))) = timeout(Duration::from_secs(1), events.recv()).await {
            info!(id, node = first.node_id(), "copy invalidated");
        }
        for grid in &masters {
            grid.messenger()
                .send_to_owner_of(id, HELLO_TOPIC, Bytes::from(format!("hello from {}", grid.node_id())))
                .await?;
        }
    }

    for grid in &masters {
        info!(node = grid.node_id(), stats = ?grid.store().stats(), "cache statistics");
    }
    debug!(store = %first.engine().directory().db().dump()?, "backing store");
    Ok(())
}

async fn graceful_shutdown(shutdown: CancellationToken) -> Result<()> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => {
            info!("SIGINT detected.");
        },
        _ = sigterm.recv() => {
            info!("SIGTERM detected.");
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl+C detected.");
        },
    }

    info!("Shutdown server..");
    shutdown.cancel();
    Ok(())
}

pub fn init_observability(
    node_id: NodeId,
    log_dir: &Path,
) -> Result<WorkerGuard> {
    let dir = log_dir.join(node_id.to_string());
    std::fs::create_dir_all(&dir)?;
    let log_file = OpenOptions::new().create(true).append(true).open(dir.join("grid.log"))?;

    let (non_blocking, guard) = tracing_appender::non_blocking(log_file);
    let base_subscriber = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry()
        .with(base_subscriber)
        .try_init()
        .map_err(|e| Error::Fatal(format!("logger already initialized: {e}")))?;

    Ok(guard)
}
