//! AutonomousTrust node binary
//!
//! Runs a cluster of identity processes in one runtime and logs how their
//! membership converges.

use autotrust_node::{Cluster, NodeConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "autotrust=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = NodeConfig::from_env();
    tracing::info!(nodes = config.nodes, "Starting AutonomousTrust node");

    let cluster = Cluster::start(config.clone()).await?;
    match config.run_for {
        Some(duration) => tokio::time::sleep(duration).await,
        None => tokio::signal::ctrl_c().await?,
    }

    for view in cluster.views().await {
        tracing::info!(
            node = %view.nickname,
            peers = view.peers,
            group = view.group_members,
            history = view.history_length,
            "final view"
        );
    }
    cluster.shutdown().await?;
    Ok(())
}
