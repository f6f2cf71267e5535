use color_eyre::eyre::{eyre, Result};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use quorumkv_local_cluster::Cluster;
use quorumkv_raft::msg::NodeId;
use quorumkv_raft::RaftConfig;

/// Runs a three node cluster, fails its leader and shows the cluster
/// carrying on.
#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut cluster = Cluster::new(3, RaftConfig::default()).await?;
    let leader = wait_for_leader(&cluster).await?;
    let handle = cluster
        .handle(leader)
        .ok_or_else(|| eyre!("leader {leader} is gone"))?;

    for (key, value) in [("alpha", "1"), ("beta", "2"), ("gamma", "3")] {
        let response = handle.set(key, value).await?;
        tracing::info!(key, value, index = response.index, "Committed");
    }

    tracing::info!(node_id = leader, "Disconnecting leader");
    cluster.disconnect(leader).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    let new_leader = wait_for_leader(&cluster).await?;
    let handle = cluster
        .handle(new_leader)
        .ok_or_else(|| eyre!("leader {new_leader} is gone"))?;
    handle.set("alpha", "10").await?;

    cluster.heal().await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    let value = handle.read("alpha").await?;
    tracing::info!(node_id = new_leader, ?value, "Read alpha");
    for summary in cluster.summaries().await? {
        tracing::info!(
            node_id = summary.id,
            role = %summary.raft.role,
            term = summary.raft.current_term,
            commit_index = summary.raft.commit_index,
            "Node state"
        );
    }
    Ok(())
}

async fn wait_for_leader(cluster: &Cluster) -> Result<NodeId> {
    for _ in 0..50 {
        for summary in cluster.summaries().await? {
            if summary.raft.is_leader() && !summary.is_disconnected {
                return Ok(summary.id);
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    Err(eyre!("no leader elected"))
}
