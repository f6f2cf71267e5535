use std::sync::Arc;
use tokio::task::JoinHandle;

use quorumkv_raft::msg::NodeId;
use quorumkv_raft::{ClusterState, RaftConfig, RaftHandle, RaftNode, Result, TokioScheduler};

use crate::router::{Router, RouterTransport};

/// Simulates a node on a network but run locally.
pub struct LocalNode {
    pub id: NodeId,
    pub is_disconnected: bool,
    pub is_dead: bool,
    handle: RaftHandle,
    task: JoinHandle<()>,
}

/// What the test harness sees of a node.
#[derive(Clone, Debug)]
pub struct LocalNodeSummary {
    pub id: NodeId,
    pub is_disconnected: bool,
    pub raft: ClusterState,
}

impl PartialEq for LocalNodeSummary {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl LocalNode {
    pub async fn start(config: RaftConfig, router: Arc<Router>) -> Result<Self> {
        let id = config.node_id;
        let transport = Arc::new(RouterTransport::new(id, router.clone()));
        let (handle, task) = RaftNode::spawn(config, transport, Arc::new(TokioScheduler))?;
        router.register(id, handle.clone()).await;
        Ok(Self {
            id,
            is_disconnected: false,
            is_dead: false,
            handle,
            task,
        })
    }

    pub fn handle(&self) -> &RaftHandle {
        &self.handle
    }

    pub async fn summary(&self) -> Result<LocalNodeSummary> {
        Ok(LocalNodeSummary {
            id: self.id,
            is_disconnected: self.is_disconnected,
            raft: self.handle.state().await?,
        })
    }

    /// Stops the node for good. Its state is gone; it cannot be restarted.
    pub async fn kill(&mut self) {
        self.handle.shutdown().await;
        self.is_dead = true;
    }
}

impl Drop for LocalNode {
    fn drop(&mut self) {
        self.handle.shutdown_now();
        self.task.abort();
    }
}
