//! A Raft cluster run inside one process, with an in-memory network that
//! can be cut to simulate node failures and partitions.

use std::collections::BTreeMap;
use std::sync::Arc;

pub mod local_cluster_tester;
pub mod local_node;
pub mod router;

use crate::local_node::{LocalNode, LocalNodeSummary};
use crate::router::Router;
use quorumkv_raft::msg::NodeId;
use quorumkv_raft::{PeerConfig, RaftConfig, RaftError, RaftHandle, Result};

pub struct Cluster {
    router: Arc<Router>,
    nodes: BTreeMap<NodeId, LocalNode>,
    /// Settings shared by every node; ids, addresses and peers are filled in
    /// per node.
    template: RaftConfig,
}

impl Cluster {
    /// Starts `node_count` voters with ids `1..=node_count`.
    pub async fn new(node_count: u64, template: RaftConfig) -> Result<Self> {
        let router = Router::new();
        let ids: Vec<NodeId> = (1..=node_count).collect();
        let mut nodes = BTreeMap::new();
        for id in &ids {
            let peers = ids.iter().copied().filter(|peer| peer != id);
            let config = node_config(&template, *id, peers);
            nodes.insert(*id, LocalNode::start(config, router.clone()).await?);
        }
        tracing::info!(node_count, "Local cluster started");
        Ok(Self {
            router,
            nodes,
            template,
        })
    }

    /// Every node ever started, dead or alive.
    pub fn ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    pub fn live_ids(&self) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|node| !node.is_dead)
            .map(|node| node.id)
            .collect()
    }

    pub fn handle(&self, id: NodeId) -> Option<RaftHandle> {
        self.nodes
            .get(&id)
            .filter(|node| !node.is_dead)
            .map(|node| node.handle().clone())
    }

    /// Starts a fresh observer that knows the existing nodes as peers. It
    /// joins the cluster once the leader adds it.
    pub async fn spawn_node(&mut self, id: NodeId) -> Result<RaftHandle> {
        if self.nodes.contains_key(&id) {
            return Err(RaftError::InvalidConfig(format!("node {id} already exists")));
        }
        let config = node_config(&self.template, id, self.ids().into_iter()).as_observer();
        let node = LocalNode::start(config, self.router.clone()).await?;
        let handle = node.handle().clone();
        self.nodes.insert(id, node);
        tracing::info!(node_id = id, "Spawned node");
        Ok(handle)
    }

    pub async fn kill(&mut self, id: NodeId) {
        if let Some(node) = self.nodes.get_mut(&id) {
            tracing::info!(node_id = id, "Killing node");
            node.kill().await;
            self.router.unregister(id).await;
        }
    }

    pub async fn disconnect(&mut self, id: NodeId) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.is_disconnected = true;
            self.router.isolate(id).await;
        }
    }

    pub async fn connect(&mut self, id: NodeId) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.is_disconnected = false;
            self.router.reconnect(id).await;
        }
    }

    /// Splits the network so that no message crosses between the two sides.
    pub async fn partition(&mut self, side_a: &[NodeId], side_b: &[NodeId]) {
        self.router.partition(side_a, side_b).await;
    }

    pub async fn heal(&mut self) {
        for node in self.nodes.values_mut() {
            node.is_disconnected = false;
        }
        self.router.heal().await;
    }

    /// Summaries of the live nodes.
    pub async fn summaries(&self) -> Result<Vec<LocalNodeSummary>> {
        let mut summaries = Vec::new();
        for node in self.nodes.values().filter(|node| !node.is_dead) {
            summaries.push(node.summary().await?);
        }
        Ok(summaries)
    }
}

fn node_config(
    template: &RaftConfig,
    id: NodeId,
    peers: impl Iterator<Item = NodeId>,
) -> RaftConfig {
    let mut config = template.clone();
    config.node_id = id;
    config.address = address(id);
    config.peers = peers
        .map(|peer| PeerConfig {
            node_id: peer,
            address: address(peer),
            is_voter: true,
        })
        .collect();
    config
}

pub fn address(id: NodeId) -> String {
    format!("local://node-{id}")
}
