use color_eyre::eyre::{bail, eyre, Result};
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};

use quorumkv_raft::msg::{Command, Index, NodeId, Term};
use quorumkv_raft::{RaftConfig, RaftHandle};

use crate::local_node::LocalNodeSummary;
use crate::Cluster;

pub type Nodes = Vec<LocalNodeSummary>;

pub const ELECTION_TIMEOUT_MS_LOW: u64 = 150;
pub const ELECTION_TIMEOUT_MS_HIGH: u64 = 300;
pub const HEARTBEAT_INTERVAL_MS: u64 = 50;

/// Drives a [`Cluster`] from tests and checks what it does.
pub struct LocalClusterRunner {
    cluster: Cluster,
}

impl LocalClusterRunner {
    pub async fn new(node_count: u64) -> Result<Self> {
        let template = RaftConfig::default()
            .with_election_timeout(ELECTION_TIMEOUT_MS_LOW, ELECTION_TIMEOUT_MS_HIGH)
            .with_heartbeat_interval(HEARTBEAT_INTERVAL_MS);
        Self::with_config(node_count, template).await
    }

    pub async fn with_config(node_count: u64, template: RaftConfig) -> Result<Self> {
        let cluster = Cluster::new(node_count, template).await?;
        Ok(Self { cluster })
    }

    pub fn cluster(&mut self) -> &mut Cluster {
        &mut self.cluster
    }

    pub fn handle(&self, id: NodeId) -> Result<RaftHandle> {
        self.cluster
            .handle(id)
            .ok_or_else(|| eyre!("node {id} is not running"))
    }

    pub async fn get_cluster_state(&self) -> Result<Nodes> {
        Ok(self.cluster.summaries().await?)
    }

    pub async fn sleep(&self, ms: u64) {
        sleep(Duration::from_millis(ms)).await;
    }

    pub async fn connect(&mut self, id: NodeId) {
        self.cluster.connect(id).await;
    }

    pub async fn disconnect(&mut self, id: NodeId) {
        self.cluster.disconnect(id).await;
    }

    pub async fn kill(&mut self, id: NodeId) {
        self.cluster.kill(id).await;
    }

    // Only one leader at the highest term
    pub async fn check_one_leader(&self) -> Result<LocalNodeSummary> {
        for _ in 0..40 {
            self.sleep(100).await;
            let nodes = self.get_cluster_state().await?;
            let highest_leaders = leaders(&nodes);
            match highest_leaders.len() {
                1 => return Ok(highest_leaders[0].clone()),
                l if l > 1 => bail!("More than one leader on the same term!"),
                _ => {}
            }
        }
        bail!("No leader elected in time!")
    }

    /// Submits `command` to `dest` without waiting for the outcome.
    pub fn send_cmd(&self, dest: NodeId, command: Command) -> Result<()> {
        let handle = self.handle(dest)?;
        tokio::spawn(async move {
            if let Err(e) = handle.submit(command).await {
                tracing::debug!(node_id = dest, error = %e, "Submit failed");
            }
        });
        Ok(())
    }

    /// One attempt through the current leader. True if `command` committed
    /// on a majority of the live nodes.
    pub async fn try_to_commit(&self, command: Command) -> Result<bool> {
        let leader = self.check_one_leader().await?;
        let handle = self.handle(leader.id)?;
        let client_timeout = Duration::from_millis(4 * ELECTION_TIMEOUT_MS_HIGH);
        let index = match timeout(client_timeout, handle.submit(command.clone())).await {
            Ok(Ok(response)) => response.index,
            Ok(Err(e)) => {
                tracing::debug!(node_id = leader.id, error = %e, "Commit attempt rejected");
                return Ok(false);
            }
            Err(_) => return Ok(false),
        };
        for _ in 0..20 {
            let nodes = self.get_cluster_state().await?;
            if committed_on(&nodes, index, &command)? > nodes.len() / 2 {
                return Ok(true);
            }
            self.sleep(100).await;
        }
        Ok(false)
    }

    /// Keeps trying until `command` is committed on at least `expected`
    /// nodes, and returns its index.
    pub async fn commit(&self, command: Command, expected: usize) -> Result<Index> {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            let Ok(leader) = self.check_one_leader().await else {
                continue;
            };
            let handle = self.handle(leader.id)?;
            let client_timeout = Duration::from_millis(4 * ELECTION_TIMEOUT_MS_HIGH);
            if let Ok(Ok(response)) = timeout(client_timeout, handle.submit(command.clone())).await {
                for _ in 0..20 {
                    let nodes = self.get_cluster_state().await?;
                    if committed_on(&nodes, response.index, &command)? >= expected {
                        return Ok(response.index);
                    }
                    self.sleep(100).await;
                }
            }
            self.sleep(50).await;
        }
        bail!("{command:?} was not committed on {expected} nodes in time")
    }

    /// Number of live nodes that have committed `index`. Fails if any two of
    /// them committed different entries there.
    pub async fn n_committed(&self, index: Index) -> Result<usize> {
        let nodes = self.get_cluster_state().await?;
        let mut count = 0;
        let mut seen = None;
        for node in &nodes {
            if node.raft.commit_index < index {
                continue;
            }
            count += 1;
            if let Some(entry) = node.raft.entry(index) {
                let value = (entry.term, &entry.command);
                match seen {
                    Some(other) if other != value => {
                        bail!("committed values differ at index {index}: {other:?} vs {value:?}")
                    }
                    _ => seen = Some(value),
                }
            }
        }
        Ok(count)
    }

    pub async fn has_no_leader(&self) -> Result<bool> {
        Ok(leaders(&self.get_cluster_state().await?).is_empty())
    }

    pub async fn current_term(&self) -> Result<Term> {
        let nodes = self.get_cluster_state().await?;
        Ok(nodes
            .iter()
            .map(|node| node.raft.current_term)
            .max()
            .unwrap_or(0))
    }

    pub async fn live_term_agreement(&self) -> Result<bool> {
        let nodes = self.get_cluster_state().await?;
        let mut terms = nodes
            .iter()
            .filter(|node| !node.is_disconnected)
            .map(|node| node.raft.current_term);
        let Some(term) = terms.next() else {
            return Ok(true);
        };
        Ok(terms.all(|t| t == term))
    }

    /// Waits until every live node has applied `key = value`.
    pub async fn wait_for_value(&self, key: &str, value: &str) -> Result<()> {
        for _ in 0..50 {
            let mut applied = true;
            for id in self.cluster.live_ids() {
                let state = self.handle(id)?.state_machine_snapshot().await?;
                if state.get(key).map(String::as_str) != Some(value) {
                    applied = false;
                    break;
                }
            }
            if applied {
                return Ok(());
            }
            self.sleep(100).await;
        }
        bail!("{key} = {value} was not applied everywhere in time")
    }

    /// Checks election safety and that committed log prefixes agree.
    pub async fn check_safety(&self) -> Result<()> {
        let nodes = self.get_cluster_state().await?;
        for (i, a) in nodes.iter().enumerate() {
            for b in &nodes[i + 1..] {
                if a.raft.is_leader()
                    && b.raft.is_leader()
                    && a.raft.current_term == b.raft.current_term
                {
                    bail!(
                        "nodes {} and {} both lead term {}",
                        a.id,
                        b.id,
                        a.raft.current_term
                    );
                }
                let committed = a.raft.commit_index.min(b.raft.commit_index);
                for index in 1..=committed {
                    if let (Some(x), Some(y)) = (a.raft.entry(index), b.raft.entry(index)) {
                        if x.term != y.term || x.command != y.command {
                            bail!("nodes {} and {} disagree at index {index}", a.id, b.id);
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// Number of nodes that committed `command` at `index`.
fn committed_on(nodes: &Nodes, index: Index, command: &Command) -> Result<usize> {
    let mut count = 0;
    for node in nodes {
        if node.raft.commit_index < index {
            continue;
        }
        match node.raft.entry(index) {
            Some(entry) if &entry.command != command => {
                bail!("node {} committed {:?} at {index}", node.id, entry.command)
            }
            // Compacted entries were committed and cannot be checked.
            _ => count += 1,
        }
    }
    Ok(count)
}

fn leaders(nodes: &Nodes) -> Vec<LocalNodeSummary> {
    let mut highest_term = 0;
    let mut highest_leaders = Vec::new();
    for node in nodes {
        if node.is_disconnected {
            continue;
        }
        if node.raft.current_term > highest_term {
            highest_term = node.raft.current_term;
            highest_leaders.clear();
        }
        if node.raft.current_term == highest_term && node.raft.is_leader() {
            highest_leaders.push(node.clone());
        }
    }
    highest_leaders
}
