use std::time::Duration;

use crate::error::{RaftError, Result};
use crate::membership::Configuration;
use crate::msg::NodeId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    pub node_id: NodeId,
    pub address: String,
    pub is_voter: bool,
}

/// Settings for a single Raft node.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    pub node_id: NodeId,
    pub address: String,
    /// False for a node joining as an observer; it receives the log but
    /// never campaigns until a membership change makes it a voter.
    pub is_voter: bool,
    pub peers: Vec<PeerConfig>,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Upper bound on a single peer RPC round trip.
    pub rpc_timeout_ms: u64,
    /// Compact the log once it holds more entries than this.
    pub max_log_entries: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            address: "127.0.0.1:7001".to_string(),
            is_voter: true,
            peers: Vec::new(),
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
            rpc_timeout_ms: 100,
            max_log_entries: 1000,
        }
    }
}

impl RaftConfig {
    pub fn new(node_id: NodeId, address: impl Into<String>) -> Self {
        Self {
            node_id,
            address: address.into(),
            ..Default::default()
        }
    }

    pub fn with_peer(mut self, node_id: NodeId, address: impl Into<String>) -> Self {
        self.peers.push(PeerConfig {
            node_id,
            address: address.into(),
            is_voter: true,
        });
        self
    }

    /// Adds a non-voting peer.
    pub fn with_observer(mut self, node_id: NodeId, address: impl Into<String>) -> Self {
        self.peers.push(PeerConfig {
            node_id,
            address: address.into(),
            is_voter: false,
        });
        self
    }

    pub fn as_observer(mut self) -> Self {
        self.is_voter = false;
        self
    }

    pub fn with_election_timeout(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.election_timeout_min_ms = min_ms;
        self.election_timeout_max_ms = max_ms;
        self
    }

    pub fn with_heartbeat_interval(mut self, ms: u64) -> Self {
        self.heartbeat_interval_ms = ms;
        self
    }

    pub fn with_max_log_entries(mut self, max: usize) -> Self {
        self.max_log_entries = max;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.election_timeout_min_ms == 0
            || self.election_timeout_min_ms > self.election_timeout_max_ms
        {
            return Err(RaftError::InvalidConfig(format!(
                "election timeout range {}..={} ms is empty",
                self.election_timeout_min_ms, self.election_timeout_max_ms
            )));
        }
        if self.heartbeat_interval_ms == 0
            || self.heartbeat_interval_ms >= self.election_timeout_min_ms
        {
            return Err(RaftError::InvalidConfig(format!(
                "heartbeat interval {} ms must be positive and below the election timeout",
                self.heartbeat_interval_ms
            )));
        }
        if self.max_log_entries == 0 {
            return Err(RaftError::InvalidConfig(
                "max_log_entries must be positive".to_string(),
            ));
        }
        if self.peers.iter().any(|p| p.node_id == self.node_id) {
            return Err(RaftError::InvalidConfig(format!(
                "node {} lists itself as a peer",
                self.node_id
            )));
        }
        Ok(())
    }

    /// The voter configuration a fresh node starts from.
    pub fn initial_configuration(&self) -> Configuration {
        let peers = self.peers.iter().filter(|p| p.is_voter).map(|p| p.node_id);
        if self.is_voter {
            Configuration::stable(peers.chain(Some(self.node_id)))
        } else {
            Configuration::stable(peers)
        }
    }

    pub fn election_timeout_min(&self) -> Duration {
        Duration::from_millis(self.election_timeout_min_ms)
    }

    pub fn election_timeout_max(&self) -> Duration {
        Duration::from_millis(self.election_timeout_max_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// How long a client write or read may stay pending.
    pub fn client_timeout(&self) -> Duration {
        2 * self.election_timeout_max()
    }

    /// A leader that has not heard from a quorum of voters within this
    /// window steps down.
    pub fn leader_lease(&self) -> Duration {
        2 * self.election_timeout_max()
    }
}
