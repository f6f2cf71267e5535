use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tokio::time::Instant;

use crate::msg::NodeId;

/// Membership table entry for a cluster node.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NodeInfo {
    pub id: NodeId,
    pub address: String,
    /// Voting member of the current configuration, as opposed to an observer
    /// that only receives the log.
    pub is_voter: bool,
    /// Last time this node heard from the peer at its current term.
    pub last_heartbeat: Option<Instant>,
}

impl NodeInfo {
    pub fn new(id: NodeId, address: impl Into<String>, is_voter: bool) -> Self {
        Self {
            id,
            address: address.into(),
            is_voter,
            last_heartbeat: None,
        }
    }
}

/// The set of voters whose agreement makes a decision.
///
/// While `Joint`, every quorum decision (votes, commits, leadership checks,
/// reads) needs a majority of `old` and a majority of `new`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Configuration {
    Stable(BTreeSet<NodeId>),
    Joint {
        old: BTreeSet<NodeId>,
        new: BTreeSet<NodeId>,
    },
}

impl Configuration {
    pub fn stable(voters: impl IntoIterator<Item = NodeId>) -> Self {
        Configuration::Stable(voters.into_iter().collect())
    }

    pub fn is_joint(&self) -> bool {
        matches!(self, Configuration::Joint { .. })
    }

    /// Every node that votes in any of the active sets.
    pub fn voters(&self) -> BTreeSet<NodeId> {
        match self {
            Configuration::Stable(voters) => voters.clone(),
            Configuration::Joint { old, new } => old.union(new).copied().collect(),
        }
    }

    pub fn is_voter(&self, id: NodeId) -> bool {
        match self {
            Configuration::Stable(voters) => voters.contains(&id),
            Configuration::Joint { old, new } => old.contains(&id) || new.contains(&id),
        }
    }

    /// The target set: the stable voters, or the incoming set while joint.
    pub fn target(&self) -> &BTreeSet<NodeId> {
        match self {
            Configuration::Stable(voters) => voters,
            Configuration::Joint { new, .. } => new,
        }
    }

    /// True if the nodes for which `acked` holds form a quorum.
    pub fn has_quorum(&self, acked: impl Fn(NodeId) -> bool) -> bool {
        match self {
            Configuration::Stable(voters) => majority(voters, &acked),
            Configuration::Joint { old, new } => majority(old, &acked) && majority(new, &acked),
        }
    }
}

fn majority(voters: &BTreeSet<NodeId>, acked: &impl Fn(NodeId) -> bool) -> bool {
    // An empty set agrees to nothing.
    if voters.is_empty() {
        return false;
    }
    let count = voters.iter().filter(|id| acked(**id)).count();
    count > voters.len() / 2
}
