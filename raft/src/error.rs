use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::msg::{Index, NodeId};

#[derive(Error, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum RaftError {
    #[error("{}", not_leader_message(.leader_id))]
    NotLeader { leader_id: Option<NodeId> },

    #[error("leadership lost before the request committed")]
    LeadershipLost,

    #[error("request timed out")]
    Timeout,

    #[error("read could not be confirmed by a quorum")]
    ReadUnconfirmed,

    #[error("a membership change is already in progress")]
    MembershipChangeInProgress,

    #[error("log index {index} is compacted into the snapshot at {snapshot_index}")]
    Compacted { index: Index, snapshot_index: Index },

    #[error("node {0} is unreachable")]
    Unreachable(NodeId),

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("node is shut down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, RaftError>;

fn not_leader_message(leader_id: &Option<NodeId>) -> String {
    match leader_id {
        Some(id) => format!("not the leader, current leader is node {id}"),
        None => "no known leader".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_leader_message_names_leader() {
        let err = RaftError::NotLeader { leader_id: Some(3) };
        assert_eq!(err.to_string(), "not the leader, current leader is node 3");
        let err = RaftError::NotLeader { leader_id: None };
        assert_eq!(err.to_string(), "no known leader");
    }

    #[test]
    fn compacted_message() {
        let err = RaftError::Compacted {
            index: 4,
            snapshot_index: 10,
        };
        assert_eq!(
            err.to_string(),
            "log index 4 is compacted into the snapshot at 10"
        );
    }
}
