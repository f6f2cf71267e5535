use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::RaftError;
use crate::membership::Configuration;

pub type Term = u64;
pub type NodeId = u64;
/// Position of an entry in the replicated log. Index 0 is never used by an
/// entry; it stands for "before the first entry".
pub type Index = u64;

/// A command replicated through the log.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// Store `value` under `key`.
    Set { key: String, value: String },
    /// Remove `key`.
    Delete { key: String },
    /// Appended by every new leader so entries from earlier terms can commit.
    Noop,
    /// First phase of a membership change: both voter sets must agree.
    JointConfig {
        old: BTreeSet<NodeId>,
        new: BTreeSet<NodeId>,
    },
    /// Second phase of a membership change.
    FinalConfig { voters: BTreeSet<NodeId> },
}

impl Command {
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        Command::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Command::Delete { key: key.into() }
    }

    pub fn is_config(&self) -> bool {
        matches!(self, Command::JointConfig { .. } | Command::FinalConfig { .. })
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub index: Index,
    pub command: Command,
    /// Leader wall clock at append time, ms since the Unix epoch.
    pub timestamp: u64,
}

/// The state machine contents as of `last_included_index`. Supersedes every
/// log entry up to and including that index.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub last_included_index: Index,
    pub last_included_term: Term,
    pub state: BTreeMap<String, String>,
    pub created_at: u64,
    /// Voter configuration in effect at `last_included_index`.
    pub configuration: Configuration,
}

impl Snapshot {
    /// The empty snapshot every log starts from.
    pub fn initial(configuration: Configuration) -> Self {
        Self {
            last_included_index: 0,
            last_included_term: 0,
            state: BTreeMap::new(),
            created_at: 0,
            configuration,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: Index,
    pub last_log_term: Term,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RequestVoteReply {
    pub term: Term,
    pub vote_granted: bool,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader_id: NodeId,
    pub prev_log_index: Index,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: Index,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: Term,
    pub success: bool,
    /// The replier's last log index, used by the leader to back up quickly.
    pub last_log_index: Index,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: Term,
    pub leader_id: NodeId,
    pub snapshot: Snapshot,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct InstallSnapshotReply {
    pub term: Term,
}

/// A client write, possibly forwarded from a non-leader.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ClientRequest {
    pub command: Command,
    /// Set by the forwarding node so the request is forwarded at most once.
    pub forwarded: bool,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub leader_id: NodeId,
    pub index: Index,
    /// Previous value for `Set`/`Delete`, `None` otherwise.
    pub result: Option<String>,
}

pub type ClientReply = Result<SubmitResponse, RaftError>;
