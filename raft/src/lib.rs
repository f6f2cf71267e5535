//! Raft consensus for a replicated key/value log.
//!
//! Every node is a single tokio task that owns its log, state machine and
//! membership table. Peers are reached through a [`Transport`]; callers talk
//! to a node through its [`RaftHandle`].

use ahash::{HashMap, HashMapExt, HashSet, HashSetExt};
use rand::Rng;
use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    fmt,
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{self, Instant},
};

pub mod client;
pub mod config;
pub mod error;
pub mod log;
pub mod membership;
pub mod msg;
mod replication;
pub mod scheduler;
pub mod state_machine;
pub mod transport;

pub use client::RaftHandle;
pub use config::{PeerConfig, RaftConfig};
pub use error::{RaftError, Result};
pub use membership::{Configuration, NodeInfo};
pub use scheduler::{ManualScheduler, Scheduler, TimerHandle, TokioScheduler};
pub use transport::{RpcFuture, Transport};

use crate::log::RaftLog;
use crate::msg::{
    AppendEntriesReply, AppendEntriesRequest, ClientReply, ClientRequest, Command, Index,
    InstallSnapshotReply, InstallSnapshotRequest, LogEntry, NodeId, RequestVoteReply,
    RequestVoteRequest, Snapshot, Term,
};
use crate::state_machine::KvStateMachine;

const INBOX_CAPACITY: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Follower => write!(f, "follower"),
            Role::Candidate => write!(f, "candidate"),
            Role::Leader => write!(f, "leader"),
        }
    }
}

/// Per-peer replication progress, tracked by the leader.
#[derive(Clone, Debug)]
struct Progress {
    /// Index of the next entry to send.
    next_index: Index,
    /// Highest index known to be replicated on the peer.
    match_index: Index,
    /// Highest read sequence number the peer has acknowledged.
    read_seq: u64,
}

impl Progress {
    fn new(next_index: Index) -> Self {
        Self {
            next_index,
            match_index: 0,
            read_seq: 0,
        }
    }
}

struct PendingWrite {
    term: Term,
    reply_tx: oneshot::Sender<ClientReply>,
    deadline: Instant,
}

struct PendingRead {
    seq: u64,
    key: String,
    reply_tx: oneshot::Sender<Result<Option<String>>>,
    deadline: Instant,
}

struct PendingChange {
    /// Index of the final configuration entry, once appended.
    final_index: Option<Index>,
    /// Node to drop from the membership table when the change completes.
    removing: Option<NodeId>,
    reply_tx: oneshot::Sender<Result<bool>>,
}

struct LeaderState {
    progress: HashMap<NodeId, Progress>,
    /// Client writes waiting for their index to be applied.
    pending: BTreeMap<Index, PendingWrite>,
    /// Reads waiting for a quorum to confirm leadership, in `seq` order.
    reads: VecDeque<PendingRead>,
    read_seq: u64,
    membership_change: Option<PendingChange>,
}

impl LeaderState {
    /// Rejects all outstanding client work.
    fn abort(self, err: RaftError) {
        for (_, write) in self.pending {
            let _ = write.reply_tx.send(Err(err.clone()));
        }
        for read in self.reads {
            let _ = read.reply_tx.send(Err(err.clone()));
        }
        if let Some(change) = self.membership_change {
            let _ = change.reply_tx.send(Ok(false));
        }
    }
}

enum RaftState {
    Follower,
    Candidate { votes: HashSet<NodeId> },
    Leader(LeaderState),
}

impl RaftState {
    fn role(&self) -> Role {
        match self {
            RaftState::Follower => Role::Follower,
            RaftState::Candidate { .. } => Role::Candidate,
            RaftState::Leader(_) => Role::Leader,
        }
    }
}

/// Everything a node's inbox carries: inbound RPCs, results of its own
/// outbound RPCs, and client/admin calls from its [`RaftHandle`].
pub(crate) enum NodeEvent {
    RequestVote {
        req: RequestVoteRequest,
        reply_tx: oneshot::Sender<RequestVoteReply>,
    },
    AppendEntries {
        req: AppendEntriesRequest,
        reply_tx: oneshot::Sender<AppendEntriesReply>,
    },
    InstallSnapshot {
        req: InstallSnapshotRequest,
        reply_tx: oneshot::Sender<InstallSnapshotReply>,
    },
    ClientRequest {
        req: ClientRequest,
        reply_tx: oneshot::Sender<ClientReply>,
    },
    Read {
        key: String,
        reply_tx: oneshot::Sender<Result<Option<String>>>,
    },
    VoteResult {
        peer: NodeId,
        term: Term,
        result: Result<RequestVoteReply>,
    },
    AppendResult {
        peer: NodeId,
        term: Term,
        read_seq: u64,
        last_sent: Index,
        result: Result<AppendEntriesReply>,
    },
    SnapshotResult {
        peer: NodeId,
        term: Term,
        last_included: Index,
        result: Result<InstallSnapshotReply>,
    },
    Admin(AdminRequest),
    Shutdown,
}

pub(crate) enum AdminRequest {
    State {
        reply_tx: oneshot::Sender<ClusterState>,
    },
    StateMachine {
        reply_tx: oneshot::Sender<BTreeMap<String, String>>,
    },
    Snapshot {
        reply_tx: oneshot::Sender<Snapshot>,
    },
    LogLength {
        reply_tx: oneshot::Sender<usize>,
    },
    Compact {
        reply_tx: oneshot::Sender<Result<Index>>,
    },
    InstallSnapshot {
        snapshot: Snapshot,
        reply_tx: oneshot::Sender<Result<()>>,
    },
    AddNode {
        peer: PeerConfig,
        reply_tx: oneshot::Sender<Result<bool>>,
    },
    RemoveNode {
        id: NodeId,
        reply_tx: oneshot::Sender<Result<bool>>,
    },
    ChangeMembership {
        voters: BTreeSet<NodeId>,
        reply_tx: oneshot::Sender<Result<bool>>,
    },
}

/// Point-in-time view of a node.
#[derive(Clone, Debug)]
pub struct ClusterState {
    pub id: NodeId,
    pub current_term: Term,
    pub role: Role,
    pub leader_id: Option<NodeId>,
    pub voted_for: Option<NodeId>,
    pub commit_index: Index,
    pub last_applied: Index,
    /// Entries not yet compacted.
    pub log: Vec<LogEntry>,
    pub snapshot_index: Index,
    pub configuration: Configuration,
    pub nodes: Vec<NodeInfo>,
}

impl ClusterState {
    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    pub fn last_log_index(&self) -> Index {
        self.log.last().map(|e| e.index).unwrap_or(self.snapshot_index)
    }

    /// The entry at `index`, if it is still in the in-memory log.
    pub fn entry(&self, index: Index) -> Option<&LogEntry> {
        if index <= self.snapshot_index {
            return None;
        }
        self.log.get((index - self.snapshot_index - 1) as usize)
    }
}

/// Implementation of Raft protocol.
pub struct RaftNode {
    id: NodeId,
    config: RaftConfig,
    state: RaftState,
    term: Term,
    voted_for: Option<NodeId>,
    leader_id: Option<NodeId>,
    log: RaftLog,
    /// Index of highest log entry known to be committed.
    commit_index: Index,
    state_machine: KvStateMachine,
    /// Cached `log.configuration()`.
    configuration: Configuration,
    nodes: BTreeMap<NodeId, NodeInfo>,
    /// Election timeout for non-leaders and heartbeat timeout for the leader.
    timer: TimerHandle,
    transport: Arc<dyn Transport>,
    scheduler: Arc<dyn Scheduler>,
    inbox_rx: mpsc::Receiver<NodeEvent>,
    /// Handed to spawned RPC tasks so they can post results back. Weak, so
    /// the node stops once every [`RaftHandle`] is gone.
    inbox_tx: mpsc::WeakSender<NodeEvent>,
}

impl RaftNode {
    pub fn new(
        config: RaftConfig,
        transport: Arc<dyn Transport>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Result<(Self, RaftHandle)> {
        config.validate()?;
        let (tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
        let configuration = config.initial_configuration();

        let mut nodes = BTreeMap::new();
        nodes.insert(
            config.node_id,
            NodeInfo::new(config.node_id, config.address.clone(), config.is_voter),
        );
        for peer in &config.peers {
            nodes.insert(
                peer.node_id,
                NodeInfo::new(peer.node_id, peer.address.clone(), peer.is_voter),
            );
        }

        let node = Self {
            id: config.node_id,
            state: RaftState::Follower,
            term: 0,
            voted_for: None,
            leader_id: None,
            log: RaftLog::new(configuration.clone()),
            commit_index: 0,
            state_machine: KvStateMachine::new(),
            configuration,
            nodes,
            timer: TimerHandle::idle(),
            transport,
            scheduler,
            inbox_rx,
            inbox_tx: tx.downgrade(),
            config,
        };
        let handle = RaftHandle::new(node.id, tx);
        Ok((node, handle))
    }

    /// Creates a node and runs it on its own task.
    pub fn spawn(
        config: RaftConfig,
        transport: Arc<dyn Transport>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Result<(RaftHandle, JoinHandle<()>)> {
        let (node, handle) = Self::new(config, transport, scheduler)?;
        let task = tokio::spawn(node.run());
        Ok((handle, task))
    }

    pub async fn run(mut self) {
        tracing::info!(node_id = self.id, voter = self.config.is_voter, "Starting raft node");
        self.reset_election_timer();
        loop {
            tokio::select! {
                event = self.inbox_rx.recv() => match event {
                    Some(NodeEvent::Shutdown) | None => break,
                    Some(event) => self.handle_event(event),
                },
                _ = &mut self.timer => {
                    self.handle_timeout();
                }
            }
        }
        tracing::info!(node_id = self.id, term = self.term, "Raft node stopped");
        if let RaftState::Leader(leader) =
            std::mem::replace(&mut self.state, RaftState::Follower)
        {
            leader.abort(RaftError::Shutdown);
        }
    }

    fn handle_event(&mut self, event: NodeEvent) {
        match event {
            NodeEvent::RequestVote { req, reply_tx } => {
                let _ = reply_tx.send(self.receive_vote_request(req));
            }
            NodeEvent::AppendEntries { req, reply_tx } => {
                let _ = reply_tx.send(self.receive_append_entries(req));
            }
            NodeEvent::InstallSnapshot { req, reply_tx } => {
                let _ = reply_tx.send(self.receive_install_snapshot(req));
            }
            NodeEvent::ClientRequest { req, reply_tx } => {
                self.receive_client_request(req, reply_tx)
            }
            NodeEvent::Read { key, reply_tx } => self.receive_read(key, reply_tx),
            NodeEvent::VoteResult { peer, term, result } => self.receive_vote(peer, term, result),
            NodeEvent::AppendResult {
                peer,
                term,
                read_seq,
                last_sent,
                result,
            } => self.receive_append_entries_reply(peer, term, read_seq, last_sent, result),
            NodeEvent::SnapshotResult {
                peer,
                term,
                last_included,
                result,
            } => self.receive_install_snapshot_reply(peer, term, last_included, result),
            NodeEvent::Admin(request) => self.receive_admin(request),
            NodeEvent::Shutdown => {}
        }
    }

    fn handle_timeout(&mut self) {
        if !self.is_leader() {
            // Election timeout. Observers only wait.
            if self.configuration.is_voter(self.id) {
                self.start_election();
            } else {
                self.reset_election_timer();
            }
            return;
        }

        // Heartbeat timeout.
        self.expire_pending();
        if !self.has_quorum_contact() {
            tracing::warn!(
                node_id = self.id,
                term = self.term,
                "Lost contact with a quorum of voters, stepping down"
            );
            self.transition_to_follower(self.term, None);
            return;
        }
        self.broadcast_append_entries();
        self.reset_heartbeat_timer();
    }

    fn start_election(&mut self) {
        self.transition_to_candidate();
        tracing::info!(node_id = self.id, term = self.term, "Starting election");
        if self.has_vote_quorum() {
            self.transition_to_leader();
            return;
        }

        let req = RequestVoteRequest {
            term: self.term,
            candidate_id: self.id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };
        let term = self.term;
        for peer in self.configuration.voters() {
            if peer == self.id {
                continue;
            }
            let rpc = self.transport.request_vote(peer, req.clone());
            self.spawn_rpc(rpc, self.config.rpc_timeout(), move |result| {
                NodeEvent::VoteResult { peer, term, result }
            });
        }
    }

    fn receive_vote_request(&mut self, req: RequestVoteRequest) -> RequestVoteReply {
        if req.term > self.term {
            self.transition_to_follower(req.term, None);
        }
        let vote_granted = req.term == self.term
            && self.voted_for.map_or(true, |v| v == req.candidate_id)
            && self.log.is_up_to_date(req.last_log_index, req.last_log_term);
        if vote_granted {
            self.voted_for = Some(req.candidate_id);
            self.reset_election_timer();
        }
        tracing::debug!(
            node_id = self.id,
            term = self.term,
            candidate = req.candidate_id,
            vote_granted,
            "Vote requested"
        );
        RequestVoteReply {
            term: self.term,
            vote_granted,
        }
    }

    fn receive_vote(&mut self, peer: NodeId, term: Term, result: Result<RequestVoteReply>) {
        let reply = match result {
            Ok(reply) => reply,
            Err(e) => {
                tracing::debug!(node_id = self.id, peer, error = %e, "Vote request failed");
                return;
            }
        };
        if reply.term > self.term {
            self.transition_to_follower(reply.term, None);
            return;
        }
        if term != self.term || !reply.vote_granted {
            return;
        }
        if let RaftState::Candidate { votes } = &mut self.state {
            votes.insert(peer);
            tracing::debug!(node_id = self.id, peer, votes = votes.len(), "Received vote");
        }
        if self.has_vote_quorum() {
            self.transition_to_leader();
        }
    }

    fn has_vote_quorum(&self) -> bool {
        match &self.state {
            RaftState::Candidate { votes } => {
                self.configuration.has_quorum(|id| votes.contains(&id))
            }
            _ => false,
        }
    }

    /// Split-brain check: true if a quorum of voters replied to this leader
    /// recently. Checked once per heartbeat, so the window is one interval
    /// short of the lease and a lost quorum is noticed within the lease.
    fn has_quorum_contact(&self) -> bool {
        let now = self.now();
        let window = self
            .config
            .leader_lease()
            .saturating_sub(self.config.heartbeat_interval());
        self.configuration.has_quorum(|id| {
            id == self.id
                || self
                    .nodes
                    .get(&id)
                    .and_then(|n| n.last_heartbeat)
                    .is_some_and(|at| now.duration_since(at) < window)
        })
    }

    fn reset_election_timer(&mut self) {
        let timeout = random_timeout(
            self.config.election_timeout_min_ms,
            self.config.election_timeout_max_ms,
        );
        self.timer = self.scheduler.schedule(timeout);
    }

    fn reset_heartbeat_timer(&mut self) {
        self.timer = self.scheduler.schedule(self.config.heartbeat_interval());
    }

    fn transition_to_candidate(&mut self) {
        self.term += 1;
        self.voted_for = Some(self.id);
        self.leader_id = None;
        let mut votes = HashSet::new();
        votes.insert(self.id);
        self.reset_election_timer();
        self.state = RaftState::Candidate { votes };
    }

    /// Becomes a follower at `term`, clearing the vote if the term advanced.
    /// A leader stepping down rejects its pending client work. A node that
    /// already was a follower keeps its election deadline.
    fn transition_to_follower(&mut self, term: Term, leader_id: Option<NodeId>) {
        if term > self.term {
            self.term = term;
            self.voted_for = None;
        }
        self.leader_id = leader_id;
        match std::mem::replace(&mut self.state, RaftState::Follower) {
            RaftState::Follower => return,
            RaftState::Leader(leader) => {
                tracing::info!(node_id = self.id, term = self.term, "Stepping down");
                leader.abort(RaftError::LeadershipLost);
            }
            RaftState::Candidate { .. } => {}
        }
        self.reset_election_timer();
    }

    fn transition_to_leader(&mut self) {
        tracing::info!(node_id = self.id, term = self.term, "Became leader");
        let next_index = self.log.last_index() + 1;
        let mut progress = HashMap::new();
        // The lease starts now: every peer gets a full window to answer.
        let now = self.now();
        for (id, node) in self.nodes.iter_mut() {
            node.last_heartbeat = Some(now);
            if *id != self.id {
                progress.insert(*id, Progress::new(next_index));
            }
        }
        self.state = RaftState::Leader(LeaderState {
            progress,
            pending: BTreeMap::new(),
            reads: VecDeque::new(),
            read_seq: 0,
            membership_change: None,
        });
        self.leader_id = Some(self.id);
        self.reset_heartbeat_timer();

        self.append_entry(Command::Noop);
        self.broadcast_append_entries();
        self.maybe_commit();
    }

    fn now(&self) -> Instant {
        self.scheduler.now()
    }

    fn is_leader(&self) -> bool {
        matches!(self.state, RaftState::Leader(_))
    }

    /// Appends a command to the leader's log. Configuration entries take
    /// effect as soon as they are appended.
    fn append_entry(&mut self, command: Command) -> Index {
        let is_config = command.is_config();
        let index = self.log.append(self.term, command);
        if is_config {
            self.refresh_configuration();
        }
        index
    }

    /// Re-reads the configuration from the log and syncs the membership
    /// table and, on a leader, replication progress with it.
    fn refresh_configuration(&mut self) {
        self.configuration = self.log.configuration();
        for id in self.configuration.voters() {
            self.nodes
                .entry(id)
                .or_insert_with(|| NodeInfo::new(id, String::new(), true));
        }
        for node in self.nodes.values_mut() {
            node.is_voter = self.configuration.is_voter(node.id);
        }
        if self.is_leader() {
            let ids: Vec<NodeId> = self.nodes.keys().copied().collect();
            for id in ids {
                self.track_peer(id);
            }
        }
    }

    /// Starts replicating to `id` if this node leads and does not track it
    /// yet. The peer gets a full lease window to answer before it counts
    /// against quorum contact.
    fn track_peer(&mut self, id: NodeId) {
        let next_index = self.log.last_index() + 1;
        let now = self.now();
        let RaftState::Leader(leader) = &mut self.state else {
            return;
        };
        if id == self.id || leader.progress.contains_key(&id) {
            return;
        }
        leader.progress.insert(id, Progress::new(next_index));
        if let Some(node) = self.nodes.get_mut(&id) {
            node.last_heartbeat = Some(now);
        }
    }

    /// Runs `rpc` on its own task and posts its outcome to the inbox, so the
    /// node keeps processing messages while the call is in flight.
    fn spawn_rpc<T: Send + 'static>(
        &self,
        rpc: RpcFuture<T>,
        timeout: Duration,
        into_event: impl FnOnce(Result<T>) -> NodeEvent + Send + 'static,
    ) {
        let Some(inbox) = self.inbox_tx.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let result = time::timeout(timeout, rpc)
                .await
                .unwrap_or(Err(RaftError::Timeout));
            // The node may have shut down meanwhile.
            let _ = inbox.send(into_event(result)).await;
        });
    }

    fn summary(&self) -> ClusterState {
        ClusterState {
            id: self.id,
            current_term: self.term,
            role: self.state.role(),
            leader_id: self.leader_id,
            voted_for: self.voted_for,
            commit_index: self.commit_index,
            last_applied: self.state_machine.last_applied(),
            log: self.log.entries().to_vec(),
            snapshot_index: self.log.snapshot_index(),
            configuration: self.configuration.clone(),
            nodes: self.nodes.values().cloned().collect(),
        }
    }
}

fn random_timeout(min_ms: u64, max_ms: u64) -> Duration {
    let mut rng = rand::thread_rng();
    let ms: u64 = rng.gen_range(min_ms..=max_ms);
    Duration::from_millis(ms)
}

#[cfg(test)]
mod tests;
