//! The client gateway: [`RaftHandle`] and the node-side handling of client
//! writes, linearizable reads and administrative calls.

use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::{mpsc, oneshot};
use tokio::time;

use crate::config::PeerConfig;
use crate::error::{RaftError, Result};
use crate::membership::NodeInfo;
use crate::msg::{
    AppendEntriesReply, AppendEntriesRequest, ClientReply, ClientRequest, Command, Index,
    InstallSnapshotReply, InstallSnapshotRequest, NodeId, RequestVoteReply, RequestVoteRequest,
    Snapshot, SubmitResponse,
};
use crate::{
    AdminRequest, ClusterState, NodeEvent, PendingChange, PendingRead, PendingWrite, RaftNode,
    RaftState,
};

/// Cloneable handle to a running [`RaftNode`]. Every call fails with
/// [`RaftError::Shutdown`] once the node has stopped.
#[derive(Clone, Debug)]
pub struct RaftHandle {
    id: NodeId,
    tx: mpsc::Sender<NodeEvent>,
}

impl RaftHandle {
    pub(crate) fn new(id: NodeId, tx: mpsc::Sender<NodeEvent>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn call<T>(&self, event: impl FnOnce(oneshot::Sender<T>) -> NodeEvent) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(event(reply_tx))
            .await
            .map_err(|_| RaftError::Shutdown)?;
        reply_rx.await.map_err(|_| RaftError::Shutdown)
    }

    async fn admin<T>(&self, request: impl FnOnce(oneshot::Sender<T>) -> AdminRequest) -> Result<T> {
        self.call(|reply_tx| NodeEvent::Admin(request(reply_tx)))
            .await
    }

    pub async fn handle_request_vote(&self, req: RequestVoteRequest) -> Result<RequestVoteReply> {
        self.call(|reply_tx| NodeEvent::RequestVote { req, reply_tx })
            .await
    }

    pub async fn handle_append_entries(
        &self,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesReply> {
        self.call(|reply_tx| NodeEvent::AppendEntries { req, reply_tx })
            .await
    }

    pub async fn handle_install_snapshot(
        &self,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotReply> {
        self.call(|reply_tx| NodeEvent::InstallSnapshot { req, reply_tx })
            .await
    }

    pub async fn handle_client_request(&self, req: ClientRequest) -> ClientReply {
        self.call(|reply_tx| NodeEvent::ClientRequest { req, reply_tx })
            .await?
    }

    /// Submits a write and waits until it is applied on the leader.
    /// A non-leader forwards the write to the leader it knows.
    pub async fn submit(&self, command: Command) -> Result<SubmitResponse> {
        self.handle_client_request(ClientRequest {
            command,
            forwarded: false,
        })
        .await
    }

    pub async fn set(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<SubmitResponse> {
        self.submit(Command::set(key, value)).await
    }

    pub async fn delete(&self, key: impl Into<String>) -> Result<SubmitResponse> {
        self.submit(Command::delete(key)).await
    }

    /// Linearizable read. Only the leader serves reads, after a quorum has
    /// confirmed it is still the leader.
    pub async fn read(&self, key: impl Into<String>) -> Result<Option<String>> {
        let key = key.into();
        self.call(|reply_tx| NodeEvent::Read { key, reply_tx })
            .await?
    }

    pub async fn state(&self) -> Result<ClusterState> {
        self.admin(|reply_tx| AdminRequest::State { reply_tx }).await
    }

    /// The applied key/value contents.
    pub async fn state_machine_snapshot(&self) -> Result<BTreeMap<String, String>> {
        self.admin(|reply_tx| AdminRequest::StateMachine { reply_tx })
            .await
    }

    /// The latest compacted snapshot.
    pub async fn snapshot(&self) -> Result<Snapshot> {
        self.admin(|reply_tx| AdminRequest::Snapshot { reply_tx })
            .await
    }

    /// Number of entries not yet compacted.
    pub async fn log_length(&self) -> Result<usize> {
        self.admin(|reply_tx| AdminRequest::LogLength { reply_tx })
            .await
    }

    /// Compacts every applied entry into a snapshot.
    pub async fn compact(&self) -> Result<Index> {
        self.admin(|reply_tx| AdminRequest::Compact { reply_tx })
            .await?
    }

    pub async fn install_snapshot(&self, snapshot: Snapshot) -> Result<()> {
        self.admin(|reply_tx| AdminRequest::InstallSnapshot { snapshot, reply_tx })
            .await?
    }

    /// Adds `id` to the membership table. On the leader, a voter is added
    /// through a joint configuration change and the call resolves once the
    /// change commits.
    pub async fn add_node(
        &self,
        id: NodeId,
        address: impl Into<String>,
        is_voter: bool,
    ) -> Result<bool> {
        let peer = PeerConfig {
            node_id: id,
            address: address.into(),
            is_voter,
        };
        self.admin(|reply_tx| AdminRequest::AddNode { peer, reply_tx })
            .await?
    }

    pub async fn remove_node(&self, id: NodeId) -> Result<bool> {
        self.admin(|reply_tx| AdminRequest::RemoveNode { id, reply_tx })
            .await?
    }

    /// Moves the cluster to a new voter set through joint consensus.
    /// Resolves to `true` once the final configuration commits, or `false`
    /// if this node lost leadership first.
    pub async fn begin_membership_change(
        &self,
        voters: impl IntoIterator<Item = NodeId>,
    ) -> Result<bool> {
        let voters = voters.into_iter().collect();
        self.admin(|reply_tx| AdminRequest::ChangeMembership { voters, reply_tx })
            .await?
    }

    /// Stops the node. Pending requests fail with [`RaftError::Shutdown`].
    pub async fn shutdown(&self) {
        let _ = self.tx.send(NodeEvent::Shutdown).await;
    }

    /// Non-blocking variant of [`RaftHandle::shutdown`], for use in `Drop`.
    pub fn shutdown_now(&self) {
        let _ = self.tx.try_send(NodeEvent::Shutdown);
    }
}

impl RaftNode {
    pub(crate) fn receive_client_request(
        &mut self,
        req: ClientRequest,
        reply_tx: oneshot::Sender<ClientReply>,
    ) {
        if req.command.is_config() {
            let _ = reply_tx.send(Err(RaftError::InvalidCommand(
                "configuration entries are appended through membership changes".to_string(),
            )));
            return;
        }
        if !self.is_leader() {
            self.forward_client_request(req, reply_tx);
            return;
        }

        let index = self.append_entry(req.command);
        let deadline = self.now() + self.config.client_timeout();
        if let RaftState::Leader(leader) = &mut self.state {
            leader.pending.insert(
                index,
                PendingWrite {
                    term: self.term,
                    reply_tx,
                    deadline,
                },
            );
        }
        tracing::debug!(node_id = self.id, term = self.term, index, "Accepted write");
        self.broadcast_append_entries();
        self.maybe_commit();
    }

    /// Hands a write to the known leader, at most once.
    fn forward_client_request(
        &self,
        req: ClientRequest,
        reply_tx: oneshot::Sender<ClientReply>,
    ) {
        let leader_id = match self.leader_id {
            Some(leader_id) if !req.forwarded => leader_id,
            leader_id => {
                let _ = reply_tx.send(Err(RaftError::NotLeader { leader_id }));
                return;
            }
        };
        tracing::debug!(node_id = self.id, leader_id, "Forwarding write to leader");
        let rpc = self.transport.client_request(
            leader_id,
            ClientRequest {
                forwarded: true,
                ..req
            },
        );
        let timeout = self.config.client_timeout() + self.config.rpc_timeout();
        tokio::spawn(async move {
            let reply = match time::timeout(timeout, rpc).await {
                Ok(Ok(reply)) => reply,
                Ok(Err(_)) => Err(RaftError::NotLeader {
                    leader_id: Some(leader_id),
                }),
                Err(_) => Err(RaftError::Timeout),
            };
            let _ = reply_tx.send(reply);
        });
    }

    pub(crate) fn receive_read(
        &mut self,
        key: String,
        reply_tx: oneshot::Sender<Result<Option<String>>>,
    ) {
        let deadline = self.now() + self.config.client_timeout();
        let RaftState::Leader(leader) = &mut self.state else {
            let _ = reply_tx.send(Err(RaftError::NotLeader {
                leader_id: self.leader_id,
            }));
            return;
        };
        leader.read_seq += 1;
        leader.reads.push_back(PendingRead {
            seq: leader.read_seq,
            key,
            reply_tx,
            deadline,
        });
        self.broadcast_append_entries();
        self.maybe_serve_reads();
    }

    /// Answers every read a quorum has confirmed, once an entry of this
    /// term is committed.
    pub(crate) fn maybe_serve_reads(&mut self) {
        if self.log.term_at(self.commit_index) != Some(self.term) {
            return;
        }
        let RaftState::Leader(leader) = &mut self.state else {
            return;
        };
        while let Some(seq) = leader.reads.front().map(|r| r.seq) {
            let progress = &leader.progress;
            let confirmed = self.configuration.has_quorum(|id| {
                id == self.id || progress.get(&id).is_some_and(|p| p.read_seq >= seq)
            });
            if !confirmed {
                break;
            }
            if let Some(read) = leader.reads.pop_front() {
                let value = self.state_machine.get(&read.key).cloned();
                let _ = read.reply_tx.send(Ok(value));
            }
        }
    }

    /// Fails writes and reads that outlived the client timeout.
    pub(crate) fn expire_pending(&mut self) {
        let now = self.now();
        let RaftState::Leader(leader) = &mut self.state else {
            return;
        };
        let expired: Vec<Index> = leader
            .pending
            .iter()
            .filter(|(_, write)| write.deadline <= now)
            .map(|(index, _)| *index)
            .collect();
        for index in expired {
            if let Some(write) = leader.pending.remove(&index) {
                tracing::debug!(node_id = self.id, index, "Write timed out");
                let _ = write.reply_tx.send(Err(RaftError::Timeout));
            }
        }
        while leader.reads.front().is_some_and(|r| r.deadline <= now) {
            if let Some(read) = leader.reads.pop_front() {
                let _ = read.reply_tx.send(Err(RaftError::ReadUnconfirmed));
            }
        }
    }

    pub(crate) fn receive_admin(&mut self, request: AdminRequest) {
        match request {
            AdminRequest::State { reply_tx } => {
                let _ = reply_tx.send(self.summary());
            }
            AdminRequest::StateMachine { reply_tx } => {
                let _ = reply_tx.send(self.state_machine.dump());
            }
            AdminRequest::Snapshot { reply_tx } => {
                let _ = reply_tx.send(self.log.snapshot().clone());
            }
            AdminRequest::LogLength { reply_tx } => {
                let _ = reply_tx.send(self.log.len());
            }
            AdminRequest::Compact { reply_tx } => {
                let _ = reply_tx.send(self.compact_log());
            }
            AdminRequest::InstallSnapshot { snapshot, reply_tx } => {
                let result = if self.is_leader() {
                    Err(RaftError::InvalidCommand(
                        "a leader does not install snapshots".to_string(),
                    ))
                } else {
                    self.install_snapshot(snapshot);
                    Ok(())
                };
                let _ = reply_tx.send(result);
            }
            AdminRequest::AddNode { peer, reply_tx } => self.add_node(peer, reply_tx),
            AdminRequest::RemoveNode { id, reply_tx } => self.remove_node(id, reply_tx),
            AdminRequest::ChangeMembership { voters, reply_tx } => {
                self.begin_membership_change(voters, None, reply_tx)
            }
        }
    }

    fn add_node(&mut self, peer: PeerConfig, reply_tx: oneshot::Sender<Result<bool>>) {
        let id = peer.node_id;
        let is_voter = self.configuration.is_voter(id);
        if peer.is_voter && !is_voter && !self.is_leader() {
            let _ = reply_tx.send(Err(RaftError::NotLeader {
                leader_id: self.leader_id,
            }));
            return;
        }
        self.nodes
            .entry(id)
            .and_modify(|node| node.address = peer.address.clone())
            .or_insert_with(|| NodeInfo::new(id, peer.address.clone(), is_voter));
        tracing::info!(node_id = self.id, peer = id, voter = peer.is_voter, "Adding node");

        if id != self.id {
            self.track_peer(id);
            self.send_append_entries(id);
        }

        if peer.is_voter && !is_voter {
            let mut voters = self.configuration.target().clone();
            voters.insert(id);
            self.begin_membership_change(voters, None, reply_tx);
        } else {
            let _ = reply_tx.send(Ok(true));
        }
    }

    fn remove_node(&mut self, id: NodeId, reply_tx: oneshot::Sender<Result<bool>>) {
        if self.configuration.is_voter(id) {
            let mut voters = self.configuration.target().clone();
            voters.remove(&id);
            self.begin_membership_change(voters, Some(id), reply_tx);
            return;
        }
        if id != self.id {
            self.nodes.remove(&id);
            if let RaftState::Leader(leader) = &mut self.state {
                leader.progress.remove(&id);
            }
        }
        tracing::info!(node_id = self.id, peer = id, "Removed observer");
        let _ = reply_tx.send(Ok(true));
    }

    /// Starts a joint configuration change towards `voters`. Only one change
    /// may be in flight at a time.
    fn begin_membership_change(
        &mut self,
        voters: BTreeSet<NodeId>,
        removing: Option<NodeId>,
        reply_tx: oneshot::Sender<Result<bool>>,
    ) {
        let RaftState::Leader(leader) = &self.state else {
            let _ = reply_tx.send(Err(RaftError::NotLeader {
                leader_id: self.leader_id,
            }));
            return;
        };
        if voters.is_empty() {
            let _ = reply_tx.send(Err(RaftError::InvalidCommand(
                "a configuration needs at least one voter".to_string(),
            )));
            return;
        }
        if leader.membership_change.is_some()
            || self.configuration.is_joint()
            || self.log.configuration_index() > self.commit_index
        {
            let _ = reply_tx.send(Err(RaftError::MembershipChangeInProgress));
            return;
        }
        let old = self.configuration.target().clone();
        if old == voters {
            let _ = reply_tx.send(Ok(true));
            return;
        }

        tracing::info!(node_id = self.id, ?old, new = ?voters, "Starting membership change");
        self.append_entry(Command::JointConfig { old, new: voters });
        if let RaftState::Leader(leader) = &mut self.state {
            leader.membership_change = Some(PendingChange {
                final_index: None,
                removing,
                reply_tx,
            });
        }
        self.broadcast_append_entries();
        self.maybe_commit();
    }
}
