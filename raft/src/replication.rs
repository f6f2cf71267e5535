//! Log replication, commitment, compaction and snapshot transfer.

use crate::error::{RaftError, Result};
use crate::membership::Configuration;
use crate::msg::{
    AppendEntriesReply, AppendEntriesRequest, Command, Index, InstallSnapshotReply,
    InstallSnapshotRequest, NodeId, Snapshot, SubmitResponse, Term,
};
use crate::{NodeEvent, RaftNode, RaftState};

/// Upper bound on entries carried by a single AppendEntries.
const MAX_ENTRIES_PER_APPEND: usize = 64;

impl RaftNode {
    pub(crate) fn broadcast_append_entries(&self) {
        let RaftState::Leader(leader) = &self.state else {
            return;
        };
        for peer in leader.progress.keys() {
            self.send_append_entries(*peer);
        }
    }

    /// Sends `peer` the entries it is missing, or the snapshot if they have
    /// been compacted away. Doubles as heartbeat and read confirmation.
    pub(crate) fn send_append_entries(&self, peer: NodeId) {
        let RaftState::Leader(leader) = &self.state else {
            return;
        };
        let Some(progress) = leader.progress.get(&peer) else {
            return;
        };
        let next_index = progress.next_index;
        if next_index <= self.log.snapshot_index() {
            self.send_snapshot(peer);
            return;
        }

        let prev_log_index = next_index - 1;
        let Some(prev_log_term) = self.log.term_at(prev_log_index) else {
            tracing::error!(node_id = self.id, peer, prev_log_index, "Missing term for prev entry");
            return;
        };
        let entries: Vec<_> = self
            .log
            .entries_from(next_index)
            .unwrap_or_default()
            .iter()
            .take(MAX_ENTRIES_PER_APPEND)
            .cloned()
            .collect();
        let last_sent = prev_log_index + entries.len() as Index;
        let req = AppendEntriesRequest {
            term: self.term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.commit_index,
        };

        let term = self.term;
        let read_seq = leader.read_seq;
        let rpc = self.transport.append_entries(peer, req);
        self.spawn_rpc(rpc, self.config.rpc_timeout(), move |result| {
            NodeEvent::AppendResult {
                peer,
                term,
                read_seq,
                last_sent,
                result,
            }
        });
    }

    pub(crate) fn receive_append_entries(&mut self, req: AppendEntriesRequest) -> AppendEntriesReply {
        if req.term < self.term {
            return AppendEntriesReply {
                term: self.term,
                success: false,
                last_log_index: self.log.last_index(),
            };
        }
        self.follow(req.term, req.leader_id);

        let fail = |node: &Self| AppendEntriesReply {
            term: node.term,
            success: false,
            last_log_index: node.log.last_index(),
        };
        if req.prev_log_index > self.log.last_index() {
            tracing::debug!(
                node_id = self.id,
                prev_log_index = req.prev_log_index,
                last_index = self.log.last_index(),
                "Log too short for AppendEntries"
            );
            return fail(self);
        }
        // Below the snapshot everything is committed and therefore matches.
        if req.prev_log_index >= self.log.snapshot_index()
            && self.log.term_at(req.prev_log_index) != Some(req.prev_log_term)
        {
            tracing::debug!(
                node_id = self.id,
                prev_log_index = req.prev_log_index,
                "Log mismatch at prev entry"
            );
            return fail(self);
        }

        let last_new = req.prev_log_index + req.entries.len() as Index;
        let has_config = req.entries.iter().any(|e| e.command.is_config());
        let truncated = self.log.merge(req.entries);
        if truncated || has_config {
            self.refresh_configuration();
        }

        let commit = req.leader_commit.min(last_new);
        if commit > self.commit_index {
            self.commit_index = commit;
            self.apply_committed();
        }

        AppendEntriesReply {
            term: self.term,
            success: true,
            last_log_index: self.log.last_index(),
        }
    }

    /// Accepts `leader_id` as the leader of `term` after a valid RPC from it.
    fn follow(&mut self, term: Term, leader_id: NodeId) {
        self.transition_to_follower(term, Some(leader_id));
        self.reset_election_timer();
        let now = self.now();
        if let Some(node) = self.nodes.get_mut(&leader_id) {
            node.last_heartbeat = Some(now);
        }
    }

    pub(crate) fn receive_append_entries_reply(
        &mut self,
        peer: NodeId,
        term: Term,
        read_seq: u64,
        last_sent: Index,
        result: Result<AppendEntriesReply>,
    ) {
        let reply = match result {
            Ok(reply) => reply,
            Err(e) => {
                tracing::trace!(node_id = self.id, peer, error = %e, "AppendEntries failed");
                return;
            }
        };
        if reply.term > self.term {
            self.transition_to_follower(reply.term, None);
            return;
        }
        if term != self.term {
            return;
        }
        let now = self.now();
        if let Some(node) = self.nodes.get_mut(&peer) {
            node.last_heartbeat = Some(now);
        }

        let last_index = self.log.last_index();
        let RaftState::Leader(leader) = &mut self.state else {
            return;
        };
        let Some(progress) = leader.progress.get_mut(&peer) else {
            return;
        };
        progress.read_seq = progress.read_seq.max(read_seq);
        let resend = if reply.success {
            progress.match_index = progress.match_index.max(last_sent);
            progress.next_index = progress.next_index.max(progress.match_index + 1);
            progress.next_index <= last_index
        } else {
            // Back up, skipping straight past the end of a short log.
            let next = progress
                .next_index
                .saturating_sub(1)
                .min(reply.last_log_index + 1)
                .max(progress.match_index + 1)
                .max(1);
            tracing::debug!(node_id = self.id, peer, next_index = next, "Backing up");
            // A reject that moves nothing waits for the next heartbeat.
            let backed_up = next < progress.next_index;
            progress.next_index = next;
            backed_up
        };

        self.maybe_commit();
        self.maybe_serve_reads();
        if resend {
            self.send_append_entries(peer);
        }
    }

    /// Advances the commit index to the highest entry of the current term
    /// stored on a quorum.
    pub(crate) fn maybe_commit(&mut self) {
        let RaftState::Leader(leader) = &self.state else {
            return;
        };
        let mut committed = None;
        for index in (self.commit_index + 1..=self.log.last_index()).rev() {
            // Earlier terms only commit indirectly.
            if self.log.term_at(index) != Some(self.term) {
                break;
            }
            let stored = |id: NodeId| {
                id == self.id
                    || leader
                        .progress
                        .get(&id)
                        .is_some_and(|p| p.match_index >= index)
            };
            if self.configuration.has_quorum(stored) {
                committed = Some(index);
                break;
            }
        }

        if let Some(index) = committed {
            tracing::debug!(node_id = self.id, term = self.term, commit_index = index, "Committed");
            self.commit_index = index;
            self.apply_committed();
            self.advance_membership_change();
            self.maybe_serve_reads();
        }
    }

    /// Applies committed entries to the state machine in order, answering
    /// the clients that wait on them.
    pub(crate) fn apply_committed(&mut self) {
        while self.state_machine.last_applied() < self.commit_index {
            let index = self.state_machine.last_applied() + 1;
            let entry = match self.log.entry(index) {
                Ok(Some(entry)) => entry.clone(),
                Ok(None) | Err(_) => {
                    tracing::error!(node_id = self.id, index, "Committed entry is not in the log");
                    break;
                }
            };
            let result = self.state_machine.apply(&entry);
            tracing::trace!(node_id = self.id, index, "Applied");

            if let RaftState::Leader(leader) = &mut self.state {
                if let Some(write) = leader.pending.remove(&index) {
                    let reply = if write.term == entry.term {
                        Ok(SubmitResponse {
                            leader_id: self.id,
                            index,
                            result,
                        })
                    } else {
                        Err(RaftError::LeadershipLost)
                    };
                    let _ = write.reply_tx.send(reply);
                }
            }
        }

        if self.log.len() > self.config.max_log_entries {
            if let Err(e) = self.compact_log() {
                tracing::warn!(node_id = self.id, error = %e, "Compaction failed");
            }
        }
    }

    /// Folds every applied entry into a new snapshot. Returns the snapshot's
    /// last included index.
    pub(crate) fn compact_log(&mut self) -> Result<Index> {
        let upto = self.state_machine.last_applied().min(self.commit_index);
        let before = self.log.len();
        let snapshot = self.log.compact(upto, self.state_machine.dump())?;
        let index = snapshot.last_included_index;
        tracing::info!(
            node_id = self.id,
            snapshot_index = index,
            compacted = before - self.log.len(),
            "Compacted log"
        );
        Ok(index)
    }

    fn send_snapshot(&self, peer: NodeId) {
        let snapshot = self.log.snapshot().clone();
        let last_included = snapshot.last_included_index;
        tracing::info!(node_id = self.id, peer, last_included, "Sending snapshot");
        let req = InstallSnapshotRequest {
            term: self.term,
            leader_id: self.id,
            snapshot,
        };
        let term = self.term;
        let rpc = self.transport.install_snapshot(peer, req);
        self.spawn_rpc(rpc, self.config.rpc_timeout(), move |result| {
            NodeEvent::SnapshotResult {
                peer,
                term,
                last_included,
                result,
            }
        });
    }

    pub(crate) fn receive_install_snapshot(
        &mut self,
        req: InstallSnapshotRequest,
    ) -> InstallSnapshotReply {
        if req.term >= self.term {
            self.follow(req.term, req.leader_id);
            self.install_snapshot(req.snapshot);
        }
        InstallSnapshotReply { term: self.term }
    }

    pub(crate) fn receive_install_snapshot_reply(
        &mut self,
        peer: NodeId,
        term: Term,
        last_included: Index,
        result: Result<InstallSnapshotReply>,
    ) {
        let reply = match result {
            Ok(reply) => reply,
            Err(e) => {
                tracing::debug!(node_id = self.id, peer, error = %e, "InstallSnapshot failed");
                return;
            }
        };
        if reply.term > self.term {
            self.transition_to_follower(reply.term, None);
            return;
        }
        if term != self.term {
            return;
        }
        let now = self.now();
        if let Some(node) = self.nodes.get_mut(&peer) {
            node.last_heartbeat = Some(now);
        }
        let last_index = self.log.last_index();
        let RaftState::Leader(leader) = &mut self.state else {
            return;
        };
        let Some(progress) = leader.progress.get_mut(&peer) else {
            return;
        };
        progress.match_index = progress.match_index.max(last_included);
        progress.next_index = progress.next_index.max(progress.match_index + 1);
        let resend = progress.next_index <= last_index;

        self.maybe_commit();
        if resend {
            self.send_append_entries(peer);
        }
    }

    /// Replaces the log prefix and the state machine with `snapshot`.
    /// Returns false if this node already has everything it covers.
    pub(crate) fn install_snapshot(&mut self, snapshot: Snapshot) -> bool {
        let index = snapshot.last_included_index;
        if index <= self.commit_index {
            return false;
        }
        tracing::info!(
            node_id = self.id,
            last_included = index,
            term = snapshot.last_included_term,
            "Installing snapshot"
        );
        self.state_machine.restore(&snapshot);
        self.log.install(snapshot);
        self.commit_index = index;
        self.refresh_configuration();
        true
    }

    /// Drives a joint configuration to completion once it commits, and
    /// resolves the pending change once the final configuration commits.
    pub(crate) fn advance_membership_change(&mut self) {
        if !self.is_leader() {
            return;
        }
        let config_committed = self.log.configuration_index() <= self.commit_index;

        if let Configuration::Joint { new, .. } = &self.configuration {
            if config_committed {
                let voters = new.clone();
                tracing::info!(node_id = self.id, ?voters, "Joint configuration committed");
                let index = self.append_entry(Command::FinalConfig { voters });
                if let RaftState::Leader(leader) = &mut self.state {
                    if let Some(change) = leader.membership_change.as_mut() {
                        change.final_index = Some(index);
                    }
                }
                self.broadcast_append_entries();
                self.maybe_commit();
            }
            return;
        }

        let commit_index = self.commit_index;
        let RaftState::Leader(leader) = &mut self.state else {
            return;
        };
        let finished = leader
            .membership_change
            .as_ref()
            .and_then(|c| c.final_index)
            .is_some_and(|index| index <= commit_index);
        if finished {
            if let Some(change) = leader.membership_change.take() {
                if let Some(id) = change.removing.filter(|id| *id != self.id) {
                    leader.progress.remove(&id);
                    self.nodes.remove(&id);
                }
                tracing::info!(
                    node_id = self.id,
                    voters = ?self.configuration.voters(),
                    "Membership change complete"
                );
                let _ = change.reply_tx.send(Ok(true));
            }
        }

        if config_committed && !self.configuration.is_voter(self.id) {
            tracing::info!(node_id = self.id, "No longer a voter");
            self.transition_to_follower(self.term, None);
        }
    }
}
