use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::msg::SubmitResponse;

/// Every peer is unreachable.
struct NullTransport;

impl Transport for NullTransport {
    fn request_vote(&self, target: NodeId, _: RequestVoteRequest) -> RpcFuture<RequestVoteReply> {
        Box::pin(async move { Err(RaftError::Unreachable(target)) })
    }

    fn append_entries(
        &self,
        target: NodeId,
        _: AppendEntriesRequest,
    ) -> RpcFuture<AppendEntriesReply> {
        Box::pin(async move { Err(RaftError::Unreachable(target)) })
    }

    fn install_snapshot(
        &self,
        target: NodeId,
        _: InstallSnapshotRequest,
    ) -> RpcFuture<InstallSnapshotReply> {
        Box::pin(async move { Err(RaftError::Unreachable(target)) })
    }

    fn client_request(&self, target: NodeId, _: ClientRequest) -> RpcFuture<ClientReply> {
        Box::pin(async move { Err(RaftError::Unreachable(target)) })
    }
}

fn spawn(config: RaftConfig) -> RaftHandle {
    let (handle, _task) =
        RaftNode::spawn(config, Arc::new(NullTransport), Arc::new(TokioScheduler)).unwrap();
    handle
}

/// A node whose timers only fire when the test advances `clock`.
fn spawn_manual(config: RaftConfig) -> (RaftHandle, ManualScheduler) {
    let clock = ManualScheduler::new();
    let (handle, _task) =
        RaftNode::spawn(config, Arc::new(NullTransport), Arc::new(clock.clone())).unwrap();
    (handle, clock)
}

/// Peers that grant every vote and answer every AppendEntries, but never
/// accept an entry. Once disconnected they are unreachable.
#[derive(Default)]
struct StubbornPeers {
    disconnected: AtomicBool,
}

impl StubbornPeers {
    fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }

    fn reach(&self, target: NodeId) -> Result<()> {
        if self.disconnected.load(Ordering::SeqCst) {
            Err(RaftError::Unreachable(target))
        } else {
            Ok(())
        }
    }
}

impl Transport for StubbornPeers {
    fn request_vote(&self, target: NodeId, req: RequestVoteRequest) -> RpcFuture<RequestVoteReply> {
        let reply = self.reach(target).map(|()| RequestVoteReply {
            term: req.term,
            vote_granted: true,
        });
        Box::pin(async move { reply })
    }

    fn append_entries(
        &self,
        target: NodeId,
        req: AppendEntriesRequest,
    ) -> RpcFuture<AppendEntriesReply> {
        let reply = self.reach(target).map(|()| AppendEntriesReply {
            term: req.term,
            success: false,
            last_log_index: 0,
        });
        Box::pin(async move { reply })
    }

    fn install_snapshot(
        &self,
        target: NodeId,
        _: InstallSnapshotRequest,
    ) -> RpcFuture<InstallSnapshotReply> {
        Box::pin(async move { Err(RaftError::Unreachable(target)) })
    }

    fn client_request(&self, target: NodeId, _: ClientRequest) -> RpcFuture<ClientReply> {
        Box::pin(async move { Err(RaftError::Unreachable(target)) })
    }
}

fn spawn_with_peers(config: RaftConfig) -> (RaftHandle, ManualScheduler, Arc<StubbornPeers>) {
    let clock = ManualScheduler::new();
    let peers = Arc::new(StubbornPeers::default());
    let (handle, _task) =
        RaftNode::spawn(config, peers.clone(), Arc::new(clock.clone())).unwrap();
    (handle, clock, peers)
}

/// Moves `clock` forward in small steps, letting the node react to each.
async fn advance(clock: &ManualScheduler, by: Duration) {
    let step = Duration::from_millis(10);
    let mut moved = Duration::ZERO;
    while moved < by {
        let delta = step.min(by - moved);
        clock.advance(delta);
        moved += delta;
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

/// Runs out the election timeout and checks the node won.
async fn elect(handle: &RaftHandle, clock: &ManualScheduler) {
    // The first timer is armed once the node answers.
    handle.state().await.unwrap();
    advance(clock, Duration::from_millis(300)).await;
    assert!(handle.state().await.unwrap().is_leader());
}

fn three_node_config() -> RaftConfig {
    RaftConfig::new(1, "n1").with_peer(2, "n2").with_peer(3, "n3")
}

async fn single_node_leader() -> RaftHandle {
    let handle = spawn(RaftConfig::new(1, "n1"));
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(handle.state().await.unwrap().is_leader());
    handle
}

fn entry(term: Term, index: Index, command: Command) -> LogEntry {
    LogEntry {
        term,
        index,
        command,
        timestamp: 0,
    }
}

#[tokio::test(start_paused = true)]
async fn single_node_elects_itself_and_applies_writes() {
    let handle = single_node_leader().await;
    let state = handle.state().await.unwrap();
    assert_eq!(state.current_term, 1);
    assert_eq!(state.leader_id, Some(1));
    // The leader's no-op.
    assert_eq!(state.entry(1).map(|e| &e.command), Some(&Command::Noop));

    let first = handle.set("a", "1").await.unwrap();
    assert_eq!(
        first,
        SubmitResponse {
            leader_id: 1,
            index: 2,
            result: None
        }
    );
    let second = handle.set("a", "2").await.unwrap();
    assert_eq!(second.result.as_deref(), Some("1"));

    assert_eq!(handle.read("a").await.unwrap().as_deref(), Some("2"));
    assert_eq!(handle.read("missing").await.unwrap(), None);

    let deleted = handle.delete("a").await.unwrap();
    assert_eq!(deleted.result.as_deref(), Some("2"));
    assert!(handle.state_machine_snapshot().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn vote_granted_once_per_term() {
    let (handle, _clock) = spawn_manual(three_node_config());
    let request = |candidate_id| RequestVoteRequest {
        term: 1,
        candidate_id,
        last_log_index: 0,
        last_log_term: 0,
    };

    let reply = handle.handle_request_vote(request(2)).await.unwrap();
    assert!(reply.vote_granted);
    assert_eq!(reply.term, 1);

    // Same candidate may ask again, a different one may not.
    assert!(handle.handle_request_vote(request(2)).await.unwrap().vote_granted);
    assert!(!handle.handle_request_vote(request(3)).await.unwrap().vote_granted);

    let state = handle.state().await.unwrap();
    assert_eq!(state.voted_for, Some(2));
    assert_eq!(state.role, Role::Follower);

    let stale = RequestVoteRequest {
        term: 0,
        ..request(3)
    };
    let reply = handle.handle_request_vote(stale).await.unwrap();
    assert!(!reply.vote_granted);
    assert_eq!(reply.term, 1);
}

#[tokio::test(start_paused = true)]
async fn vote_denied_to_stale_log() {
    let (handle, _clock) = spawn_manual(three_node_config());
    let append = AppendEntriesRequest {
        term: 2,
        leader_id: 2,
        prev_log_index: 0,
        prev_log_term: 0,
        entries: vec![entry(1, 1, Command::Noop), entry(2, 2, Command::set("k", "v"))],
        leader_commit: 0,
    };
    assert!(handle.handle_append_entries(append).await.unwrap().success);

    let behind = RequestVoteRequest {
        term: 3,
        candidate_id: 3,
        last_log_index: 5,
        last_log_term: 1,
    };
    let reply = handle.handle_request_vote(behind).await.unwrap();
    assert!(!reply.vote_granted);
    // The higher term is still adopted.
    assert_eq!(reply.term, 3);
}

#[tokio::test(start_paused = true)]
async fn follower_appends_and_commits_up_to_last_new_entry() {
    let (handle, _clock) = spawn_manual(three_node_config());
    let append = AppendEntriesRequest {
        term: 1,
        leader_id: 2,
        prev_log_index: 0,
        prev_log_term: 0,
        entries: vec![entry(1, 1, Command::Noop), entry(1, 2, Command::set("a", "1"))],
        leader_commit: 5,
    };
    let reply = handle.handle_append_entries(append).await.unwrap();
    assert!(reply.success);
    assert_eq!(reply.last_log_index, 2);

    let state = handle.state().await.unwrap();
    assert_eq!(state.leader_id, Some(2));
    assert_eq!(state.commit_index, 2);
    assert_eq!(state.last_applied, 2);
    assert_eq!(
        handle.state_machine_snapshot().await.unwrap().get("a").map(String::as_str),
        Some("1")
    );

    // A gap is rejected with our last index as a hint.
    let gap = AppendEntriesRequest {
        term: 1,
        leader_id: 2,
        prev_log_index: 7,
        prev_log_term: 1,
        entries: vec![],
        leader_commit: 5,
    };
    let reply = handle.handle_append_entries(gap).await.unwrap();
    assert!(!reply.success);
    assert_eq!(reply.last_log_index, 2);

    // So is a stale leader.
    let stale = AppendEntriesRequest {
        term: 0,
        leader_id: 3,
        prev_log_index: 0,
        prev_log_term: 0,
        entries: vec![],
        leader_commit: 0,
    };
    let reply = handle.handle_append_entries(stale).await.unwrap();
    assert!(!reply.success);
    assert_eq!(reply.term, 1);
}

#[tokio::test(start_paused = true)]
async fn conflicting_entries_are_replaced() {
    let (handle, _clock) = spawn_manual(three_node_config());
    let first = AppendEntriesRequest {
        term: 1,
        leader_id: 2,
        prev_log_index: 0,
        prev_log_term: 0,
        entries: vec![
            entry(1, 1, Command::Noop),
            entry(1, 2, Command::set("x", "old")),
            entry(1, 3, Command::set("y", "old")),
        ],
        leader_commit: 1,
    };
    assert!(handle.handle_append_entries(first).await.unwrap().success);

    let second = AppendEntriesRequest {
        term: 2,
        leader_id: 3,
        prev_log_index: 1,
        prev_log_term: 1,
        entries: vec![entry(2, 2, Command::set("x", "new"))],
        leader_commit: 2,
    };
    let reply = handle.handle_append_entries(second).await.unwrap();
    assert!(reply.success);
    assert_eq!(reply.last_log_index, 2);

    let state = handle.state().await.unwrap();
    assert_eq!(state.leader_id, Some(3));
    assert_eq!(state.current_term, 2);
    assert_eq!(state.log.len(), 2);
    assert_eq!(
        handle.state_machine_snapshot().await.unwrap().get("x").map(String::as_str),
        Some("new")
    );
}

#[tokio::test(start_paused = true)]
async fn observer_never_campaigns() {
    let (handle, clock) = spawn_manual(RaftConfig::new(4, "n4").with_peer(1, "n1").as_observer());
    handle.state().await.unwrap();
    for _ in 0..10 {
        clock.advance(Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    let state = handle.state().await.unwrap();
    assert_eq!(state.current_term, 0);
    assert_eq!(state.role, Role::Follower);
}

#[tokio::test(start_paused = true)]
async fn election_timeout_starts_campaign() {
    let (handle, clock) = spawn_manual(three_node_config());
    // Make sure the node armed its first timer before moving the clock.
    let mut state = handle.state().await.unwrap();
    assert_eq!(state.current_term, 0);
    clock.advance(Duration::from_millis(300));
    for _ in 0..100 {
        if state.current_term > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
        state = handle.state().await.unwrap();
    }
    assert_eq!(state.current_term, 1);
    assert_eq!(state.role, Role::Candidate);
    assert_eq!(state.voted_for, Some(1));
}

#[tokio::test(start_paused = true)]
async fn follower_rejects_writes_and_reads_without_leader() {
    let (handle, _clock) = spawn_manual(three_node_config());
    assert_eq!(
        handle.set("a", "1").await,
        Err(RaftError::NotLeader { leader_id: None })
    );
    assert_eq!(
        handle.read("a").await,
        Err(RaftError::NotLeader { leader_id: None })
    );
}

#[tokio::test(start_paused = true)]
async fn follower_forwards_once() {
    let (handle, _clock) = spawn_manual(three_node_config());
    let heartbeat = AppendEntriesRequest {
        term: 1,
        leader_id: 2,
        prev_log_index: 0,
        prev_log_term: 0,
        entries: vec![],
        leader_commit: 0,
    };
    handle.handle_append_entries(heartbeat).await.unwrap();

    // The leader is unreachable, so forwarding fails with a redirect.
    assert_eq!(
        handle.set("a", "1").await,
        Err(RaftError::NotLeader { leader_id: Some(2) })
    );

    // A request that was already forwarded is not forwarded again.
    let forwarded = ClientRequest {
        command: Command::set("a", "1"),
        forwarded: true,
    };
    assert_eq!(
        handle.handle_client_request(forwarded).await,
        Err(RaftError::NotLeader { leader_id: Some(2) })
    );
}

#[tokio::test(start_paused = true)]
async fn configuration_commands_are_not_client_writes() {
    let handle = single_node_leader().await;
    let command = Command::FinalConfig {
        voters: [1, 2].into_iter().collect(),
    };
    assert!(matches!(
        handle.submit(command).await,
        Err(RaftError::InvalidCommand(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn log_is_compacted_past_limit() {
    let handle = spawn(RaftConfig::new(1, "n1").with_max_log_entries(5));
    tokio::time::sleep(Duration::from_millis(500)).await;
    for i in 0..20 {
        handle.set(format!("k{i}"), format!("v{i}")).await.unwrap();
    }

    assert!(handle.log_length().await.unwrap() <= 5);
    let snapshot = handle.snapshot().await.unwrap();
    assert!(snapshot.last_included_index > 0);
    assert_eq!(snapshot.configuration, Configuration::stable([1]));

    let state = handle.state_machine_snapshot().await.unwrap();
    assert_eq!(state.len(), 20);
    assert_eq!(state.get("k19").map(String::as_str), Some("v19"));

    // Explicit compaction folds in everything applied.
    let index = handle.compact().await.unwrap();
    assert_eq!(index, 21);
    assert_eq!(handle.log_length().await.unwrap(), 0);
    assert_eq!(handle.read("k7").await.unwrap().as_deref(), Some("v7"));
}

#[tokio::test(start_paused = true)]
async fn install_snapshot_replaces_state() {
    let (handle, _clock) = spawn_manual(three_node_config());
    let mut state = BTreeMap::new();
    state.insert("a".to_string(), "1".to_string());
    let snapshot = Snapshot {
        last_included_index: 10,
        last_included_term: 2,
        state: state.clone(),
        created_at: 0,
        configuration: Configuration::stable([1, 2, 3]),
    };
    handle.install_snapshot(snapshot.clone()).await.unwrap();

    assert_eq!(handle.state_machine_snapshot().await.unwrap(), state);
    assert_eq!(handle.snapshot().await.unwrap(), snapshot);
    let summary = handle.state().await.unwrap();
    assert_eq!(summary.commit_index, 10);
    assert_eq!(summary.last_applied, 10);
    assert_eq!(summary.last_log_index(), 10);

    // An older snapshot changes nothing.
    let older = Snapshot {
        last_included_index: 5,
        state: BTreeMap::new(),
        ..snapshot.clone()
    };
    handle.install_snapshot(older).await.unwrap();
    assert_eq!(handle.snapshot().await.unwrap(), snapshot);
}

#[tokio::test(start_paused = true)]
async fn leader_refuses_snapshot_install() {
    let handle = single_node_leader().await;
    let snapshot = Snapshot::initial(Configuration::stable([1]));
    assert!(matches!(
        handle.install_snapshot(snapshot).await,
        Err(RaftError::InvalidCommand(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn membership_change_needs_leader() {
    let (handle, _clock) = spawn_manual(three_node_config());
    assert_eq!(
        handle.begin_membership_change([1, 2]).await,
        Err(RaftError::NotLeader { leader_id: None })
    );
    assert_eq!(
        handle.remove_node(3).await,
        Err(RaftError::NotLeader { leader_id: None })
    );
    // A rejected voter leaves no row behind.
    assert_eq!(
        handle.add_node(8, "n8", true).await,
        Err(RaftError::NotLeader { leader_id: None })
    );
    // Observers are table-only and need no leader.
    assert_eq!(handle.add_node(9, "n9", false).await, Ok(true));
    let state = handle.state().await.unwrap();
    assert!(state.nodes.iter().any(|n| n.id == 9 && !n.is_voter));
    assert!(state.nodes.iter().all(|n| n.id != 8));
}

#[tokio::test(start_paused = true)]
async fn one_membership_change_at_a_time() {
    let handle = single_node_leader().await;
    // Node 2 never answers, so the joint configuration cannot commit.
    let (first, second) = tokio::join!(
        handle.begin_membership_change([1, 2]),
        handle.begin_membership_change([1, 3]),
    );
    assert_eq!(second, Err(RaftError::MembershipChangeInProgress));
    // The leader loses its quorum in the joint configuration and steps down.
    assert_eq!(first, Ok(false));
    assert!(!handle.state().await.unwrap().is_leader());
}

#[tokio::test(start_paused = true)]
async fn observers_are_added_and_removed_without_config_change() {
    let handle = single_node_leader().await;
    assert_eq!(handle.add_node(5, "n5", false).await, Ok(true));
    assert_eq!(handle.remove_node(5).await, Ok(true));
    let state = handle.state().await.unwrap();
    assert!(state.nodes.iter().all(|n| n.id != 5));
    assert_eq!(state.configuration, Configuration::stable([1]));
}

#[tokio::test(start_paused = true)]
async fn leader_steps_down_within_lease_after_losing_peers() {
    let config = three_node_config();
    let lease = config.leader_lease();
    let (handle, clock, peers) = spawn_with_peers(config);
    elect(&handle, &clock).await;

    // Replies keep the lease alive, accepted or not.
    advance(&clock, 2 * lease).await;
    assert!(handle.state().await.unwrap().is_leader());

    peers.disconnect();
    advance(&clock, lease).await;
    let state = handle.state().await.unwrap();
    assert_ne!(state.role, Role::Leader);
    assert_eq!(state.current_term, 1);
    assert_eq!(state.leader_id, None);
}

#[tokio::test(start_paused = true)]
async fn pending_write_times_out() {
    let config = three_node_config();
    let timeout = config.client_timeout();
    let (handle, clock, _peers) = spawn_with_peers(config);
    elect(&handle, &clock).await;

    let write = tokio::spawn({
        let handle = handle.clone();
        async move { handle.set("a", "1").await }
    });
    tokio::time::sleep(Duration::from_millis(1)).await;
    advance(&clock, timeout + Duration::from_millis(100)).await;

    assert_eq!(write.await.unwrap(), Err(RaftError::Timeout));
    assert!(handle.state().await.unwrap().is_leader());
}

#[tokio::test(start_paused = true)]
async fn unconfirmed_read_fails() {
    let config = three_node_config();
    let timeout = config.client_timeout();
    let (handle, clock, _peers) = spawn_with_peers(config);
    elect(&handle, &clock).await;

    // Nothing from this term commits, so the read is never served.
    let read = tokio::spawn({
        let handle = handle.clone();
        async move { handle.read("a").await }
    });
    tokio::time::sleep(Duration::from_millis(1)).await;
    advance(&clock, timeout + Duration::from_millis(100)).await;

    assert_eq!(read.await.unwrap(), Err(RaftError::ReadUnconfirmed));
    assert!(handle.state().await.unwrap().is_leader());
}

#[tokio::test(start_paused = true)]
async fn new_voter_gets_a_full_lease_to_answer() {
    let config = RaftConfig::new(1, "n1");
    let lease = config.leader_lease();
    let (handle, clock) = spawn_manual(config);
    elect(&handle, &clock).await;

    let add = tokio::spawn({
        let handle = handle.clone();
        async move { handle.add_node(2, "n2", true).await }
    });
    tokio::time::sleep(Duration::from_millis(1)).await;

    // Node 2 is needed for the joint quorum but has not answered yet.
    advance(&clock, lease / 2).await;
    assert!(handle.state().await.unwrap().is_leader());

    advance(&clock, lease).await;
    assert!(!handle.state().await.unwrap().is_leader());
    assert_eq!(add.await.unwrap(), Ok(false));
}

#[tokio::test(start_paused = true)]
async fn calls_fail_after_shutdown() {
    let handle = single_node_leader().await;
    handle.shutdown().await;
    assert_eq!(handle.state().await.err(), Some(RaftError::Shutdown));
    assert_eq!(handle.set("a", "1").await, Err(RaftError::Shutdown));
}

#[test]
fn invalid_config_is_rejected() {
    let config = RaftConfig::new(1, "n1").with_election_timeout(0, 0);
    let result = RaftNode::new(config, Arc::new(NullTransport), Arc::new(TokioScheduler));
    assert!(matches!(result, Err(RaftError::InvalidConfig(_))));
}
