use std::future::Future;
use std::pin::Pin;

use crate::error::Result;
use crate::msg::{
    AppendEntriesReply, AppendEntriesRequest, ClientReply, ClientRequest, InstallSnapshotReply,
    InstallSnapshotRequest, NodeId, RequestVoteReply, RequestVoteRequest,
};

pub type RpcFuture<T> = Pin<Box<dyn Future<Output = Result<T>> + Send>>;

/// How a node reaches its peers. One method per RPC type; each call resolves
/// to the peer's reply or to a delivery failure.
///
/// Implementations must not hold any reference back into the calling node:
/// the node spawns these futures and posts their results to its own inbox.
pub trait Transport: Send + Sync {
    fn request_vote(&self, target: NodeId, req: RequestVoteRequest) -> RpcFuture<RequestVoteReply>;

    fn append_entries(
        &self,
        target: NodeId,
        req: AppendEntriesRequest,
    ) -> RpcFuture<AppendEntriesReply>;

    fn install_snapshot(
        &self,
        target: NodeId,
        req: InstallSnapshotRequest,
    ) -> RpcFuture<InstallSnapshotReply>;

    /// Forwards a client write to `target`, normally the known leader.
    fn client_request(&self, target: NodeId, req: ClientRequest) -> RpcFuture<ClientReply>;
}
