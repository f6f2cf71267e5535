use ahash::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;

use quorumkv_raft::msg::{
    AppendEntriesReply, AppendEntriesRequest, ClientReply, ClientRequest, InstallSnapshotReply,
    InstallSnapshotRequest, NodeId, RequestVoteReply, RequestVoteRequest,
};
use quorumkv_raft::{RaftError, RaftHandle, Result, RpcFuture, Transport};

#[derive(Default)]
struct Links {
    handles: HashMap<NodeId, RaftHandle>,
    /// Nodes cut off from everyone.
    isolated: HashSet<NodeId>,
    /// Severed links, stored as (low id, high id).
    cut: HashSet<(NodeId, NodeId)>,
}

impl Links {
    fn is_connected(&self, a: NodeId, b: NodeId) -> bool {
        a == b
            || (!self.isolated.contains(&a)
                && !self.isolated.contains(&b)
                && !self.cut.contains(&link(a, b)))
    }
}

fn link(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
    (a.min(b), a.max(b))
}

/// In-process network between the nodes of a local cluster. Messages on a
/// broken link are dropped in either direction.
#[derive(Default)]
pub struct Router {
    links: RwLock<Links>,
}

impl Router {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn register(&self, id: NodeId, handle: RaftHandle) {
        self.links.write().await.handles.insert(id, handle);
    }

    pub async fn unregister(&self, id: NodeId) {
        self.links.write().await.handles.remove(&id);
    }

    /// Cuts `id` off from every other node.
    pub async fn isolate(&self, id: NodeId) {
        tracing::debug!(node_id = id, "Isolating node");
        self.links.write().await.isolated.insert(id);
    }

    pub async fn reconnect(&self, id: NodeId) {
        tracing::debug!(node_id = id, "Reconnecting node");
        self.links.write().await.isolated.remove(&id);
    }

    /// Severs every link between a node of `side_a` and a node of `side_b`.
    pub async fn partition(&self, side_a: &[NodeId], side_b: &[NodeId]) {
        tracing::debug!(?side_a, ?side_b, "Partitioning network");
        let mut links = self.links.write().await;
        for a in side_a {
            for b in side_b {
                if a != b {
                    links.cut.insert(link(*a, *b));
                }
            }
        }
    }

    /// Restores every link, including those of isolated nodes.
    pub async fn heal(&self) {
        tracing::debug!("Healing network");
        let mut links = self.links.write().await;
        links.cut.clear();
        links.isolated.clear();
    }

    pub async fn is_connected(&self, a: NodeId, b: NodeId) -> bool {
        self.links.read().await.is_connected(a, b)
    }

    /// The handle of `to`, if a message from `from` can reach it.
    async fn route(&self, from: NodeId, to: NodeId) -> Result<RaftHandle> {
        let links = self.links.read().await;
        if !links.is_connected(from, to) {
            return Err(RaftError::Unreachable(to));
        }
        links
            .handles
            .get(&to)
            .cloned()
            .ok_or(RaftError::Unreachable(to))
    }
}

/// A node's view of the [`Router`].
#[derive(Clone)]
pub struct RouterTransport {
    from: NodeId,
    router: Arc<Router>,
}

impl RouterTransport {
    pub fn new(from: NodeId, router: Arc<Router>) -> Self {
        Self { from, router }
    }

    /// Delivers a call to `target` and its reply back. Either leg fails if
    /// the link is down at that moment.
    fn deliver<T, F, Fut>(&self, target: NodeId, call: F) -> RpcFuture<T>
    where
        T: Send + 'static,
        F: FnOnce(RaftHandle) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let from = self.from;
        let router = self.router.clone();
        Box::pin(async move {
            let handle = router.route(from, target).await?;
            let reply = call(handle).await?;
            router.route(target, from).await?;
            Ok(reply)
        })
    }
}

impl Transport for RouterTransport {
    fn request_vote(&self, target: NodeId, req: RequestVoteRequest) -> RpcFuture<RequestVoteReply> {
        self.deliver(target, move |node| async move {
            node.handle_request_vote(req).await
        })
    }

    fn append_entries(
        &self,
        target: NodeId,
        req: AppendEntriesRequest,
    ) -> RpcFuture<AppendEntriesReply> {
        self.deliver(target, move |node| async move {
            node.handle_append_entries(req).await
        })
    }

    fn install_snapshot(
        &self,
        target: NodeId,
        req: InstallSnapshotRequest,
    ) -> RpcFuture<InstallSnapshotReply> {
        self.deliver(target, move |node| async move {
            node.handle_install_snapshot(req).await
        })
    }

    fn client_request(&self, target: NodeId, req: ClientRequest) -> RpcFuture<ClientReply> {
        self.deliver(target, move |node| async move {
            Ok(node.handle_client_request(req).await)
        })
    }
}
