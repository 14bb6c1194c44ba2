use crate::error::Result;
use crate::messaging::{Connection, MessageTransport};
use crate::metadata::NodeMeta;
use bytes::Bytes;
use smol_str::SmolStr;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, OnceLock, RwLock as StdRwLock};
use tokio::sync::Mutex as AsyncMutex;

/// Snapshot of a member as reported by the membership substrate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeHandle {
    pub name: SmolStr,
    pub addr: SocketAddr,
    pub meta: Bytes,
}

impl NodeHandle {
    pub fn new(name: impl Into<SmolStr>, addr: SocketAddr, meta: Bytes) -> Self {
        Self {
            name: name.into(),
            addr,
            meta,
        }
    }
}

/// A cluster member. Wraps the latest substrate snapshot and owns the lazily
/// dialed direct connection to that member.
pub struct Node {
    handle: StdRwLock<NodeHandle>,
    conn: AsyncMutex<Option<Arc<dyn Connection>>>,
    sanitized_addr: OnceLock<String>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handle = self.handle();
        f.debug_struct("Node")
            .field("name", &handle.name)
            .field("addr", &handle.addr)
            .finish()
    }
}

impl Node {
    pub fn new(handle: NodeHandle) -> Self {
        Self {
            handle: StdRwLock::new(handle),
            conn: AsyncMutex::new(None),
            sanitized_addr: OnceLock::new(),
        }
    }

    pub fn handle(&self) -> NodeHandle {
        match self.handle.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn refresh(&self, handle: NodeHandle) {
        match self.handle.write() {
            Ok(mut guard) => *guard = handle,
            Err(poisoned) => *poisoned.into_inner() = handle,
        }
    }

    pub fn name(&self) -> SmolStr {
        self.handle().name
    }

    pub fn addr(&self) -> SocketAddr {
        self.handle().addr
    }

    /// IP address with separators replaced, usable as a metric or path
    /// component. Computed once.
    pub fn sanitized_addr(&self) -> &str {
        self.sanitized_addr
            .get_or_init(|| self.addr().ip().to_string().replace(['.', ':'], "_"))
    }

    /// Decodes the metadata from the latest substrate snapshot.
    pub fn meta(&self) -> Result<NodeMeta> {
        NodeMeta::decode(&self.handle().meta)
    }

    /// User portion of the node metadata.
    pub fn user_meta(&self) -> Result<Bytes> {
        Ok(self.meta()?.user)
    }

    pub fn is_ready(&self) -> bool {
        self.meta().map(|meta| meta.ready).unwrap_or(false)
    }

    /// Delivers one frame over the cached connection, dialing first if there
    /// is none. A failed dial or call drops the cached connection so the next
    /// frame redials. Callers sending to the same node serialize here.
    pub(crate) async fn deliver(&self, transport: &dyn MessageTransport, frame: Bytes) -> Result<()> {
        let mut conn = self.conn.lock().await;

        let current = match conn.as_ref() {
            Some(existing) => Arc::clone(existing),
            None => {
                let handle = self.handle();
                tracing::info!(
                    node = %handle.name,
                    addr = %handle.addr,
                    "establishing direct connection"
                );
                let dialed = transport.connect(&handle).await?;
                *conn = Some(Arc::clone(&dialed));
                dialed
            }
        };

        if let Err(error) = current.deliver(frame).await {
            *conn = None;
            return Err(error);
        }
        Ok(())
    }

    pub async fn has_connection(&self) -> bool {
        self.conn.lock().await.is_some()
    }
}

/// Maps member names to their [`Node`] wrappers so that repeated lookups of
/// the same member share one wrapper and one connection.
///
/// The cache does not decide member lifetime: members that vanish from the
/// substrate are evicted on the next [`NodeCache::sync`], while registry
/// entries may keep their own references.
#[derive(Default)]
pub struct NodeCache {
    nodes: StdMutex<HashMap<SmolStr, Arc<Node>>>,
}

impl NodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SmolStr, Arc<Node>>> {
        match self.nodes.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Returns the wrapper for `handle`, creating it on a miss and refreshing
    /// the snapshot on a hit.
    pub fn resolve(&self, handle: NodeHandle) -> Arc<Node> {
        let mut nodes = self.lock();
        if let Some(node) = nodes.get(&handle.name) {
            node.refresh(handle);
            return Arc::clone(node);
        }

        let node = Arc::new(Node::new(handle.clone()));
        nodes.insert(handle.name, Arc::clone(&node));
        node
    }

    /// Resolves a node named on the wire. An unknown name gets a wrapper with
    /// empty metadata until the substrate reports it.
    pub fn resolve_ref(&self, name: &str, addr: SocketAddr) -> Arc<Node> {
        let mut nodes = self.lock();
        if let Some(node) = nodes.get(name) {
            return Arc::clone(node);
        }

        let node = Arc::new(Node::new(NodeHandle::new(name, addr, Bytes::new())));
        nodes.insert(SmolStr::new(name), Arc::clone(&node));
        node
    }

    /// Resolves every handle and evicts members that are no longer listed.
    pub fn sync(&self, handles: Vec<NodeHandle>) -> Vec<Arc<Node>> {
        let live: HashSet<SmolStr> = handles.iter().map(|handle| handle.name.clone()).collect();
        let resolved: Vec<Arc<Node>> = handles
            .into_iter()
            .map(|handle| self.resolve(handle))
            .collect();
        self.lock().retain(|name, _| live.contains(name));
        resolved
    }

    pub fn get(&self, name: &str) -> Option<Arc<Node>> {
        self.lock().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(name: &str, ip: &str, meta: NodeMeta) -> NodeHandle {
        NodeHandle::new(name, format!("{}:7946", ip).parse().unwrap(), meta.encode())
    }

    #[test]
    fn cache_returns_one_wrapper_per_member() {
        let cache = NodeCache::new();
        let a1 = cache.resolve(handle("a", "10.0.0.1", NodeMeta::new(1)));
        let a2 = cache.resolve(handle(
            "a",
            "10.0.0.1",
            NodeMeta {
                ready: true,
                ..NodeMeta::new(1)
            },
        ));

        assert!(Arc::ptr_eq(&a1, &a2));
        assert!(a1.is_ready(), "hit refreshes the snapshot");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn sync_evicts_departed_members() {
        let cache = NodeCache::new();
        let kept = cache.resolve(handle("a", "10.0.0.1", NodeMeta::new(1)));
        cache.resolve(handle("b", "10.0.0.2", NodeMeta::new(2)));

        let live = cache.sync(vec![handle("a", "10.0.0.1", NodeMeta::new(1))]);
        assert_eq!(live.len(), 1);
        assert!(Arc::ptr_eq(&live[0], &kept));
        assert!(cache.get("b").is_none());
        assert_eq!(kept.name(), "a", "outside references stay valid");
    }

    #[test]
    fn node_metadata_accessors() {
        let node = Node::new(handle(
            "a",
            "10.1.2.3",
            NodeMeta {
                ready: true,
                sort_by: 9,
                user: Bytes::from_static(b"payload"),
            },
        ));
        assert!(node.is_ready());
        assert_eq!(node.meta().unwrap().sort_by, 9);
        assert_eq!(node.user_meta().unwrap(), Bytes::from_static(b"payload"));
        assert_eq!(node.sanitized_addr(), "10_1_2_3");

        let broken = Node::new(NodeHandle::new(
            "b",
            "10.0.0.9:1".parse().unwrap(),
            Bytes::from_static(b"x"),
        ));
        assert!(!broken.is_ready());
        assert!(broken.meta().is_err());
    }
}
