//! In-process message transport for tests and single-process clusters.

use super::{Connection, MessageTransport, Messenger};
use crate::error::{BatonError, Result};
use crate::node::NodeHandle;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

/// Routes frames between messengers by gossip address. Partitioned
/// addresses refuse both dials and deliveries until healed.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    inner: Arc<NetworkInner>,
}

#[derive(Default)]
struct NetworkInner {
    routes: StdMutex<HashMap<SocketAddr, Weak<Messenger>>>,
    partitioned: StdMutex<HashSet<SocketAddr>>,
    dials: AtomicUsize,
    delivered: AtomicUsize,
    dropped: AtomicUsize,
}

impl NetworkInner {
    fn route(&self, addr: &SocketAddr) -> Result<Arc<Messenger>> {
        let partitioned = match self.partitioned.lock() {
            Ok(guard) => guard.contains(addr),
            Err(poisoned) => poisoned.into_inner().contains(addr),
        };
        if partitioned {
            return Err(BatonError::Transport(format!("{} is unreachable", addr)));
        }

        let routes = match self.routes.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        routes
            .get(addr)
            .and_then(Weak::upgrade)
            .ok_or_else(|| BatonError::Transport(format!("no messenger at {}", addr)))
    }
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, addr: SocketAddr, messenger: &Arc<Messenger>) {
        match self.inner.routes.lock() {
            Ok(mut guard) => guard.insert(addr, Arc::downgrade(messenger)),
            Err(poisoned) => poisoned.into_inner().insert(addr, Arc::downgrade(messenger)),
        };
    }

    pub fn partition(&self, addr: SocketAddr) {
        match self.inner.partitioned.lock() {
            Ok(mut guard) => guard.insert(addr),
            Err(poisoned) => poisoned.into_inner().insert(addr),
        };
    }

    pub fn heal(&self, addr: SocketAddr) {
        match self.inner.partitioned.lock() {
            Ok(mut guard) => guard.remove(&addr),
            Err(poisoned) => poisoned.into_inner().remove(&addr),
        };
    }

    pub fn dial_count(&self) -> usize {
        self.inner.dials.load(Ordering::SeqCst)
    }

    /// Frames handed to a receiving messenger, including ones it discarded.
    pub fn delivered_count(&self) -> usize {
        self.inner.delivered.load(Ordering::SeqCst)
    }

    /// Frames refused because the destination was partitioned or gone.
    pub fn dropped_count(&self) -> usize {
        self.inner.dropped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageTransport for LocalNetwork {
    async fn connect(&self, node: &NodeHandle) -> Result<Arc<dyn Connection>> {
        self.inner.route(&node.addr)?;
        self.inner.dials.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(LocalConnection {
            network: Arc::clone(&self.inner),
            addr: node.addr,
        }))
    }
}

struct LocalConnection {
    network: Arc<NetworkInner>,
    addr: SocketAddr,
}

#[async_trait]
impl Connection for LocalConnection {
    async fn deliver(&self, frame: Bytes) -> Result<()> {
        let messenger = match self.network.route(&self.addr) {
            Ok(messenger) => messenger,
            Err(error) => {
                self.network.dropped.fetch_add(1, Ordering::SeqCst);
                return Err(error);
            }
        };
        self.network.delivered.fetch_add(1, Ordering::SeqCst);
        messenger.deliver(&frame).await
    }
}
