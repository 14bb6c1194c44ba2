use crate::membership::MembershipDelegate;
use crate::metadata::NodeMeta;
use crate::node::NodeHandle;
use bytes::Bytes;
use std::sync::{Mutex as StdMutex, RwLock as StdRwLock};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Owns the local node metadata and fans membership events out to change
/// subscribers. Substrate callbacks land here and never touch the registry.
pub struct ClusterDelegate {
    meta: StdRwLock<NodeMeta>,
    subscribers: StdMutex<Vec<mpsc::Sender<()>>>,
}

impl ClusterDelegate {
    pub fn new(sort_by: i64) -> Self {
        Self {
            meta: StdRwLock::new(NodeMeta::new(sort_by)),
            subscribers: StdMutex::new(Vec::new()),
        }
    }

    pub fn local_meta(&self) -> NodeMeta {
        match self.meta.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Applies `update` to the cached local metadata. Publishing is up to
    /// the caller.
    pub fn update_local_meta(&self, update: impl FnOnce(&mut NodeMeta)) {
        match self.meta.write() {
            Ok(mut guard) => update(&mut guard),
            Err(poisoned) => update(&mut poisoned.into_inner()),
        }
    }

    /// Returns a receiver signalled on every membership change. The buffer
    /// holds one pending signal; further signals are dropped until it is
    /// consumed.
    pub fn subscribe(&self) -> mpsc::Receiver<()> {
        let (tx, rx) = mpsc::channel(1);
        self.lock_subscribers().push(tx);
        rx
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.lock_subscribers().len()
    }

    fn lock_subscribers(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::Sender<()>>> {
        match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn notify_all(&self) {
        self.lock_subscribers()
            .retain(|subscriber| match subscriber.try_send(()) {
                Ok(()) | Err(TrySendError::Full(())) => true,
                Err(TrySendError::Closed(())) => false,
            });
    }
}

impl MembershipDelegate for ClusterDelegate {
    fn node_meta(&self) -> Bytes {
        self.local_meta().encode()
    }

    fn notify_join(&self, node: &NodeHandle) {
        tracing::info!(node = %node.name, addr = %node.addr, "member joined");
        self.notify_all();
    }

    fn notify_leave(&self, node: &NodeHandle) {
        tracing::info!(node = %node.name, addr = %node.addr, "member left");
        self.notify_all();
    }

    fn notify_update(&self, node: &NodeHandle) {
        tracing::debug!(node = %node.name, "member metadata updated");
        self.notify_all();
    }
}
