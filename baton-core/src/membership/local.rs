//! In-process membership substrate.
//!
//! Members of one [`LocalCluster`] share a member table; joins, departures
//! and metadata publishes are fanned out to every joined member's delegate
//! synchronously. Useful for tests and for embedding several nodes in one
//! process.

use crate::error::{BatonError, Result};
use crate::membership::{Membership, MembershipDelegate};
use crate::node::NodeHandle;
use async_trait::async_trait;
use bytes::Bytes;
use smol_str::SmolStr;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

struct LocalMember {
    addr: SocketAddr,
    delegate: Arc<dyn MembershipDelegate>,
    published: Bytes,
    joined: bool,
}

#[derive(Default)]
pub struct LocalCluster {
    members: StdMutex<BTreeMap<SmolStr, LocalMember>>,
}

impl LocalCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<SmolStr, LocalMember>> {
        match self.members.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Registers a member. It becomes visible to others once it joins.
    pub fn member(
        self: &Arc<Self>,
        name: &str,
        addr: SocketAddr,
        delegate: Arc<dyn MembershipDelegate>,
    ) -> Result<Arc<LocalMembership>> {
        let name = SmolStr::new(name);
        let mut members = self.lock();
        if members.contains_key(&name) {
            return Err(BatonError::Membership(format!(
                "member '{}' already registered",
                name
            )));
        }

        let published = delegate.node_meta();
        members.insert(
            name.clone(),
            LocalMember {
                addr,
                delegate,
                published,
                joined: false,
            },
        );

        Ok(Arc::new(LocalMembership {
            cluster: Arc::clone(self),
            name,
            addr,
        }))
    }

    fn handle_of(name: &SmolStr, member: &LocalMember) -> NodeHandle {
        NodeHandle::new(name.clone(), member.addr, member.published.clone())
    }

    fn joined_delegates(
        members: &BTreeMap<SmolStr, LocalMember>,
    ) -> Vec<Arc<dyn MembershipDelegate>> {
        members
            .values()
            .filter(|member| member.joined)
            .map(|member| Arc::clone(&member.delegate))
            .collect()
    }

    fn join(&self, name: &SmolStr) -> Result<usize> {
        let (handle, delegates, peers) = {
            let mut members = self.lock();
            let peers = members
                .iter()
                .filter(|(other, member)| *other != name && member.joined)
                .count();
            let member = members
                .get_mut(name)
                .ok_or_else(|| BatonError::Membership(format!("unknown member '{}'", name)))?;
            member.joined = true;
            member.published = member.delegate.node_meta();
            let handle = Self::handle_of(name, member);
            (handle, Self::joined_delegates(&members), peers)
        };

        for delegate in delegates {
            delegate.notify_join(&handle);
        }
        Ok(peers + 1)
    }

    fn publish(&self, name: &SmolStr) -> Result<()> {
        let (handle, delegates) = {
            let mut members = self.lock();
            let member = members
                .get_mut(name)
                .ok_or_else(|| BatonError::Membership(format!("unknown member '{}'", name)))?;
            member.published = member.delegate.node_meta();
            if !member.joined {
                return Ok(());
            }
            let handle = Self::handle_of(name, member);
            (handle, Self::joined_delegates(&members))
        };

        for delegate in delegates {
            delegate.notify_update(&handle);
        }
        Ok(())
    }

    /// Removes a member as if it failed or left.
    pub fn leave(&self, name: &str) {
        let removed = {
            let mut members = self.lock();
            members
                .remove(name)
                .map(|member| (Self::handle_of(&SmolStr::new(name), &member), member.joined))
                .filter(|(_, joined)| *joined)
                .map(|(handle, _)| (handle, Self::joined_delegates(&members)))
        };

        if let Some((handle, delegates)) = removed {
            for delegate in delegates {
                delegate.notify_leave(&handle);
            }
        }
    }

    fn members(&self) -> Vec<NodeHandle> {
        self.lock()
            .iter()
            .filter(|(_, member)| member.joined)
            .map(|(name, member)| Self::handle_of(name, member))
            .collect()
    }
}

pub struct LocalMembership {
    cluster: Arc<LocalCluster>,
    name: SmolStr,
    addr: SocketAddr,
}

#[async_trait]
impl Membership for LocalMembership {
    async fn join(&self, _seeds: &[String]) -> Result<usize> {
        self.cluster.join(&self.name)
    }

    async fn members(&self) -> Vec<NodeHandle> {
        self.cluster.members()
    }

    fn local_name(&self) -> &str {
        &self.name
    }

    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    async fn local_node(&self) -> NodeHandle {
        let members = self.cluster.lock();
        match members.get(&self.name) {
            Some(member) => LocalCluster::handle_of(&self.name, member),
            None => NodeHandle::new(self.name.clone(), self.addr, Bytes::new()),
        }
    }

    async fn update_local_meta(&self, _timeout: Duration) -> Result<()> {
        self.cluster.publish(&self.name)
    }

    async fn shutdown(&self) -> Result<()> {
        self.cluster.leave(&self.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingDelegate {
        joins: AtomicUsize,
        leaves: AtomicUsize,
        updates: AtomicUsize,
    }

    impl MembershipDelegate for CountingDelegate {
        fn node_meta(&self) -> Bytes {
            Bytes::from_static(b"meta")
        }

        fn notify_join(&self, _node: &NodeHandle) {
            self.joins.fetch_add(1, Ordering::SeqCst);
        }

        fn notify_leave(&self, _node: &NodeHandle) {
            self.leaves.fetch_add(1, Ordering::SeqCst);
        }

        fn notify_update(&self, _node: &NodeHandle) {
            self.updates.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn members_appear_after_join_and_events_fan_out() {
        let cluster = LocalCluster::new();
        let first = Arc::new(CountingDelegate::default());
        let second = Arc::new(CountingDelegate::default());
        let a = cluster
            .member("a", "10.0.0.1:7946".parse().unwrap(), first.clone())
            .unwrap();
        let b = cluster
            .member("b", "10.0.0.2:7946".parse().unwrap(), second.clone())
            .unwrap();

        assert!(a.members().await.is_empty());
        assert_eq!(a.join(&[]).await.unwrap(), 1);
        assert_eq!(b.join(&[]).await.unwrap(), 2);

        let names: Vec<_> = b.members().await.into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(first.joins.load(Ordering::SeqCst), 2);

        b.update_local_meta(Duration::from_secs(1)).await.unwrap();
        assert_eq!(first.updates.load(Ordering::SeqCst), 1);

        b.shutdown().await.unwrap();
        assert_eq!(first.leaves.load(Ordering::SeqCst), 1);
        assert_eq!(a.members().await.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_member_names_are_rejected() {
        let cluster = LocalCluster::new();
        let delegate = Arc::new(CountingDelegate::default());
        cluster
            .member("a", "10.0.0.1:7946".parse().unwrap(), delegate.clone())
            .unwrap();
        assert!(
            cluster
                .member("a", "10.0.0.3:7946".parse().unwrap(), delegate)
                .is_err()
        );
    }
}
