//! Membership substrate seam.
//!
//! The substrate tracks live members and their metadata blobs and reports
//! joins, departures and metadata updates. Failure detection and transport
//! belong to the substrate; the cluster only consumes this interface.

pub mod gossip_memberlist;
pub mod local;

use crate::error::Result;
use crate::node::NodeHandle;
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::time::Duration;

#[async_trait]
pub trait Membership: Send + Sync {
    /// Join the cluster through at least one existing member. A member may
    /// join itself to form a cluster of one. Returns how many seeds answered.
    async fn join(&self, seeds: &[String]) -> Result<usize>;

    /// Every live member, ready or not, including the local one.
    async fn members(&self) -> Vec<NodeHandle>;

    fn local_name(&self) -> &str;

    fn local_addr(&self) -> SocketAddr;

    async fn local_node(&self) -> NodeHandle;

    /// Re-publish the local metadata, pulled from the delegate, waiting at
    /// most `timeout` for the broadcast.
    async fn update_local_meta(&self, timeout: Duration) -> Result<()>;

    async fn shutdown(&self) -> Result<()>;
}

/// Callbacks the substrate invokes on the cluster: one method per event plus
/// the local metadata provider.
pub trait MembershipDelegate: Send + Sync {
    fn node_meta(&self) -> Bytes;

    fn notify_join(&self, node: &NodeHandle);

    fn notify_leave(&self, node: &NodeHandle);

    fn notify_update(&self, node: &NodeHandle);
}
