use crate::config::{ClusterConfig, parse_socket_addr};
use crate::error::{BatonError, Result};
use crate::membership::{Membership, MembershipDelegate};
use crate::metadata::META_HEADER_LEN;
use crate::node::NodeHandle;
use async_trait::async_trait;
use bytes::Bytes;
use memberlist::delegate::{AliveDelegate, CompositeDelegate, EventDelegate, MergeDelegate};
use memberlist::net::NetTransportOptions;
use memberlist::net::stream_layer::tcp::Tcp;
use memberlist::proto::{MaybeResolvedAddress, Meta, NodeState};
use memberlist::tokio::{TokioNetTransport, TokioRuntime};
use memberlist::transport::Node as MemberlistNode;
use memberlist::{Memberlist, Options};
use smol_str::SmolStr;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

const LEAVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Failure detection tuned for clusters with frequent membership churn:
/// slower to declare a member dead, so fewer needless transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct GossipTuning {
    tcp_timeout: Duration,
    suspicion_mult: usize,
    push_pull_interval: Duration,
}

impl Default for GossipTuning {
    fn default() -> Self {
        Self {
            tcp_timeout: Duration::from_secs(30),
            suspicion_mult: 6,
            push_pull_interval: Duration::from_secs(15),
        }
    }
}

impl GossipTuning {
    fn options(&self) -> Options {
        Options::lan()
            .with_timeout(self.tcp_timeout)
            .with_suspicion_mult(self.suspicion_mult)
            .with_push_pull_interval(self.push_pull_interval)
    }
}

/// Address other members can reach us at: the configured advertise
/// address, else what memberlist resolved, else the bind address.
fn resolve_advertise_addr(
    configured: Option<SocketAddr>,
    reported: SocketAddr,
    bind: SocketAddr,
) -> SocketAddr {
    if let Some(addr) = configured {
        return addr;
    }
    if !reported.ip().is_unspecified() {
        return reported;
    }

    tracing::warn!(bind = %bind, "no routable advertise address, set advertise_addr");
    bind
}

fn to_handle(state: &NodeState<SmolStr, SocketAddr>) -> NodeHandle {
    NodeHandle::new(
        state.id().clone(),
        *state.address(),
        Bytes::copy_from_slice(state.meta().as_bytes()),
    )
}

/// Bridges memberlist delegate callbacks to a [`MembershipDelegate`].
#[derive(Clone)]
struct ClusterMemberlistDelegate {
    inner: Arc<dyn MembershipDelegate>,
}

#[derive(Debug, thiserror::Error)]
enum DelegateError {
    #[error("{0}")]
    Message(String),
}

impl ClusterMemberlistDelegate {
    fn new(inner: Arc<dyn MembershipDelegate>) -> Self {
        Self { inner }
    }

    fn validate_peer(
        &self,
        peer: &NodeState<SmolStr, SocketAddr>,
    ) -> std::result::Result<(), DelegateError> {
        let len = peer.meta().as_bytes().len();
        if len < META_HEADER_LEN {
            return Err(DelegateError::Message(format!(
                "peer '{}' carries {} bytes of metadata, need at least {}",
                peer.id(),
                len,
                META_HEADER_LEN
            )));
        }

        Ok(())
    }
}

impl memberlist::delegate::NodeDelegate for ClusterMemberlistDelegate {
    async fn node_meta(&self, limit: usize) -> Meta {
        let meta = self.inner.node_meta();
        if meta.len() > limit {
            tracing::warn!(
                len = meta.len(),
                limit,
                "node metadata exceeds memberlist limit"
            );
        }

        Meta::try_from(meta.to_vec()).unwrap_or_else(|error| {
            tracing::warn!(error = %error, "failed to build memberlist node meta");
            Meta::empty()
        })
    }

    async fn local_state(&self, _join: bool) -> Bytes {
        Bytes::new()
    }

    async fn merge_remote_state(&self, _buf: &[u8], _join: bool) {}
}

impl AliveDelegate for ClusterMemberlistDelegate {
    type Error = DelegateError;
    type Id = SmolStr;
    type Address = SocketAddr;

    async fn notify_alive(
        &self,
        peer: Arc<NodeState<Self::Id, Self::Address>>,
    ) -> std::result::Result<(), Self::Error> {
        self.validate_peer(&peer)
    }
}

impl MergeDelegate for ClusterMemberlistDelegate {
    type Error = DelegateError;
    type Id = SmolStr;
    type Address = SocketAddr;

    async fn notify_merge(
        &self,
        peers: Arc<[NodeState<Self::Id, Self::Address>]>,
    ) -> std::result::Result<(), Self::Error> {
        for peer in peers.iter() {
            self.validate_peer(peer)?;
        }

        Ok(())
    }
}

impl EventDelegate for ClusterMemberlistDelegate {
    type Id = SmolStr;
    type Address = SocketAddr;

    async fn notify_join(&self, node: Arc<NodeState<Self::Id, Self::Address>>) {
        tracing::debug!(node = %node.id(), "memberlist peer joined");
        self.inner.notify_join(&to_handle(&node));
    }

    async fn notify_leave(&self, node: Arc<NodeState<Self::Id, Self::Address>>) {
        tracing::debug!(node = %node.id(), "memberlist peer left");
        self.inner.notify_leave(&to_handle(&node));
    }

    async fn notify_update(&self, node: Arc<NodeState<Self::Id, Self::Address>>) {
        tracing::debug!(node = %node.id(), "memberlist peer updated");
        self.inner.notify_update(&to_handle(&node));
    }
}

type MemberlistType = Memberlist<
    TokioNetTransport<SmolStr, memberlist::tokio::TokioSocketAddrResolver, Tcp<TokioRuntime>>,
    CompositeDelegate<
        SmolStr,
        SocketAddr,
        ClusterMemberlistDelegate,
        memberlist::delegate::VoidDelegate<SmolStr, SocketAddr>,
        ClusterMemberlistDelegate,
        ClusterMemberlistDelegate,
        ClusterMemberlistDelegate,
    >,
>;

/// Gossip substrate backed by memberlist over TCP/UDP.
pub struct GossipMembership {
    memberlist: MemberlistType,
    local_name: SmolStr,
    advertise_addr: SocketAddr,
    delegate: Arc<dyn MembershipDelegate>,
}

impl GossipMembership {
    pub async fn start(config: &ClusterConfig, delegate: Arc<dyn MembershipDelegate>) -> Result<Self> {
        let bind = config.gossip_bind_addr()?;
        let advertise = config.gossip_advertise_addr()?;
        let local_name = SmolStr::new(config.resolved_node_name()?);

        let delegate_core = ClusterMemberlistDelegate::new(Arc::clone(&delegate));
        let composite = CompositeDelegate::new()
            .with_alive_delegate(delegate_core.clone())
            .with_event_delegate(delegate_core.clone())
            .with_merge_delegate(delegate_core.clone())
            .with_node_delegate(delegate_core);

        let mut transport_options = NetTransportOptions::<
            SmolStr,
            memberlist::tokio::TokioSocketAddrResolver,
            Tcp<TokioRuntime>,
        >::with_stream_layer_options(local_name.clone(), ());

        transport_options.add_bind_address(bind);
        if let Some(addr) = advertise {
            transport_options = transport_options.with_advertise_address(addr);
        }

        let options = GossipTuning::default().options();
        let memberlist = Memberlist::with_delegate(composite, transport_options, options)
            .await
            .map_err(|error| {
                BatonError::Membership(format!("failed to start memberlist: {}", error))
            })?;

        let advertise_addr =
            resolve_advertise_addr(advertise, *memberlist.advertise_address(), bind);
        tracing::info!(
            node = %local_name,
            bind = %bind,
            advertise = %advertise_addr,
            "memberlist started"
        );

        Ok(Self {
            memberlist,
            local_name,
            advertise_addr,
            delegate,
        })
    }
}

#[async_trait]
impl Membership for GossipMembership {
    async fn join(&self, seeds: &[String]) -> Result<usize> {
        let mut parsed_seeds = seeds
            .iter()
            .map(|seed| parse_socket_addr(seed, "seed"))
            .collect::<Result<Vec<_>>>()?;
        if parsed_seeds.is_empty() {
            parsed_seeds.push(self.advertise_addr);
        }

        let join_targets = parsed_seeds.into_iter().map(|seed| {
            MemberlistNode::new(
                SmolStr::new(seed.to_string()),
                MaybeResolvedAddress::resolved(seed),
            )
        });

        match self.memberlist.join_many(join_targets).await {
            Ok(joined) => {
                tracing::info!(joined = joined.len(), "joined cluster seeds");
                Ok(joined.len())
            }
            Err((joined, error)) => {
                if joined.is_empty() {
                    return Err(BatonError::Membership(format!(
                        "failed to join cluster seeds: {}",
                        error
                    )));
                }

                tracing::warn!(
                    joined = joined.len(),
                    error = %error,
                    "partially joined cluster seeds"
                );
                Ok(joined.len())
            }
        }
    }

    async fn members(&self) -> Vec<NodeHandle> {
        self.memberlist
            .members()
            .await
            .iter()
            .map(|member| to_handle(member))
            .collect()
    }

    fn local_name(&self) -> &str {
        &self.local_name
    }

    fn local_addr(&self) -> SocketAddr {
        self.advertise_addr
    }

    async fn local_node(&self) -> NodeHandle {
        self.members()
            .await
            .into_iter()
            .find(|member| member.name == self.local_name)
            .unwrap_or_else(|| {
                NodeHandle::new(
                    self.local_name.clone(),
                    self.advertise_addr,
                    self.delegate.node_meta(),
                )
            })
    }

    async fn update_local_meta(&self, timeout: Duration) -> Result<()> {
        self.memberlist.update_node(timeout).await.map_err(|error| {
            BatonError::Membership(format!("memberlist update_node failed: {}", error))
        })
    }

    async fn shutdown(&self) -> Result<()> {
        if let Err(error) = self.memberlist.leave(LEAVE_TIMEOUT).await {
            tracing::warn!(error = %error, "memberlist leave failed");
        }

        self.memberlist.shutdown().await.map_err(|error| {
            BatonError::Membership(format!("memberlist shutdown failed: {}", error))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tuning_favours_slow_failure_detection() {
        let tuning = GossipTuning::default();
        assert_eq!(tuning.suspicion_mult, 6);
        assert_eq!(tuning.push_pull_interval, Duration::from_secs(15));
        assert_eq!(tuning.tcp_timeout, Duration::from_secs(30));
    }

    #[test]
    fn advertise_addr_never_uses_wildcard_when_resolved() {
        let bind: SocketAddr = "0.0.0.0:7946".parse().unwrap();
        let resolved: SocketAddr = "192.168.1.20:7946".parse().unwrap();
        let configured: SocketAddr = "10.1.0.5:7946".parse().unwrap();

        assert_eq!(resolve_advertise_addr(None, resolved, bind), resolved);
        assert_eq!(
            resolve_advertise_addr(Some(configured), resolved, bind),
            configured
        );
        assert_eq!(resolve_advertise_addr(None, bind, bind), bind);
    }
}
