//! Cluster coordinator: datum registry, readiness and change notifications.

mod delegate;
mod transition;

pub use delegate::ClusterDelegate;

use crate::assignment::{NodeOrderKey, select_nodes, sort_nodes};
use crate::config::ClusterConfig;
use crate::datum::{DistDatum, datum_key};
use crate::error::{BatonError, DatumError, Result};
use crate::membership::Membership;
use crate::membership::gossip_memberlist::GossipMembership;
use crate::messaging::rpc::{HttpTransport, serve_rpc};
use crate::messaging::{MessageTransport, Messenger, Msg};
use crate::node::{Node, NodeCache};
use bytes::Bytes;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::net::TcpListener;
use tokio::sync::{Mutex as AsyncMutex, RwLock, mpsc};
use tokio::task::JoinHandle;

struct DatumEntry {
    datum: Arc<dyn DistDatum>,
    nodes: Vec<Arc<Node>>,
}

struct Registry {
    joined: bool,
    copies: usize,
    entries: HashMap<String, DatumEntry>,
}

/// Current placement of one registered datum.
#[derive(Debug, Clone)]
pub struct DatumAssignment {
    pub key: String,
    pub name: String,
    pub nodes: Vec<Arc<Node>>,
}

impl DatumAssignment {
    pub fn primary(&self) -> Option<&Arc<Node>> {
        self.nodes.first()
    }
}

pub struct Cluster {
    config: ClusterConfig,
    membership: Arc<dyn Membership>,
    delegate: Arc<ClusterDelegate>,
    messenger: Arc<Messenger>,
    nodes: Arc<NodeCache>,
    state: RwLock<Registry>,
    handoff_tx: mpsc::Sender<Msg>,
    handoff_rx: AsyncMutex<mpsc::Receiver<Msg>>,
    rpc_task: StdMutex<Option<JoinHandle<()>>>,
}

impl Cluster {
    /// Starts a member on the memberlist gossip substrate with the HTTP
    /// message listener on `rpc_port`. The member still has to [`join`].
    ///
    /// [`join`]: Cluster::join
    pub async fn start(config: ClusterConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let delegate = Arc::new(ClusterDelegate::new(
            config.resolved_sort_key(chrono::Utc::now()),
        ));
        let membership = Arc::new(GossipMembership::start(&config, delegate.clone()).await?);

        let rpc_addr = config.rpc_bind_addr()?;
        let listener = TcpListener::bind(rpc_addr).await?;
        let transport = Arc::new(HttpTransport::new(
            config.rpc_port,
            config.dial_timeout(),
            config.call_timeout(),
        )?);

        let cluster = Self::with_parts(config, membership, delegate, transport)?;
        let messenger = cluster.messenger();
        let rpc_task = tokio::spawn(async move {
            if let Err(error) = serve_rpc(listener, messenger).await {
                tracing::error!(error = %error, "message listener stopped");
            }
        });
        match cluster.rpc_task.lock() {
            Ok(mut guard) => *guard = Some(rpc_task),
            Err(poisoned) => *poisoned.into_inner() = Some(rpc_task),
        }

        tracing::info!(
            node = %cluster.membership.local_name(),
            rpc = %rpc_addr,
            "cluster member started"
        );
        Ok(cluster)
    }

    /// Assembles a coordinator from an already running substrate and
    /// transport. `delegate` must be the one the substrate reports to.
    ///
    /// Registers the handoff channel, so this is always channel 0 and must
    /// run inside a Tokio runtime.
    pub fn with_parts(
        config: ClusterConfig,
        membership: Arc<dyn Membership>,
        delegate: Arc<ClusterDelegate>,
        transport: Arc<dyn MessageTransport>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let nodes = Arc::new(NodeCache::new());
        let messenger = Messenger::new(
            membership.local_name(),
            membership.local_addr(),
            Arc::clone(&nodes),
            transport,
        );
        let (handoff_tx, handoff_rx) = messenger.register_channel();

        Ok(Arc::new(Self {
            state: RwLock::new(Registry {
                joined: false,
                copies: config.copies,
                entries: HashMap::new(),
            }),
            config,
            membership,
            delegate,
            messenger,
            nodes,
            handoff_tx,
            handoff_rx: AsyncMutex::new(handoff_rx),
            rpc_task: StdMutex::new(None),
        }))
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn messenger(&self) -> Arc<Messenger> {
        Arc::clone(&self.messenger)
    }

    /// Joins the cluster through `seeds` and publishes the local metadata.
    /// Returns the number of seeds reached.
    pub async fn join(&self, seeds: &[String]) -> Result<usize> {
        let joined = self.membership.join(seeds).await?;
        self.publish_local_meta().await?;
        self.state.write().await.joined = true;
        tracing::info!(node = %self.membership.local_name(), joined, "joined cluster");
        Ok(joined)
    }

    /// Populates the registry with the inventory returned by `loader`,
    /// assigned against the current ready nodes.
    ///
    /// Must follow [`join`](Cluster::join) and precede marking the local
    /// node ready, or the node may be handed data before its own state is
    /// loaded.
    pub async fn load_dist_data<F, Fut>(&self, loader: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<Vec<Arc<dyn DistDatum>>, DatumError>>,
    {
        let mut state = self.state.write().await;
        if !state.joined {
            return Err(BatonError::NotJoined);
        }

        let data = loader()
            .await
            .map_err(|error| BatonError::Loader(error.to_string()))?;
        let ready = self.ready_nodes().await;

        let copies = state.copies;
        for datum in data {
            let nodes = select_nodes(&ready, datum.id(), copies);
            state
                .entries
                .insert(datum_key(datum.as_ref()), DatumEntry { datum, nodes });
        }

        tracing::info!(
            datums = state.entries.len(),
            ready_nodes = ready.len(),
            "loaded dist data"
        );
        Ok(())
    }

    /// Marks the local node eligible (or not) for newly assigned data and
    /// publishes the change.
    pub async fn set_ready(&self, ready: bool) -> Result<()> {
        self.delegate.update_local_meta(|meta| meta.ready = ready);
        self.publish_local_meta().await?;
        tracing::info!(node = %self.membership.local_name(), ready, "readiness changed");
        Ok(())
    }

    /// Replaces the application part of the local metadata, keeping
    /// readiness and sort key.
    pub async fn set_user_meta(&self, user: Bytes) -> Result<()> {
        self.delegate.update_local_meta(|meta| meta.user = user);
        self.publish_local_meta().await
    }

    async fn publish_local_meta(&self) -> Result<()> {
        self.membership
            .update_local_meta(self.config.publish_timeout())
            .await
    }

    pub async fn local_node(&self) -> Arc<Node> {
        self.nodes.resolve(self.membership.local_node().await)
    }

    /// Every known member, ready or not.
    pub async fn members(&self) -> Vec<Arc<Node>> {
        self.nodes.sync(self.membership.members().await)
    }

    /// Members in cluster-wide order. Members whose metadata does not decode
    /// are left out.
    pub async fn sorted_nodes(&self) -> Vec<Arc<Node>> {
        self.ordered_nodes(false).await
    }

    /// Ready members in cluster-wide order; the input to assignment.
    pub async fn ready_nodes(&self) -> Vec<Arc<Node>> {
        self.ordered_nodes(true).await
    }

    async fn ordered_nodes(&self, ready_only: bool) -> Vec<Arc<Node>> {
        let mut keyed = Vec::new();
        for node in self.members().await {
            let meta = match node.meta() {
                Ok(meta) => meta,
                Err(error) => {
                    tracing::warn!(node = %node.name(), error = %error, "skipping member with bad metadata");
                    continue;
                }
            };
            if ready_only && !meta.ready {
                continue;
            }
            keyed.push((NodeOrderKey::new(meta.sort_by, node.name()), node));
        }

        sort_nodes(&mut keyed);
        keyed.into_iter().map(|(_, node)| node).collect()
    }

    pub async fn copies(&self) -> usize {
        self.state.read().await.copies
    }

    /// Changes the replica count. Only allowed before any data is loaded.
    pub async fn set_copies(&self, copies: usize) -> Result<()> {
        if copies == 0 {
            return Err(BatonError::Config("copies must be at least 1".to_string()));
        }

        let mut state = self.state.write().await;
        if !state.entries.is_empty() {
            return Err(BatonError::Config(
                "copies cannot change after dist data is loaded".to_string(),
            ));
        }
        state.copies = copies;
        Ok(())
    }

    /// Nodes currently assigned to `datum`, primary first. Empty when the
    /// datum is not registered.
    pub async fn nodes_for_dist_datum(&self, datum: &dyn DistDatum) -> Vec<Arc<Node>> {
        self.state
            .read()
            .await
            .entries
            .get(&datum_key(datum))
            .map(|entry| entry.nodes.clone())
            .unwrap_or_default()
    }

    /// Every registered datum with its placement, ordered by key.
    pub async fn assignments(&self) -> Vec<DatumAssignment> {
        let state = self.state.read().await;
        let mut listed: Vec<DatumAssignment> = state
            .entries
            .iter()
            .map(|(key, entry)| DatumAssignment {
                key: key.clone(),
                name: entry.datum.name(),
                nodes: entry.nodes.clone(),
            })
            .collect();
        listed.sort_by(|left, right| left.key.cmp(&right.key));
        listed
    }

    /// Allocates the next message channel. Every member must register its
    /// channels in the same order.
    pub fn register_channel(&self) -> (mpsc::Sender<Msg>, mpsc::Receiver<Msg>) {
        self.messenger.register_channel()
    }

    /// Receiver signalled whenever membership or member metadata changes.
    pub fn subscribe_to_changes(&self) -> mpsc::Receiver<()> {
        self.delegate.subscribe()
    }

    /// Stops the message listener and leaves the substrate.
    pub async fn shutdown(&self) -> Result<()> {
        let rpc_task = match self.rpc_task.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(task) = rpc_task {
            task.abort();
        }

        self.membership.shutdown().await?;
        tracing::info!(node = %self.membership.local_name(), "left cluster");
        Ok(())
    }
}
