//! Baton - cluster-aware ownership assignment and graceful handoff
//!
//! Nodes are identical; each datum, identified by an integer id, belongs to
//! the node picked by `id mod ready_nodes`. When membership or readiness
//! changes, a transition lets the previous owner relinquish each moving
//! datum and tells the new owner, over a direct message, that it may
//! acquire it. Confirmations that do not arrive in time are given up on.

pub mod assignment;
pub mod cluster;
pub mod config;
pub mod datum;
pub mod error;
pub mod membership;
pub mod messaging;
pub mod metadata;
pub mod node;

pub use assignment::{NodeOrderKey, select_nodes, sort_nodes};
pub use cluster::{Cluster, ClusterDelegate, DatumAssignment};
pub use config::{ClusterConfig, DEFAULT_RPC_PORT};
pub use datum::{DistDatum, datum_key};
pub use error::{BatonError, DatumError, Result};
pub use membership::gossip_memberlist::GossipMembership;
pub use membership::local::{LocalCluster, LocalMembership};
pub use membership::{Membership, MembershipDelegate};
pub use messaging::local::LocalNetwork;
pub use messaging::rpc::{DELIVER_PATH, HttpTransport, rpc_router, serve_rpc};
pub use messaging::{CHANNEL_CAPACITY, Connection, MessageTransport, Messenger, Msg};
pub use metadata::{META_HEADER_LEN, NodeMeta};
pub use node::{Node, NodeCache, NodeHandle};
