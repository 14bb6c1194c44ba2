//! Point-to-point messaging between members, independent of gossip.
//!
//! Each registered channel is a send/receive queue pair bound to a
//! sequential id. Members must register channels in the same order so ids
//! agree cluster-wide; nothing detects a mismatch. Delivery is at most once:
//! a failed send is logged and dropped.

pub mod local;
pub mod rpc;
pub mod wire;

use crate::error::{BatonError, Result};
use crate::node::{Node, NodeCache, NodeHandle};
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use smol_str::SmolStr;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock as StdRwLock};
use tokio::sync::mpsc;
use wire::{WireMsg, WireNodeRef};

/// Outstanding messages per queue before senders wait.
pub const CHANNEL_CAPACITY: usize = 128;

/// Dials members for direct delivery.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn connect(&self, node: &NodeHandle) -> Result<Arc<dyn Connection>>;
}

/// An established link to one member.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn deliver(&self, frame: Bytes) -> Result<()>;
}

/// A message on a registered channel.
///
/// Senders set `dst` and `body`; `channel` and `src` are filled in on send.
#[derive(Debug, Clone)]
pub struct Msg {
    pub channel: usize,
    pub dst: Option<Arc<Node>>,
    pub src: Option<Arc<Node>>,
    pub body: Bytes,
}

impl Msg {
    pub fn new(dst: Arc<Node>, body: impl Into<Bytes>) -> Self {
        Self {
            channel: 0,
            dst: Some(dst),
            src: None,
            body: body.into(),
        }
    }

    /// Builds a message whose body is `payload` in bincode.
    pub fn encode<T: Serialize>(dst: Arc<Node>, payload: &T) -> Result<Self> {
        Ok(Self::new(dst, bincode::serialize(payload)?))
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        bincode::deserialize(&self.body).map_err(|error| {
            tracing::warn!(error = %error, channel = self.channel, "message body decode failed");
            BatonError::Decode(format!("message body: {}", error))
        })
    }
}

/// Owns the channel table and moves frames between queues and transport.
pub struct Messenger {
    receivers: StdRwLock<Vec<mpsc::Sender<Msg>>>,
    transport: Arc<dyn MessageTransport>,
    nodes: Arc<NodeCache>,
    local_name: SmolStr,
    local_addr: SocketAddr,
}

impl Messenger {
    pub fn new(
        local_name: impl Into<SmolStr>,
        local_addr: SocketAddr,
        nodes: Arc<NodeCache>,
        transport: Arc<dyn MessageTransport>,
    ) -> Arc<Self> {
        Arc::new(Self {
            receivers: StdRwLock::new(Vec::new()),
            transport,
            nodes,
            local_name: local_name.into(),
            local_addr,
        })
    }

    /// Allocates the next channel id and returns its send and receive
    /// queues. Spawns the drainer for the send queue, so it must be called
    /// inside a Tokio runtime.
    pub fn register_channel(self: &Arc<Self>) -> (mpsc::Sender<Msg>, mpsc::Receiver<Msg>) {
        let (snd_tx, snd_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (rcv_tx, rcv_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let channel = {
            let mut receivers = match self.receivers.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            receivers.push(rcv_tx);
            receivers.len() - 1
        };

        tokio::spawn(Arc::clone(self).drain(channel, snd_rx));
        (snd_tx, rcv_rx)
    }

    pub fn channel_count(&self) -> usize {
        match self.receivers.read() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    async fn drain(self: Arc<Self>, channel: usize, mut outgoing: mpsc::Receiver<Msg>) {
        while let Some(msg) = outgoing.recv().await {
            let dst = msg.dst.as_ref().map(|node| node.name());
            if let Err(error) = self.send(channel, msg).await {
                tracing::warn!(
                    channel,
                    node = ?dst,
                    error = %error,
                    "failed to send message, dropping it"
                );
            }
        }
        tracing::debug!(channel, "send queue closed");
    }

    async fn send(&self, channel: usize, msg: Msg) -> Result<()> {
        let Some(dst) = msg.dst else {
            tracing::warn!(channel, "message has no destination, ignoring");
            return Ok(());
        };

        let wire = WireMsg {
            channel: u32::try_from(channel)
                .map_err(|_| BatonError::Internal(format!("channel id {} overflows", channel)))?,
            src: WireNodeRef {
                name: self.local_name.to_string(),
                addr: self.local_addr,
            },
            dst: WireNodeRef {
                name: dst.name().to_string(),
                addr: dst.addr(),
            },
            body: msg.body.to_vec(),
        };

        let frame = wire::encode_frame(&wire)?;
        dst.deliver(self.transport.as_ref(), frame).await
    }

    /// Routes an inbound frame to its channel's receive queue, waiting while
    /// the queue is full. Frames for unknown channels are logged and dropped.
    pub async fn deliver(&self, frame: &[u8]) -> Result<()> {
        let wire = wire::decode_frame(frame).inspect_err(|error| {
            tracing::warn!(error = %error, "dropping undecodable message");
        })?;

        let channel = wire.channel as usize;
        let receiver = match self.receivers.read() {
            Ok(guard) => guard.get(channel).cloned(),
            Err(poisoned) => poisoned.into_inner().get(channel).cloned(),
        };

        let Some(receiver) = receiver else {
            tracing::warn!(
                channel,
                src = %wire.src.name,
                "unknown channel id, dropping message"
            );
            return Ok(());
        };

        let msg = Msg {
            channel,
            src: Some(self.nodes.resolve_ref(&wire.src.name, wire.src.addr)),
            dst: Some(self.nodes.resolve_ref(&wire.dst.name, wire.dst.addr)),
            body: Bytes::from(wire.body),
        };

        if receiver.send(msg).await.is_err() {
            tracing::warn!(channel, "receive queue closed, dropping message");
        }
        Ok(())
    }
}
