use crate::error::{BatonError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

pub const DEFAULT_RPC_PORT: u16 = 12354;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Unique member name. Empty means `HOSTNAME`, then the advertised address.
    pub node_name: String,
    /// Gossip bind address.
    pub bind_addr: String,
    /// Address advertised to other members when it differs from `bind_addr`
    /// (containers, NAT).
    pub advertise_addr: Option<String>,
    /// Direct messaging port, identical on every member.
    pub rpc_port: u16,
    /// Nodes assigned per datum; the first is the primary.
    pub copies: usize,
    pub seeds: Vec<String>,
    /// Log per-datum handoff decisions at info level.
    pub verbose_transitions: bool,
    /// Node ordering key, normally the process start time in nanoseconds.
    pub sort_key: Option<i64>,
    pub dial_timeout_ms: u64,
    pub call_timeout_ms: u64,
    pub publish_timeout_secs: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            bind_addr: "0.0.0.0:7946".to_string(),
            advertise_addr: None,
            rpc_port: DEFAULT_RPC_PORT,
            copies: 1,
            seeds: Vec::new(),
            verbose_transitions: false,
            sort_key: None,
            dial_timeout_ms: 3_000,
            call_timeout_ms: 10_000,
            publish_timeout_secs: 30,
        }
    }
}

impl ClusterConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("BATON"))
            .build()
            .map_err(|e| BatonError::Config(e.to_string()))?;

        settings
            .try_deserialize()
            .map_err(|e| BatonError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.copies == 0 {
            return Err(BatonError::Config("copies must be at least 1".to_string()));
        }
        self.gossip_bind_addr()?;
        self.gossip_advertise_addr()?;
        Ok(())
    }

    pub fn gossip_bind_addr(&self) -> Result<SocketAddr> {
        parse_socket_addr(&self.bind_addr, "bind_addr")
    }

    pub fn gossip_advertise_addr(&self) -> Result<Option<SocketAddr>> {
        self.advertise_addr
            .as_deref()
            .map(|value| parse_socket_addr(value, "advertise_addr"))
            .transpose()
    }

    /// Listening address of the direct messaging endpoint: the gossip bind
    /// IP on `rpc_port`.
    pub fn rpc_bind_addr(&self) -> Result<SocketAddr> {
        let bind = self.gossip_bind_addr()?;
        Ok(SocketAddr::new(bind.ip(), self.rpc_port))
    }

    pub fn resolved_node_name(&self) -> Result<String> {
        let name = self.node_name.trim();
        if !name.is_empty() {
            return Ok(name.to_string());
        }

        if let Ok(host) = std::env::var("HOSTNAME")
            && !host.trim().is_empty()
        {
            return Ok(host.trim().to_string());
        }

        let addr = self
            .gossip_advertise_addr()?
            .map_or_else(|| self.gossip_bind_addr(), Ok)?;
        Ok(addr.to_string())
    }

    /// Explicit sort key, or the given process start timestamp.
    pub fn resolved_sort_key(&self, started_at: chrono::DateTime<chrono::Utc>) -> i64 {
        self.sort_key
            .unwrap_or_else(|| started_at.timestamp_nanos_opt().unwrap_or_default())
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }
}

pub(crate) fn parse_socket_addr(value: &str, field: &str) -> Result<SocketAddr> {
    value
        .trim()
        .parse::<SocketAddr>()
        .map_err(|error| BatonError::Config(format!("invalid {} '{}': {}", field, value, error)))
}
