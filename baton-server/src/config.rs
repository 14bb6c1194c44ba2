use baton_core::{BatonError, ClusterConfig, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cluster: ClusterConfig,
    /// Diagnostics HTTP listener.
    #[serde(default = "default_status_addr")]
    pub status_addr: String,
    #[serde(default)]
    pub demo: DemoConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    /// Number of in-memory counters to distribute.
    pub datums: usize,
    pub transition_timeout_secs: u64,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            datums: 16,
            transition_timeout_secs: 30,
        }
    }
}

fn default_status_addr() -> String {
    "0.0.0.0:8080".to_string()
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(::config::Environment::with_prefix("BATON").separator("__"))
            .build()
            .map_err(|e| BatonError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| BatonError::Config(e.to_string()))?;
        config.cluster.validate()?;
        Ok(config)
    }
}
