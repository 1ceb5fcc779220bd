//! Configuration for a kayak node

use crate::common::node::NodeId;
use crate::common::utils::parse_duration;
use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node ID (must appear in the peer set)
    pub node_id: String,

    /// Directory holding this node's log and stable store
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,

    /// Bind address for the TCP transport
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// Per-phase deadline for prepare/commit fan-out (e.g. "800ms", "5s")
    #[serde(default = "default_process_timeout")]
    pub process_timeout: String,

    /// Signed peer set (JSON)
    #[serde(default = "default_peers_file")]
    pub peers_file: PathBuf,

    /// Address book: node ID -> transport address
    #[serde(default)]
    pub addresses: HashMap<String, SocketAddr>,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_root_dir() -> PathBuf {
    PathBuf::from("./kayak-data")
}
fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7000))
}
fn default_process_timeout() -> String {
    "800ms".to_string()
}
fn default_peers_file() -> PathBuf {
    PathBuf::from("./peers.json")
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Minimal config for a node, everything else defaulted
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            root_dir: default_root_dir(),
            bind_addr: default_bind_addr(),
            process_timeout: default_process_timeout(),
            peers_file: default_peers_file(),
            addresses: HashMap::new(),
            log_level: default_log_level(),
        }
    }

    /// Load from a TOML file, then apply `KAYAK_*` environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()).required(true))
            .add_source(config::Environment::with_prefix("KAYAK"))
            .build()
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;

        let conf: Config = settings
            .try_deserialize()
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        conf.validate()?;
        Ok(conf)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(Error::InvalidConfig("node_id cannot be empty".into()));
        }
        if self.process_timeout()?.is_zero() {
            return Err(Error::InvalidConfig("process_timeout must be > 0".into()));
        }
        if !self.addresses.is_empty() && !self.addresses.contains_key(&self.node_id) {
            return Err(Error::InvalidConfig(format!(
                "address book has no entry for local node {}",
                self.node_id
            )));
        }
        Ok(())
    }

    pub fn local_id(&self) -> NodeId {
        NodeId::from(self.node_id.as_str())
    }

    pub fn process_timeout(&self) -> Result<Duration> {
        parse_duration(&self.process_timeout)
    }

    pub fn address_book(&self) -> HashMap<NodeId, SocketAddr> {
        self.addresses
            .iter()
            .map(|(id, addr)| (NodeId::from(id.as_str()), *addr))
            .collect()
    }
}
