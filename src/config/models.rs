// src/config/models.rs
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub controller: Option<ControllerConfig>,

    #[serde(rename = "virtual_server", default)]
    pub virtual_servers: Vec<VirtualServerConfig>,
}

impl Config {
    /// Cross-entry checks. Per-server semantics (protocol, TLS files,
    /// lb method) are validated when the virtual server is built.
    pub fn validate(&self) -> Result<()> {
        if let Some(controller) = &self.controller {
            if controller.address.is_empty() {
                bail!("controller address is empty");
            }
        }

        let mut names = HashSet::new();
        for vs in &self.virtual_servers {
            if !vs.name.is_empty() && !names.insert(vs.name.as_str()) {
                bail!("duplicate virtual server name: {}", vs.name);
            }

            if vs.max_fails == Some(0) {
                bail!("virtual server {}: max_fails must be at least 1", vs.name);
            }

            let mut addresses = HashSet::new();
            for peer in &vs.pool {
                if peer.address.is_empty() {
                    bail!("virtual server {}: peer address is empty", vs.name);
                }
                if peer.weight == 0 {
                    bail!("virtual server {}: peer {} has zero weight", vs.name, peer.address);
                }
                if !addresses.insert(peer.address.as_str()) {
                    bail!("virtual server {}: duplicate peer {}", vs.name, peer.address);
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub address: String,

    #[serde(default)]
    pub auth: Option<AuthConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    pub username: String,
    pub password: String,
}

/// One front-end endpoint as written in the config file. String fields
/// left empty fall back to their defaults when the server is built.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VirtualServerConfig {
    pub name: String,
    pub address: String,
    pub server_name: String,
    pub protocol: String,
    pub cert_file: String,
    pub key_file: String,
    pub lb_method: String,
    pub retry: bool,
    pub max_fails: Option<u32>,
    pub fail_timeout_secs: Option<u64>,
    pub proxy_timeout_secs: Option<u64>,
    pub max_body_size: Option<usize>,
    pub pool: Vec<PeerConfig>,
}

impl VirtualServerConfig {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            ..Self::default()
        }
    }

    pub fn fail_timeout(&self) -> Option<Duration> {
        self.fail_timeout_secs.map(Duration::from_secs)
    }

    pub fn proxy_timeout(&self) -> Option<Duration> {
        self.proxy_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub address: String,

    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}
