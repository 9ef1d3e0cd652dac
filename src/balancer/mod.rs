// src/balancer/mod.rs
mod error;
mod virtual_server;

pub use error::{ConfigError, LifecycleError};
pub use virtual_server::{
    host_matches, Protocol, Status, VirtualServer, DEFAULT_SERVER_NAME, PROTO_HTTP, PROTO_HTTPS,
};

use crate::config::Config;
use crate::metrics::MetricsCollector;
use std::sync::Arc;
use tracing::{info, warn};

/// Every virtual server declared in one configuration, addressed by name.
pub struct Balancer {
    servers: Vec<Arc<VirtualServer>>,
}

impl Balancer {
    pub fn new(servers: Vec<Arc<VirtualServer>>) -> Self {
        Self { servers }
    }

    pub fn from_config(
        config: &Config,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> anyhow::Result<Self> {
        let mut servers = Vec::with_capacity(config.virtual_servers.len());
        for vs_config in &config.virtual_servers {
            let mut vs = VirtualServer::new(vs_config).map_err(|err| {
                anyhow::anyhow!("virtual server {:?}: {}", vs_config.name, err)
            })?;
            if let Some(metrics) = &metrics {
                vs = vs.with_metrics(metrics.clone());
            }
            servers.push(Arc::new(vs));
        }
        Ok(Self { servers })
    }

    pub fn servers(&self) -> &[Arc<VirtualServer>] {
        &self.servers
    }

    pub fn get(&self, name: &str) -> Option<Arc<VirtualServer>> {
        self.servers.iter().find(|vs| vs.name() == name).cloned()
    }

    /// Enables every server. On the first failure the servers already
    /// enabled by this call are stopped again before the error is returned.
    pub async fn run_all(&self) -> Result<(), LifecycleError> {
        for (index, vs) in self.servers.iter().enumerate() {
            if let Err(err) = vs.run().await {
                for started in &self.servers[..index] {
                    if let Err(stop_err) = started.stop().await {
                        warn!(vserver = %started.name(), %stop_err, "rollback stop failed");
                    }
                }
                return Err(err);
            }
        }
        info!(count = self.servers.len(), "All virtual servers enabled");
        Ok(())
    }

    /// Disables every enabled server.
    pub async fn stop_all(&self) {
        for vs in &self.servers {
            if vs.status().await == Status::Enabled {
                if let Err(err) = vs.stop().await {
                    warn!(vserver = %vs.name(), %err, "stop failed");
                }
            }
        }
    }

    pub async fn stats(&self) -> String {
        let mut reports = Vec::with_capacity(self.servers.len());
        for vs in &self.servers {
            reports.push(vs.stats().await);
        }
        reports.join("\n")
    }
}
