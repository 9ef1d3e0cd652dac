// src/proxy/pool.rs
use super::peer::{HealthPolicy, Peer};
use super::proxy::ProxyError;
use super::stats::render_report;
use crate::config::PeerConfig;
use crate::load_balancer::{create_load_balancer, LbMethod, LoadBalancer};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// The backend peers of one virtual server.
///
/// Membership sits behind a reader-writer lock: selection and size take
/// the read side, add/remove take the write side.
pub struct Pool {
    peers: RwLock<Vec<Arc<Peer>>>,
    balancer: Arc<dyn LoadBalancer>,
    policy: Mutex<HealthPolicy>,
}

impl Pool {
    pub fn new(method: LbMethod, policy: HealthPolicy) -> Self {
        Self {
            peers: RwLock::new(Vec::new()),
            balancer: create_load_balancer(method),
            policy: Mutex::new(policy),
        }
    }

    /// Builds a pool from configured peers; duplicate addresses keep the first entry.
    pub fn with_peers(method: LbMethod, policy: HealthPolicy, configs: &[PeerConfig]) -> Self {
        let mut peers: Vec<Arc<Peer>> = Vec::with_capacity(configs.len());
        for config in configs {
            if peers.iter().any(|p| p.address == config.address) {
                continue;
            }
            peers.push(Arc::new(Peer::new(config.address.clone(), config.weight, policy)));
        }

        Self {
            peers: RwLock::new(peers),
            balancer: create_load_balancer(method),
            policy: Mutex::new(policy),
        }
    }

    pub fn policy(&self) -> HealthPolicy {
        *self.policy.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn balancer_name(&self) -> &'static str {
        self.balancer.name()
    }

    pub async fn size(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<Arc<Peer>> {
        self.peers.read().await.clone()
    }

    pub async fn get_peer(&self, address: &str) -> Option<Arc<Peer>> {
        self.peers
            .read()
            .await
            .iter()
            .find(|peer| peer.address == address)
            .cloned()
    }

    /// Returns `false` when the address was already present.
    pub async fn add_peer(&self, address: &str, weight: u32) -> bool {
        let mut peers = self.peers.write().await;
        if peers.iter().any(|peer| peer.address == address) {
            return false;
        }

        peers.push(Arc::new(Peer::new(address, weight, self.policy())));
        tracing::info!(peer = %address, weight, size = peers.len(), "Added peer");
        true
    }

    /// Returns the removed peer, or `None` when the address was not present.
    pub async fn remove_peer(&self, address: &str) -> Option<Arc<Peer>> {
        let mut peers = self.peers.write().await;
        let index = peers.iter().position(|peer| peer.address == address)?;
        let removed = peers.remove(index);

        tracing::info!(peer = %address, size = peers.len(), "Removed peer");
        Some(removed)
    }

    pub async fn select_peer(&self) -> Result<Arc<Peer>, ProxyError> {
        self.select_peer_excluding(None).await
    }

    pub async fn select_peer_excluding(
        &self,
        excluded: Option<&str>,
    ) -> Result<Arc<Peer>, ProxyError> {
        let peers = self.peers.read().await;
        self.balancer
            .select_peer(&peers, excluded, Instant::now())
            .ok_or(ProxyError::PeerNotFound)
    }

    /// Applies a new fail timeout to current and future peers.
    pub async fn set_fail_timeout(&self, fail_timeout: Duration) {
        self.policy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .fail_timeout = fail_timeout;

        for peer in self.peers.read().await.iter() {
            peer.set_fail_timeout(fail_timeout);
        }
    }

    pub async fn report(&self, name: &str) -> String {
        render_report(name, &self.peers.read().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_of(addresses: &[&str]) -> Pool {
        let configs: Vec<PeerConfig> = addresses
            .iter()
            .map(|address| PeerConfig {
                address: address.to_string(),
                weight: 1,
            })
            .collect();
        Pool::with_peers(LbMethod::RoundRobin, HealthPolicy::default(), &configs)
    }

    #[tokio::test]
    async fn test_add_peer_is_idempotent() {
        let pool = pool_of(&["127.0.0.1:9001"]);
        assert!(pool.add_peer("127.0.0.1:9002", 1).await);
        assert_eq!(pool.size().await, 2);

        assert!(!pool.add_peer("127.0.0.1:9002", 4).await);
        assert_eq!(pool.size().await, 2);
    }

    #[tokio::test]
    async fn test_remove_peer_is_idempotent() {
        let pool = pool_of(&["127.0.0.1:9001", "127.0.0.1:9002"]);
        let removed = pool.remove_peer("127.0.0.1:9001").await.unwrap();
        assert_eq!(removed.address, "127.0.0.1:9001");
        assert_eq!(pool.size().await, 1);

        assert!(pool.remove_peer("127.0.0.1:9001").await.is_none());
        assert_eq!(pool.size().await, 1);
    }

    #[tokio::test]
    async fn test_duplicate_config_entries_collapse() {
        let pool = pool_of(&["127.0.0.1:9001", "127.0.0.1:9001"]);
        assert_eq!(pool.size().await, 1);
    }

    #[tokio::test]
    async fn test_select_from_empty_pool() {
        let pool = pool_of(&[]);
        assert!(matches!(pool.select_peer().await, Err(ProxyError::PeerNotFound)));
    }

    #[tokio::test]
    async fn test_select_alternates_and_follows_membership() {
        let pool = pool_of(&["127.0.0.1:9001", "127.0.0.1:9002"]);

        let first = pool.select_peer().await.unwrap();
        let second = pool.select_peer().await.unwrap();
        assert_ne!(first.address, second.address);

        pool.remove_peer("127.0.0.1:9002").await;
        for _ in 0..3 {
            assert_eq!(pool.select_peer().await.unwrap().address, "127.0.0.1:9001");
        }
    }

    #[tokio::test]
    async fn test_set_fail_timeout_reaches_new_peers() {
        let pool = pool_of(&["127.0.0.1:9001"]);
        pool.set_fail_timeout(Duration::from_secs(1)).await;
        pool.add_peer("127.0.0.1:9002", 1).await;

        for peer in pool.peers().await {
            assert_eq!(peer.fail_timeout(), Duration::from_secs(1));
        }
        assert_eq!(pool.policy().fail_timeout, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_concurrent_membership_changes() {
        let pool = Arc::new(pool_of(&[]));
        let mut tasks = Vec::new();

        for i in 0..16 {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move {
                let address = format!("127.0.0.1:{}", 9000 + (i % 4));
                pool.add_peer(&address, 1).await;
                let _ = pool.select_peer().await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(pool.size().await, 4);
    }
}
