// src/load_balancer/round_robin.rs
use crate::load_balancer::LoadBalancer;
use crate::proxy::Peer;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

/// Smooth weighted round robin.
///
/// Every eligible peer gains its weight on each pick; the peer holding the
/// largest running total wins and pays back the sum of eligible weights.
/// Over `sum(weights)` consecutive picks each peer is chosen `weight` times,
/// interleaved rather than in bursts. Ties go to the first peer found when
/// scanning from just after the previous pick, so equal weights alternate
/// in insertion order.
pub struct RoundRobinBalancer {
    cursor: Mutex<Option<usize>>,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self {
            cursor: Mutex::new(None),
        }
    }
}

impl Default for RoundRobinBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer for RoundRobinBalancer {
    fn select_peer(
        &self,
        peers: &[Arc<Peer>],
        excluded: Option<&str>,
        now: Instant,
    ) -> Option<Arc<Peer>> {
        if peers.is_empty() {
            return None;
        }

        // Held for the whole pick so concurrent selections see consistent weights.
        let mut cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        let start = cursor.map_or(0, |last| last + 1);

        let mut total: i64 = 0;
        let mut best: Option<usize> = None;

        for offset in 0..peers.len() {
            let index = (start + offset) % peers.len();
            let peer = &peers[index];

            if excluded == Some(peer.address.as_str()) || !peer.is_available_at(now) {
                continue;
            }

            let weight = i64::from(peer.weight);
            peer.add_current_weight(weight);
            total += weight;

            match best {
                Some(current) if peers[current].current_weight() >= peer.current_weight() => {}
                _ => best = Some(index),
            }
        }

        let index = best?;
        peers[index].add_current_weight(-total);
        *cursor = Some(index);
        Some(peers[index].clone())
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::HealthPolicy;
    use proptest::prelude::*;
    use std::collections::HashMap;

    fn make_peers(specs: &[(&str, u32)]) -> Vec<Arc<Peer>> {
        specs
            .iter()
            .map(|(address, weight)| {
                Arc::new(Peer::new(*address, *weight, HealthPolicy::default()))
            })
            .collect()
    }

    fn pick(balancer: &RoundRobinBalancer, peers: &[Arc<Peer>]) -> String {
        balancer
            .select_peer(peers, None, Instant::now())
            .map(|peer| peer.address.clone())
            .unwrap()
    }

    #[test]
    fn test_round_robin_cycling() {
        let peers = make_peers(&[("b1:80", 1), ("b2:80", 1), ("b3:80", 1)]);
        let balancer = RoundRobinBalancer::new();

        assert_eq!(pick(&balancer, &peers), "b1:80");
        assert_eq!(pick(&balancer, &peers), "b2:80");
        assert_eq!(pick(&balancer, &peers), "b3:80");
        assert_eq!(pick(&balancer, &peers), "b1:80");
    }

    #[test]
    fn test_weighted_distribution_interleaves() {
        let peers = make_peers(&[("b1:80", 3), ("b2:80", 1)]);
        let balancer = RoundRobinBalancer::new();

        let first_cycle: Vec<String> = (0..4).map(|_| pick(&balancer, &peers)).collect();
        assert_eq!(first_cycle, vec!["b1:80", "b2:80", "b1:80", "b1:80"]);

        let mut counts: HashMap<String, u32> = HashMap::new();
        for _ in 0..400 {
            *counts.entry(pick(&balancer, &peers)).or_default() += 1;
        }
        assert_eq!(counts["b1:80"], 300);
        assert_eq!(counts["b2:80"], 100);
    }

    #[test]
    fn test_skips_down_peers() {
        let peers = make_peers(&[("b1:80", 1), ("b2:80", 1)]);
        let balancer = RoundRobinBalancer::new();
        for _ in 0..peers[0].max_fails() {
            peers[0].record_failure();
        }

        for _ in 0..5 {
            assert_eq!(pick(&balancer, &peers), "b2:80");
        }
    }

    #[test]
    fn test_all_down_returns_none() {
        let peers = make_peers(&[("b1:80", 1)]);
        let balancer = RoundRobinBalancer::new();
        for _ in 0..peers[0].max_fails() {
            peers[0].record_failure();
        }

        assert!(balancer.select_peer(&peers, None, Instant::now()).is_none());
        assert!(balancer.select_peer(&[], None, Instant::now()).is_none());
    }

    #[test]
    fn test_excluded_peer_is_never_returned() {
        let peers = make_peers(&[("b1:80", 1), ("b2:80", 1)]);
        let balancer = RoundRobinBalancer::new();

        for _ in 0..4 {
            let peer = balancer
                .select_peer(&peers, Some("b1:80"), Instant::now())
                .unwrap();
            assert_eq!(peer.address, "b2:80");
        }
        assert!(balancer
            .select_peer(&peers[..1], Some("b1:80"), Instant::now())
            .is_none());
    }

    #[test]
    fn test_strategy_name() {
        assert_eq!(RoundRobinBalancer::new().name(), "round_robin");
    }

    proptest! {
        #[test]
        fn equal_weights_split_evenly(peer_count in 1usize..8, rounds in 1usize..20) {
            let addresses: Vec<String> =
                (0..peer_count).map(|i| format!("10.0.0.{}:80", i)).collect();
            let specs: Vec<(&str, u32)> = addresses.iter().map(|a| (a.as_str(), 1)).collect();
            let peers = make_peers(&specs);
            let balancer = RoundRobinBalancer::new();

            let mut counts: HashMap<String, usize> = HashMap::new();
            for _ in 0..peer_count * rounds {
                *counts.entry(pick(&balancer, &peers)).or_default() += 1;
            }

            prop_assert_eq!(counts.len(), peer_count);
            for count in counts.values() {
                prop_assert_eq!(*count, rounds);
            }
        }
    }
}
