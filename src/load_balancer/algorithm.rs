// src/load_balancer/algorithm.rs
use crate::proxy::Peer;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Name accepted in configuration for round-robin selection.
pub const LB_ROUNDROBIN: &str = "roundrobin";

pub trait LoadBalancer: Send + Sync {
    /// Picks the next peer to receive a request. Peers that are down at
    /// `now`, or whose address equals `excluded`, are never returned.
    fn select_peer(
        &self,
        peers: &[Arc<Peer>],
        excluded: Option<&str>,
        now: Instant,
    ) -> Option<Arc<Peer>>;

    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LbMethod {
    #[default]
    RoundRobin,
}

impl LbMethod {
    /// An empty value selects the default method.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "" | LB_ROUNDROBIN => Some(Self::RoundRobin),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => LB_ROUNDROBIN,
        }
    }
}

impl fmt::Display for LbMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
