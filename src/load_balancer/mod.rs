// src/load_balancer/mod.rs
mod algorithm;
mod round_robin;

pub use algorithm::{LbMethod, LoadBalancer, LB_ROUNDROBIN};
pub use round_robin::RoundRobinBalancer;

use std::sync::Arc;

pub fn create_load_balancer(method: LbMethod) -> Arc<dyn LoadBalancer> {
    match method {
        LbMethod::RoundRobin => Arc::new(RoundRobinBalancer::new()),
    }
}
