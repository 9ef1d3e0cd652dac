// src/lib.rs
pub mod balancer;
pub mod config;
pub mod controller;
pub mod load_balancer;
pub mod metrics;
pub mod proxy;
pub mod server;

pub use balancer::{Balancer, ConfigError, LifecycleError, Status, VirtualServer};
pub use proxy::{Pool, ProxyError};
