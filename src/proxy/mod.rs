// src/proxy/mod.rs
mod body;
mod peer;
mod pool;
mod proxy;
mod stats;

pub use body::{read_limited, BodyEnd, BodyError, CountingBody, DEFAULT_MAX_BODY_SIZE};
pub use peer::{HealthPolicy, Peer, DEFAULT_FAIL_TIMEOUT, DEFAULT_MAX_FAILS};
pub use pool::Pool;
pub use proxy::{ProxiedResponse, Proxy, ProxyError, DEFAULT_PROXY_TIMEOUT};
pub use stats::{render_report, StatsRecorder, StatsSnapshot};
