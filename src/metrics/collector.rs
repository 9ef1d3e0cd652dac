// src/metrics/collector.rs
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;
use std::time::Instant;
use anyhow::Result;

pub struct MetricsRegistry {
    registry: Registry,
    collector: Arc<MetricsCollector>,
}

impl MetricsRegistry {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let collector = Arc::new(MetricsCollector::new(&registry)?);

        Ok(Self {
            registry,
            collector,
        })
    }

    pub fn collector(&self) -> Arc<MetricsCollector> {
        self.collector.clone()
    }

    /// Prometheus text exposition of everything registered.
    pub fn gather(&self) -> Result<Vec<u8>> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(buffer)
    }
}

pub struct MetricsCollector {
    // Request metrics
    pub requests_total: IntCounterVec,
    pub request_duration_seconds: HistogramVec,
    pub routing_errors_total: IntCounterVec,

    // Peer metrics
    pub peer_failures_total: IntCounterVec,
    pub pool_size: IntGaugeVec,

    // System metrics
    pub active_connections: IntGauge,
}

impl MetricsCollector {
    pub fn new(registry: &Registry) -> Result<Self> {
        let requests_total = IntCounterVec::new(
            Opts::new("golb_requests_total", "Completed proxied round trips"),
            &["vserver", "peer", "status_code"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "golb_request_duration_seconds",
                "Request duration in seconds, routing through response",
            ),
            &["vserver"],
        )?;
        registry.register(Box::new(request_duration_seconds.clone()))?;

        let routing_errors_total = IntCounterVec::new(
            Opts::new("golb_routing_errors_total", "Requests answered without contacting a peer"),
            &["vserver", "reason"],
        )?;
        registry.register(Box::new(routing_errors_total.clone()))?;

        let peer_failures_total = IntCounterVec::new(
            Opts::new("golb_peer_failures_total", "Transport failures per peer"),
            &["vserver", "peer"],
        )?;
        registry.register(Box::new(peer_failures_total.clone()))?;

        let pool_size = IntGaugeVec::new(
            Opts::new("golb_pool_size", "Number of peers in a virtual server pool"),
            &["vserver"],
        )?;
        registry.register(Box::new(pool_size.clone()))?;

        let active_connections =
            IntGauge::new("golb_active_connections", "Open client connections")?;
        registry.register(Box::new(active_connections.clone()))?;

        Ok(Self {
            requests_total,
            request_duration_seconds,
            routing_errors_total,
            peer_failures_total,
            pool_size,
            active_connections,
        })
    }

    pub fn record_request(&self, vserver: &str, peer: &str, status_code: u16) {
        let status = status_code.to_string();
        self.requests_total
            .with_label_values(&[vserver, peer, &status])
            .inc();
    }

    pub fn observe_duration(&self, vserver: &str, duration: std::time::Duration) {
        self.request_duration_seconds
            .with_label_values(&[vserver])
            .observe(duration.as_secs_f64());
    }

    pub fn record_routing_error(&self, vserver: &str, reason: &str) {
        self.routing_errors_total
            .with_label_values(&[vserver, reason])
            .inc();
    }

    pub fn record_peer_failure(&self, vserver: &str, peer: &str) {
        self.peer_failures_total
            .with_label_values(&[vserver, peer])
            .inc();
    }

    /// Drops every per-peer series of a peer leaving the pool.
    pub fn remove_peer<I>(&self, vserver: &str, peer: &str, status_codes: I)
    where
        I: IntoIterator<Item = u16>,
    {
        for status_code in status_codes {
            let status = status_code.to_string();
            // Missing series are fine.
            let _ = self.requests_total.remove_label_values(&[vserver, peer, &status]);
        }
        let _ = self.peer_failures_total.remove_label_values(&[vserver, peer]);
    }

    pub fn update_pool_size(&self, vserver: &str, size: usize) {
        self.pool_size
            .with_label_values(&[vserver])
            .set(size as i64);
    }

    pub fn increment_active_connections(&self) {
        self.active_connections.inc();
    }

    pub fn decrement_active_connections(&self) {
        self.active_connections.dec();
    }
}

// Helper for timing operations
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_exposes_recorded_series() {
        let registry = MetricsRegistry::new().unwrap();
        let metrics = registry.collector();

        metrics.record_request("web", "127.0.0.1:9001", 200);
        metrics.record_routing_error("web", "peer_not_found");
        metrics.update_pool_size("web", 2);

        let text = String::from_utf8(registry.gather().unwrap()).unwrap();
        assert!(text.contains(r#"golb_requests_total{peer="127.0.0.1:9001",status_code="200",vserver="web"} 1"#));
        assert!(text.contains(r#"golb_routing_errors_total{reason="peer_not_found",vserver="web"} 1"#));
        assert!(text.contains(r#"golb_pool_size{vserver="web"} 2"#));
    }

    #[test]
    fn test_remove_peer_drops_its_series() {
        let registry = MetricsRegistry::new().unwrap();
        let metrics = registry.collector();

        metrics.record_request("web", "127.0.0.1:9001", 200);
        metrics.record_request("web", "127.0.0.1:9001", 502);
        metrics.record_peer_failure("web", "127.0.0.1:9001");
        metrics.record_request("web", "127.0.0.1:9002", 200);

        metrics.remove_peer("web", "127.0.0.1:9001", [200, 502, 404]);

        let text = String::from_utf8(registry.gather().unwrap()).unwrap();
        assert!(!text.contains("127.0.0.1:9001"));
        assert!(text.contains(r#"peer="127.0.0.1:9002""#));
    }
}
