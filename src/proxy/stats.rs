// src/proxy/stats.rs
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::peer::Peer;

const BLOCK_SEPARATOR: &str = "------";

/// Per-peer traffic counters. Every counter is updated atomically so
/// concurrent round trips to the same peer never lose an increment.
#[derive(Debug, Default)]
pub struct StatsRecorder {
    status_codes: DashMap<u16, u64>,
    methods: DashMap<String, u64>,
    paths: DashMap<String, u64>,
    recv_bytes: AtomicU64,
    send_bytes: AtomicU64,
}

impl StatsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &self,
        status_code: u16,
        method: &str,
        path: &str,
        recv_bytes: u64,
        send_bytes: u64,
    ) {
        *self.status_codes.entry(status_code).or_insert(0) += 1;
        *self.methods.entry(method.to_string()).or_insert(0) += 1;
        *self.paths.entry(path.to_string()).or_insert(0) += 1;
        self.recv_bytes.fetch_add(recv_bytes, Ordering::Relaxed);
        self.send_bytes.fetch_add(send_bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            status_codes: self.status_codes.iter().map(|e| (*e.key(), *e.value())).collect(),
            methods: self.methods.iter().map(|e| (e.key().clone(), *e.value())).collect(),
            paths: self.paths.iter().map(|e| (e.key().clone(), *e.value())).collect(),
            recv_bytes: self.recv_bytes.load(Ordering::Relaxed),
            send_bytes: self.send_bytes.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a [`StatsRecorder`], keys sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub status_codes: BTreeMap<u16, u64>,
    pub methods: BTreeMap<String, u64>,
    pub paths: BTreeMap<String, u64>,
    pub recv_bytes: u64,
    pub send_bytes: u64,
}

impl StatsSnapshot {
    pub fn total_requests(&self) -> u64 {
        self.status_codes.values().sum()
    }

    fn render_block(&self, address: &str) -> String {
        format!(
            "{}\nstatus_code: {}\nmethod: {}\npath: {}\nrecv_bytes: {}\nsend_bytes: {}\n{}",
            address,
            join_counts(&self.status_codes),
            join_counts(&self.methods),
            join_counts(&self.paths),
            self.recv_bytes,
            self.send_bytes,
            BLOCK_SEPARATOR,
        )
    }
}

fn join_counts<K: Display>(counts: &BTreeMap<K, u64>) -> String {
    counts
        .iter()
        .map(|(key, count)| format!("{}:{}", key, count))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Render the stats report for a pool. Peers are listed in ascending
/// address order regardless of their insertion order.
pub fn render_report(pool_name: &str, peers: &[Arc<Peer>]) -> String {
    let mut sorted: Vec<&Arc<Peer>> = peers.iter().collect();
    sorted.sort_by(|a, b| a.address.cmp(&b.address));

    let mut report = format!("Pool-{}", pool_name);
    for peer in sorted {
        report.push('\n');
        report.push_str(&peer.stats().snapshot().render_block(&peer.address));
    }
    report
}
