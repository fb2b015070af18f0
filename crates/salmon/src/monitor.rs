// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Process-wide bridge monitor.
//!
//! One [`Monitor`] is constructed at startup and handed into every bridge;
//! there is no hidden global. Counter fields are atomics so the data plane
//! never takes the registry lock; the lock only guards the name map itself.

use crate::limit::RateLimiter;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Interval between summary log lines.
const REPORT_INTERVAL: Duration = Duration::from_secs(30);

/// Per-bridge runtime counters.
#[derive(Debug, Default)]
pub struct BridgeStats {
    active_streams: AtomicI64,
    last_ping_ms: AtomicU64,
    last_alive: AtomicU64,
    alive: AtomicBool,
    limiter: Mutex<Option<RateLimiter>>,
}

impl BridgeStats {
    /// Increment the active stream count.
    pub fn inc_active(&self) {
        self.active_streams.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement the active stream count.
    pub fn dec_active(&self) {
        self.active_streams.fetch_sub(1, Ordering::Relaxed);
    }

    /// Current active stream count.
    pub fn active(&self) -> i64 {
        self.active_streams.load(Ordering::Relaxed)
    }

    /// Record a successful liveness round-trip.
    pub fn record_ping(&self, rtt: Duration) {
        self.last_ping_ms
            .store(rtt.as_millis().max(1) as u64, Ordering::Relaxed);
        self.last_alive.store(epoch_secs(), Ordering::Relaxed);
        self.alive.store(true, Ordering::Relaxed);
    }

    /// Mark the peer unreachable (two consecutive missed pings).
    pub fn mark_down(&self) {
        self.alive.store(false, Ordering::Relaxed);
    }

    /// Last observed round-trip time in milliseconds (0 = never).
    pub fn last_ping_ms(&self) -> u64 {
        self.last_ping_ms.load(Ordering::Relaxed)
    }

    /// Epoch seconds of the last successful ping (0 = never).
    pub fn last_alive(&self) -> u64 {
        self.last_alive.load(Ordering::Relaxed)
    }

    /// Whether the peer currently answers pings.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    /// Attach the bridge's rate limiter for rate reporting.
    pub fn register_limiter(&self, limiter: RateLimiter) {
        *self.limiter.lock() = Some(limiter);
    }

    /// Rolling observed throughput of the registered limiter.
    pub fn observed_rate(&self) -> u64 {
        self.limiter
            .lock()
            .as_ref()
            .map(|l| l.observed_rate())
            .unwrap_or(0)
    }
}

/// Snapshot of one bridge's counters, for status reporting.
#[derive(Debug, Clone)]
pub struct BridgeSnapshot {
    pub name: String,
    pub active_streams: i64,
    pub last_ping_ms: u64,
    pub last_alive: u64,
    pub alive: bool,
    pub observed_rate: u64,
}

/// Registry of per-bridge counters. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct Monitor {
    bridges: Arc<Mutex<HashMap<String, Arc<BridgeStats>>>>,
}

impl Monitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a bridge, returning its stats record. Registering the same
    /// name twice returns the existing record.
    pub fn register(&self, name: &str) -> Arc<BridgeStats> {
        let mut bridges = self.bridges.lock();
        bridges
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(BridgeStats::default()))
            .clone()
    }

    /// Remove a bridge's record at shutdown.
    pub fn unregister(&self, name: &str) {
        self.bridges.lock().remove(name);
    }

    /// Look up a bridge's stats record.
    pub fn get(&self, name: &str) -> Option<Arc<BridgeStats>> {
        self.bridges.lock().get(name).cloned()
    }

    /// Snapshot every bridge, sorted by name.
    pub fn snapshot(&self) -> Vec<BridgeSnapshot> {
        let bridges = self.bridges.lock();
        let mut out: Vec<BridgeSnapshot> = bridges
            .iter()
            .map(|(name, stats)| BridgeSnapshot {
                name: name.clone(),
                active_streams: stats.active(),
                last_ping_ms: stats.last_ping_ms(),
                last_alive: stats.last_alive(),
                alive: stats.is_alive(),
                observed_rate: stats.observed_rate(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Total active streams across all bridges.
    pub fn total_active(&self) -> i64 {
        self.bridges.lock().values().map(|s| s.active()).sum()
    }

    /// Spawn the periodic summary log task. Returns a handle the caller can
    /// abort at shutdown.
    pub fn spawn_reporter(&self) -> tokio::task::JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(REPORT_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let snapshot = monitor.snapshot();
                let active: i64 = snapshot.iter().map(|s| s.active_streams).sum();
                let alive = snapshot.iter().filter(|s| s.alive).count();
                match heap_rss_kb() {
                    Some(rss) => log::info!(
                        "[monitor] bridges={} alive={} active_streams={} rss={}KB",
                        snapshot.len(),
                        alive,
                        active,
                        rss
                    ),
                    None => log::info!(
                        "[monitor] bridges={} alive={} active_streams={}",
                        snapshot.len(),
                        alive,
                        active
                    ),
                }
            }
        })
    }
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("bridges", &self.bridges.lock().len())
            .finish()
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

/// Resident set size in KB from /proc, when available.
#[cfg(target_os = "linux")]
fn heap_rss_kb() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident_pages * 4)
}

#[cfg(not(target_os = "linux"))]
fn heap_rss_kb() -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_is_idempotent() {
        let monitor = Monitor::new();
        let a = monitor.register("office");
        let b = monitor.register("office");
        a.inc_active();
        assert_eq!(b.active(), 1);
        assert_eq!(monitor.snapshot().len(), 1);
    }

    #[test]
    fn test_active_counting() {
        let monitor = Monitor::new();
        let stats = monitor.register("b");
        stats.inc_active();
        stats.inc_active();
        stats.dec_active();
        assert_eq!(stats.active(), 1);
        assert_eq!(monitor.total_active(), 1);
    }

    #[test]
    fn test_ping_recording_flips_alive() {
        let monitor = Monitor::new();
        let stats = monitor.register("b");
        assert!(!stats.is_alive());
        assert_eq!(stats.last_ping_ms(), 0);

        stats.record_ping(Duration::from_millis(7));
        assert!(stats.is_alive());
        assert_eq!(stats.last_ping_ms(), 7);
        assert!(stats.last_alive() > 0);

        stats.mark_down();
        assert!(!stats.is_alive());
        // Last successful values survive the down flag.
        assert_eq!(stats.last_ping_ms(), 7);
    }

    #[test]
    fn test_sub_millisecond_ping_reports_nonzero() {
        let stats = BridgeStats::default();
        stats.record_ping(Duration::from_micros(120));
        assert_eq!(stats.last_ping_ms(), 1);
    }

    #[test]
    fn test_limiter_registration() {
        let monitor = Monitor::new();
        let stats = monitor.register("b");
        assert_eq!(stats.observed_rate(), 0);
        stats.register_limiter(RateLimiter::unlimited());
        assert_eq!(stats.observed_rate(), 0);
    }

    #[test]
    fn test_snapshot_sorted() {
        let monitor = Monitor::new();
        monitor.register("zeta");
        monitor.register("alpha");
        let names: Vec<String> = monitor.snapshot().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["alpha".to_string(), "zeta".to_string()]);
    }

    #[test]
    fn test_unregister() {
        let monitor = Monitor::new();
        monitor.register("b");
        monitor.unregister("b");
        assert!(monitor.get("b").is_none());
    }
}
