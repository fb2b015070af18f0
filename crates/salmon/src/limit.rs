// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-bridge token-bucket rate limiter.
//!
//! One limiter is shared by every stream of a bridge. Readers consume tokens
//! after the underlying read returns (so a large read never stalls the peer
//! mid-frame); writers consume before writing. The bucket mutex is held only
//! for the book-keeping; waiting for tokens happens outside any lock.
//!
//! Observed throughput is accumulated into a five-slot ring of one-second
//! buckets so an observer can compute a rolling rate without locking. Ring
//! rotation is lock-free: a compare-and-swap on the stamp word, guarded by
//! the wall-clock second.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

const RING_SLOTS: u64 = 5;

/// Shared token-bucket limiter. Cheap to clone; clones share the bucket.
///
/// A rate of zero or less disables shaping entirely: `acquire` returns
/// immediately and only the throughput ring is updated.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<LimiterInner>,
}

struct LimiterInner {
    /// None = unlimited.
    bucket: Option<Mutex<TokenBucket>>,
    ring: ThroughputRing,
    rate: i64,
}

impl RateLimiter {
    /// Create a limiter capped at `bytes_per_second`; `<= 0` disables it.
    pub fn new(bytes_per_second: i64) -> Self {
        let bucket = if bytes_per_second > 0 {
            // Burst capacity of one second keeps the cap at
            // rate * (window + 1s) over any window.
            Some(Mutex::new(TokenBucket::new(
                bytes_per_second as u64,
                bytes_per_second as u64,
            )))
        } else {
            None
        };
        Self {
            inner: Arc::new(LimiterInner {
                bucket,
                ring: ThroughputRing::new(),
                rate: bytes_per_second,
            }),
        }
    }

    /// A limiter that never throttles (still records throughput).
    pub fn unlimited() -> Self {
        Self::new(0)
    }

    /// True when no shaping is applied.
    pub fn is_unlimited(&self) -> bool {
        self.inner.bucket.is_none()
    }

    /// Configured rate in bytes per second (`<= 0` = unlimited).
    pub fn rate(&self) -> i64 {
        self.inner.rate
    }

    /// Take `bytes` tokens, sleeping until they are available, and record
    /// them in the throughput ring. Requests larger than the burst capacity
    /// are consumed in capacity-sized instalments.
    pub async fn acquire(&self, bytes: usize) {
        self.inner.ring.add(bytes as u64);

        let Some(ref bucket) = self.inner.bucket else {
            return;
        };

        let mut remaining = bytes as u64;
        while remaining > 0 {
            let (granted, wait) = {
                let mut bucket = bucket.lock();
                let chunk = remaining.min(bucket.capacity);
                if bucket.try_consume(chunk) {
                    (chunk, Duration::ZERO)
                } else {
                    (0, bucket.time_until_available(chunk))
                }
            };
            remaining -= granted;
            if granted == 0 {
                // Lock released; sleeping never blocks other streams'
                // accounting.
                tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
            }
        }
    }

    /// Rolling observed throughput in bytes per second, averaged over the
    /// ring window.
    pub fn observed_rate(&self) -> u64 {
        self.inner.ring.rate()
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("rate", &self.inner.rate)
            .finish()
    }
}

/// Classic token bucket: refilled from elapsed wall time, capped at burst
/// capacity.
#[derive(Debug)]
struct TokenBucket {
    tokens: u64,
    capacity: u64,
    rate: u64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate: u64, capacity: u64) -> Self {
        Self {
            tokens: capacity,
            capacity,
            rate,
            last_refill: Instant::now(),
        }
    }

    fn try_consume(&mut self, bytes: u64) -> bool {
        self.refill();
        if self.tokens >= bytes {
            self.tokens -= bytes;
            true
        } else {
            false
        }
    }

    fn time_until_available(&mut self, bytes: u64) -> Duration {
        self.refill();
        let goal = bytes.min(self.capacity);
        if self.tokens >= goal {
            return Duration::ZERO;
        }
        Duration::from_secs_f64((goal - self.tokens) as f64 / self.rate as f64)
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        if elapsed.is_zero() {
            return;
        }
        let add = (elapsed.as_secs_f64() * self.rate as f64) as u64;
        if add > 0 {
            self.tokens = (self.tokens + add).min(self.capacity);
            self.last_refill = now;
        }
    }
}

/// Five one-second buckets of observed bytes, rotated in place.
struct ThroughputRing {
    slots: [AtomicU64; RING_SLOTS as usize],
    /// Epoch second the current slot belongs to.
    stamp: AtomicU64,
}

impl ThroughputRing {
    fn new() -> Self {
        Self {
            slots: Default::default(),
            stamp: AtomicU64::new(epoch_secs()),
        }
    }

    fn add(&self, bytes: u64) {
        let now = epoch_secs();
        let stamp = self.stamp.load(Ordering::Acquire);
        if now != stamp
            && self
                .stamp
                .compare_exchange(stamp, now, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            // CAS winner clears the seconds skipped since the old stamp.
            let gap = (now.saturating_sub(stamp)).min(RING_SLOTS);
            for i in 1..=gap {
                self.slots[((stamp + i) % RING_SLOTS) as usize].store(0, Ordering::Release);
            }
        }
        self.slots[(now % RING_SLOTS) as usize].fetch_add(bytes, Ordering::AcqRel);
    }

    fn rate(&self) -> u64 {
        // Force rotation so stale slots do not inflate the rate.
        self.add(0);
        let total: u64 = self
            .slots
            .iter()
            .map(|s| s.load(Ordering::Acquire))
            .sum();
        total / RING_SLOTS
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_bucket_starts_full() {
        let mut bucket = TokenBucket::new(1000, 1000);
        assert!(bucket.try_consume(1000));
        assert!(!bucket.try_consume(1));
    }

    #[test]
    fn test_bucket_refills() {
        let mut bucket = TokenBucket::new(10_000, 10_000);
        assert!(bucket.try_consume(10_000));
        std::thread::sleep(Duration::from_millis(50));
        let tokens_now = {
            bucket.refill();
            bucket.tokens
        };
        assert!((300..=800).contains(&tokens_now), "tokens={}", tokens_now);
    }

    #[test]
    fn test_time_until_available() {
        let mut bucket = TokenBucket::new(1000, 1000);
        assert_eq!(bucket.time_until_available(500), Duration::ZERO);
        assert!(bucket.try_consume(1000));
        let wait = bucket.time_until_available(500);
        assert!(wait > Duration::from_millis(400) && wait <= Duration::from_millis(600));
    }

    #[test]
    fn test_oversized_request_waits_for_full_bucket() {
        let mut bucket = TokenBucket::new(1000, 1000);
        assert!(bucket.try_consume(1000));
        // A 5000-byte request can never hold 5000 tokens; it waits for a
        // full bucket instead of forever.
        let wait = bucket.time_until_available(5000);
        assert!(wait <= Duration::from_millis(1100));
    }

    #[test]
    fn test_unlimited_is_unlimited() {
        assert!(RateLimiter::new(0).is_unlimited());
        assert!(RateLimiter::new(-8).is_unlimited());
        assert!(!RateLimiter::new(1024).is_unlimited());
    }

    #[tokio::test]
    async fn test_unlimited_acquire_is_immediate() {
        let limiter = RateLimiter::unlimited();
        let start = Instant::now();
        for _ in 0..100 {
            limiter.acquire(1 << 20).await;
        }
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_rate_bound_over_window() {
        // 100 KB/s with one second of burst: 50 acquires of 10 KB each must
        // take at least ~4 seconds (500 KB - 100 KB burst at 100 KB/s).
        let rate = 100 * 1024;
        let limiter = RateLimiter::new(rate);
        let start = Instant::now();
        let mut moved = 0u64;
        while moved < 500 * 1024 {
            limiter.acquire(10 * 1024).await;
            moved += 10 * 1024;
        }
        let window = start.elapsed().as_secs_f64();
        let cap = rate as f64 * (window + 1.0);
        assert!(
            moved as f64 <= cap,
            "moved {} bytes in {:.2}s exceeds cap {:.0}",
            moved,
            window,
            cap
        );
        assert!(window > 3.5, "finished too fast: {:.2}s", window);
    }

    #[tokio::test]
    async fn test_clones_share_the_bucket() {
        let limiter = RateLimiter::new(10 * 1024);
        let other = limiter.clone();
        let start = Instant::now();
        // Drain the shared burst from one handle, then the clone must wait.
        limiter.acquire(10 * 1024).await;
        other.acquire(5 * 1024).await;
        assert!(start.elapsed() >= Duration::from_millis(400));
    }

    #[test]
    fn test_ring_accumulates_and_reports() {
        let ring = ThroughputRing::new();
        ring.add(5000);
        ring.add(5000);
        // 10 KB spread over a 5-slot window.
        assert_eq!(ring.rate(), 2000);
    }

    #[test]
    fn test_ring_rotation_clears_stale_slots() {
        let ring = ThroughputRing::new();
        ring.add(1000);
        // Simulate the clock moving past the whole window.
        ring.stamp.store(epoch_secs() - 10, Ordering::Release);
        assert_eq!(ring.rate(), 0);
    }

    #[test]
    fn test_observed_rate_via_limiter() {
        let limiter = RateLimiter::unlimited();
        futures_block_on(limiter.acquire(25_000));
        assert!(limiter.observed_rate() >= 5000);
    }

    // Minimal executor for the one sync test that calls an async fn which
    // never actually suspends on the unlimited path.
    fn futures_block_on<F: std::future::Future<Output = ()>>(fut: F) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        rt.block_on(fut);
    }
}
