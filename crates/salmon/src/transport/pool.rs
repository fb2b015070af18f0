// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-bridge QUIC connection pool.
//!
//! The pool owns one dialling endpoint and a slice of live connections.
//! Selection happens under the pool mutex but the mutex is never held across
//! I/O: dialling reserves a slot first (so `entries + pending` never exceeds
//! `max_connections`), then connects, then inserts. Stream slots are
//! reserved under the same mutex at selection time, so `active_streams`
//! never exceeds `max_streams_per_connection`, not even transiently.
//!
//! Callers that find the pool momentarily full while a dial is in flight
//! wait for that dial to resolve instead of failing; `Exhausted` is reserved
//! for a pool that is saturated with nothing left to create.
//!
//! A stream-open failure is treated as proof the connection is dead: the
//! entry is evicted immediately and selection retries once on the remaining
//! (or a freshly dialled) connection. Leases share ownership of the
//! underlying `quinn::Connection`, so an evicted entry's transport survives
//! until its last outstanding stream is done.

use crate::config::QuicTuning;
use crate::transport::socket::{self, SocketError};
use crate::transport::tls::{self, TlsError};
use parking_lot::Mutex;
use quinn::{Connection, Endpoint, RecvStream, SendStream, VarInt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::timeout;

/// Deadline for a QUIC dial.
pub const DIAL_DEADLINE: Duration = Duration::from_secs(10);
/// Deadline for opening a stream on a live connection.
pub const OPEN_DEADLINE: Duration = Duration::from_secs(15);
/// Reaper wake-up period.
const REAP_INTERVAL: Duration = Duration::from_secs(5);

/// Connection close codes, also used as stream stop/reset codes.
pub const CLOSE_SHUTDOWN: u32 = 0x0;
pub const CLOSE_RECONNECT: u32 = 0x1;
pub const CLOSE_IDLE: u32 = 0x2;
pub const CLOSE_REJECTED: u32 = 0x3;

/// Pool errors.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("connection pool exhausted")]
    Exhausted,

    #[error("QUIC dial failed: {0}")]
    DialFailed(String),

    #[error("stream open failed: {0}")]
    StreamOpenFailed(String),

    #[error("pool is shut down")]
    ShutDown,

    #[error("transport tuning invalid: {0}")]
    Tuning(String),

    #[error("TLS setup failed: {0}")]
    Tls(#[from] TlsError),

    #[error(transparent)]
    Socket(#[from] SocketError),

    #[error("endpoint setup failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Static pool parameters, captured at construction. Entries never point
/// back at the owning bridge.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Far end to dial.
    pub remote: SocketAddr,
    /// ALPN token (the bridge name).
    pub alpn: String,
    /// Maximum live connections.
    pub max_connections: usize,
    /// Maximum concurrent streams per connection.
    pub max_streams_per_connection: u64,
    /// Close connections idle for at least this long.
    pub idle_reap: Duration,
    /// Optional interface to pin the UDP socket to.
    pub interface: Option<String>,
    /// Transport tuning.
    pub tuning: QuicTuning,
}

/// One pooled connection with its stream accounting.
struct PoolEntry {
    conn: Connection,
    active: AtomicU64,
    created_at: Instant,
    last_used: Mutex<Instant>,
}

impl PoolEntry {
    fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_used.lock())
    }
}

/// A pooled stream. Dropping the lease releases the slot: the parent
/// connection's `active_streams` is decremented exactly once.
pub struct StreamLease {
    pub send: SendStream,
    pub recv: RecvStream,
    _guard: LeaseGuard,
}

/// A reserved stream slot. The increment happens under the pool mutex at
/// selection time; the decrement happens here, exactly once, whether the
/// slot became a lease, failed to open, or was cancelled mid-open.
struct LeaseGuard {
    entry: Arc<PoolEntry>,
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.entry.active.fetch_sub(1, Ordering::AcqRel);
        self.entry.touch();
    }
}

/// Slot reservation for a dial in flight. Dropping it (including when the
/// caller's future is cancelled mid-dial) releases the reservation and
/// wakes everyone waiting on the dial's outcome.
struct DialGuard<'a> {
    pending: &'a AtomicUsize,
    dials_changed: &'a Notify,
}

impl Drop for DialGuard<'_> {
    fn drop(&mut self) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
        self.dials_changed.notify_waiters();
    }
}

enum Selection<'a> {
    /// A slot was reserved on this entry; open the stream.
    Use(LeaseGuard),
    /// Room to grow: a dial slot was reserved.
    Dial(DialGuard<'a>),
    /// Full right now, but a dial in flight may create capacity.
    Wait,
    /// Saturated with nothing in flight.
    Exhausted,
}

/// Pool of live QUIC connections for a connector bridge.
pub struct ConnectionPool {
    endpoint: Endpoint,
    config: PoolConfig,
    entries: Mutex<Vec<Arc<PoolEntry>>>,
    /// Dials in flight, reserved under the entries lock.
    pending_dials: AtomicUsize,
    /// Signalled whenever a dial resolves (insert, failure or cancel).
    dials_changed: Notify,
    running: Arc<AtomicBool>,
    reaper: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ConnectionPool {
    /// Create the pool and start its reaper. Must run inside a tokio
    /// runtime (the endpoint registers its socket with the reactor).
    pub fn new(config: PoolConfig) -> Result<Arc<Self>, PoolError> {
        let local: SocketAddr = if config.remote.is_ipv4() {
            "0.0.0.0:0".parse().expect("constant address")
        } else {
            "[::]:0".parse().expect("constant address")
        };
        let udp = socket::bind_udp(local, config.interface.as_deref())?;
        let transport = Arc::new(super::transport_config(
            &config.tuning,
            config.max_streams_per_connection,
        )?);
        let client = tls::client_config(&config.alpn, transport)?;
        let mut endpoint = Endpoint::new(
            quinn::EndpointConfig::default(),
            None,
            udp,
            Arc::new(quinn::TokioRuntime),
        )?;
        endpoint.set_default_client_config(client);

        let pool = Arc::new(Self {
            endpoint,
            config,
            entries: Mutex::new(Vec::new()),
            pending_dials: AtomicUsize::new(0),
            dials_changed: Notify::new(),
            running: Arc::new(AtomicBool::new(true)),
            reaper: Mutex::new(None),
        });
        pool.spawn_reaper();
        Ok(pool)
    }

    /// Number of live pooled connections.
    pub fn entry_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Sum of active streams across all entries.
    pub fn active_streams(&self) -> u64 {
        self.entries
            .lock()
            .iter()
            .map(|e| e.active.load(Ordering::Acquire))
            .sum()
    }

    /// Open a stream, dialling a new connection if the pool has room and no
    /// existing entry has spare capacity. Callers finding the pool full
    /// while a dial is in flight wait for it to resolve; `Exhausted` means
    /// every entry is at its stream cap and nothing more can be dialled.
    /// One retry after evicting a connection that failed to open a stream.
    pub async fn open_stream(self: &Arc<Self>) -> Result<StreamLease, PoolError> {
        let mut open_failures = 0;
        loop {
            if !self.running.load(Ordering::Acquire) {
                return Err(PoolError::ShutDown);
            }
            // Register interest before selecting so a dial resolving
            // in between cannot be missed.
            let mut dial_resolved = std::pin::pin!(self.dials_changed.notified());
            dial_resolved.as_mut().enable();

            let guard = match self.select() {
                Selection::Use(guard) => guard,
                Selection::Dial(reservation) => self.dial(reservation).await?,
                Selection::Wait => {
                    dial_resolved.await;
                    continue;
                }
                Selection::Exhausted => return Err(PoolError::Exhausted),
            };
            let entry = guard.entry.clone();
            match self.open_on(guard).await {
                Ok(lease) => return Ok(lease),
                Err(reason) => {
                    // The connection is unusable; drop it from the pool and
                    // try once more on whatever selection yields next.
                    self.evict(&entry, &reason);
                    open_failures += 1;
                    if open_failures >= 2 {
                        return Err(PoolError::StreamOpenFailed(reason));
                    }
                }
            }
        }
    }

    /// Close every entry and stop the reaper. In-flight stream I/O is
    /// unblocked with a cancellation; outstanding leases keep their
    /// transports alive until dropped.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.reaper.lock().take() {
            handle.abort();
        }
        let drained: Vec<Arc<PoolEntry>> = self.entries.lock().drain(..).collect();
        for entry in &drained {
            entry
                .conn
                .close(VarInt::from_u32(CLOSE_SHUTDOWN), b"shutdown");
        }
        self.endpoint
            .close(VarInt::from_u32(CLOSE_SHUTDOWN), b"shutdown");
        // Unpark anyone waiting on a dial so they observe the stop flag.
        self.dials_changed.notify_waiters();
        log::info!(
            "[pool] {} shut down ({} connections closed)",
            self.config.alpn,
            drained.len()
        );
    }

    /// Selection step, under the pool mutex, book-keeping only. Stream and
    /// dial slots are reserved here, atomically with the decision, so
    /// concurrent selections can neither oversubscribe an entry nor
    /// overshoot the connection cap.
    fn select(&self) -> Selection<'_> {
        let entries = self.entries.lock();
        let pending = self.pending_dials.load(Ordering::Acquire);
        let max = self.config.max_streams_per_connection;

        let reserve_dial = || {
            self.pending_dials.fetch_add(1, Ordering::AcqRel);
            DialGuard {
                pending: &self.pending_dials,
                dials_changed: &self.dials_changed,
            }
        };
        let reserve_slot = |entry: &Arc<PoolEntry>| {
            entry.active.fetch_add(1, Ordering::AcqRel);
            LeaseGuard {
                entry: entry.clone(),
            }
        };

        let has_spare = entries
            .iter()
            .any(|e| e.active.load(Ordering::Acquire) < max);

        // Grow first when nothing has spare capacity and there is room.
        if !has_spare && entries.len() + pending < self.config.max_connections {
            return Selection::Dial(reserve_dial());
        }

        // Least-active entry below the stream cap; oldest wins ties so
        // long-lived connections drain gracefully under shrinkage.
        let best = entries
            .iter()
            .filter(|e| e.active.load(Ordering::Acquire) < max)
            .min_by_key(|e| (e.active.load(Ordering::Acquire), e.created_at));

        match best {
            Some(entry) => Selection::Use(reserve_slot(entry)),
            None if entries.len() + pending < self.config.max_connections => {
                Selection::Dial(reserve_dial())
            }
            // Capacity is still being created; wait rather than fail.
            None if pending > 0 => Selection::Wait,
            None => Selection::Exhausted,
        }
    }

    /// Dial a new connection for a reserved slot and claim its first stream
    /// slot. The guard releases the reservation (and wakes waiters) on
    /// every exit path, cancellation included.
    async fn dial(self: &Arc<Self>, reservation: DialGuard<'_>) -> Result<LeaseGuard, PoolError> {
        let result = async {
            let connecting = self
                .endpoint
                .connect(self.config.remote, tls::TLS_SERVER_NAME)
                .map_err(|e| PoolError::DialFailed(e.to_string()))?;
            let conn = timeout(DIAL_DEADLINE, connecting)
                .await
                .map_err(|_| PoolError::DialFailed("dial timed out".to_string()))?
                .map_err(|e| PoolError::DialFailed(e.to_string()))?;
            Ok::<Connection, PoolError>(conn)
        }
        .await;

        let conn = result.inspect_err(|e| {
            log::warn!("[pool] {} dial {}: {}", self.config.alpn, self.config.remote, e);
        })?;

        log::debug!(
            "[pool] {} connected to {}",
            self.config.alpn,
            self.config.remote
        );
        let now = Instant::now();
        let entry = Arc::new(PoolEntry {
            conn,
            active: AtomicU64::new(0),
            created_at: now,
            last_used: Mutex::new(now),
        });

        let mut entries = self.entries.lock();
        if !self.running.load(Ordering::Acquire) {
            entry
                .conn
                .close(VarInt::from_u32(CLOSE_SHUTDOWN), b"shutdown");
            return Err(PoolError::ShutDown);
        }
        entry.active.fetch_add(1, Ordering::AcqRel);
        let guard = LeaseGuard {
            entry: entry.clone(),
        };
        entries.push(entry);
        // The reservation converts into a real entry under the same lock;
        // dropping it wakes the waiters.
        drop(reservation);
        Ok(guard)
    }

    /// Open a stream on an already-reserved slot. The guard travels into
    /// the lease on success and releases the slot on failure.
    async fn open_on(&self, guard: LeaseGuard) -> Result<StreamLease, String> {
        let opened = timeout(OPEN_DEADLINE, guard.entry.conn.open_bi()).await;
        match opened {
            Ok(Ok((send, recv))) => {
                guard.entry.touch();
                Ok(StreamLease {
                    send,
                    recv,
                    _guard: guard,
                })
            }
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("stream open timed out".to_string()),
        }
    }

    /// Remove a dead entry and close its connection.
    fn evict(&self, entry: &Arc<PoolEntry>, reason: &str) {
        {
            let mut entries = self.entries.lock();
            if let Some(pos) = entries.iter().position(|e| Arc::ptr_eq(e, entry)) {
                entries.remove(pos);
            }
        }
        entry
            .conn
            .close(VarInt::from_u32(CLOSE_RECONNECT), b"reconnecting");
        log::warn!("[pool] {} evicted connection: {}", self.config.alpn, reason);
    }

    fn spawn_reaper(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(REAP_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(pool) = weak.upgrade() else { break };
                if !pool.running.load(Ordering::Acquire) {
                    break;
                }
                pool.reap();
            }
        });
        *self.reaper.lock() = Some(handle);
    }

    /// Close entries that sat idle past the configured reap timeout. Holds
    /// the pool mutex for the whole mutation so selection never sees a
    /// closed entry.
    fn reap(&self) {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|entry| {
            let reapable = entry.active.load(Ordering::Acquire) == 0
                && entry.idle_for(now) >= self.config.idle_reap;
            if reapable {
                entry.conn.close(VarInt::from_u32(CLOSE_IDLE), b"idle");
                log::debug!(
                    "[pool] {} reaped idle connection (idle {:?})",
                    self.config.alpn,
                    entry.idle_for(now)
                );
            }
            !reapable
        });
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        if let Some(handle) = self.reaper.lock().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("alpn", &self.config.alpn)
            .field("remote", &self.config.remote)
            .field("entries", &self.entry_count())
            .finish()
    }
}
