// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bridge data plane.
//!
//! A [`Bridge`] is one end of a named tunnel. The connector end owns a
//! connection pool and opens tunnels on behalf of ingress listeners; the
//! acceptor end listens for QUIC connections, filters peers, and serves
//! every incoming stream: liveness pings are answered in place, connect
//! requests are checked against the egress allow-list and dialled out over
//! TCP.
//!
//! `open_tunnel` hands the caller an in-process byte pipe. The QUIC side of
//! the pipe is spliced in a spawned task, so ingress code treats a tunnel
//! exactly like a socket.

pub mod splice;

use crate::config::{BridgeConfig, BridgeMode, QuicTuning};
use crate::filter::AddrFilter;
use crate::limit::RateLimiter;
use crate::monitor::{BridgeStats, Monitor};
use crate::protocol::header::{self, HeaderError, StreamHeader};
use crate::protocol::status::{self, StatusError};
use crate::transport::pool::{
    ConnectionPool, PoolConfig, PoolError, CLOSE_REJECTED, CLOSE_SHUTDOWN,
};
use crate::transport;
use parking_lot::Mutex;
use quinn::{Endpoint, RecvStream, SendStream, VarInt};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::DuplexStream;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Deadline for far-side reads on flight paths (header, target).
const PEER_READ_DEADLINE: Duration = Duration::from_secs(30);
/// Deadline for the far-side TCP dial.
const TCP_DIAL_DEADLINE: Duration = Duration::from_secs(10);
/// Consecutive ping misses before the bridge is considered down.
const PING_MISS_LIMIT: u32 = 2;

/// Bridge errors.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("bridge has no connector pool")]
    NotConnector,

    #[error("invalid remote address '{0}'")]
    BadRemote(String),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Header(#[from] HeaderError),

    #[error(transparent)]
    Status(#[from] StatusError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One end of a named tunnel. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

struct BridgeInner {
    name: String,
    mode: BridgeMode,
    limiter: RateLimiter,
    stats: Arc<BridgeStats>,
    /// Near ingress allow-list (client addresses).
    ingress_filter: AddrFilter,
    /// Far egress allow-list (connect targets).
    egress_filter: AddrFilter,
    /// Acceptor: expected peer host ("" = accept any).
    expected_peer: String,
    /// Connector side only.
    pool: Option<Arc<ConnectionPool>>,
    /// Acceptor side only; closed at shutdown to unblock the accept loop.
    endpoint: Option<Endpoint>,
    running: Arc<AtomicBool>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Bridge {
    /// Build the near end: a connection pool towards the far peer plus the
    /// liveness ping scheduler. Ingress listeners are attached separately.
    pub async fn connector(
        config: &BridgeConfig,
        tuning: QuicTuning,
        monitor: &Monitor,
    ) -> Result<Self, BridgeError> {
        let remote = resolve_remote(&config.remote, config.udp_port)?;
        let stats = monitor.register(&config.name);
        let limiter = RateLimiter::new(config.bandwidth);
        stats.register_limiter(limiter.clone());

        let pool = ConnectionPool::new(PoolConfig {
            remote,
            alpn: config.name.clone(),
            max_connections: config.max_connections,
            max_streams_per_connection: config.max_streams_per_connection,
            idle_reap: config.idle_reap,
            interface: config.interface.clone(),
            tuning,
        })?;

        let bridge = Self {
            inner: Arc::new(BridgeInner {
                name: config.name.clone(),
                mode: BridgeMode::Connector,
                limiter,
                stats,
                ingress_filter: AddrFilter::new(config.allowed_in.clone()),
                egress_filter: AddrFilter::new(config.allowed_out.clone()),
                expected_peer: String::new(),
                pool: Some(pool),
                endpoint: None,
                running: Arc::new(AtomicBool::new(true)),
                tasks: Mutex::new(Vec::new()),
            }),
        };
        bridge.spawn_status_task(config.status_interval);
        log::info!(
            "[bridge] {} connecting towards {} (pool {}x{})",
            config.name,
            remote,
            config.max_connections,
            config.max_streams_per_connection
        );
        Ok(bridge)
    }

    /// Build the far end: a listening endpoint serving streams until
    /// shutdown.
    pub async fn acceptor(
        config: &BridgeConfig,
        tuning: QuicTuning,
        monitor: &Monitor,
    ) -> Result<Self, BridgeError> {
        let bind: SocketAddr = SocketAddr::new("0.0.0.0".parse().expect("constant"), config.udp_port);
        let endpoint = transport::server_endpoint(
            bind,
            config.interface.as_deref(),
            &config.name,
            &tuning,
            config.max_streams_per_connection,
        )?;
        let stats = monitor.register(&config.name);
        let limiter = RateLimiter::new(config.bandwidth);
        stats.register_limiter(limiter.clone());

        let bridge = Self {
            inner: Arc::new(BridgeInner {
                name: config.name.clone(),
                mode: BridgeMode::Acceptor,
                limiter,
                stats,
                ingress_filter: AddrFilter::new(config.allowed_in.clone()),
                egress_filter: AddrFilter::new(config.allowed_out.clone()),
                expected_peer: config.remote.clone(),
                pool: None,
                endpoint: Some(endpoint.clone()),
                running: Arc::new(AtomicBool::new(true)),
                tasks: Mutex::new(Vec::new()),
            }),
        };

        let inner = bridge.inner.clone();
        let accept = tokio::spawn(async move {
            BridgeInner::run_accept(inner, endpoint).await;
        });
        bridge.inner.tasks.lock().push(accept);
        log::info!("[bridge] {} accepting on {}", config.name, bind);
        Ok(bridge)
    }

    /// Bridge name (doubles as the ALPN token).
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn mode(&self) -> BridgeMode {
        self.inner.mode
    }

    /// Stats record shared with the monitor.
    pub fn stats(&self) -> Arc<BridgeStats> {
        self.inner.stats.clone()
    }

    /// Whether a client address passes the near ingress allow-list.
    pub fn ingress_allows(&self, client: &SocketAddr) -> bool {
        self.inner.ingress_filter.permits(&client.ip().to_string())
    }

    /// Live pooled connections (connector side; 0 otherwise).
    pub fn pool_entries(&self) -> usize {
        self.inner
            .pool
            .as_ref()
            .map(|p| p.entry_count())
            .unwrap_or(0)
    }

    /// Leased streams currently outstanding on the pool.
    pub fn pool_active_streams(&self) -> u64 {
        self.inner
            .pool
            .as_ref()
            .map(|p| p.active_streams())
            .unwrap_or(0)
    }

    /// Open a tunnel to `host:port` through the far peer. Returns the near
    /// end of an in-process pipe whose far end is spliced onto a pooled
    /// QUIC stream.
    pub async fn open_tunnel(&self, host: &str, port: u16) -> Result<DuplexStream, BridgeError> {
        let pool = self.inner.pool.as_ref().ok_or(BridgeError::NotConnector)?;
        let mut lease = pool.open_stream().await?;

        let target = format!("{}:{}", host, port);
        header::write_connect(&mut lease.send, &target).await?;

        let (near, far) = tokio::io::duplex(splice::COPY_BUF);
        let inner = self.inner.clone();
        inner.stats.inc_active();
        tokio::spawn(async move {
            let mut lease = lease;
            let (far_read, far_write) = tokio::io::split(far);
            let result = splice::splice(
                &mut lease.recv,
                &mut lease.send,
                far_read,
                far_write,
                inner.limiter.clone(),
            )
            .await;
            match result {
                Ok((from_peer, to_peer)) => log::debug!(
                    "[bridge] {} tunnel to {} done ({}B in, {}B out)",
                    inner.name,
                    target,
                    from_peer,
                    to_peer
                ),
                Err(e) => log::debug!("[bridge] {} tunnel to {} ended: {}", inner.name, target, e),
            }
            inner.stats.dec_active();
            // Lease drops here: the slot is released exactly once, after
            // both splice directions have terminated.
        });
        Ok(near)
    }

    /// How long ingress waits for a far-side rejection before reporting a
    /// tunnel as established. The far end signals policy and dial failures
    /// only by cancelling the stream, so the window scales with the last
    /// observed round-trip time.
    pub fn early_close_window(&self) -> Duration {
        let rtt_ms = self.inner.stats.last_ping_ms();
        Duration::from_millis(rtt_ms.saturating_mul(4).clamp(50, 500))
    }

    /// Run one liveness ping now. Exposed for the scheduler and tests.
    pub async fn ping(&self) -> Result<Duration, BridgeError> {
        let pool = self.inner.pool.as_ref().ok_or(BridgeError::NotConnector)?;
        let mut lease = pool.open_stream().await?;
        let rtt = status::ping(&mut lease.send, &mut lease.recv).await?;
        let _ = lease.send.finish();
        Ok(rtt)
    }

    /// Stop the bridge: close the pool (or listening endpoint) and cancel
    /// background tasks. In-flight splices unwind via stream cancellation.
    pub fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(ref pool) = self.inner.pool {
            pool.shutdown();
        }
        if let Some(ref endpoint) = self.inner.endpoint {
            endpoint.close(VarInt::from_u32(CLOSE_SHUTDOWN), b"shutdown");
        }
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        log::info!("[bridge] {} shut down", self.inner.name);
    }

    fn spawn_status_task(&self, interval: Duration) {
        let bridge = self.clone();
        let handle = tokio::spawn(async move {
            // A ping attempt never outlives its ack deadline, and with fast
            // schedules it is bounded by the cadence itself so two misses
            // fit the detection window.
            let budget = status::ACK_DEADLINE
                .min(interval * 2)
                .max(Duration::from_millis(100));
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut misses = 0u32;
            loop {
                ticker.tick().await;
                if !bridge.inner.running.load(Ordering::Acquire) {
                    break;
                }
                match timeout(budget, bridge.ping()).await {
                    Ok(Ok(rtt)) => {
                        misses = 0;
                        bridge.inner.stats.record_ping(rtt);
                        log::trace!("[bridge] {} ping {}ms", bridge.inner.name, rtt.as_millis());
                    }
                    Ok(Err(e)) => {
                        misses += 1;
                        log::warn!(
                            "[bridge] {} ping failed ({}/{}): {}",
                            bridge.inner.name,
                            misses,
                            PING_MISS_LIMIT,
                            e
                        );
                    }
                    Err(_) => {
                        misses += 1;
                        log::warn!(
                            "[bridge] {} ping timed out ({}/{})",
                            bridge.inner.name,
                            misses,
                            PING_MISS_LIMIT
                        );
                    }
                }
                if misses >= PING_MISS_LIMIT {
                    bridge.inner.stats.mark_down();
                }
            }
        });
        self.inner.tasks.lock().push(handle);
    }
}

impl BridgeInner {
    /// Acceptor loop: peer-filter incoming connections, then serve their
    /// streams until they close.
    async fn run_accept(inner: Arc<BridgeInner>, endpoint: Endpoint) {
        while let Some(incoming) = endpoint.accept().await {
            if !inner.running.load(Ordering::Acquire) {
                incoming.refuse();
                break;
            }
            let peer = incoming.remote_address();
            if !inner.peer_allowed(&peer) {
                log::info!(
                    "[bridge] {} refused {}: unexpected address",
                    inner.name,
                    peer
                );
                incoming.refuse();
                continue;
            }
            let inner = inner.clone();
            tokio::spawn(async move {
                let conn = match incoming.await {
                    Ok(conn) => conn,
                    Err(e) => {
                        log::warn!("[bridge] {} handshake with {} failed: {}", inner.name, peer, e);
                        return;
                    }
                };
                log::debug!("[bridge] {} accepted {}", inner.name, peer);
                Self::serve_connection(inner, conn).await;
            });
        }
    }

    fn peer_allowed(&self, peer: &SocketAddr) -> bool {
        if self.expected_peer.is_empty() {
            return true;
        }
        crate::filter::strip_port(&self.expected_peer) == peer.ip().to_string()
    }

    /// Accept streams on one connection, a task per stream.
    async fn serve_connection(inner: Arc<BridgeInner>, conn: quinn::Connection) {
        let peer = conn.remote_address();
        loop {
            match conn.accept_bi().await {
                Ok((send, recv)) => {
                    let inner = inner.clone();
                    tokio::spawn(async move {
                        inner.handle_stream(send, recv).await;
                    });
                }
                Err(quinn::ConnectionError::ApplicationClosed(_))
                | Err(quinn::ConnectionError::ConnectionClosed(_)) => {
                    log::debug!("[bridge] {} connection from {} closed", inner.name, peer);
                    break;
                }
                Err(e) => {
                    log::warn!(
                        "[bridge] {} stream accept from {} failed: {}",
                        inner.name,
                        peer,
                        e
                    );
                    break;
                }
            }
        }
    }

    /// Serve one far-side stream: answer a ping or run a connect.
    async fn handle_stream(self: Arc<Self>, mut send: SendStream, mut recv: RecvStream) {
        let header = match timeout(PEER_READ_DEADLINE, header::read_header(&mut recv)).await {
            Ok(Ok(header)) => header,
            Ok(Err(e)) => {
                log::warn!("[bridge] {} malformed stream header: {}", self.name, e);
                cancel_stream(send, recv);
                return;
            }
            Err(_) => {
                log::warn!("[bridge] {} stream header read timed out", self.name);
                cancel_stream(send, recv);
                return;
            }
        };

        match header {
            StreamHeader::StatusPing => {
                match status::answer(&mut send, &mut recv).await {
                    Ok(rtt) => {
                        self.stats.record_ping(rtt);
                        log::trace!("[bridge] {} answered ping ({}ms)", self.name, rtt.as_millis());
                    }
                    Err(e) => log::warn!("[bridge] {} ping answer failed: {}", self.name, e),
                }
                let _ = send.finish();
            }
            StreamHeader::Connect { target } => {
                self.run_connect(send, recv, target).await;
            }
        }
    }

    /// Far side of a connect: egress filter, TCP dial, splice.
    async fn run_connect(self: Arc<Self>, send: SendStream, recv: RecvStream, target: String) {
        if !self.egress_filter.permits(&target) {
            log::info!(
                "[bridge] {} target {} not found in allow list",
                self.name,
                target
            );
            cancel_stream(send, recv);
            return;
        }
        let Some((host, port)) = header::split_target(&target) else {
            log::warn!("[bridge] {} invalid connect target '{}'", self.name, target);
            cancel_stream(send, recv);
            return;
        };

        let tcp = match timeout(TCP_DIAL_DEADLINE, TcpStream::connect((host, port))).await {
            Ok(Ok(tcp)) => tcp,
            Ok(Err(e)) => {
                log::warn!("[bridge] {} dial {} failed: {}", self.name, target, e);
                cancel_stream(send, recv);
                return;
            }
            Err(_) => {
                log::warn!("[bridge] {} dial {} timed out", self.name, target);
                cancel_stream(send, recv);
                return;
            }
        };

        log::debug!("[bridge] {} connected {} for peer", self.name, target);
        self.stats.inc_active();
        let (tcp_read, tcp_write) = tcp.into_split();
        let result =
            splice::splice(recv, send, tcp_read, tcp_write, self.limiter.clone()).await;
        if let Err(e) = result {
            log::debug!("[bridge] {} relay for {} ended: {}", self.name, target, e);
        }
        self.stats.dec_active();
    }
}

/// Cancel both halves of a rejected stream; the client observes it like a
/// dial timeout, not an explicit refusal.
fn cancel_stream(mut send: SendStream, mut recv: RecvStream) {
    let _ = recv.stop(VarInt::from_u32(CLOSE_REJECTED));
    let _ = send.reset(VarInt::from_u32(CLOSE_REJECTED));
}

fn resolve_remote(remote: &str, port: u16) -> Result<SocketAddr, BridgeError> {
    (remote, port)
        .to_socket_addrs()
        .map_err(|_| BridgeError::BadRemote(remote.to_string()))?
        .next()
        .ok_or_else(|| BridgeError::BadRemote(remote.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_remote_literal() {
        let addr = resolve_remote("127.0.0.1", 42000).unwrap();
        assert_eq!(addr, "127.0.0.1:42000".parse().unwrap());
    }

    #[test]
    fn test_resolve_remote_rejects_garbage() {
        assert!(matches!(
            resolve_remote("no db such host..", 1),
            Err(BridgeError::BadRemote(_))
        ));
    }
}
