// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! QUIC transport plumbing: endpoint construction, TLS material, socket
//! options and the per-bridge connection pool.

pub mod pool;
pub mod socket;
pub mod tls;

use crate::config::QuicTuning;
use self::pool::PoolError;
use quinn::{IdleTimeout, TransportConfig, VarInt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Build the quinn transport parameters for a bridge.
///
/// Receive windows are derived from the configured buffer budget: the
/// per-stream window starts at 1/8 of the budget, the connection window is
/// capped at 1/2. Keep-alives run well inside the idle timeout so pooled
/// connections survive until the reaper decides their fate.
pub fn transport_config(
    tuning: &QuicTuning,
    max_streams_per_connection: u64,
) -> Result<TransportConfig, PoolError> {
    let bad = |what: &str| PoolError::Tuning(what.to_string());

    let mut config = TransportConfig::default();
    config.max_idle_timeout(Some(
        IdleTimeout::try_from(tuning.idle_timeout).map_err(|_| bad("idle_timeout too large"))?,
    ));
    config.initial_mtu(tuning.initial_packet_size.max(1200));
    config.stream_receive_window(
        VarInt::from_u64(tuning.max_recv_buffer / 8).map_err(|_| bad("max_recv_buffer"))?,
    );
    config.receive_window(
        VarInt::from_u64(tuning.max_recv_buffer / 2).map_err(|_| bad("max_recv_buffer"))?,
    );
    // Incoming stream budget equals the per-connection cap, so the
    // transport enforces the same bound the pool accounting guarantees.
    config.max_concurrent_bidi_streams(
        VarInt::from_u64(max_streams_per_connection)
            .map_err(|_| bad("max_streams_per_connection"))?,
    );
    config.max_concurrent_uni_streams(VarInt::from_u32(0));
    config.keep_alive_interval(Some(
        (tuning.idle_timeout / 2).min(Duration::from_secs(5)),
    ));
    Ok(config)
}

/// Build a listening endpoint for an acceptor bridge.
pub fn server_endpoint(
    bind: SocketAddr,
    interface: Option<&str>,
    alpn: &str,
    tuning: &QuicTuning,
    max_streams_per_connection: u64,
) -> Result<quinn::Endpoint, PoolError> {
    let transport = Arc::new(transport_config(tuning, max_streams_per_connection)?);
    let server = tls::server_config(alpn, transport)?;
    let socket = socket::bind_udp(bind, interface)?;
    let endpoint = quinn::Endpoint::new(
        quinn::EndpointConfig::default(),
        Some(server),
        socket,
        Arc::new(quinn::TokioRuntime),
    )?;
    Ok(endpoint)
}
