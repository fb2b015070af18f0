// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # Salmon - pooled QUIC tunnelling core
//!
//! A two-ended tunnelling proxy. The near ("connector") end accepts client
//! TCP traffic over SOCKS5 or HTTP CONNECT, multiplexes every client flow
//! onto a dedicated bidirectional stream inside a pooled QUIC transport, and
//! the far ("acceptor") end dials the real destination and splices bytes
//! end-to-end. Several independent bridges run in one process, each with its
//! own identity (the bridge name doubles as the TLS ALPN token), transport
//! tuning and address policies.
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                            Ingress                                 |
//! |      SOCKS5 listener | HTTP CONNECT listener | redirect listener   |
//! +--------------------------------------------------------------------+
//! |                            Bridge                                  |
//! |   open_tunnel(host, port) -> pipe     handle_stream() -> TCP dial  |
//! |                 splice (rate limited, half-close aware)            |
//! +--------------------------------------------------------------------+
//! |                       Connection pool                              |
//! |   select / dial / evict / reap        stream leases + accounting   |
//! +--------------------------------------------------------------------+
//! |                      quinn QUIC transport                          |
//! |   self-signed TLS, ALPN = bridge name, optional interface binding  |
//! +--------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Bridge`] | One named tunnel end (connector or acceptor) |
//! | [`ConnectionPool`] | Per-bridge pool of live QUIC connections |
//! | [`StreamLease`] | A pooled stream plus its release accounting |
//! | [`RateLimiter`] | Shared token bucket applied to all streams of a bridge |
//! | [`Monitor`] | Process-wide registry of per-bridge runtime counters |
//! | [`Config`] | `scconfig.yml` schema with size/duration parsing |

pub mod bridge;
pub mod config;
pub mod filter;
pub mod ingress;
pub mod limit;
pub mod monitor;
pub mod protocol;
pub mod transport;

pub use bridge::{Bridge, BridgeError};
pub use config::{BridgeConfig, BridgeMode, Config, ConfigError, QuicTuning};
pub use filter::AddrFilter;
pub use limit::RateLimiter;
pub use monitor::{BridgeStats, Monitor};
pub use transport::pool::{ConnectionPool, PoolError, StreamLease};
