// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Process configuration (`scconfig.yml`).
//!
//! The schema groups per-bridge settings under `SalmonBridges`, with global
//! sections for logging, the management API, the shared redirect listener and
//! QUIC transport tuning. Size strings accept `K/M/G` and `KB/MB/GB`
//! suffixes (x1024 each, uppercase only); bandwidth values are given in bits
//! per second and are divided by 8 to bytes after parsing; durations accept a
//! bare integer (seconds) or a string ending in `s` or `m`.

use serde::{Deserialize, Deserializer};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Bridge definitions.
    #[serde(rename = "SalmonBridges", default)]
    pub bridges: Vec<BridgeConfig>,

    /// Global logging settings.
    #[serde(rename = "GlobalLog", default)]
    pub log: LogConfig,

    /// Management API listener (absent = disabled).
    #[serde(rename = "ApiConfig", default)]
    pub api: Option<ApiConfig>,

    /// Shared redirect SOCKS listener (absent = disabled).
    #[serde(rename = "SocksRedirect", default)]
    pub redirect: Option<RedirectConfig>,

    /// Default QUIC transport tuning, overridable per bridge.
    #[serde(rename = "QuicConfig", default)]
    pub quic: QuicTuning,
}

impl Config {
    /// Load and validate configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Parse and validate configuration from a YAML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// Bridge names are the ALPN namespace, so they must be unique per host.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        for bridge in &self.bridges {
            bridge.validate()?;
            if !names.insert(bridge.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate bridge name '{}' (names are the ALPN identifier)",
                    bridge.name
                )));
            }
        }

        if let Some(ref redirect) = self.redirect {
            for route in &redirect.routes {
                if !names.contains(route.bridge.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "redirect route '{}' references unknown bridge '{}'",
                        route.host, route.bridge
                    )));
                }
            }
        }

        Ok(())
    }

    /// Effective QUIC tuning for a bridge (per-bridge override or global).
    pub fn quic_for(&self, bridge: &BridgeConfig) -> QuicTuning {
        bridge.quic.clone().unwrap_or_else(|| self.quic.clone())
    }
}

/// Role of a bridge end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeMode {
    /// Near end: dials the far peer and serves local ingress listeners.
    Connector,
    /// Far end: listens for QUIC connections and dials targets.
    Acceptor,
}

/// Configuration for a single bridge.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BridgeConfig {
    /// Bridge name. Doubles as the TLS ALPN identifier; unique per host.
    pub name: String,

    /// Connector or acceptor.
    pub mode: BridgeMode,

    /// Far IP for connectors; expected peer for acceptors (empty = any).
    #[serde(default)]
    pub remote: String,

    /// Far UDP port (connector: remote port to dial; acceptor: local port).
    pub udp_port: u16,

    /// Network interface to bind the UDP socket to (Linux only).
    #[serde(default)]
    pub interface: Option<String>,

    /// SOCKS5 listener address (connector side).
    #[serde(default)]
    pub socks_addr: Option<SocketAddr>,

    /// HTTP CONNECT listener address (connector side).
    #[serde(default)]
    pub http_addr: Option<SocketAddr>,

    /// Inbound allow-list, matched against client addresses at near ingress.
    /// Empty = accept all.
    #[serde(default)]
    pub allowed_in: Vec<String>,

    /// Outbound allow-list, matched against CONNECT targets at the far end.
    /// Empty = accept all.
    #[serde(default)]
    pub allowed_out: Vec<String>,

    /// Maximum pooled QUIC connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum concurrent streams per pooled connection.
    #[serde(default = "default_max_streams")]
    pub max_streams_per_connection: u64,

    /// Close pooled connections idle for at least this long.
    #[serde(default = "default_idle_reap", deserialize_with = "de_duration")]
    pub idle_reap: Duration,

    /// Bandwidth cap in bits per second, stored as bytes per second after
    /// parsing. Zero or negative disables shaping.
    #[serde(default, deserialize_with = "de_bandwidth")]
    pub bandwidth: i64,

    /// Interval between liveness pings.
    #[serde(
        rename = "status_check_interval",
        default = "default_status_interval",
        deserialize_with = "de_duration"
    )]
    pub status_interval: Duration,

    /// Per-bridge QUIC tuning override.
    #[serde(default)]
    pub quic: Option<QuicTuning>,
}

impl BridgeConfig {
    /// Validate one bridge definition.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::Invalid("bridge name must not be empty".into()));
        }
        if !self
            .name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.')
        {
            return Err(ConfigError::Invalid(format!(
                "bridge name '{}' must be alphanumeric plus '-', '_', '.'",
                self.name
            )));
        }
        if self.max_connections < 1 {
            return Err(ConfigError::Invalid(format!(
                "bridge '{}': max_connections must be >= 1",
                self.name
            )));
        }
        if self.max_streams_per_connection < 1 {
            return Err(ConfigError::Invalid(format!(
                "bridge '{}': max_streams_per_connection must be >= 1",
                self.name
            )));
        }
        if self.idle_reap < Duration::from_secs(1) {
            return Err(ConfigError::Invalid(format!(
                "bridge '{}': idle_reap must be >= 1s",
                self.name
            )));
        }
        if self.udp_port == 0 {
            return Err(ConfigError::Invalid(format!(
                "bridge '{}': udp_port must be set",
                self.name
            )));
        }
        match self.mode {
            BridgeMode::Connector => {
                if self.remote.is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "connector bridge '{}' requires a remote address",
                        self.name
                    )));
                }
            }
            BridgeMode::Acceptor => {}
        }
        Ok(())
    }
}

fn default_max_connections() -> usize {
    2
}

fn default_max_streams() -> u64 {
    100
}

fn default_idle_reap() -> Duration {
    Duration::from_secs(60)
}

fn default_status_interval() -> Duration {
    Duration::from_secs(10)
}

/// QUIC transport tuning passed down to the quinn stack.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuicTuning {
    /// Connection idle timeout.
    #[serde(default = "default_idle_timeout", deserialize_with = "de_duration")]
    pub idle_timeout: Duration,

    /// Initial packet size (MTU before path probing).
    #[serde(default = "default_initial_packet_size")]
    pub initial_packet_size: u16,

    /// Receive buffer budget. Stream windows are derived from it: initial
    /// window = 1/8, connection window = 1/2.
    #[serde(default = "default_max_recv_buffer", deserialize_with = "de_size")]
    pub max_recv_buffer: u64,
}

impl Default for QuicTuning {
    fn default() -> Self {
        Self {
            idle_timeout: default_idle_timeout(),
            initial_packet_size: default_initial_packet_size(),
            max_recv_buffer: default_max_recv_buffer(),
        }
    }
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_initial_packet_size() -> u16 {
    1350
}

fn default_max_recv_buffer() -> u64 {
    8 * 1024 * 1024
}

/// Global logging settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Management API settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiConfig {
    /// HTTP listener address.
    pub listen: SocketAddr,
}

/// Shared redirect SOCKS listener settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedirectConfig {
    /// TCP listener address.
    pub listen: SocketAddr,

    /// Ordered routes; the first substring hit on the requested host wins.
    pub routes: Vec<RedirectRoute>,
}

/// One redirect route: requested-host substring to bridge name.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedirectRoute {
    /// Substring matched against the requested host.
    pub host: String,

    /// Name of the bridge that serves matching requests.
    pub bridge: String,
}

// ============================================================================
// Size / duration parsing
// ============================================================================

/// Parse a byte-size string: a decimal integer with an optional uppercase
/// `K`/`KB`/`M`/`MB`/`G`/`GB` suffix (x1024 per step).
pub fn parse_size(s: &str) -> Result<u64, ConfigError> {
    let digits_end = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    if digits_end == 0 {
        return Err(ConfigError::Invalid(format!("invalid size '{}'", s)));
    }
    let value: u64 = s[..digits_end]
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("invalid size '{}'", s)))?;
    let multiplier: u64 = match &s[digits_end..] {
        "" => 1,
        "K" | "KB" => 1024,
        "M" | "MB" => 1024 * 1024,
        "G" | "GB" => 1024 * 1024 * 1024,
        suffix => {
            return Err(ConfigError::Invalid(format!(
                "invalid size suffix '{}' in '{}'",
                suffix, s
            )))
        }
    };
    value
        .checked_mul(multiplier)
        .ok_or_else(|| ConfigError::Invalid(format!("size '{}' overflows", s)))
}

/// Parse a duration: a bare integer is seconds, a string must end in `s`
/// (seconds) or `m` (minutes).
pub fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
    let (digits, unit) = s.split_at(s.len().saturating_sub(1));
    let secs_per_unit = match unit {
        "s" => 1,
        "m" => 60,
        _ => {
            // Bare integer means seconds.
            return s
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| ConfigError::Invalid(format!("invalid duration '{}'", s)));
        }
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("invalid duration '{}'", s)))?;
    Ok(Duration::from_secs(value * secs_per_unit))
}

fn de_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Secs(s) => Ok(Duration::from_secs(s)),
        Raw::Text(t) => parse_duration(&t).map_err(serde::de::Error::custom),
    }
}

fn de_size<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Bytes(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Bytes(b) => Ok(b),
        Raw::Text(t) => parse_size(&t).map_err(serde::de::Error::custom),
    }
}

fn de_bandwidth<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Bits(i64),
        Text(String),
    }

    // Configured in bits per second; stored as bytes per second.
    let bits = match Raw::deserialize(deserializer)? {
        Raw::Bits(b) => b,
        Raw::Text(t) => parse_size(&t).map_err(serde::de::Error::custom)? as i64,
    };
    Ok(bits / 8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size_vectors() {
        assert_eq!(parse_size("10K").unwrap(), 10240);
        assert_eq!(parse_size("10KB").unwrap(), 10240);
        assert_eq!(parse_size("50MB").unwrap(), 52428800);
        assert_eq!(parse_size("2M").unwrap(), 2097152);
        assert_eq!(parse_size("1G").unwrap(), 1073741824);
        assert_eq!(parse_size("4096").unwrap(), 4096);
    }

    #[test]
    fn test_parse_size_rejects() {
        assert!(parse_size("10k").is_err()); // lowercase
        assert!(parse_size("bad").is_err());
        assert!(parse_size("").is_err());
        assert!(parse_size("10T").is_err());
        assert!(parse_size("K10").is_err());
    }

    #[test]
    fn test_parse_duration_vectors() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("15").unwrap(), Duration::from_secs(15));
    }

    #[test]
    fn test_parse_duration_rejects() {
        assert!(parse_duration("10h").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("").is_err());
        assert!(parse_duration("tenm").is_err());
    }

    #[test]
    fn test_minimal_bridge_yaml() {
        let yaml = r#"
SalmonBridges:
  - name: office
    mode: connector
    remote: 203.0.113.7
    udp_port: 42000
    socks_addr: 127.0.0.1:1080
    bandwidth: 80M
    idle_reap: 2m
"#;
        let config = Config::from_str(yaml).unwrap();
        assert_eq!(config.bridges.len(), 1);
        let bridge = &config.bridges[0];
        assert_eq!(bridge.name, "office");
        assert_eq!(bridge.mode, BridgeMode::Connector);
        // 80 * 1024 * 1024 bits -> bytes
        assert_eq!(bridge.bandwidth, 80 * 1024 * 1024 / 8);
        assert_eq!(bridge.idle_reap, Duration::from_secs(120));
        assert_eq!(bridge.max_connections, 2);
        assert_eq!(bridge.status_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_acceptor_yaml_with_quic_tuning() {
        let yaml = r#"
SalmonBridges:
  - name: exit-1
    mode: acceptor
    remote: ""
    udp_port: 42000
    allowed_out: ["example.com"]
QuicConfig:
  idle_timeout: 30s
  max_recv_buffer: 16M
"#;
        let config = Config::from_str(yaml).unwrap();
        let bridge = &config.bridges[0];
        assert_eq!(bridge.mode, BridgeMode::Acceptor);
        assert_eq!(bridge.allowed_out, vec!["example.com".to_string()]);
        let quic = config.quic_for(bridge);
        assert_eq!(quic.idle_timeout, Duration::from_secs(30));
        assert_eq!(quic.max_recv_buffer, 16 * 1024 * 1024);
        assert_eq!(quic.initial_packet_size, 1350);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let yaml = r#"
SalmonBridges:
  - name: same
    mode: acceptor
    udp_port: 42000
  - name: same
    mode: acceptor
    udp_port: 42001
"#;
        assert!(matches!(
            Config::from_str(yaml),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_pool_invariants_rejected() {
        let yaml = r#"
SalmonBridges:
  - name: b
    mode: acceptor
    udp_port: 42000
    max_connections: 0
"#;
        assert!(Config::from_str(yaml).is_err());

        let yaml = r#"
SalmonBridges:
  - name: b
    mode: acceptor
    udp_port: 42000
    idle_reap: 0
"#;
        assert!(Config::from_str(yaml).is_err());
    }

    #[test]
    fn test_connector_requires_remote() {
        let yaml = r#"
SalmonBridges:
  - name: b
    mode: connector
    udp_port: 42000
"#;
        assert!(Config::from_str(yaml).is_err());
    }

    #[test]
    fn test_redirect_route_must_reference_bridge() {
        let yaml = r#"
SalmonBridges:
  - name: real
    mode: acceptor
    udp_port: 42000
SocksRedirect:
  listen: 127.0.0.1:1080
  routes:
    - host: example
      bridge: ghost
"#;
        assert!(Config::from_str(yaml).is_err());
    }

    #[test]
    fn test_redirect_routes_keep_order() {
        let yaml = r#"
SalmonBridges:
  - name: a
    mode: acceptor
    udp_port: 42000
  - name: b
    mode: acceptor
    udp_port: 42001
SocksRedirect:
  listen: 127.0.0.1:1080
  routes:
    - host: internal.example
      bridge: a
    - host: example
      bridge: b
"#;
        let config = Config::from_str(yaml).unwrap();
        let redirect = config.redirect.unwrap();
        assert_eq!(redirect.routes[0].bridge, "a");
        assert_eq!(redirect.routes[1].bridge, "b");
    }
}
