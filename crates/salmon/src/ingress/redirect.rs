// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared redirect SOCKS listener.
//!
//! One listener serving several bridges: the requested host is matched
//! against an ordered substring table and the first hit picks the bridge.
//! From there the request behaves exactly as if it had arrived on that
//! bridge's own SOCKS listener, inbound allow-list included.

use super::socks::{self, CredentialCheck};
use crate::bridge::Bridge;
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

/// Ordered substring-to-bridge table. Insertion order is match order.
#[derive(Debug, Clone, Default)]
pub struct RedirectTable {
    routes: Vec<(String, String)>,
}

impl RedirectTable {
    pub fn new(routes: Vec<(String, String)>) -> Self {
        Self { routes }
    }

    /// First route whose substring occurs in `host`.
    pub fn select(&self, host: &str) -> Option<&str> {
        self.routes
            .iter()
            .find(|(substring, _)| host.contains(substring.as_str()))
            .map(|(_, bridge)| bridge.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Accept clients and route each to the bridge its destination selects.
pub async fn run_listener(
    listener: TcpListener,
    table: RedirectTable,
    bridges: HashMap<String, Bridge>,
    creds: Option<CredentialCheck>,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                log::warn!("[redirect] accept failed: {}", e);
                continue;
            }
        };
        let table = table.clone();
        let bridges = bridges.clone();
        let creds = creds.clone();
        tokio::spawn(async move {
            handle_client(stream, peer, table, bridges, creds).await;
        });
    }
}

async fn handle_client(
    mut stream: TcpStream,
    peer: SocketAddr,
    table: RedirectTable,
    bridges: HashMap<String, Bridge>,
    creds: Option<CredentialCheck>,
) {
    let target = match timeout(
        socks::HANDSHAKE_DEADLINE,
        socks::handshake(&mut stream, creds.as_ref()),
    )
    .await
    {
        Ok(Ok(target)) => target,
        Ok(Err(e)) => {
            log::warn!("[redirect] handshake with {} failed: {}", peer, e);
            return;
        }
        Err(_) => {
            log::warn!("[redirect] handshake with {} timed out", peer);
            return;
        }
    };

    let Some(bridge) = table.select(&target.0).and_then(|name| bridges.get(name)) else {
        log::info!("[redirect] no route for host {} from {}", target.0, peer);
        return;
    };

    // The routed request honours the selected bridge's inbound policy.
    if !bridge.ingress_allows(&peer) {
        log::info!("[redirect] {} refused client {}", bridge.name(), peer);
        return;
    }

    log::debug!(
        "[redirect] {} serves {} -> {}:{}",
        bridge.name(),
        peer,
        target.0,
        target.1
    );
    socks::relay(stream, peer, bridge, target).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_substring_hit_wins() {
        let table = RedirectTable::new(vec![
            ("internal.example".to_string(), "office".to_string()),
            ("example".to_string(), "public".to_string()),
        ]);
        assert_eq!(table.select("internal.example.com"), Some("office"));
        assert_eq!(table.select("www.example.com"), Some("public"));
        assert_eq!(table.select("elsewhere.net"), None);
    }

    #[test]
    fn test_order_matters() {
        // Reversed order shadows the more specific route.
        let table = RedirectTable::new(vec![
            ("example".to_string(), "public".to_string()),
            ("internal.example".to_string(), "office".to_string()),
        ]);
        assert_eq!(table.select("internal.example.com"), Some("public"));
    }

    #[test]
    fn test_empty_table() {
        let table = RedirectTable::default();
        assert!(table.is_empty());
        assert_eq!(table.select("anything"), None);
    }
}
