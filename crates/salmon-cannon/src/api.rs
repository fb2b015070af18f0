// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Read-only management API.
//!
//! - `GET /bridges` - per-bridge snapshot (streams, ping, rate)
//! - `GET /status`  - process summary

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use salmon::Monitor;
use serde_json::{json, Value};
use std::net::SocketAddr;

/// Serve the API until the task is aborted.
pub async fn serve(addr: SocketAddr, monitor: Monitor) {
    let app = Router::new()
        .route("/bridges", get(bridges))
        .route("/status", get(status))
        .with_state(monitor);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            log::error!("[api] bind {} failed: {}", addr, e);
            return;
        }
    };
    log::info!("[api] listening on {}", addr);
    if let Err(e) = axum::serve(listener, app).await {
        log::error!("[api] server error: {}", e);
    }
}

async fn bridges(State(monitor): State<Monitor>) -> Json<Value> {
    let list: Vec<Value> = monitor
        .snapshot()
        .into_iter()
        .map(|s| {
            json!({
                "name": s.name,
                "alive": s.alive,
                "active_streams": s.active_streams,
                "last_ping_ms": s.last_ping_ms,
                "last_alive": s.last_alive,
                "observed_rate_bps": s.observed_rate,
            })
        })
        .collect();
    Json(json!({ "bridges": list }))
}

async fn status(State(monitor): State<Monitor>) -> Json<Value> {
    let snapshot = monitor.snapshot();
    let alive = snapshot.iter().filter(|s| s.alive).count();
    Json(json!({
        "bridges": snapshot.len(),
        "alive": alive,
        "active_streams": monitor.total_active(),
    }))
}
