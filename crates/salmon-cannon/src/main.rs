// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! salmon-cannon - two-ended QUIC tunnelling proxy daemon
//!
//! Reads `scconfig.yml` from the working directory, starts every configured
//! bridge (connectors get their SOCKS5 / HTTP CONNECT listeners, acceptors
//! start serving), plus the optional shared redirect listener and the
//! read-only management API. Ctrl-C shuts everything down in order.
//!
//! # Usage
//!
//! ```bash
//! # Run with ./scconfig.yml
//! salmon-cannon
//!
//! # Explicit config path, verbose logging
//! salmon-cannon --config /etc/salmon/scconfig.yml --log-level debug
//! ```

mod api;

use clap::Parser;
use salmon::ingress::redirect::RedirectTable;
use salmon::ingress::{http, redirect, socks};
use salmon::{Bridge, BridgeMode, Config, Monitor};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::net::TcpListener;

/// Two-ended QUIC tunnelling proxy
#[derive(Parser, Debug)]
#[command(name = "salmon-cannon")]
#[command(about = "Two-ended QUIC tunnelling proxy with pooled transports")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "scconfig.yml")]
    config: PathBuf,

    /// Override the configured log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match Config::from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("salmon-cannon: {}: {}", args.config.display(), e);
            std::process::exit(1);
        }
    };

    let level = args.log_level.unwrap_or_else(|| config.log.level.clone());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&level)).init();

    log::info!(
        "salmon-cannon v{} starting ({} bridges)",
        env!("CARGO_PKG_VERSION"),
        config.bridges.len()
    );

    let monitor = Monitor::new();
    let reporter = monitor.spawn_reporter();

    let mut bridges: HashMap<String, Bridge> = HashMap::new();
    let mut listener_tasks = Vec::new();

    for bridge_config in &config.bridges {
        let tuning = config.quic_for(bridge_config);
        let bridge = match bridge_config.mode {
            BridgeMode::Connector => {
                match Bridge::connector(bridge_config, tuning, &monitor).await {
                    Ok(bridge) => bridge,
                    Err(e) => fail(&format!("bridge '{}': {}", bridge_config.name, e)),
                }
            }
            BridgeMode::Acceptor => match Bridge::acceptor(bridge_config, tuning, &monitor).await {
                Ok(bridge) => bridge,
                Err(e) => fail(&format!("bridge '{}': {}", bridge_config.name, e)),
            },
        };

        if let Some(addr) = bridge_config.socks_addr {
            let listener = match TcpListener::bind(addr).await {
                Ok(listener) => listener,
                Err(e) => fail(&format!("bridge '{}' SOCKS bind {}: {}", bridge_config.name, addr, e)),
            };
            log::info!("[main] {} SOCKS5 on {}", bridge_config.name, addr);
            listener_tasks.push(tokio::spawn(socks::run_listener(
                listener,
                bridge.clone(),
                None,
            )));
        }
        if let Some(addr) = bridge_config.http_addr {
            let listener = match TcpListener::bind(addr).await {
                Ok(listener) => listener,
                Err(e) => fail(&format!("bridge '{}' HTTP bind {}: {}", bridge_config.name, addr, e)),
            };
            log::info!("[main] {} HTTP CONNECT on {}", bridge_config.name, addr);
            listener_tasks.push(tokio::spawn(http::run_listener(listener, bridge.clone())));
        }

        bridges.insert(bridge_config.name.clone(), bridge);
    }

    if let Some(ref redirect_config) = config.redirect {
        let table = RedirectTable::new(
            redirect_config
                .routes
                .iter()
                .map(|r| (r.host.clone(), r.bridge.clone()))
                .collect(),
        );
        let listener = match TcpListener::bind(redirect_config.listen).await {
            Ok(listener) => listener,
            Err(e) => fail(&format!("redirect bind {}: {}", redirect_config.listen, e)),
        };
        log::info!("[main] redirect SOCKS5 on {}", redirect_config.listen);
        listener_tasks.push(tokio::spawn(redirect::run_listener(
            listener,
            table,
            bridges.clone(),
            None,
        )));
    }

    if let Some(ref api_config) = config.api {
        listener_tasks.push(tokio::spawn(api::serve(
            api_config.listen,
            monitor.clone(),
        )));
    }

    if tokio::signal::ctrl_c().await.is_err() {
        log::error!("[main] signal handler unavailable; exiting");
    }
    log::info!("[main] shutting down");

    for task in &listener_tasks {
        task.abort();
    }
    for bridge in bridges.values() {
        bridge.shutdown();
    }
    reporter.abort();
}

fn fail(message: &str) -> ! {
    log::error!("[main] {}", message);
    eprintln!("salmon-cannon: {}", message);
    std::process::exit(1);
}
