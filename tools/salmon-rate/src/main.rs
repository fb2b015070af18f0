// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! salmon-rate - plain-TCP rate and latency measurement
//!
//! Point `test` mode at a tunnel ingress (or directly at a `listen` peer)
//! to measure sustained throughput; `pingpong` measures round-trip latency.
//!
//! # Usage
//!
//! ```bash
//! # Sink side
//! salmon-rate --mode listen --lport 9100
//!
//! # Source side, 10 seconds of writes
//! salmon-rate --mode test --cport 9100 --seconds 10
//!
//! # Latency: echo side, then initiator
//! salmon-rate --mode pingpong --lport 9101
//! salmon-rate --mode pingpong --cport 9101 --count 1000
//! ```

use clap::{Parser, ValueEnum};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const CHUNK: usize = 64 * 1024;
const PING_PAYLOAD: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Write bytes as fast as the peer accepts them.
    Test,
    /// Accept one connection and report receive throughput.
    Listen,
    /// Echo (with --lport) or measure round-trips (with --cport).
    Pingpong,
}

/// TCP throughput and ping-pong latency tool
#[derive(Parser, Debug)]
#[command(name = "salmon-rate")]
#[command(about = "TCP rate and latency measurement companion")]
#[command(version)]
struct Args {
    /// Operating mode
    #[arg(short, long, value_enum)]
    mode: Mode,

    /// Local port to listen on (listen / pingpong echo side)
    #[arg(long, default_value = "9100")]
    lport: u16,

    /// Port to connect to (test / pingpong initiator side)
    #[arg(long)]
    cport: Option<u16>,

    /// Peer host for connecting modes
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Seconds to run in test mode (0 = until interrupted)
    #[arg(long, default_value = "10")]
    seconds: u64,

    /// Round-trips to measure in pingpong mode
    #[arg(long, default_value = "1000")]
    count: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    match args.mode {
        Mode::Listen => run_listen(args.lport).await,
        Mode::Test => {
            let cport = args.cport.ok_or("--cport is required in test mode")?;
            run_test(&args.host, cport, args.seconds).await
        }
        Mode::Pingpong => match args.cport {
            Some(cport) => run_pingpong_initiator(&args.host, cport, args.count).await,
            None => run_pingpong_echo(args.lport).await,
        },
    }
}

async fn run_listen(lport: u16) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(("0.0.0.0", lport)).await?;
    println!("listening on port {}", lport);

    let (mut stream, peer) = listener.accept().await?;
    println!("accepted {}", peer);

    let mut buf = vec![0u8; CHUNK];
    let mut window_bytes = 0u64;
    let mut total = 0u64;
    let mut window_start = Instant::now();
    let start = window_start;

    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        window_bytes += n as u64;
        total += n as u64;
        if window_start.elapsed() >= Duration::from_secs(1) {
            println!("rx {}", format_rate(window_bytes, window_start.elapsed()));
            window_bytes = 0;
            window_start = Instant::now();
        }
    }
    println!(
        "total {} in {:.1}s ({})",
        format_bytes(total),
        start.elapsed().as_secs_f64(),
        format_rate(total, start.elapsed())
    );
    Ok(())
}

async fn run_test(host: &str, cport: u16, seconds: u64) -> Result<(), Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect((host, cport)).await?;
    println!("connected to {}:{}", host, cport);

    let chunk = vec![0x5Au8; CHUNK];
    let mut window_bytes = 0u64;
    let mut total = 0u64;
    let mut window_start = Instant::now();
    let start = window_start;
    let deadline = (seconds > 0).then(|| start + Duration::from_secs(seconds));

    loop {
        tokio::select! {
            result = stream.write_all(&chunk) => {
                result?;
                window_bytes += chunk.len() as u64;
                total += chunk.len() as u64;
            }
            _ = tokio::signal::ctrl_c() => break,
        }
        if window_start.elapsed() >= Duration::from_secs(1) {
            println!("tx {}", format_rate(window_bytes, window_start.elapsed()));
            window_bytes = 0;
            window_start = Instant::now();
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }
    }
    stream.shutdown().await?;
    println!(
        "total {} in {:.1}s ({})",
        format_bytes(total),
        start.elapsed().as_secs_f64(),
        format_rate(total, start.elapsed())
    );
    Ok(())
}

async fn run_pingpong_echo(lport: u16) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(("0.0.0.0", lport)).await?;
    println!("echo on port {}", lport);

    let (mut stream, peer) = listener.accept().await?;
    println!("accepted {}", peer);

    let mut buf = [0u8; PING_PAYLOAD];
    let mut count = 0u64;
    loop {
        match stream.read_exact(&mut buf).await {
            Ok(_) => {}
            Err(_) => break,
        }
        stream.write_all(&buf).await?;
        count += 1;
    }
    println!("echoed {} round-trips", count);
    Ok(())
}

async fn run_pingpong_initiator(
    host: &str,
    cport: u16,
    count: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect((host, cport)).await?;
    stream.set_nodelay(true)?;
    println!("connected to {}:{}, {} round-trips", host, cport, count);

    let payload = [0xA5u8; PING_PAYLOAD];
    let mut echo = [0u8; PING_PAYLOAD];
    let mut samples = Vec::with_capacity(count as usize);

    // Short warmup so connection setup does not pollute the samples.
    for _ in 0..10.min(count) {
        stream.write_all(&payload).await?;
        stream.read_exact(&mut echo).await?;
    }

    for _ in 0..count {
        let t0 = Instant::now();
        stream.write_all(&payload).await?;
        stream.read_exact(&mut echo).await?;
        samples.push(t0.elapsed());
    }
    stream.shutdown().await?;

    samples.sort();
    let sum: Duration = samples.iter().sum();
    let pick = |q: f64| samples[((samples.len() - 1) as f64 * q) as usize];
    println!(
        "rtt min {:?} / p50 {:?} / p99 {:?} / max {:?} / avg {:?}",
        samples[0],
        pick(0.50),
        pick(0.99),
        samples[samples.len() - 1],
        sum / samples.len() as u32
    );
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

fn format_rate(bytes: u64, window: Duration) -> String {
    let per_second = bytes as f64 / window.as_secs_f64().max(0.001);
    format!("{}/s", format_bytes(per_second as u64))
}
