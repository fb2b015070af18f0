// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! HTTP CONNECT ingress.
//!
//! Only `CONNECT host:port HTTP/1.1` is understood. Anything else answers
//! `405` (wrong method) or `400` (malformed request); a failed tunnel
//! answers `502`. A successful tunnel answers
//! `200 Connection Established` and splices, sharing the SOCKS path from
//! there on.

use crate::bridge::{splice, Bridge};
use crate::ingress::socks;
use crate::limit::RateLimiter;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

/// Deadline for reading the request head.
const HEAD_DEADLINE: Duration = Duration::from_secs(5);
/// Upper bound on the request head.
const MAX_HEAD: usize = 8 * 1024;

const RESPONSE_OK: &str = "HTTP/1.1 200 Connection Established\r\n\r\n";
const RESPONSE_BAD_REQUEST: &str = "HTTP/1.1 400 Bad Request\r\n\r\n";
const RESPONSE_METHOD_NOT_ALLOWED: &str = "HTTP/1.1 405 Method Not Allowed\r\n\r\n";
const RESPONSE_BAD_GATEWAY: &str = "HTTP/1.1 502 Bad Gateway\r\n\r\n";

/// Request parsing errors, each mapped to a fixed response.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HttpError {
    #[error("method not allowed")]
    MethodNotAllowed,

    #[error("malformed request")]
    BadRequest,
}

/// Accept clients on `listener` and tunnel each through `bridge`.
pub async fn run_listener(listener: TcpListener, bridge: Bridge) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                log::warn!("[http] {} accept failed: {}", bridge.name(), e);
                continue;
            }
        };
        let bridge = bridge.clone();
        tokio::spawn(async move {
            handle_client(stream, peer, bridge).await;
        });
    }
}

async fn handle_client(mut stream: TcpStream, peer: SocketAddr, bridge: Bridge) {
    if !bridge.ingress_allows(&peer) {
        log::info!("[http] {} refused client {}", bridge.name(), peer);
        return;
    }

    let head = match timeout(HEAD_DEADLINE, read_head(&mut stream)).await {
        Ok(Ok(head)) => head,
        Ok(Err(_)) | Err(_) => {
            let _ = stream.write_all(RESPONSE_BAD_REQUEST.as_bytes()).await;
            return;
        }
    };

    let (host, port) = match parse_connect(&head) {
        Ok(target) => target,
        Err(HttpError::MethodNotAllowed) => {
            let _ = stream
                .write_all(RESPONSE_METHOD_NOT_ALLOWED.as_bytes())
                .await;
            return;
        }
        Err(HttpError::BadRequest) => {
            let _ = stream.write_all(RESPONSE_BAD_REQUEST.as_bytes()).await;
            return;
        }
    };

    match bridge.open_tunnel(&host, port).await {
        Ok(mut tunnel) => {
            let buffered = match socks::probe_early_close(&mut tunnel, bridge.early_close_window())
                .await
            {
                socks::TunnelProbe::Closed => {
                    log::warn!(
                        "[http] {} tunnel to {}:{} rejected by peer",
                        bridge.name(),
                        host,
                        port
                    );
                    let _ = stream.write_all(RESPONSE_BAD_GATEWAY.as_bytes()).await;
                    return;
                }
                socks::TunnelProbe::Open(buffered) => buffered,
            };
            if stream.write_all(RESPONSE_OK.as_bytes()).await.is_err() {
                return;
            }
            if !buffered.is_empty() && stream.write_all(&buffered).await.is_err() {
                return;
            }
            log::debug!("[http] {} relaying {} -> {}:{}", bridge.name(), peer, host, port);
            let (client_read, client_write) = stream.into_split();
            let (tunnel_read, tunnel_write) = tokio::io::split(tunnel);
            let _ = splice::splice(
                client_read,
                client_write,
                tunnel_read,
                tunnel_write,
                RateLimiter::unlimited(),
            )
            .await;
        }
        Err(e) => {
            log::warn!(
                "[http] {} tunnel to {}:{} failed for {}: {}",
                bridge.name(),
                host,
                port,
                peer,
                e
            );
            let _ = stream.write_all(RESPONSE_BAD_GATEWAY.as_bytes()).await;
        }
    }
}

/// Read up to the blank line ending the request head.
async fn read_head<R>(stream: &mut R) -> std::io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_HEAD {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "request head too large",
            ));
        }
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        head.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&head).into_owned())
}

/// Parse the request line of a CONNECT request.
pub fn parse_connect(head: &str) -> Result<(String, u16), HttpError> {
    let request_line = head.lines().next().ok_or(HttpError::BadRequest)?;
    let mut parts = request_line.split_whitespace();

    let method = parts.next().ok_or(HttpError::BadRequest)?;
    if !method.eq_ignore_ascii_case("CONNECT") {
        return Err(HttpError::MethodNotAllowed);
    }

    let target = parts.next().ok_or(HttpError::BadRequest)?;
    let version = parts.next().ok_or(HttpError::BadRequest)?;
    if !version.starts_with("HTTP/1.") {
        return Err(HttpError::BadRequest);
    }

    let (host, port) = crate::protocol::header::split_target(target).ok_or(HttpError::BadRequest)?;
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_connect() {
        let head = "CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n";
        assert_eq!(
            parse_connect(head).unwrap(),
            ("example.com".to_string(), 443)
        );
    }

    #[test]
    fn test_parse_connect_ipv6() {
        let head = "CONNECT [::1]:8443 HTTP/1.1\r\n\r\n";
        assert_eq!(parse_connect(head).unwrap(), ("::1".to_string(), 8443));
    }

    #[test]
    fn test_get_is_method_not_allowed() {
        let head = "GET /index.html HTTP/1.1\r\n\r\n";
        assert_eq!(parse_connect(head), Err(HttpError::MethodNotAllowed));
    }

    #[test]
    fn test_malformed_requests() {
        assert_eq!(parse_connect(""), Err(HttpError::BadRequest));
        assert_eq!(
            parse_connect("CONNECT example.com:443\r\n\r\n"),
            Err(HttpError::BadRequest)
        );
        assert_eq!(
            parse_connect("CONNECT noport HTTP/1.1\r\n\r\n"),
            Err(HttpError::BadRequest)
        );
        assert_eq!(
            parse_connect("CONNECT example.com:badport HTTP/1.1\r\n\r\n"),
            Err(HttpError::BadRequest)
        );
    }

    #[tokio::test]
    async fn test_read_head_stops_at_blank_line() {
        let head = b"CONNECT a:1 HTTP/1.1\r\n\r\nBODYBYTES";
        let mut cursor = std::io::Cursor::new(head.to_vec());
        let parsed = read_head(&mut cursor).await.unwrap();
        assert_eq!(parsed, "CONNECT a:1 HTTP/1.1\r\n\r\n");
        // Body bytes stay unread for the splice.
        assert_eq!(cursor.position(), 24);
    }

    #[tokio::test]
    async fn test_read_head_caps_size() {
        let huge = vec![b'x'; MAX_HEAD + 1];
        let mut cursor = std::io::Cursor::new(huge);
        assert!(read_head(&mut cursor).await.is_err());
    }
}
