// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SOCKS5 ingress (RFC 1928 subset).
//!
//! Supported: NO_AUTH and USER/PASS methods, the CONNECT command, IPv4,
//! domain and IPv6 address types. Replies use the truncated form with a
//! zero bind address. UDP ASSOCIATE and BIND close the connection.
//!
//! The whole handshake runs under one five-second deadline and every field
//! is read with `read_exact`, so TCP fragmentation never desynchronises the
//! state machine. USER/PASS credentials (RFC 1929) are parsed and handed to
//! an injectable predicate; the default accepts anything.

use crate::bridge::{splice, Bridge};
use crate::limit::RateLimiter;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

/// Overall deadline for the handshake bytes.
pub const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(5);

pub const SOCKS_VERSION: u8 = 0x05;
pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_USER_PASS: u8 = 0x02;
pub const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;
pub const CMD_CONNECT: u8 = 0x01;
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;
pub const REPLY_SUCCESS: u8 = 0x00;
pub const REPLY_FAILURE: u8 = 0x01;

/// Credential predicate for the USER/PASS method.
pub type CredentialCheck = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

/// SOCKS handshake errors.
#[derive(Debug, Error)]
pub enum SocksError {
    #[error("unsupported SOCKS version {0:#04x}")]
    BadVersion(u8),

    #[error("no acceptable authentication method")]
    NoAcceptableMethod,

    #[error("authentication rejected")]
    AuthRejected,

    #[error("unsupported command {0:#04x}")]
    BadCommand(u8),

    #[error("unsupported address type {0:#04x}")]
    BadAddrType(u8),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Accept clients on `listener` and tunnel each through `bridge`.
pub async fn run_listener(listener: TcpListener, bridge: Bridge, creds: Option<CredentialCheck>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                log::warn!("[socks] {} accept failed: {}", bridge.name(), e);
                continue;
            }
        };
        let bridge = bridge.clone();
        let creds = creds.clone();
        tokio::spawn(async move {
            handle_client(stream, peer, bridge, creds).await;
        });
    }
}

async fn handle_client(
    mut stream: TcpStream,
    peer: SocketAddr,
    bridge: Bridge,
    creds: Option<CredentialCheck>,
) {
    if !bridge.ingress_allows(&peer) {
        log::info!("[socks] {} refused client {}", bridge.name(), peer);
        return;
    }

    let target = match timeout(HANDSHAKE_DEADLINE, handshake(&mut stream, creds.as_ref())).await {
        Ok(Ok(target)) => target,
        Ok(Err(e)) => {
            log::warn!("[socks] {} handshake with {} failed: {}", bridge.name(), peer, e);
            return;
        }
        Err(_) => {
            log::warn!("[socks] {} handshake with {} timed out", bridge.name(), peer);
            return;
        }
    };

    relay(stream, peer, &bridge, target).await;
}

/// Open the tunnel, send the reply, splice. Shared with the redirect
/// listener.
pub(crate) async fn relay(
    mut stream: TcpStream,
    peer: SocketAddr,
    bridge: &Bridge,
    (host, port): (String, u16),
) {
    match bridge.open_tunnel(&host, port).await {
        Ok(mut tunnel) => {
            // A far-side policy or dial failure arrives only as a stream
            // cancel; catch it before claiming success to the client.
            let buffered = match probe_early_close(&mut tunnel, bridge.early_close_window()).await
            {
                TunnelProbe::Closed => {
                    log::warn!(
                        "[socks] {} tunnel to {}:{} rejected by peer",
                        bridge.name(),
                        host,
                        port
                    );
                    let _ = write_reply(&mut stream, REPLY_FAILURE).await;
                    return;
                }
                TunnelProbe::Open(buffered) => buffered,
            };
            if write_reply(&mut stream, REPLY_SUCCESS).await.is_err() {
                return;
            }
            if !buffered.is_empty() && stream.write_all(&buffered).await.is_err() {
                return;
            }
            log::debug!(
                "[socks] {} relaying {} -> {}:{}",
                bridge.name(),
                peer,
                host,
                port
            );
            let (client_read, client_write) = stream.into_split();
            let (tunnel_read, tunnel_write) = tokio::io::split(tunnel);
            // The bridge-side splice applies the limiter; this hop is local.
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
                "[socks] {} tunnel to {}:{} failed for {}: {}",
                bridge.name(),
                host,
                port,
                peer,
                e
            );
            let _ = write_reply(&mut stream, REPLY_FAILURE).await;
        }
    }
}

/// Outcome of watching a fresh tunnel for an early far-side cancel.
pub(crate) enum TunnelProbe {
    /// Still open; any bytes the target already sent are handed back.
    Open(Vec<u8>),
    /// Cancelled before the window elapsed.
    Closed,
}

/// Watch a fresh tunnel for `window` before declaring it established.
pub(crate) async fn probe_early_close<S>(tunnel: &mut S, window: Duration) -> TunnelProbe
where
    S: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; 4096];
    match timeout(window, tunnel.read(&mut buf)).await {
        Ok(Ok(0)) | Ok(Err(_)) => TunnelProbe::Closed,
        Ok(Ok(n)) => {
            buf.truncate(n);
            TunnelProbe::Open(buf)
        }
        // Quiet tunnel: the far side had its chance to cancel.
        Err(_) => TunnelProbe::Open(Vec::new()),
    }
}

/// Run the greeting, method selection and request phases; returns the
/// requested `(host, port)`. The connect reply is sent by the caller once
/// the tunnel outcome is known.
pub async fn handshake<S>(
    stream: &mut S,
    creds: Option<&CredentialCheck>,
) -> Result<(String, u16), SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Greeting: VER, NMETHODS, then the method list.
    let mut greeting = [0u8; 2];
    stream.read_exact(&mut greeting).await?;
    if greeting[0] != SOCKS_VERSION {
        return Err(SocksError::BadVersion(greeting[0]));
    }
    let mut methods = vec![0u8; greeting[1] as usize];
    stream.read_exact(&mut methods).await?;

    if methods.contains(&METHOD_NO_AUTH) {
        stream
            .write_all(&[SOCKS_VERSION, METHOD_NO_AUTH])
            .await?;
    } else if methods.contains(&METHOD_USER_PASS) {
        stream
            .write_all(&[SOCKS_VERSION, METHOD_USER_PASS])
            .await?;
        user_pass_exchange(stream, creds).await?;
    } else {
        stream
            .write_all(&[SOCKS_VERSION, METHOD_NONE_ACCEPTABLE])
            .await?;
        return Err(SocksError::NoAcceptableMethod);
    }

    // Request: VER, CMD, RSV, ATYP.
    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    if request[0] != SOCKS_VERSION {
        return Err(SocksError::BadVersion(request[0]));
    }
    if request[1] != CMD_CONNECT {
        return Err(SocksError::BadCommand(request[1]));
    }

    let host = match request[3] {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            std::net::Ipv4Addr::from(octets).to_string()
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await?;
            String::from_utf8_lossy(&name).into_owned()
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            std::net::Ipv6Addr::from(octets).to_string()
        }
        other => return Err(SocksError::BadAddrType(other)),
    };

    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok((host, u16::from_be_bytes(port)))
}

/// RFC 1929 username/password subnegotiation. Validation is one predicate;
/// absent a predicate every credential passes.
async fn user_pass_exchange<S>(
    stream: &mut S,
    creds: Option<&CredentialCheck>,
) -> Result<(), SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    // head[0] is the subnegotiation version; clients disagree on it, so it
    // is not enforced.
    let mut username = vec![0u8; head[1] as usize];
    stream.read_exact(&mut username).await?;

    let mut plen = [0u8; 1];
    stream.read_exact(&mut plen).await?;
    let mut password = vec![0u8; plen[0] as usize];
    stream.read_exact(&mut password).await?;

    let username = String::from_utf8_lossy(&username).into_owned();
    let password = String::from_utf8_lossy(&password).into_owned();

    let accepted = creds.map(|check| check(&username, &password)).unwrap_or(true);
    if accepted {
        stream.write_all(&[0x01, 0x00]).await?;
        Ok(())
    } else {
        stream.write_all(&[0x01, 0x01]).await?;
        Err(SocksError::AuthRejected)
    }
}

/// Truncated reply with a zero bind address.
async fn write_reply<S>(stream: &mut S, code: u8) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(&[SOCKS_VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    async fn drive(client_bytes: Vec<u8>) -> (Result<(String, u16), SocksError>, Vec<u8>) {
        drive_with(client_bytes, None).await
    }

    async fn drive_with(
        client_bytes: Vec<u8>,
        creds: Option<CredentialCheck>,
    ) -> (Result<(String, u16), SocksError>, Vec<u8>) {
        let (mut client, mut server) = duplex(1024);
        client.write_all(&client_bytes).await.unwrap();
        client.shutdown().await.unwrap();
        let result = handshake(&mut server, creds.as_ref()).await;
        drop(server);
        let mut replies = Vec::new();
        client.read_to_end(&mut replies).await.unwrap();
        (result, replies)
    }

    #[tokio::test]
    async fn test_no_auth_ipv4_connect() {
        let mut bytes = vec![0x05, 0x01, 0x00]; // greeting: one method, NO_AUTH
        bytes.extend_from_slice(&[0x05, 0x01, 0x00, 0x01]); // request, ATYP v4
        bytes.extend_from_slice(&[127, 0, 0, 1]);
        bytes.extend_from_slice(&1099u16.to_be_bytes());

        let (result, replies) = drive(bytes).await;
        let (host, port) = result.unwrap();
        assert_eq!(host, "127.0.0.1");
        assert_eq!(port, 1099);
        assert_eq!(replies, vec![0x05, 0x00]);
    }

    #[tokio::test]
    async fn test_domain_connect() {
        let mut bytes = vec![0x05, 0x01, 0x00];
        bytes.extend_from_slice(&[0x05, 0x01, 0x00, 0x03]);
        bytes.push(11);
        bytes.extend_from_slice(b"example.com");
        bytes.extend_from_slice(&443u16.to_be_bytes());

        let (result, _) = drive(bytes).await;
        assert_eq!(result.unwrap(), ("example.com".to_string(), 443));
    }

    #[tokio::test]
    async fn test_ipv6_connect() {
        let mut bytes = vec![0x05, 0x01, 0x00];
        bytes.extend_from_slice(&[0x05, 0x01, 0x00, 0x04]);
        let ip: std::net::Ipv6Addr = "::1".parse().unwrap();
        bytes.extend_from_slice(&ip.octets());
        bytes.extend_from_slice(&80u16.to_be_bytes());

        let (result, _) = drive(bytes).await;
        assert_eq!(result.unwrap(), ("::1".to_string(), 80));
    }

    #[tokio::test]
    async fn test_wrong_version_closes() {
        let (result, replies) = drive(vec![0x04, 0x01, 0x00]).await;
        assert!(matches!(result, Err(SocksError::BadVersion(0x04))));
        // Closed without a reply.
        assert!(replies.is_empty());
    }

    #[tokio::test]
    async fn test_no_acceptable_method() {
        // Client offers only GSSAPI (0x01).
        let (result, replies) = drive(vec![0x05, 0x01, 0x01]).await;
        assert!(matches!(result, Err(SocksError::NoAcceptableMethod)));
        assert_eq!(replies, vec![0x05, 0xFF]);
    }

    #[tokio::test]
    async fn test_bind_command_rejected() {
        let mut bytes = vec![0x05, 0x01, 0x00];
        bytes.extend_from_slice(&[0x05, 0x02, 0x00, 0x01]); // BIND
        bytes.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
        let (result, _) = drive(bytes).await;
        assert!(matches!(result, Err(SocksError::BadCommand(0x02))));
    }

    #[tokio::test]
    async fn test_udp_associate_rejected() {
        let mut bytes = vec![0x05, 0x01, 0x00];
        bytes.extend_from_slice(&[0x05, 0x03, 0x00, 0x01]); // UDP ASSOCIATE
        bytes.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
        let (result, _) = drive(bytes).await;
        assert!(matches!(result, Err(SocksError::BadCommand(0x03))));
    }

    #[tokio::test]
    async fn test_unknown_atyp_rejected() {
        let mut bytes = vec![0x05, 0x01, 0x00];
        bytes.extend_from_slice(&[0x05, 0x01, 0x00, 0x02]);
        let (result, _) = drive(bytes).await;
        assert!(matches!(result, Err(SocksError::BadAddrType(0x02))));
    }

    #[tokio::test]
    async fn test_user_pass_accepted_by_default() {
        let mut bytes = vec![0x05, 0x01, 0x02]; // only USER/PASS offered
        bytes.push(0x01); // subnegotiation version
        bytes.push(5);
        bytes.extend_from_slice(b"alice");
        bytes.push(6);
        bytes.extend_from_slice(b"secret");
        bytes.extend_from_slice(&[0x05, 0x01, 0x00, 0x01]);
        bytes.extend_from_slice(&[10, 0, 0, 7]);
        bytes.extend_from_slice(&22u16.to_be_bytes());

        let (result, replies) = drive(bytes).await;
        assert_eq!(result.unwrap(), ("10.0.0.7".to_string(), 22));
        // Method choice then auth success.
        assert_eq!(replies, vec![0x05, 0x02, 0x01, 0x00]);
    }

    #[tokio::test]
    async fn test_user_pass_predicate_rejects() {
        let check: CredentialCheck =
            Arc::new(|user: &str, pass: &str| user == "alice" && pass == "right");
        let mut bytes = vec![0x05, 0x01, 0x02];
        bytes.push(0x01);
        bytes.push(5);
        bytes.extend_from_slice(b"alice");
        bytes.push(5);
        bytes.extend_from_slice(b"wrong");

        let (result, replies) = drive_with(bytes, Some(check)).await;
        assert!(matches!(result, Err(SocksError::AuthRejected)));
        assert_eq!(replies, vec![0x05, 0x02, 0x01, 0x01]);
    }

    #[tokio::test]
    async fn test_fragmented_request_still_parses() {
        // Bytes arrive one at a time; read_exact must reassemble.
        let (mut client, mut server) = duplex(1024);
        let mut bytes = vec![0x05, 0x01, 0x00];
        bytes.extend_from_slice(&[0x05, 0x01, 0x00, 0x01]);
        bytes.extend_from_slice(&[192, 168, 0, 9]);
        bytes.extend_from_slice(&8080u16.to_be_bytes());

        let writer = tokio::spawn(async move {
            for byte in bytes {
                client.write_all(&[byte]).await.unwrap();
                client.flush().await.unwrap();
                tokio::task::yield_now().await;
            }
            client
        });

        let result = handshake(&mut server, None).await;
        assert_eq!(result.unwrap(), ("192.168.0.9".to_string(), 8080));
        drop(writer.await.unwrap());
    }
}
