// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! UDP socket construction with optional interface binding.

use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use thiserror::Error;

/// Socket setup errors.
#[derive(Debug, Error)]
pub enum SocketError {
    #[error("UDP bind failed: {0}")]
    Bind(#[source] std::io::Error),

    #[error("interface binding is not supported on this platform")]
    InterfaceUnsupported,

    #[error("binding to interface failed: {0}")]
    Interface(#[source] std::io::Error),
}

/// Create a non-blocking UDP socket bound to `addr`, optionally pinned to a
/// network interface (`SO_BINDTODEVICE`, Linux only).
pub fn bind_udp(
    addr: SocketAddr,
    interface: Option<&str>,
) -> Result<std::net::UdpSocket, SocketError> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket =
        Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).map_err(SocketError::Bind)?;
    if let Some(name) = interface {
        bind_device(&socket, name)?;
        log::debug!("[socket] UDP socket pinned to interface {}", name);
    }
    socket.set_nonblocking(true).map_err(SocketError::Bind)?;
    socket.bind(&addr.into()).map_err(SocketError::Bind)?;
    Ok(socket.into())
}

#[cfg(target_os = "linux")]
fn bind_device(socket: &Socket, name: &str) -> Result<(), SocketError> {
    socket
        .bind_device(Some(name.as_bytes()))
        .map_err(SocketError::Interface)
}

#[cfg(not(target_os = "linux"))]
fn bind_device(_socket: &Socket, _name: &str) -> Result<(), SocketError> {
    Err(SocketError::InterfaceUnsupported)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_ephemeral() {
        let socket = bind_udp("127.0.0.1:0".parse().unwrap(), None).unwrap();
        let addr = socket.local_addr().unwrap();
        assert_eq!(addr.ip().to_string(), "127.0.0.1");
        assert_ne!(addr.port(), 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_bind_unknown_interface_fails() {
        let result = bind_udp(
            "0.0.0.0:0".parse().unwrap(),
            Some("no-such-interface-xyz"),
        );
        assert!(matches!(result, Err(SocketError::Interface(_))));
    }
}
