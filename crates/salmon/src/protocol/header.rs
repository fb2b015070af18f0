// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Tunnel stream header codec.
//!
//! Every stream opened near-to-far starts with a one-byte type. A status
//! ping carries nothing else; a connect request is followed by a 16-bit
//! big-endian length and that many ASCII bytes of `host:port`:
//!
//! ```text
//! +------+---------+----------------+
//! | Type | Len(16) | Target bytes   |
//! +------+---------+----------------+
//!    1       0..2       0..L (L <= 65535)
//! ```
//!
//! The `host:port` split happens on the far side, after the egress filter
//! has seen the raw target string.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Liveness probe; no payload.
pub const TYPE_STATUS_PING: u8 = 0x01;
/// Connect request; length-prefixed target follows.
pub const TYPE_CONNECT: u8 = 0x02;
/// Reply byte to a status ping.
pub const STATUS_ACK: u8 = 0x03;
// 0x04 is reserved and intentionally not assigned.

/// Upper bound on the encoded target (16-bit length field).
pub const MAX_TARGET_LEN: usize = 65535;

/// Header codec errors.
#[derive(Debug, Error)]
pub enum HeaderError {
    #[error("unknown stream header type {0:#04x}")]
    UnknownType(u8),

    #[error("empty target")]
    EmptyTarget,

    #[error("target address too long ({0} bytes)")]
    TargetTooLong(usize),

    #[error("target is not ASCII")]
    NonAscii,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Decoded stream header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamHeader {
    StatusPing,
    Connect { target: String },
}

/// Read one header from the start of a stream.
pub async fn read_header<R>(reader: &mut R) -> Result<StreamHeader, HeaderError>
where
    R: AsyncRead + Unpin,
{
    let mut kind = [0u8; 1];
    reader.read_exact(&mut kind).await?;
    match kind[0] {
        TYPE_STATUS_PING => Ok(StreamHeader::StatusPing),
        TYPE_CONNECT => {
            let mut len = [0u8; 2];
            reader.read_exact(&mut len).await?;
            let len = u16::from_be_bytes(len) as usize;
            if len == 0 {
                return Err(HeaderError::EmptyTarget);
            }
            // Length is validated before the allocation.
            let mut target = vec![0u8; len];
            reader.read_exact(&mut target).await?;
            if !target.is_ascii() {
                return Err(HeaderError::NonAscii);
            }
            // ASCII verified above, so this cannot fail.
            let target = String::from_utf8(target).map_err(|_| HeaderError::NonAscii)?;
            Ok(StreamHeader::Connect { target })
        }
        other => Err(HeaderError::UnknownType(other)),
    }
}

/// Write a connect header for `target` (`host:port`).
pub async fn write_connect<W>(writer: &mut W, target: &str) -> Result<(), HeaderError>
where
    W: AsyncWrite + Unpin,
{
    if target.is_empty() {
        return Err(HeaderError::EmptyTarget);
    }
    if target.len() > MAX_TARGET_LEN {
        return Err(HeaderError::TargetTooLong(target.len()));
    }
    if !target.is_ascii() {
        return Err(HeaderError::NonAscii);
    }
    let mut frame = Vec::with_capacity(3 + target.len());
    frame.push(TYPE_CONNECT);
    frame.extend_from_slice(&(target.len() as u16).to_be_bytes());
    frame.extend_from_slice(target.as_bytes());
    writer.write_all(&frame).await?;
    Ok(())
}

/// Write a status ping header.
pub async fn write_status_ping<W>(writer: &mut W) -> Result<(), HeaderError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&[TYPE_STATUS_PING]).await?;
    Ok(())
}

/// Split a decoded target into host and port.
pub fn split_target(target: &str) -> Option<(&str, u16)> {
    let (host, port) = target.rsplit_once(':')?;
    let host = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')).unwrap_or(host);
    if host.is_empty() {
        return None;
    }
    let port: u16 = port.parse().ok()?;
    Some((host, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    async fn roundtrip(target: &str) -> Result<StreamHeader, HeaderError> {
        let mut buf = Vec::new();
        write_connect(&mut buf, target).await?;
        read_header(&mut Cursor::new(buf)).await
    }

    #[tokio::test]
    async fn test_connect_roundtrip() {
        for target in ["example.com:443", "10.0.0.1:80", "[::1]:1099", "a:1"] {
            let header = roundtrip(target).await.unwrap();
            assert_eq!(
                header,
                StreamHeader::Connect {
                    target: target.to_string()
                }
            );
        }
    }

    #[tokio::test]
    async fn test_connect_roundtrip_longest() {
        let target = format!("{}:1", "h".repeat(MAX_TARGET_LEN - 2));
        assert_eq!(target.len(), MAX_TARGET_LEN);
        let header = roundtrip(&target).await.unwrap();
        assert_eq!(header, StreamHeader::Connect { target });
    }

    #[tokio::test]
    async fn test_empty_target_rejected_on_write() {
        let mut buf = Vec::new();
        assert!(matches!(
            write_connect(&mut buf, "").await,
            Err(HeaderError::EmptyTarget)
        ));
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_zero_length_rejected_on_read() {
        let frame = [TYPE_CONNECT, 0, 0];
        assert!(matches!(
            read_header(&mut Cursor::new(frame.to_vec())).await,
            Err(HeaderError::EmptyTarget)
        ));
    }

    #[tokio::test]
    async fn test_oversized_target_rejected() {
        let target = "h".repeat(MAX_TARGET_LEN + 1);
        let mut buf = Vec::new();
        assert!(matches!(
            write_connect(&mut buf, &target).await,
            Err(HeaderError::TargetTooLong(_))
        ));
    }

    #[tokio::test]
    async fn test_non_ascii_rejected() {
        let mut buf = Vec::new();
        assert!(matches!(
            write_connect(&mut buf, "bücher.example:80").await,
            Err(HeaderError::NonAscii)
        ));

        let mut frame = vec![TYPE_CONNECT, 0, 2];
        frame.extend_from_slice(&[0xC3, 0xBC]);
        assert!(matches!(
            read_header(&mut Cursor::new(frame)).await,
            Err(HeaderError::NonAscii)
        ));
    }

    #[tokio::test]
    async fn test_status_ping_roundtrip() {
        let mut buf = Vec::new();
        write_status_ping(&mut buf).await.unwrap();
        assert_eq!(buf, vec![TYPE_STATUS_PING]);
        let header = read_header(&mut Cursor::new(buf)).await.unwrap();
        assert_eq!(header, StreamHeader::StatusPing);
    }

    #[tokio::test]
    async fn test_unknown_type_rejected() {
        for kind in [0x00u8, 0x04, 0x7F, 0xFF] {
            let result = read_header(&mut Cursor::new(vec![kind])).await;
            assert!(matches!(result, Err(HeaderError::UnknownType(k)) if k == kind));
        }
    }

    #[tokio::test]
    async fn test_truncated_target_is_io_error() {
        // Length says 10 bytes but only 3 follow.
        let mut frame = vec![TYPE_CONNECT, 0, 10];
        frame.extend_from_slice(b"abc");
        assert!(matches!(
            read_header(&mut Cursor::new(frame)).await,
            Err(HeaderError::Io(_))
        ));
    }

    #[test]
    fn test_split_target() {
        assert_eq!(split_target("example.com:443"), Some(("example.com", 443)));
        assert_eq!(split_target("[::1]:80"), Some(("::1", 80)));
        assert_eq!(split_target("127.0.0.1:1099"), Some(("127.0.0.1", 1099)));
        assert_eq!(split_target("noport"), None);
        assert_eq!(split_target(":80"), None);
        assert_eq!(split_target("host:notaport"), None);
        assert_eq!(split_target("host:99999"), None);
    }
}
