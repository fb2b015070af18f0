// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Liveness ping exchange.
//!
//! The exchange is symmetric so both ends observe a fresh round-trip time:
//!
//! ```text
//! near                     far
//!  |------ STATUS_PING ----->|   (header byte)
//!  |<----- STATUS_ACK -------|   near records RTT (5s deadline)
//!  |------ STATUS_ACK ------>|   far records RTT (5s deadline)
//!  |<------ close -----------|   near waits up to 3s for the close
//! ```
//!
//! Scheduling lives in the bridge: pings run at the configured status-check
//! interval, and two consecutive misses flip the bridge's alive flag until a
//! ping succeeds again.

use super::header::{self, STATUS_ACK};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

/// Deadline for reading the peer's ack.
pub const ACK_DEADLINE: Duration = Duration::from_secs(5);
/// Deadline for the final close indication on the near side.
pub const CLOSE_DEADLINE: Duration = Duration::from_secs(3);

/// Liveness exchange errors.
#[derive(Debug, Error)]
pub enum StatusError {
    #[error("ping timed out")]
    Timeout,

    #[error("unexpected reply byte {0:#04x}")]
    UnexpectedReply(u8),

    #[error("header error: {0}")]
    Header(#[from] header::HeaderError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Near side: run one ping over a fresh stream and return the round-trip
/// time. The caller closes the stream afterwards.
pub async fn ping<W, R>(send: &mut W, recv: &mut R) -> Result<Duration, StatusError>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    header::write_status_ping(send).await?;
    send.flush().await?;
    let t0 = Instant::now();

    let ack = timeout(ACK_DEADLINE, read_byte(recv))
        .await
        .map_err(|_| StatusError::Timeout)??;
    if ack != STATUS_ACK {
        return Err(StatusError::UnexpectedReply(ack));
    }
    let rtt = t0.elapsed();

    // Ack back so the far side gets its own RTT sample, then wait briefly
    // for its close.
    send.write_all(&[STATUS_ACK]).await?;
    send.flush().await?;
    let _ = timeout(CLOSE_DEADLINE, read_byte_or_eof(recv)).await;

    Ok(rtt)
}

/// Far side: answer a ping whose header byte has already been consumed.
/// Returns the far-side round-trip sample. The caller closes the stream.
pub async fn answer<W, R>(send: &mut W, recv: &mut R) -> Result<Duration, StatusError>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    let t0 = Instant::now();
    send.write_all(&[STATUS_ACK]).await?;
    send.flush().await?;

    let ack = timeout(ACK_DEADLINE, read_byte(recv))
        .await
        .map_err(|_| StatusError::Timeout)??;
    if ack != STATUS_ACK {
        return Err(StatusError::UnexpectedReply(ack));
    }
    Ok(t0.elapsed())
}

async fn read_byte<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<u8> {
    let mut byte = [0u8; 1];
    reader.read_exact(&mut byte).await?;
    Ok(byte[0])
}

async fn read_byte_or_eof<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<usize> {
    let mut byte = [0u8; 1];
    reader.read(&mut byte).await
}
