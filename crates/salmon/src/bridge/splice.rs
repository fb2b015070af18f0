// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bidirectional byte splice with coordinated half-close.
//!
//! Two copy loops run concurrently, one per direction, sharing the bridge's
//! rate limiter. A direction that ends in EOF half-closes its writer (FIN)
//! and lets the opposite direction keep flowing; a direction that ends in an
//! error cancels both. The splice returns only when both directions have
//! terminated, so lease release happens exactly once, afterwards.
//!
//! Reads go into a bounded buffer and every buffered byte is written before
//! the next terminate decision, so no observed byte is dropped short of a
//! force-close.

use crate::limit::RateLimiter;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// Per-direction copy buffer.
pub const COPY_BUF: usize = 64 * 1024;

/// Splice endpoint A (read+write halves) with endpoint B. Returns the byte
/// counts moved A-to-B and B-to-A; an error from either direction is
/// surfaced after both have stopped.
pub async fn splice<AR, AW, BR, BW>(
    a_read: AR,
    a_write: AW,
    b_read: BR,
    b_write: BW,
    limiter: RateLimiter,
) -> io::Result<(u64, u64)>
where
    AR: AsyncRead + Unpin,
    AW: AsyncWrite + Unpin,
    BR: AsyncRead + Unpin,
    BW: AsyncWrite + Unpin,
{
    let cancel = CancellationToken::new();

    let a_to_b = copy_direction(a_read, b_write, &limiter, &cancel);
    let b_to_a = copy_direction(b_read, a_write, &limiter, &cancel);
    let (forward, backward) = tokio::join!(a_to_b, b_to_a);

    match (forward, backward) {
        (Ok(fwd), Ok(bwd)) => Ok((fwd, bwd)),
        (Err(e), _) | (_, Err(e)) => Err(e),
    }
}

/// One copy direction. EOF half-closes the writer; any error cancels the
/// sibling direction before returning.
async fn copy_direction<R, W>(
    mut reader: R,
    mut writer: W,
    limiter: &RateLimiter,
    cancel: &CancellationToken,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF];
    let mut total = 0u64;

    let result = loop {
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                break Err(io::Error::new(io::ErrorKind::Interrupted, "splice cancelled"));
            }
            read = reader.read(&mut buf) => read,
        };
        let n = match read {
            Ok(0) => {
                // Clean EOF: half-close so in-flight bytes on the other
                // direction keep moving.
                let _ = writer.shutdown().await;
                break Ok(total);
            }
            Ok(n) => n,
            Err(e) => break Err(e),
        };

        limiter.acquire(n).await;

        let wrote = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                break Err(io::Error::new(io::ErrorKind::Interrupted, "splice cancelled"));
            }
            wrote = writer.write_all(&buf[..n]) => wrote,
        };
        if let Err(e) = wrote {
            break Err(e);
        }
        total += n as u64;
    };

    if result.is_err() {
        cancel.cancel();
    }
    result
}
