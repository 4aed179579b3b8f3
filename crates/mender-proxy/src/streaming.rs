//! Streamed response relay.
//!
//! Backend bytes are yielded to the client in the order received; SSE frames
//! are not parsed or re-chunked. Dropping the returned stream (actix does this
//! when the client disconnects) drops the upstream body and closes the
//! backend connection.

use crate::error::{GatewayError, ProxyError};
use crate::pipeline::{RequestTrace, Stage};
use async_stream::try_stream;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::time::Duration;
use tracing::debug;

/// Closes out a request's trace when the relay ends. A guard dropped before
/// the upstream is exhausted means the client went away (or the relay
/// failed) mid-stream; the upstream body is dropped with it.
#[derive(Debug)]
pub struct RelayGuard {
    trace: RequestTrace,
    bytes: u64,
    chunks: u64,
    finished: bool,
}

impl RelayGuard {
    pub fn new(trace: RequestTrace) -> Self {
        Self {
            trace,
            bytes: 0,
            chunks: 0,
            finished: false,
        }
    }

    fn record(&mut self, chunk: &Bytes) {
        self.bytes += chunk.len() as u64;
        self.chunks += 1;
    }

    fn finish(&mut self) {
        self.finished = true;
        debug!(
            request_id = %self.trace.request_id(),
            bytes = self.bytes,
            chunks = self.chunks,
            "stream relayed"
        );
        self.trace.advance(Stage::Relayed);
    }
}

impl Drop for RelayGuard {
    fn drop(&mut self) {
        if !self.finished {
            let reason = format!(
                "stream aborted after {} bytes in {} chunks; backend connection released",
                self.bytes, self.chunks
            );
            self.trace.fail(&reason);
        }
    }
}

/// Relay an upstream body stream chunk by chunk.
///
/// Each read waits at most `idle_timeout`; a stall ends the stream with
/// [`GatewayError::Timeout`] (the status line has already been sent, so this
/// surfaces to the client as a truncated body).
pub fn relay_stream<S>(
    upstream: S,
    idle_timeout: Duration,
    mut guard: RelayGuard,
) -> impl Stream<Item = Result<Bytes, ProxyError>>
where
    S: Stream<Item = Result<Bytes, reqwest::Error>>,
{
    try_stream! {
        let mut upstream = Box::pin(upstream);
        loop {
            let next = tokio::time::timeout(idle_timeout, upstream.next())
                .await
                .map_err(|_| ProxyError::from(GatewayError::Timeout(idle_timeout)))?;
            let chunk = match next {
                Some(chunk) => chunk,
                None => break,
            };
            let chunk = chunk.map_err(|e| ProxyError::from(GatewayError::Read(e)))?;
            guard.record(&chunk);
            yield chunk;
        }
        guard.finish();
    }
}
