// Copyright 2022 Protocol Labs.
//
// Permission is hereby granted, free of charge, to any person obtaining a
// copy of this software and associated documentation files (the "Software"),
// to deal in the Software without restriction, including without limitation
// the rights to use, copy, modify, merge, publish, distribute, sublicense,
// and/or sell copies of the Software, and to permit persons to whom the
// Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS
// OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
// DEALINGS IN THE SOFTWARE.

//! Stream multiplexing over a single byte pipe.

use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};

/// The role a party played when the underlying connection was established.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// A multiplexed session over one byte pipe. Implementations own the pipe
/// and any background tasks driving it; dropping the last handle tears the
/// session down.
#[async_trait]
pub trait StreamMuxer: Send + Sync {
    /// Open a new outbound substream.
    async fn open_stream(&self) -> Result<BoxSubstream, MuxerError>;

    /// Wait for the next inbound substream.
    async fn accept_stream(&self) -> Result<BoxSubstream, MuxerError>;

    /// Close the session: existing streams may drain, no new streams are
    /// opened or accepted.
    async fn close(&self) -> Result<(), MuxerError>;

    /// Whether the session has terminated (locally closed or remote gone).
    fn is_closed(&self) -> bool;
}

/// One bidirectional ordered byte channel within a session. Reads and writes
/// half-close independently; `reset` tears both directions down and is
/// observable by the remote as an error, not as EOF.
pub trait Substream: AsyncRead + AsyncWrite + Send + Unpin {
    /// Abruptly terminate the stream in both directions.
    fn reset(&mut self);
}

pub type BoxSubstream = Box<dyn Substream>;

/// Errors raised by a muxing session.
#[derive(Debug, thiserror::Error)]
pub enum MuxerError {
    /// The session was closed locally.
    #[error("session closed")]
    Closed,
    /// The remote terminated the session.
    #[error("remote terminated session with code {0}")]
    GoAway(u32),
    /// The remote stopped answering keepalives.
    #[error("keepalive timed out")]
    KeepaliveTimeout,
    /// `max_concurrent_streams` was reached.
    #[error("concurrent stream limit exceeded")]
    StreamLimitExceeded,
    /// The remote violated the framing protocol. Fatal to the session.
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// The error surfaced on read/write when a stream has been reset. Stream
/// reads yield this via [`io::ErrorKind::ConnectionReset`]; it is
/// distinguishable from a clean EOF, which is `Ok(0)`.
pub fn stream_reset_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionReset, "stream reset")
}
