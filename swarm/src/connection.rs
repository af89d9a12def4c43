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

//! Connections and the streams opened on them.

use crate::{Direction, SwarmError};
use peerlink_core::{
    muxing::{BoxSubstream, StreamMuxer},
    rcmgr::{ConnectionScope, StreamScope},
    upgrader::ConnectionInfo,
    Multiaddr, PeerId,
};
use peerlink_multistream_select as multistream;
use std::{
    io,
    pin::Pin,
    sync::{Arc, Weak},
    task::{Context, Poll},
    time::{Duration, Instant},
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

pub(crate) struct ConnectionInner {
    pub id: u64,
    pub local_peer: PeerId,
    pub remote_peer: PeerId,
    /// The listen address an inbound connection arrived on.
    pub local_addr: Option<Multiaddr>,
    pub remote_addr: Multiaddr,
    pub direction: Direction,
    pub info: ConnectionInfo,
    pub muxer: Arc<dyn StreamMuxer>,
    pub scope: ConnectionScope,
    /// Relayed connections are limited in time and volume; callers must opt
    /// in to using them.
    pub limited: bool,
    pub opened_at: Instant,
}

/// A live connection to a peer. Cheap to clone; the swarm owns the
/// authoritative set.
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<ConnectionInner>,
}

impl Connection {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn local_peer(&self) -> PeerId {
        self.inner.local_peer
    }

    pub fn remote_peer(&self) -> PeerId {
        self.inner.remote_peer
    }

    pub fn remote_addr(&self) -> &Multiaddr {
        &self.inner.remote_addr
    }

    pub fn local_addr(&self) -> Option<&Multiaddr> {
        self.inner.local_addr.as_ref()
    }

    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    /// How the connection was built: transport, security and muxer.
    pub fn info(&self) -> &ConnectionInfo {
        &self.inner.info
    }

    pub fn is_limited(&self) -> bool {
        self.inner.limited
    }

    pub fn is_closed(&self) -> bool {
        self.inner.muxer.is_closed()
    }

    pub fn opened_at(&self) -> Instant {
        self.inner.opened_at
    }

    pub(crate) fn muxer(&self) -> &Arc<dyn StreamMuxer> {
        &self.inner.muxer
    }

    /// Close the muxing session. Existing streams drain; no new streams.
    pub async fn close(&self) {
        let _ = self.inner.muxer.close().await;
    }

    /// Open a stream and negotiate the first protocol of `protocols` the
    /// remote accepts.
    pub async fn new_stream(
        &self,
        protocols: &[String],
        negotiation_timeout: Duration,
    ) -> Result<Stream, SwarmError> {
        let scope = self.inner.scope.open_stream()?;
        let mut substream = self.inner.muxer.open_stream().await?;
        let protocol = match tokio::time::timeout(
            negotiation_timeout,
            multistream::dialer_select(&mut substream, protocols, multistream::Version::V1),
        )
        .await
        {
            Ok(Ok(protocol)) => protocol,
            Ok(Err(e)) => {
                substream.reset();
                return Err(e.into());
            }
            Err(_) => {
                substream.reset();
                return Err(SwarmError::NegotiationTimeout);
            }
        };
        Ok(Stream::new(
            substream,
            protocol,
            self.inner.remote_peer,
            Arc::downgrade(&self.inner),
            scope,
        ))
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("remote_peer", &self.inner.remote_peer)
            .field("remote_addr", &self.inner.remote_addr)
            .field("direction", &self.inner.direction)
            .finish()
    }
}

/// A protocol-bound bidirectional stream. Holds only a weak reference to
/// its connection; the swarm remains the sole owner of connections.
pub struct Stream {
    io: BoxSubstream,
    protocol: String,
    peer: PeerId,
    conn: Weak<ConnectionInner>,
    _scope: StreamScope,
}

impl Stream {
    pub(crate) fn new(
        io: BoxSubstream,
        protocol: String,
        peer: PeerId,
        conn: Weak<ConnectionInner>,
        scope: StreamScope,
    ) -> Stream {
        Stream {
            io,
            protocol,
            peer,
            conn,
            _scope: scope,
        }
    }

    /// The negotiated protocol id.
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// The connection this stream runs on, if it still exists.
    pub fn connection(&self) -> Option<Connection> {
        self.conn.upgrade().map(|inner| Connection { inner })
    }

    /// Abruptly terminate the stream; the remote observes an error, not EOF.
    pub fn reset(&mut self) {
        self.io.reset();
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("protocol", &self.protocol)
            .field("peer", &self.peer)
            .finish()
    }
}
