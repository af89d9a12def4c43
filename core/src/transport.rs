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

//! The transport abstraction: anything that can produce ordered reliable
//! byte pipes for a class of multiaddrs.
//!
//! Transports are stateless. They neither cache nor reuse pipes; connection
//! reuse is the swarm's business alone, since a transport-level cache would
//! let two callers race the upgrade of one pipe.

use crate::{io::BoxPipe, Multiaddr};
use async_trait::async_trait;
use std::io;

/// A dialer/listener for a class of multiaddrs.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Short label recorded in connection metadata, e.g. `"tcp"`.
    fn name(&self) -> &'static str;

    /// Whether this transport knows how to dial `addr`.
    fn can_dial(&self, addr: &Multiaddr) -> bool;

    /// Dial `addr`, producing a fresh byte pipe.
    async fn dial(&self, addr: &Multiaddr) -> Result<BoxPipe, TransportError>;

    /// Bind to `addr` and accept inbound pipes.
    async fn listen(&self, addr: &Multiaddr) -> Result<BoxListener, TransportError>;
}

/// An accept loop bound to one address.
#[async_trait]
pub trait Listener: Send {
    /// The concrete bound address (e.g. with the ephemeral port filled in).
    fn local_addr(&self) -> Multiaddr;

    /// Wait for the next inbound pipe and its remote address.
    async fn accept(&mut self) -> Result<(BoxPipe, Multiaddr), TransportError>;
}

pub type BoxListener = Box<dyn Listener>;

/// Errors raised by transports.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The transport does not handle the given address.
    #[error("address {0} not supported by this transport")]
    UnsupportedAddress(Multiaddr),
    #[error(transparent)]
    Io(#[from] io::Error),
    /// Dialing failed for a transport-specific reason.
    #[error("{0}")]
    Other(String),
}
