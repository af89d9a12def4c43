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

//! Circuit relay v2: lets an unreachable peer be dialed through a third
//! party. The server side answers HOP (reserve, connect); the client side
//! dials through relays, answers STOP, and keeps reservations alive while
//! the host is private.

mod client;
mod proto;
mod server;
mod voucher;

pub use client::{CircuitTransport, ClientConfig, RelayClient};
pub use proto::Status;
pub use server::{RelayServer, ServerConfig};
pub use voucher::{ReservationVoucher, VoucherError};

use peerlink_core::Multiaddr;
use std::sync::Arc;

pub const HOP_PROTOCOL_NAME: &str = "/libp2p/circuit/relay/0.2.0/hop";
pub const STOP_PROTOCOL_NAME: &str = "/libp2p/circuit/relay/0.2.0/stop";

/// A source of the addresses the relay advertises in reservations.
pub type AddrsSource = Arc<dyn Fn() -> Vec<Multiaddr> + Send + Sync>;

/// Errors of the relay client.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Swarm(#[from] peerlink_swarm::SwarmError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("relay answered with status {0:?}")]
    Refused(Status),
    #[error("relay sent a malformed response")]
    Malformed,
    #[error("relay did not answer in time")]
    Timeout,
}
