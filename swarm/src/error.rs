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

use peerlink_core::{muxing::MuxerError, rcmgr::ResourceLimitExceeded, Multiaddr, PeerId};
use peerlink_multistream_select::NegotiationError;

/// Failure of one dial attempt, stringified so the aggregate error stays
/// cheap to clone into every deduplicated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptError {
    pub addr: Multiaddr,
    pub error: String,
}

/// Why a dial produced no connection.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DialError {
    #[error("refusing to dial own peer id")]
    SelfDial,
    #[error("no dialable addresses for {0}")]
    NoAddresses(PeerId),
    #[error("dial to {0} vetoed by the connection gater")]
    Gated(PeerId),
    #[error("dial to {peer} failed on all {} addresses", attempts.len())]
    AllAttemptsFailed {
        peer: PeerId,
        attempts: Vec<AttemptError>,
    },
    #[error("dial to {peer} timed out")]
    Timeout {
        peer: PeerId,
        attempts: Vec<AttemptError>,
    },
    #[error(transparent)]
    ResourceLimit(#[from] ResourceLimitExceeded),
    #[error("swarm is closed")]
    Closed,
}

/// Errors of swarm operations other than dialing.
#[derive(Debug, thiserror::Error)]
pub enum SwarmError {
    #[error(transparent)]
    Dial(#[from] DialError),
    /// `no_dial` was set and no usable connection exists.
    #[error("no connection to {0} and dialing was not permitted")]
    NoConnection(PeerId),
    /// Only a limited (relayed) connection exists and the caller did not
    /// opt in to using it.
    #[error("connection to {0} is limited and the caller did not allow limited connections")]
    Limited(PeerId),
    #[error(transparent)]
    Muxer(#[from] MuxerError),
    #[error("protocol negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),
    #[error("stream negotiation timed out")]
    NegotiationTimeout,
    #[error(transparent)]
    ResourceLimit(#[from] ResourceLimitExceeded),
    #[error("no transport can listen on {0}")]
    ListenUnsupported(Multiaddr),
    #[error(transparent)]
    Transport(#[from] peerlink_core::transport::TransportError),
    #[error("swarm is closed")]
    Closed,
}
