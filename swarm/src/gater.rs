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

//! The connection gater: a veto hook at each stage of connection
//! establishment. Every method defaults to allowing the operation.

use crate::Direction;
use peerlink_core::{Multiaddr, PeerId};

pub trait ConnGater: Send + Sync {
    /// Called before any addresses are resolved for an outbound dial.
    fn intercept_peer_dial(&self, _peer: &PeerId) -> bool {
        true
    }

    /// Called for each candidate address of an outbound dial.
    fn intercept_addr_dial(&self, _peer: &PeerId, _addr: &Multiaddr) -> bool {
        true
    }

    /// Called when a listener accepts a raw pipe, before any upgrade.
    fn intercept_accept(&self, _remote_addr: &Multiaddr) -> bool {
        true
    }

    /// Called once the security handshake has authenticated the remote.
    fn intercept_secured(&self, _direction: Direction, _peer: &PeerId) -> bool {
        true
    }
}

/// The gater used when none is configured.
pub(crate) struct AllowAll;

impl ConnGater for AllowAll {}
