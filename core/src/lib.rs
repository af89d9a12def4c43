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

//! Core traits and structs of the peerlink stack: addresses, transports,
//! stream muxing, the connection upgrader, the peer store, signed records,
//! the event bus and resource accounting.

pub mod bus;
pub mod io;
pub mod multiaddr;
pub mod muxing;
pub mod peerstore;
pub mod rcmgr;
pub mod signed_record;
pub mod transport;
pub mod upgrader;

pub use multiaddr::{AddressClass, Multiaddr, Protocol};
pub use peerlink_identity::{Keypair, PeerId, PublicKey};

/// Whether this node believes it can be dialed from the open internet.
///
/// Process-wide state, owned by the host and published on the event bus
/// whenever it changes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Reachability {
    #[default]
    Unknown,
    Public,
    Private,
}

/// A peer id together with known addresses, the unit taken by `connect`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddrInfo {
    pub peer: PeerId,
    pub addrs: Vec<Multiaddr>,
}

impl AddrInfo {
    pub fn new(peer: PeerId) -> AddrInfo {
        AddrInfo {
            peer,
            addrs: Vec::new(),
        }
    }

    /// Parse from a multiaddr that ends in `/p2p/<peer>`.
    pub fn try_from_addr(addr: &Multiaddr) -> Option<AddrInfo> {
        let (base, peer) = addr.split_peer_suffix();
        Some(AddrInfo {
            peer: peer?,
            addrs: vec![base],
        })
    }
}
