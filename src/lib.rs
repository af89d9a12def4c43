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

//! Peerlink is a modular peer-to-peer networking stack: authenticated,
//! encrypted, multiplexed connections between peers identified by
//! self-certifying ids, with relay-assisted NAT traversal.
//!
//! The [`Host`] ties the member crates together; most applications only
//! need [`Host`], [`Config`] and the address/peer-id types re-exported
//! here.

pub use peerlink_autonat as autonat;
pub use peerlink_core as core;
pub use peerlink_dcutr as dcutr;
pub use peerlink_identify as identify;
pub use peerlink_identity as identity;
pub use peerlink_noise as noise;
pub use peerlink_ping as ping;
pub use peerlink_relay as relay;
pub use peerlink_swarm as swarm;
pub use peerlink_tcp as tcp;
pub use peerlink_yamux as yamux;

mod host;

pub use host::{AddrsFactory, Config, Host, HostError};
pub use peerlink_core::{
    bus::{Event, EventBus},
    AddrInfo, Multiaddr, Protocol, Reachability,
};
pub use peerlink_identity::{Keypair, PeerId, PublicKey};
pub use peerlink_swarm::{Connection, DialHints, Direction, Stream, StreamHandler, Swarm};
