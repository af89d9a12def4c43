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

//! The process-wide event bus services publish on and subscribe to.

use crate::{Multiaddr, Reachability};
use peerlink_identity::PeerId;
use std::time::Duration;
use tokio::sync::broadcast;

const BUS_CAPACITY: usize = 256;

/// Events published by the host and its services. Slow subscribers lag and
/// miss events rather than applying backpressure to publishers.
#[derive(Clone, Debug)]
pub enum Event {
    /// The set of advertised listen addresses changed.
    ListenAddrsChanged { addrs: Vec<Multiaddr> },
    /// The host's view of its own reachability changed.
    ReachabilityChanged {
        reachability: Reachability,
        confidence: u8,
    },
    /// A connection to a new peer was established.
    PeerConnected { peer: PeerId },
    /// The last connection to a peer closed.
    PeerDisconnected { peer: PeerId },
    /// The identify exchange with a peer completed.
    PeerIdentified {
        peer: PeerId,
        protocols: Vec<String>,
        listen_addrs: Vec<Multiaddr>,
        observed_addr: Option<Multiaddr>,
        agent_version: String,
    },
    /// A ping round-trip completed.
    PingResult { peer: PeerId, rtt: Duration },
    /// A relay reservation was acquired or refreshed.
    RelayReservationAcquired {
        relay: PeerId,
        renewed: bool,
    },
    /// A relay reservation could not be acquired or renewed.
    RelayReservationFailed { relay: PeerId },
    /// A hole-punch attempt finished.
    HolePunchAttempt {
        peer: PeerId,
        attempt: u32,
        succeeded: bool,
    },
}

/// A broadcast bus carrying [`Event`]s. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new()
    }
}

impl EventBus {
    pub fn new() -> EventBus {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        EventBus { tx }
    }

    /// Publish an event. Dropped silently when nobody listens.
    pub fn publish(&self, event: Event) {
        log::trace!("bus: {event:?}");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_reach_all_subscribers() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        let peer = PeerId::random();
        bus.publish(Event::PeerConnected { peer });
        for rx in [&mut a, &mut b] {
            match rx.recv().await.unwrap() {
                Event::PeerConnected { peer: p } => assert_eq!(p, peer),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        EventBus::new().publish(Event::PeerDisconnected {
            peer: PeerId::random(),
        });
    }
}
