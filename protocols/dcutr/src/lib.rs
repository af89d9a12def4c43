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

//! Direct connection upgrade through relay (hole punching).
//!
//! When a relayed connection arrives inbound, the accepting side (the one
//! behind the NAT) coordinates a simultaneous dial with the remote over
//! the relayed connection: it measures the RTT with a CONNECT exchange,
//! sends SYNC, and both sides dial directly half an RTT apart so their
//! packets cross the NATs at the same time.

mod proto;

use futures::FutureExt;
use peerlink_core::{
    bus::{Event, EventBus},
    io,
    peerstore::TEMP_ADDR_TTL,
    Multiaddr, PeerId,
};
use peerlink_swarm::{Connection, DialHints, Direction, Notifiee, Stream, Swarm};
use std::{sync::Arc, time::Duration};
use tokio::time::Instant;

pub const PROTOCOL_NAME: &str = "/libp2p/dcutr";

const MAX_MESSAGE_SIZE: usize = 4096;
const STREAM_TIMEOUT: Duration = Duration::from_secs(30);
const DIRECT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct Config {
    /// Hole-punch attempts per relayed connection.
    pub max_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config { max_retries: 3 }
    }
}

/// A source of our own dialable address candidates.
pub type AddrsSource = Arc<dyn Fn() -> Vec<Multiaddr> + Send + Sync>;

/// Drop relay addresses from a candidate set; when public addresses exist,
/// offer only those.
fn filter_candidates(addrs: Vec<Multiaddr>) -> Vec<Multiaddr> {
    let direct: Vec<Multiaddr> = addrs.into_iter().filter(|a| !a.is_circuit()).collect();
    let public: Vec<Multiaddr> = direct.iter().filter(|a| a.is_public()).cloned().collect();
    if public.is_empty() {
        direct
    } else {
        public
    }
}

/// The hole-punch service.
#[derive(Clone)]
pub struct HolePuncher {
    swarm: Swarm,
    bus: EventBus,
    config: Config,
    addrs: AddrsSource,
}

impl HolePuncher {
    pub fn new(swarm: Swarm, bus: EventBus, config: Config, addrs: AddrsSource) -> Arc<HolePuncher> {
        Arc::new(HolePuncher {
            swarm,
            bus,
            config,
            addrs,
        })
    }

    /// Register the stream handler (responder role) and the connection
    /// observer that triggers hole punching (initiator role).
    pub fn register(self: Arc<Self>) {
        let puncher = self.clone();
        self.swarm.handlers().set(
            PROTOCOL_NAME,
            Arc::new(move |stream| {
                let puncher = puncher.clone();
                async move { puncher.respond(stream).await }.boxed()
            }),
        );
        self.swarm.register_notifiee(self.clone());
    }

    fn own_candidates(&self) -> Vec<Multiaddr> {
        filter_candidates((self.addrs)())
    }

    /// Initiator: runs on the NATed side after a relayed connection came
    /// in, coordinating the simultaneous dial.
    async fn initiate(self: Arc<Self>, peer: PeerId) {
        for attempt in 1..=self.config.max_retries {
            match self.attempt(peer, attempt).await {
                Ok(()) => {
                    log::debug!("hole punch to {peer} succeeded on attempt {attempt}");
                    self.bus.publish(Event::HolePunchAttempt {
                        peer,
                        attempt,
                        succeeded: true,
                    });
                    return;
                }
                Err(e) => {
                    log::debug!("hole punch to {peer} attempt {attempt} failed: {e}");
                    self.bus.publish(Event::HolePunchAttempt {
                        peer,
                        attempt,
                        succeeded: false,
                    });
                }
            }
        }
    }

    async fn attempt(&self, peer: PeerId, attempt: u32) -> Result<(), HolePunchError> {
        let mut stream = self
            .swarm
            .new_stream(
                peer,
                &[PROTOCOL_NAME.to_string()],
                DialHints::default().allow_limited().no_dial(),
            )
            .await?;

        let connect = proto::HolePunch {
            r#type: proto::Type::Connect as i32,
            obs_addrs: self
                .own_candidates()
                .iter()
                .map(|a| a.to_bytes())
                .collect(),
        };
        let started = Instant::now();
        io::write_proto(&mut stream, &connect).await?;

        let response = tokio::time::timeout(
            STREAM_TIMEOUT,
            io::read_proto::<_, proto::HolePunch>(&mut stream, MAX_MESSAGE_SIZE),
        )
        .await
        .map_err(|_| HolePunchError::Timeout)??;
        if proto::Type::from_i32(response.r#type) != Some(proto::Type::Connect) {
            return Err(HolePunchError::UnexpectedMessage);
        }
        let rtt = started.elapsed();

        let remote_addrs = filter_candidates(
            response
                .obs_addrs
                .iter()
                .filter_map(|bytes| Multiaddr::from_bytes(bytes).ok())
                .collect(),
        );
        if remote_addrs.is_empty() {
            return Err(HolePunchError::NoAddresses);
        }
        self.swarm
            .peerstore()
            .add_addrs(peer, remote_addrs, TEMP_ADDR_TTL);

        let sync = proto::HolePunch {
            r#type: proto::Type::Sync as i32,
            obs_addrs: Vec::new(),
        };
        io::write_proto(&mut stream, &sync).await?;

        // The SYNC needs half a round trip to arrive; dialing then makes
        // both dials cross the NATs at the same moment.
        tokio::time::sleep(rtt / 2).await;
        log::debug!("hole punch attempt {attempt} to {peer}: dialing after rtt/2 = {:?}", rtt / 2);

        let conn = self
            .swarm
            .dial_with(
                peer,
                DialHints::default()
                    .force_direct()
                    .force_new()
                    .simultaneous_connect()
                    .with_timeout(DIRECT_DIAL_TIMEOUT),
            )
            .await?;
        if conn.is_limited() {
            return Err(HolePunchError::StillRelayed);
        }
        Ok(())
    }

    /// Responder: answers a CONNECT/SYNC exchange on a relayed connection
    /// and dials back the moment SYNC arrives.
    async fn respond(&self, mut stream: Stream) {
        let peer = stream.peer();
        // Hole punching is only meaningful over a relayed connection.
        match stream.connection() {
            Some(conn) if conn.remote_addr().is_circuit() => {}
            _ => {
                stream.reset();
                return;
            }
        }
        if let Err(e) = self.respond_inner(peer, &mut stream).await {
            log::debug!("hole punch with {peer} (responder) failed: {e}");
        }
    }

    async fn respond_inner(
        &self,
        peer: PeerId,
        stream: &mut Stream,
    ) -> Result<(), HolePunchError> {
        let connect = tokio::time::timeout(
            STREAM_TIMEOUT,
            io::read_proto::<_, proto::HolePunch>(stream, MAX_MESSAGE_SIZE),
        )
        .await
        .map_err(|_| HolePunchError::Timeout)??;
        if proto::Type::from_i32(connect.r#type) != Some(proto::Type::Connect) {
            return Err(HolePunchError::UnexpectedMessage);
        }
        let remote_addrs = filter_candidates(
            connect
                .obs_addrs
                .iter()
                .filter_map(|bytes| Multiaddr::from_bytes(bytes).ok())
                .collect(),
        );
        if remote_addrs.is_empty() {
            return Err(HolePunchError::NoAddresses);
        }
        self.swarm
            .peerstore()
            .add_addrs(peer, remote_addrs, TEMP_ADDR_TTL);

        let response = proto::HolePunch {
            r#type: proto::Type::Connect as i32,
            obs_addrs: self
                .own_candidates()
                .iter()
                .map(|a| a.to_bytes())
                .collect(),
        };
        io::write_proto(stream, &response).await?;

        let sync = tokio::time::timeout(
            STREAM_TIMEOUT,
            io::read_proto::<_, proto::HolePunch>(stream, MAX_MESSAGE_SIZE),
        )
        .await
        .map_err(|_| HolePunchError::Timeout)??;
        if proto::Type::from_i32(sync.r#type) != Some(proto::Type::Sync) {
            return Err(HolePunchError::UnexpectedMessage);
        }

        // SYNC means the remote dials in half an RTT; we dial now.
        let conn = self
            .swarm
            .dial_with(
                peer,
                DialHints::default()
                    .force_direct()
                    .force_new()
                    .simultaneous_connect()
                    .with_timeout(DIRECT_DIAL_TIMEOUT),
            )
            .await?;
        if conn.is_limited() {
            return Err(HolePunchError::StillRelayed);
        }
        Ok(())
    }
}

impl Notifiee for HolePuncher {
    fn connected(&self, conn: &Connection) {
        // An inbound connection over a relay means we are the unreachable
        // side; try to upgrade it to a direct one.
        if conn.direction() == Direction::Inbound && conn.remote_addr().is_circuit() {
            let peer = conn.remote_peer();
            log::debug!("relayed connection from {peer}, initiating hole punch");
            let puncher = Arc::new(self.clone());
            tokio::spawn(puncher.initiate(peer));
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HolePunchError {
    #[error(transparent)]
    Swarm(#[from] peerlink_swarm::SwarmError),
    #[error(transparent)]
    Dial(#[from] peerlink_swarm::DialError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("remote sent an unexpected message")]
    UnexpectedMessage,
    #[error("no dialable addresses were exchanged")]
    NoAddresses,
    #[error("remote did not answer in time")]
    Timeout,
    #[error("direct dial produced another relayed connection")]
    StillRelayed,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ma(s: &str) -> Multiaddr {
        s.parse().unwrap()
    }

    #[test]
    fn filter_drops_relay_addrs() {
        let relay = PeerId::random();
        let filtered = filter_candidates(vec![
            ma(&format!("/ip4/9.9.9.9/tcp/1/p2p/{relay}/p2p-circuit")),
            ma("/ip4/192.168.1.10/tcp/1"),
        ]);
        assert_eq!(filtered, vec![ma("/ip4/192.168.1.10/tcp/1")]);
    }

    #[test]
    fn filter_prefers_public() {
        let filtered = filter_candidates(vec![
            ma("/ip4/192.168.1.10/tcp/1"),
            ma("/ip4/203.0.114.7/tcp/1"),
        ]);
        assert_eq!(filtered, vec![ma("/ip4/203.0.114.7/tcp/1")]);
    }

    #[test]
    fn filter_keeps_private_when_nothing_public() {
        let filtered = filter_candidates(vec![ma("/ip4/192.168.1.10/tcp/1")]);
        assert_eq!(filtered, vec![ma("/ip4/192.168.1.10/tcp/1")]);
    }
}
