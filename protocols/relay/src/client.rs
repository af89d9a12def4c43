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

//! The relay client: a transport dialing `/p2p-circuit` addresses through
//! HOP streams, the STOP handler accepting relayed connections, and the
//! reservation lifecycle for unreachable hosts.

use crate::{
    proto::{self, HopMessageType, Status, StopMessageType},
    voucher::ReservationVoucher,
    RelayError, HOP_PROTOCOL_NAME, STOP_PROTOCOL_NAME,
};
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use peerlink_core::{
    bus::{Event, EventBus},
    io::{self, BoxPipe},
    peerstore::{PERMANENT_ADDR_TTL, TEMP_ADDR_TTL},
    signed_record::SignedEnvelope,
    transport::{BoxListener, Transport, TransportError},
    Multiaddr, PeerId, Protocol, Reachability,
};
use peerlink_swarm::{DialHints, Stream, Swarm};
use std::{
    collections::HashMap,
    sync::Arc,
    time::Duration,
};
use tokio::{sync::watch, time::Instant};

const MAX_CONTROL_MESSAGE: usize = 4096;
const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);

/// Dials `/p2p-circuit` addresses by asking the named relay to connect us.
///
/// The transport holds no state besides the swarm handle: every dial opens
/// a fresh HOP stream, and relayed pipes are never cached. Collapsing
/// concurrent dials is the swarm's job; a cache here would let two callers
/// upgrade the same pipe concurrently.
pub struct CircuitTransport {
    swarm: tokio::sync::OnceCell<Swarm>,
}

impl CircuitTransport {
    pub fn new() -> Arc<CircuitTransport> {
        Arc::new(CircuitTransport {
            swarm: tokio::sync::OnceCell::new(),
        })
    }

    /// Inject the swarm handle after construction; the swarm owns the
    /// transport, so the reference cannot be taken at build time.
    pub fn set_swarm(&self, swarm: Swarm) {
        let _ = self.swarm.set(swarm);
    }

    fn swarm(&self) -> Result<&Swarm, TransportError> {
        self.swarm
            .get()
            .ok_or_else(|| TransportError::Other("circuit transport not wired to a swarm".into()))
    }
}

#[async_trait]
impl Transport for CircuitTransport {
    fn name(&self) -> &'static str {
        "circuit"
    }

    fn can_dial(&self, addr: &Multiaddr) -> bool {
        // Generic `/p2p-circuit` addresses name no relay to go through.
        addr.is_circuit() && addr.relay_peer().is_some()
    }

    async fn dial(&self, addr: &Multiaddr) -> Result<BoxPipe, TransportError> {
        let swarm = self.swarm()?;
        let relay = addr
            .relay_peer()
            .ok_or_else(|| TransportError::UnsupportedAddress(addr.clone()))?;
        let dst = addr
            .circuit_dst_peer()
            .ok_or_else(|| TransportError::UnsupportedAddress(addr.clone()))?;

        // Make the relay's own address known so the swarm can reach it.
        if let Some(relay_addr) = addr.circuit_relay_addr() {
            let (base, _) = relay_addr.split_peer_suffix();
            if !base.is_empty() {
                swarm.peerstore().add_addrs(relay, [base], TEMP_ADDR_TTL);
            }
        }

        let mut hop = swarm
            .new_stream(relay, &[HOP_PROTOCOL_NAME.to_string()], DialHints::default())
            .await
            .map_err(|e| TransportError::Other(format!("reaching relay {relay}: {e}")))?;

        let connect = proto::HopMessage {
            r#type: HopMessageType::Connect as i32,
            peer: Some(proto::Peer {
                id: dst.to_bytes(),
                addrs: Vec::new(),
            }),
            reservation: None,
            limit: None,
            status: Status::Unused as i32,
        };
        io::write_proto(&mut hop, &connect).await?;
        let response = tokio::time::timeout(
            CONTROL_TIMEOUT,
            io::read_proto::<_, proto::HopMessage>(&mut hop, MAX_CONTROL_MESSAGE),
        )
        .await
        .map_err(|_| TransportError::Other("relay did not answer CONNECT".into()))??;

        match Status::from_i32(response.status) {
            Some(Status::Ok) => {}
            Some(status) => {
                return Err(TransportError::Other(format!(
                    "relay refused circuit: {status:?}"
                )))
            }
            None => return Err(TransportError::Other("relay sent unknown status".into())),
        }
        log::debug!("circuit to {dst} via {relay} established");
        // From here on the HOP stream is the raw pipe to the destination;
        // the upgrader runs over it like over any transport's pipe.
        Ok(Box::new(hop))
    }

    async fn listen(&self, addr: &Multiaddr) -> Result<BoxListener, TransportError> {
        // Inbound relayed connections arrive via the STOP handler, driven
        // by reservations rather than by a bound listener.
        Err(TransportError::UnsupportedAddress(addr.clone()))
    }
}

#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Relays to use, each address ending in `/p2p/<relay>`.
    pub static_relays: Vec<Multiaddr>,
    /// How many concurrent reservations to maintain while private.
    pub desired_reservations: usize,
    /// How often the reservation state is re-examined.
    pub tick_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            static_relays: Vec::new(),
            desired_reservations: 1,
            tick_interval: Duration::from_secs(30),
        }
    }
}

struct ReservationState {
    /// When the relay will drop us.
    expire: Instant,
    ttl: Duration,
    /// Addresses peers can dial us at through this relay, ending in
    /// `/p2p-circuit`.
    circuit_addrs: Vec<Multiaddr>,
}

#[derive(Default)]
struct ClientState {
    reservations: HashMap<PeerId, ReservationState>,
    reachability: Reachability,
}

/// Maintains relay reservations while the host is privately reachable and
/// accepts relayed connections over STOP.
pub struct RelayClient {
    swarm: Swarm,
    bus: EventBus,
    config: ClientConfig,
    state: Mutex<ClientState>,
    reachability_rx: watch::Receiver<(Reachability, u8)>,
}

impl RelayClient {
    pub fn new(
        swarm: Swarm,
        bus: EventBus,
        config: ClientConfig,
        reachability_rx: watch::Receiver<(Reachability, u8)>,
    ) -> Arc<RelayClient> {
        Arc::new(RelayClient {
            swarm,
            bus,
            config,
            state: Mutex::new(ClientState::default()),
            reachability_rx,
        })
    }

    /// Register the STOP handler accepting relayed connections.
    pub fn register(self: Arc<Self>) {
        let client = self.clone();
        self.swarm.handlers().set(
            STOP_PROTOCOL_NAME,
            Arc::new(move |stream| {
                let client = client.clone();
                async move { client.handle_stop(stream).await }.boxed()
            }),
        );
    }

    /// Drive the reservation lifecycle.
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move {
            let mut reachability_rx = client.reachability_rx.clone();
            client.state.lock().reachability = reachability_rx.borrow().0;
            let mut ticker = tokio::time::interval(client.config.tick_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    changed = reachability_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        let (reachability, _) = *reachability_rx.borrow();
                        client.state.lock().reachability = reachability;
                        client.tick().await;
                    }
                    _ = ticker.tick() => client.tick().await,
                }
            }
        })
    }

    /// The circuit addresses peers can currently dial us at, each ending
    /// in `/p2p-circuit/p2p/<self>`.
    pub fn circuit_addrs(&self) -> Vec<Multiaddr> {
        let local = self.swarm.local_peer();
        self.state
            .lock()
            .reservations
            .values()
            .flat_map(|r| r.circuit_addrs.iter().cloned())
            .map(|a| a.with_peer(local))
            .collect()
    }

    /// One pass over the reservation state: drop expired entries, renew
    /// those nearing expiry, and acquire new ones while private.
    async fn tick(&self) {
        let reachability = self.state.lock().reachability;
        if reachability != Reachability::Private {
            // Reachable directly: let reservations lapse naturally and
            // stop advertising circuit addresses.
            let had = {
                let mut state = self.state.lock();
                let had = !state.reservations.is_empty();
                state.reservations.clear();
                had
            };
            if had {
                self.announce_addrs_changed();
            }
            return;
        }

        let now = Instant::now();
        let mut renew = Vec::new();
        {
            let mut state = self.state.lock();
            state.reservations.retain(|relay, r| {
                if r.expire <= now {
                    log::warn!("reservation on {relay} lapsed");
                    false
                } else {
                    true
                }
            });
            for (relay, r) in state.reservations.iter() {
                // Refresh before expire - ttl/3.
                if r.expire - now < r.ttl / 3 {
                    renew.push(*relay);
                }
            }
        }
        for relay in renew {
            match self.reserve(relay).await {
                Ok(()) => self.bus.publish(Event::RelayReservationAcquired {
                    relay,
                    renewed: true,
                }),
                Err(e) => {
                    log::warn!("renewing reservation on {relay} failed: {e}");
                    self.bus.publish(Event::RelayReservationFailed { relay });
                }
            }
        }

        let missing = {
            let state = self.state.lock();
            self.config
                .desired_reservations
                .saturating_sub(state.reservations.len())
        };
        if missing == 0 {
            return;
        }
        for relay in self.candidate_relays() {
            let missing = {
                let state = self.state.lock();
                self.config
                    .desired_reservations
                    .saturating_sub(state.reservations.len())
            };
            if missing == 0 {
                break;
            }
            if self.state.lock().reservations.contains_key(&relay) {
                continue;
            }
            match self.reserve(relay).await {
                Ok(()) => {
                    self.bus.publish(Event::RelayReservationAcquired {
                        relay,
                        renewed: false,
                    });
                    self.announce_addrs_changed();
                }
                Err(e) => {
                    log::debug!("reservation on {relay} failed: {e}");
                    self.bus.publish(Event::RelayReservationFailed { relay });
                }
            }
        }
    }

    /// Static relays first, then peers known to speak HOP.
    fn candidate_relays(&self) -> Vec<PeerId> {
        let mut relays = Vec::new();
        for addr in &self.config.static_relays {
            let (base, peer) = addr.split_peer_suffix();
            if let Some(peer) = peer {
                self.swarm
                    .peerstore()
                    .add_addrs(peer, [base], PERMANENT_ADDR_TTL);
                if !relays.contains(&peer) {
                    relays.push(peer);
                }
            }
        }
        let hop = [HOP_PROTOCOL_NAME.to_string()];
        for peer in self.swarm.peerstore().peers_with_addrs() {
            if peer == self.swarm.local_peer() || relays.contains(&peer) {
                continue;
            }
            if self
                .swarm
                .peerstore()
                .first_supported(&peer, &hop)
                .is_some()
            {
                relays.push(peer);
            }
        }
        relays
    }

    /// Obtain or refresh a reservation on `relay`.
    async fn reserve(&self, relay: PeerId) -> Result<(), RelayError> {
        let mut hop = self
            .swarm
            .new_stream(relay, &[HOP_PROTOCOL_NAME.to_string()], DialHints::default())
            .await?;
        let request = proto::HopMessage {
            r#type: HopMessageType::Reserve as i32,
            peer: None,
            reservation: None,
            limit: None,
            status: Status::Unused as i32,
        };
        io::write_proto(&mut hop, &request).await?;
        let response = tokio::time::timeout(
            CONTROL_TIMEOUT,
            io::read_proto::<_, proto::HopMessage>(&mut hop, MAX_CONTROL_MESSAGE),
        )
        .await
        .map_err(|_| RelayError::Timeout)??;

        match Status::from_i32(response.status) {
            Some(Status::Ok) => {}
            Some(status) => return Err(RelayError::Refused(status)),
            None => return Err(RelayError::Malformed),
        }
        let reservation = response.reservation.ok_or(RelayError::Malformed)?;

        // The voucher is advisory for the client, but a bad one indicates
        // a broken or dishonest relay.
        if !reservation.voucher.is_empty() {
            match SignedEnvelope::decode(&reservation.voucher)
                .ok()
                .and_then(|envelope| ReservationVoucher::from_signed_envelope(&envelope).ok())
            {
                Some(voucher) if voucher.relay == relay => {}
                _ => log::warn!("relay {relay} issued an unverifiable voucher"),
            }
        }

        let now_unix = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let ttl = Duration::from_secs(reservation.expire.saturating_sub(now_unix).max(1));

        let mut circuit_addrs: Vec<Multiaddr> = reservation
            .addrs
            .iter()
            .filter_map(|bytes| Multiaddr::from_bytes(bytes).ok())
            .map(|a| a.with_peer(relay).with(Protocol::P2pCircuit))
            .collect();
        if circuit_addrs.is_empty() {
            // Fall back to the relay addresses we know ourselves.
            circuit_addrs = self
                .swarm
                .peerstore()
                .addrs(&relay)
                .into_iter()
                .filter(|a| !a.is_circuit())
                .map(|a| a.with_peer(relay).with(Protocol::P2pCircuit))
                .collect();
        }

        log::debug!("reserved slot on {relay}, ttl {ttl:?}");
        self.state.lock().reservations.insert(
            relay,
            ReservationState {
                expire: Instant::now() + ttl,
                ttl,
                circuit_addrs,
            },
        );
        Ok(())
    }

    fn announce_addrs_changed(&self) {
        let mut addrs = self.swarm.listen_addrs();
        addrs.extend(self.circuit_addrs());
        self.bus.publish(Event::ListenAddrsChanged { addrs });
    }

    /// Accept a relayed connection: answer the STOP exchange and hand the
    /// stream to the swarm as an inbound pipe.
    async fn handle_stop(&self, mut stream: Stream) {
        let relay = stream.peer();
        let msg = match tokio::time::timeout(
            CONTROL_TIMEOUT,
            io::read_proto::<_, proto::StopMessage>(&mut stream, MAX_CONTROL_MESSAGE),
        )
        .await
        {
            Ok(Ok(msg)) => msg,
            _ => {
                stream.reset();
                return;
            }
        };
        if StopMessageType::from_i32(msg.r#type) != Some(StopMessageType::Connect) {
            let _ = write_stop_status(&mut stream, Status::UnexpectedMessage).await;
            return;
        }
        let src = match msg.peer.as_ref().and_then(|p| PeerId::from_bytes(&p.id).ok()) {
            Some(src) => src,
            None => {
                let _ = write_stop_status(&mut stream, Status::MalformedMessage).await;
                return;
            }
        };
        if write_stop_status(&mut stream, Status::Ok).await.is_err() {
            return;
        }

        log::debug!("accepting relayed connection from {src} via {relay}");
        let remote_addr = Multiaddr::from(Protocol::P2p(relay))
            .with(Protocol::P2pCircuit)
            .with(Protocol::P2p(src));
        let local_addr = self
            .circuit_addrs()
            .into_iter()
            .find(|a| a.relay_peer() == Some(relay));
        self.swarm
            .add_incoming(Box::new(stream), "circuit", local_addr, remote_addr);
    }
}

async fn write_stop_status(stream: &mut Stream, status: Status) -> std::io::Result<()> {
    let msg = proto::StopMessage {
        r#type: StopMessageType::Status as i32,
        peer: None,
        limit: None,
        status: status as i32,
    };
    io::write_proto(stream, &msg).await
}
