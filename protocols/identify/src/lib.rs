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

//! The identify protocol: exchange peer metadata (listen addresses,
//! supported protocols, agent) on every new connection, and push updates
//! when our own address set changes.
//!
//! Identify populates the peer store; nothing gates application traffic on
//! it. Callers that need the remote's protocol list first should await
//! [`Identify::wait_identified`] explicitly.

mod proto;

use futures::FutureExt;
use peerlink_core::{
    bus::{Event, EventBus},
    io,
    peerstore::RECENT_ADDR_TTL,
    signed_record::{PeerRecord, SignedEnvelope},
    Keypair, Multiaddr, PeerId,
};
use peerlink_swarm::{DialHints, Stream, Swarm, SwarmError};
use std::{sync::Arc, time::Duration};
use tokio::io::AsyncWriteExt;

pub const PROTOCOL_NAME: &str = "/ipfs/id/1.0.0";
pub const PUSH_PROTOCOL_NAME: &str = "/ipfs/id/push/1.0.0";

const MAX_MESSAGE_SIZE: usize = 8 * 1024;

/// A source of the addresses we currently advertise.
pub type AddrsSource = Arc<dyn Fn() -> Vec<Multiaddr> + Send + Sync>;

#[derive(Clone)]
pub struct Config {
    pub protocol_version: String,
    pub agent_version: String,
    /// Deadline for one identify exchange.
    pub timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            protocol_version: "peerlink/1.0.0".to_owned(),
            agent_version: concat!("peerlink/", env!("CARGO_PKG_VERSION")).to_owned(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// The identify service.
pub struct Identify {
    swarm: Swarm,
    keypair: Keypair,
    config: Config,
    addrs: AddrsSource,
    bus: EventBus,
}

impl Identify {
    pub fn new(
        swarm: Swarm,
        keypair: Keypair,
        config: Config,
        addrs: AddrsSource,
        bus: EventBus,
    ) -> Arc<Identify> {
        Arc::new(Identify {
            swarm,
            keypair,
            config,
            addrs,
            bus,
        })
    }

    /// Register the identify and identify-push handlers.
    pub fn register(self: Arc<Self>) {
        let identify = self.clone();
        self.swarm.handlers().set(
            PROTOCOL_NAME,
            Arc::new(move |stream| {
                let identify = identify.clone();
                async move { identify.serve(stream).await }.boxed()
            }),
        );
        let identify = self.clone();
        self.swarm.handlers().set(
            PUSH_PROTOCOL_NAME,
            Arc::new(move |stream| {
                let identify = identify.clone();
                async move { identify.absorb_push(stream).await }.boxed()
            }),
        );
    }

    /// Start identifying newly connected peers and pushing our own changes.
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let identify = self.clone();
        let mut events = self.bus.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                match event {
                    Event::PeerConnected { peer } => {
                        let identify = identify.clone();
                        tokio::spawn(async move {
                            if let Err(e) = identify.identify_peer(peer).await {
                                log::debug!("identify of {peer} failed: {e}");
                            }
                        });
                    }
                    Event::ListenAddrsChanged { .. } => {
                        let identify = identify.clone();
                        tokio::spawn(async move { identify.push_all().await });
                    }
                    _ => {}
                }
            }
        })
    }

    /// Run the identify exchange with `peer` and record the result.
    pub async fn identify_peer(&self, peer: PeerId) -> Result<(), IdentifyError> {
        let mut stream = self
            .swarm
            .new_stream(
                peer,
                &[PROTOCOL_NAME.to_string()],
                DialHints::default().allow_limited().no_dial(),
            )
            .await?;
        let message = tokio::time::timeout(
            self.config.timeout,
            io::read_proto::<_, proto::Identify>(&mut stream, MAX_MESSAGE_SIZE),
        )
        .await
        .map_err(|_| IdentifyError::Timeout)??;
        self.absorb(peer, message);
        Ok(())
    }

    /// Wait until `peer` has been identified, i.e. its protocol list is
    /// known. Resolves immediately when it already is.
    pub async fn wait_identified(&self, peer: PeerId) {
        let mut events = self.bus.subscribe();
        if !self.swarm.peerstore().protocols(&peer).is_empty() {
            return;
        }
        while let Ok(event) = events.recv().await {
            if matches!(event, Event::PeerIdentified { peer: p, .. } if p == peer) {
                return;
            }
        }
    }

    /// Answer an inbound identify request with our own description.
    async fn serve(&self, mut stream: Stream) {
        let observed = stream
            .connection()
            .map(|conn| conn.remote_addr().clone());
        let message = self.own_message(observed);
        let _ = io::write_proto(&mut stream, &message).await;
        let _ = stream.shutdown().await;
    }

    /// Process an identify-push from the remote.
    async fn absorb_push(&self, mut stream: Stream) {
        let peer = stream.peer();
        match io::read_proto::<_, proto::Identify>(&mut stream, MAX_MESSAGE_SIZE).await {
            Ok(message) => self.absorb(peer, message),
            Err(e) => log::debug!("bad identify push from {peer}: {e}"),
        }
    }

    /// Push our current description to every connected peer.
    pub async fn push_all(&self) {
        let message = self.own_message(None);
        for peer in self.swarm.peers() {
            let message = message.clone();
            let swarm = self.swarm.clone();
            tokio::spawn(async move {
                let stream = swarm
                    .new_stream(
                        peer,
                        &[PUSH_PROTOCOL_NAME.to_string()],
                        DialHints::default().allow_limited().no_dial(),
                    )
                    .await;
                if let Ok(mut stream) = stream {
                    let _ = io::write_proto(&mut stream, &message).await;
                    let _ = stream.shutdown().await;
                }
            });
        }
    }

    fn own_message(&self, observed: Option<Multiaddr>) -> proto::Identify {
        let listen_addrs = (self.addrs)();
        let signed_record = PeerRecord {
            peer: self.swarm.local_peer(),
            seq: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
            addresses: listen_addrs.clone(),
        }
        .into_signed_envelope(&self.keypair)
        .map(|envelope| envelope.encode())
        .unwrap_or_default();

        proto::Identify {
            protocol_version: self.config.protocol_version.clone(),
            agent_version: self.config.agent_version.clone(),
            public_key: self.keypair.public().to_protobuf_encoding(),
            listen_addrs: listen_addrs.iter().map(|a| a.to_bytes()).collect(),
            observed_addr: observed.map(|a| a.to_bytes()).unwrap_or_default(),
            protocols: self.swarm.handlers().protocols(),
            signed_peer_record: signed_record,
        }
    }

    /// Fold a received identify message into the peer store and announce it.
    fn absorb(&self, peer: PeerId, message: proto::Identify) {
        let store = self.swarm.peerstore();
        if let Ok(key) = peerlink_identity::PublicKey::from_protobuf_encoding(&message.public_key)
        {
            if key.to_peer_id() == peer {
                store.set_key(peer, key);
            } else {
                log::debug!("identify from {peer} carried a foreign public key, ignoring");
                return;
            }
        }

        // A verified signed record is authoritative for addresses;
        // otherwise fall back to the unsigned listen addresses.
        let mut listen_addrs: Vec<Multiaddr> = Vec::new();
        if !message.signed_peer_record.is_empty() {
            if let Ok(envelope) = SignedEnvelope::decode(&message.signed_peer_record) {
                if let Ok(record) = PeerRecord::from_signed_envelope(&envelope) {
                    if record.peer == peer {
                        listen_addrs = record.addresses.clone();
                        store.set_signed_record(peer, envelope);
                    }
                }
            }
        }
        if listen_addrs.is_empty() {
            listen_addrs = message
                .listen_addrs
                .iter()
                .filter_map(|bytes| Multiaddr::from_bytes(bytes).ok())
                .collect();
        }
        store.add_addrs(peer, listen_addrs.iter().cloned(), RECENT_ADDR_TTL);
        store.set_protocols(peer, message.protocols.clone());

        let observed_addr = if message.observed_addr.is_empty() {
            None
        } else {
            Multiaddr::from_bytes(&message.observed_addr).ok()
        };
        log::debug!(
            "identified {peer}: agent={} protocols={}",
            message.agent_version,
            message.protocols.len()
        );
        self.bus.publish(Event::PeerIdentified {
            peer,
            protocols: message.protocols,
            listen_addrs,
            observed_addr,
            agent_version: message.agent_version,
        });
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IdentifyError {
    #[error(transparent)]
    Swarm(#[from] SwarmError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("identify exchange timed out")]
    Timeout,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_message_carries_signed_record() {
        // Construct the message parts without a live swarm: the envelope
        // decodes and verifies against the signing key.
        let key = Keypair::generate_ed25519();
        let record = PeerRecord {
            peer: key.public().to_peer_id(),
            seq: 1,
            addresses: vec!["/ip4/127.0.0.1/tcp/4001".parse().unwrap()],
        };
        let envelope = record.clone().into_signed_envelope(&key).unwrap();
        let decoded = SignedEnvelope::decode(&envelope.encode()).unwrap();
        assert_eq!(PeerRecord::from_signed_envelope(&decoded).unwrap(), record);
    }
}
