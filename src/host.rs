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

//! The host: the facade binding transports, the swarm and the protocol
//! services into one node with a lifecycle.

use parking_lot::Mutex;
use peerlink_autonat::AutoNat;
use peerlink_core::{
    bus::{Event, EventBus},
    peerstore::{PeerStore, PERMANENT_ADDR_TTL},
    rcmgr::{ResourceLimits, ResourceManager},
    upgrader::Upgrader,
    AddrInfo, Multiaddr, Reachability,
};
use peerlink_dcutr::HolePuncher;
use peerlink_identify::Identify;
use peerlink_identity::{Keypair, PeerId};
use peerlink_ping::Ping;
use peerlink_relay::{CircuitTransport, RelayClient, RelayServer};
use peerlink_swarm::{
    ConnGater, Connection, DialError, DialHints, Stream, StreamHandler, Swarm, SwarmConfig,
    SwarmError,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::watch;

/// Filters the addresses the host advertises.
pub type AddrsFactory = Arc<dyn Fn(Vec<Multiaddr>) -> Vec<Multiaddr> + Send + Sync>;

/// Host configuration. The defaults produce a full node: identify and ping
/// always on, relay client, AutoNAT and hole punching enabled, relay
/// service disabled.
#[derive(Clone)]
pub struct Config {
    pub keypair: Keypair,
    pub listen_addrs: Vec<Multiaddr>,
    /// Serve as a relay for others.
    pub enable_relay_server: bool,
    /// Keep relay reservations while private.
    pub enable_relay_client: bool,
    pub enable_autonat: bool,
    pub enable_hole_punching: bool,
    /// Skip AutoNAT and pin the reachability verdict; useful for nodes
    /// that know their deployment.
    pub force_reachability: Option<Reachability>,
    pub addrs_factory: Option<AddrsFactory>,
    pub conn_gater: Option<Arc<dyn ConnGater>>,
    pub resource_limits: ResourceLimits,
    pub swarm: SwarmConfig,
    pub yamux: peerlink_yamux::Config,
    pub ping: peerlink_ping::Config,
    pub identify: peerlink_identify::Config,
    pub relay_server: peerlink_relay::ServerConfig,
    pub relay_client: peerlink_relay::ClientConfig,
    pub autonat: peerlink_autonat::Config,
    pub dcutr: peerlink_dcutr::Config,
}

impl Config {
    pub fn new(keypair: Keypair) -> Config {
        Config {
            keypair,
            listen_addrs: Vec::new(),
            enable_relay_server: false,
            enable_relay_client: true,
            enable_autonat: true,
            enable_hole_punching: true,
            force_reachability: None,
            addrs_factory: None,
            conn_gater: None,
            resource_limits: ResourceLimits::default(),
            swarm: SwarmConfig::default(),
            yamux: peerlink_yamux::Config::default(),
            ping: peerlink_ping::Config::default(),
            identify: peerlink_identify::Config::default(),
            relay_server: peerlink_relay::ServerConfig::default(),
            relay_client: peerlink_relay::ClientConfig::default(),
            autonat: peerlink_autonat::Config::default(),
            dcutr: peerlink_dcutr::Config::default(),
        }
    }

    pub fn with_listen_addrs(mut self, addrs: impl IntoIterator<Item = Multiaddr>) -> Config {
        self.listen_addrs = addrs.into_iter().collect();
        self
    }

    pub fn with_relay_server(mut self) -> Config {
        self.enable_relay_server = true;
        self
    }

    /// Relays to reserve on, each address ending in `/p2p/<relay>`.
    pub fn with_static_relays(mut self, relays: impl IntoIterator<Item = Multiaddr>) -> Config {
        self.relay_client.static_relays = relays.into_iter().collect();
        self
    }

    pub fn with_forced_reachability(mut self, reachability: Reachability) -> Config {
        self.force_reachability = Some(reachability);
        self
    }
}

struct HostInner {
    keypair: Keypair,
    local_peer: PeerId,
    swarm: Swarm,
    bus: EventBus,
    listen_addrs: Vec<Multiaddr>,
    addrs_factory: Option<AddrsFactory>,
    identify: Arc<Identify>,
    ping: Arc<Ping>,
    relay_server: Option<Arc<RelayServer>>,
    relay_client: Option<Arc<RelayClient>>,
    autonat: Option<Arc<AutoNat>>,
    hole_puncher: Option<Arc<HolePuncher>>,
    force_reachability: Option<Reachability>,
    reachability_tx: watch::Sender<(Reachability, u8)>,
    reachability_rx: watch::Receiver<(Reachability, u8)>,
    started: AtomicBool,
    closed: AtomicBool,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

/// A complete node. Cheap to clone.
#[derive(Clone)]
pub struct Host {
    inner: Arc<HostInner>,
}

impl Host {
    pub fn new(config: Config) -> Host {
        let keypair = config.keypair.clone();
        let local_peer = keypair.public().to_peer_id();
        let bus = EventBus::new();
        let peerstore = PeerStore::default();
        let rcmgr = ResourceManager::new(config.resource_limits);

        let upgrader = Upgrader::new(
            vec![Arc::new(peerlink_noise::Config::new(&keypair))],
            vec![Arc::new(config.yamux.clone())],
        );
        let swarm = Swarm::new(
            local_peer,
            upgrader,
            peerstore,
            bus.clone(),
            rcmgr,
            config.conn_gater.clone(),
            config.swarm.clone(),
        );
        swarm.add_transport(Arc::new(peerlink_tcp::TcpTransport::new()));
        let circuit = CircuitTransport::new();
        circuit.set_swarm(swarm.clone());
        swarm.add_transport(circuit);

        let (reachability_tx, reachability_rx) =
            watch::channel((Reachability::Unknown, 0u8));

        let relay_client = config.enable_relay_client.then(|| {
            RelayClient::new(
                swarm.clone(),
                bus.clone(),
                config.relay_client.clone(),
                reachability_rx.clone(),
            )
        });

        // What we tell the world about ourselves: listener addresses plus
        // any circuit addresses backed by a live reservation, run through
        // the user's filter.
        let addrs_source: Arc<dyn Fn() -> Vec<Multiaddr> + Send + Sync> = {
            let swarm = swarm.clone();
            let relay_client = relay_client.clone();
            let factory = config.addrs_factory.clone();
            Arc::new(move || {
                let mut addrs = swarm.listen_addrs();
                if let Some(client) = &relay_client {
                    addrs.extend(client.circuit_addrs());
                }
                match &factory {
                    Some(factory) => factory(addrs),
                    None => addrs,
                }
            })
        };

        let identify = Identify::new(
            swarm.clone(),
            keypair.clone(),
            config.identify.clone(),
            addrs_source.clone(),
            bus.clone(),
        );
        let ping = Ping::new(swarm.clone(), config.ping.clone());
        let relay_server = config.enable_relay_server.then(|| {
            RelayServer::new(
                swarm.clone(),
                keypair.clone(),
                config.relay_server.clone(),
                addrs_source.clone(),
            )
        });
        let autonat = (config.enable_autonat && config.force_reachability.is_none()).then(|| {
            AutoNat::new(
                swarm.clone(),
                bus.clone(),
                config.autonat.clone(),
                addrs_source.clone(),
                reachability_tx.clone(),
            )
        });
        let hole_puncher = config.enable_hole_punching.then(|| {
            HolePuncher::new(
                swarm.clone(),
                bus.clone(),
                config.dcutr.clone(),
                addrs_source.clone(),
            )
        });

        Host {
            inner: Arc::new(HostInner {
                keypair,
                local_peer,
                swarm,
                bus,
                listen_addrs: config.listen_addrs,
                addrs_factory: config.addrs_factory,
                identify,
                ping,
                relay_server,
                relay_client,
                autonat,
                hole_puncher,
                force_reachability: config.force_reachability,
                reachability_tx,
                reachability_rx,
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// This node's peer id.
    pub fn id(&self) -> PeerId {
        self.inner.local_peer
    }

    pub fn keypair(&self) -> &Keypair {
        &self.inner.keypair
    }

    pub fn swarm(&self) -> &Swarm {
        &self.inner.swarm
    }

    pub fn peerstore(&self) -> &PeerStore {
        self.inner.swarm.peerstore()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn identify(&self) -> &Arc<Identify> {
        &self.inner.identify
    }

    pub fn ping_service(&self) -> &Arc<Ping> {
        &self.inner.ping
    }

    pub fn relay_server(&self) -> Option<&Arc<RelayServer>> {
        self.inner.relay_server.as_ref()
    }

    /// The current reachability verdict and its confidence.
    pub fn reachability(&self) -> (Reachability, u8) {
        *self.inner.reachability_rx.borrow()
    }

    /// The addresses this host advertises.
    pub fn addrs(&self) -> Vec<Multiaddr> {
        let mut addrs = self.inner.swarm.listen_addrs();
        if let Some(client) = &self.inner.relay_client {
            addrs.extend(client.circuit_addrs());
        }
        match &self.inner.addrs_factory {
            Some(factory) => factory(addrs),
            None => addrs,
        }
    }

    /// Make the peer's addresses known and connect to it.
    pub async fn connect(&self, info: AddrInfo) -> Result<Connection, DialError> {
        self.peerstore()
            .add_addrs(info.peer, info.addrs, PERMANENT_ADDR_TTL);
        self.inner.swarm.dial(info.peer).await
    }

    /// Open a stream speaking the first mutually supported of `protocols`.
    pub async fn new_stream(
        &self,
        peer: PeerId,
        protocols: &[String],
    ) -> Result<Stream, SwarmError> {
        self.inner
            .swarm
            .new_stream(peer, protocols, DialHints::default().allow_limited())
            .await
    }

    /// Register `handler` for inbound streams negotiating `protocol`.
    pub fn set_stream_handler(&self, protocol: impl Into<String>, handler: StreamHandler) {
        self.inner.swarm.handlers().set(protocol, handler);
    }

    pub fn remove_stream_handler(&self, protocol: &str) {
        self.inner.swarm.handlers().remove(protocol);
    }

    /// Bring up listeners and background services. Idempotent.
    pub async fn start(&self) -> Result<(), HostError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        log::info!("host {} starting", self.inner.local_peer);

        for addr in self.inner.listen_addrs.clone() {
            if let Err(e) = self.inner.swarm.listen(&addr).await {
                // Release everything a partial start acquired.
                self.close().await;
                return Err(HostError::Listen(addr, e));
            }
        }

        self.inner.ping.register();
        self.inner.identify.clone().register();
        let mut tasks = vec![
            self.inner.identify.clone().start(),
            self.inner.ping.clone().start(self.inner.bus.clone()),
        ];

        if let Some(server) = &self.inner.relay_server {
            server.clone().register();
            tasks.push(server.clone().start());
        }
        if let Some(client) = &self.inner.relay_client {
            client.clone().register();
            tasks.push(client.clone().start());
        }
        if let Some(puncher) = &self.inner.hole_puncher {
            puncher.clone().register();
        }
        match (&self.inner.autonat, self.inner.force_reachability) {
            (_, Some(forced)) => {
                let _ = self
                    .inner
                    .reachability_tx
                    .send((forced, peerlink_autonat::MAX_CONFIDENCE));
                self.inner.bus.publish(Event::ReachabilityChanged {
                    reachability: forced,
                    confidence: peerlink_autonat::MAX_CONFIDENCE,
                });
            }
            (Some(autonat), None) => {
                autonat.clone().register();
                tasks.push(autonat.clone().start());
            }
            (None, None) => {}
        }

        // Peer store hygiene.
        {
            let store = self.peerstore().clone();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
                loop {
                    ticker.tick().await;
                    store.gc();
                }
            }));
        }

        self.inner.tasks.lock().extend(tasks);
        self.inner.bus.publish(Event::ListenAddrsChanged {
            addrs: self.addrs(),
        });
        Ok(())
    }

    /// Stop background services, close the swarm and drain listeners.
    /// Idempotent, and safe to call after a failed `start`.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("host {} shutting down", self.inner.local_peer);
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        self.inner.swarm.close().await;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("listening on {0} failed: {1}")]
    Listen(Multiaddr, #[source] SwarmError),
}
