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

//! Reachability detection: ask a remote peer to dial our candidate
//! addresses back and fold the outcomes into a confidence-weighted
//! verdict. Also answers such probes for others, with an amplification
//! guard restricting dial-backs to the requester's observed IP.

mod proto;
mod tracker;

pub use tracker::{ConfidenceTracker, MAX_CONFIDENCE};

use futures::FutureExt;
use parking_lot::Mutex;
use peerlink_core::{
    bus::{Event, EventBus},
    io,
    peerstore::TEMP_ADDR_TTL,
    Multiaddr, PeerId, Reachability,
};
use peerlink_swarm::{Connection, DialHints, Stream, Swarm};
use rand::Rng;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::watch;

pub const DIAL_REQUEST_PROTOCOL: &str = "/libp2p/autonat/2/dial-request";
pub const DIAL_BACK_PROTOCOL: &str = "/libp2p/autonat/2/dial-back";

const MAX_MESSAGE_SIZE: usize = 4096;

/// A source of our own candidate addresses.
pub type AddrsSource = Arc<dyn Fn() -> Vec<Multiaddr> + Send + Sync>;

#[derive(Clone, Debug)]
pub struct Config {
    /// Grace period after start before the first probe.
    pub boot_delay: Duration,
    /// Probe interval while the verdict is unsettled.
    pub retry_interval: Duration,
    /// Probe interval once the verdict is settled.
    pub refresh_interval: Duration,
    /// Delay for probes forced by external events (a fresh autonat server
    /// appeared, our addresses changed).
    pub forced_probe_delay: Duration,
    /// Deadline for one probe round trip, dial-back included.
    pub probe_timeout: Duration,
    /// Whether to answer probes from other peers.
    pub enable_server: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            boot_delay: Duration::from_secs(15),
            retry_interval: Duration::from_secs(60),
            refresh_interval: Duration::from_secs(15 * 60),
            forced_probe_delay: Duration::from_secs(2),
            probe_timeout: Duration::from_secs(30),
            enable_server: true,
        }
    }
}

/// The AutoNAT service: ambient orchestrator, probe client and probe
/// server.
pub struct AutoNat {
    swarm: Swarm,
    bus: EventBus,
    config: Config,
    addrs: AddrsSource,
    tracker: Mutex<ConfidenceTracker>,
    reachability_tx: watch::Sender<(Reachability, u8)>,
    /// Nonces of in-flight probes, flipped when the dial-back arrives.
    pending_nonces: Mutex<HashMap<u64, Arc<AtomicBool>>>,
}

impl AutoNat {
    pub fn new(
        swarm: Swarm,
        bus: EventBus,
        config: Config,
        addrs: AddrsSource,
        reachability_tx: watch::Sender<(Reachability, u8)>,
    ) -> Arc<AutoNat> {
        Arc::new(AutoNat {
            swarm,
            bus,
            config,
            addrs,
            tracker: Mutex::new(ConfidenceTracker::default()),
            reachability_tx,
            pending_nonces: Mutex::new(HashMap::new()),
        })
    }

    /// Register the dial-back handler and, when enabled, the probe server.
    pub fn register(self: Arc<Self>) {
        let autonat = self.clone();
        self.swarm.handlers().set(
            DIAL_BACK_PROTOCOL,
            Arc::new(move |stream| {
                let autonat = autonat.clone();
                async move { autonat.handle_dial_back(stream).await }.boxed()
            }),
        );
        if self.config.enable_server {
            let autonat = self.clone();
            self.swarm.handlers().set(
                DIAL_REQUEST_PROTOCOL,
                Arc::new(move |stream| {
                    let autonat = autonat.clone();
                    async move { autonat.handle_dial_request(stream).await }.boxed()
                }),
            );
        }
    }

    pub fn reachability(&self) -> (Reachability, u8) {
        let tracker = self.tracker.lock();
        (tracker.reachability(), tracker.confidence())
    }

    /// Run the ambient orchestrator: boot delay, then probe on a schedule
    /// driven by the verdict's confidence, with forced probes on relevant
    /// events.
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let autonat = self.clone();
        let mut events = self.bus.subscribe();
        tokio::spawn(async move {
            tokio::time::sleep(autonat.config.boot_delay).await;
            loop {
                let observation = autonat.probe().await;
                autonat.apply(observation);

                let delay = {
                    let tracker = autonat.tracker.lock();
                    if tracker.is_settled() {
                        autonat.config.refresh_interval
                    } else {
                        autonat.config.retry_interval
                    }
                };
                // Wait out the schedule, but let events pull the next probe
                // forward.
                let sleep = tokio::time::sleep(delay);
                tokio::pin!(sleep);
                loop {
                    tokio::select! {
                        _ = &mut sleep => break,
                        event = events.recv() => match event {
                            Ok(Event::PeerIdentified { protocols, .. })
                                if protocols.iter().any(|p| p == DIAL_REQUEST_PROTOCOL)
                                    && !autonat.tracker.lock().is_settled() =>
                            {
                                // A fresh autonat server showed up.
                                tokio::time::sleep(autonat.config.forced_probe_delay).await;
                                break;
                            }
                            Ok(Event::ListenAddrsChanged { .. }) => {
                                autonat.tracker.lock().on_address_change();
                                tokio::time::sleep(autonat.config.forced_probe_delay).await;
                                break;
                            }
                            Ok(_) => {}
                            Err(_) => return,
                        },
                    }
                }
            }
        })
    }

    fn apply(&self, observation: Reachability) {
        let mut tracker = self.tracker.lock();
        let changed = tracker.observe(observation);
        let state = (tracker.reachability(), tracker.confidence());
        drop(tracker);
        let _ = self.reachability_tx.send(state);
        if let Some((reachability, confidence)) = changed {
            log::info!("reachability changed to {reachability:?} (confidence {confidence})");
            self.bus.publish(Event::ReachabilityChanged {
                reachability,
                confidence,
            });
        }
    }

    /// Run one probe, yielding the resulting observation.
    async fn probe(&self) -> Reachability {
        let candidates: Vec<Multiaddr> = (self.addrs)()
            .into_iter()
            .filter(|a| !a.is_circuit())
            .collect();
        if candidates.is_empty() {
            return Reachability::Unknown;
        }
        let Some(server) = self.pick_server() else {
            log::debug!("no autonat server known");
            return Reachability::Unknown;
        };

        match self.probe_with(server, &candidates).await {
            Ok(observation) => observation,
            Err(e) => {
                log::debug!("probe via {server} failed: {e}");
                Reachability::Unknown
            }
        }
    }

    fn pick_server(&self) -> Option<PeerId> {
        let wanted = [DIAL_REQUEST_PROTOCOL.to_string()];
        let store = self.swarm.peerstore();
        // Prefer peers we are already connected to.
        let connected = self.swarm.peers();
        connected
            .iter()
            .find(|p| store.first_supported(p, &wanted).is_some())
            .copied()
            .or_else(|| {
                store
                    .peers_with_addrs()
                    .into_iter()
                    .find(|p| *p != self.swarm.local_peer() && store.first_supported(p, &wanted).is_some())
            })
    }

    async fn probe_with(
        &self,
        server: PeerId,
        candidates: &[Multiaddr],
    ) -> Result<Reachability, AutoNatError> {
        let nonce: u64 = rand::thread_rng().gen();
        let received = Arc::new(AtomicBool::new(false));
        self.pending_nonces.lock().insert(nonce, received.clone());
        let result = self.probe_inner(server, candidates, nonce, &received).await;
        self.pending_nonces.lock().remove(&nonce);
        result
    }

    async fn probe_inner(
        &self,
        server: PeerId,
        candidates: &[Multiaddr],
        nonce: u64,
        received: &AtomicBool,
    ) -> Result<Reachability, AutoNatError> {
        let mut stream = self
            .swarm
            .new_stream(
                server,
                &[DIAL_REQUEST_PROTOCOL.to_string()],
                DialHints::default(),
            )
            .await?;
        let request = proto::DialRequest {
            addrs: candidates.iter().map(|a| a.to_bytes()).collect(),
            nonce,
        };
        io::write_proto(&mut stream, &request).await?;
        let response = tokio::time::timeout(
            self.config.probe_timeout,
            io::read_proto::<_, proto::DialResponse>(&mut stream, MAX_MESSAGE_SIZE),
        )
        .await
        .map_err(|_| AutoNatError::Timeout)??;

        match proto::ResponseStatus::from_i32(response.status) {
            Some(proto::ResponseStatus::Ok) => {}
            Some(proto::ResponseStatus::EDialRefused) => return Ok(Reachability::Unknown),
            _ => return Err(AutoNatError::Refused),
        }
        match proto::DialStatus::from_i32(response.dial_status) {
            Some(proto::DialStatus::Ok) if received.load(Ordering::SeqCst) => {
                Ok(Reachability::Public)
            }
            // The server reached us but the nonce never arrived: something
            // in between is interfering; treat as inconclusive.
            Some(proto::DialStatus::Ok) => Ok(Reachability::Unknown),
            Some(proto::DialStatus::EDialError) => Ok(Reachability::Private),
            _ => Ok(Reachability::Unknown),
        }
    }

    /// Server side: read the candidate addresses, dial one back, confirm
    /// the nonce, report the outcome.
    async fn handle_dial_request(&self, mut stream: Stream) {
        let peer = stream.peer();
        let Ok(request) =
            io::read_proto::<_, proto::DialRequest>(&mut stream, MAX_MESSAGE_SIZE).await
        else {
            stream.reset();
            return;
        };
        let request_conn = stream.connection();
        let observed_ip = request_conn
            .as_ref()
            .and_then(|conn| conn.remote_addr().ip());

        // Amplification guard: only dial addresses matching the IP the
        // request came from.
        let candidate = request
            .addrs
            .iter()
            .enumerate()
            .filter_map(|(i, bytes)| Multiaddr::from_bytes(bytes).ok().map(|a| (i, a)))
            .find(|(_, a)| !a.is_circuit() && a.ip().is_some() && a.ip() == observed_ip);

        let response = match candidate {
            None => proto::DialResponse {
                status: proto::ResponseStatus::EDialRefused as i32,
                addr_idx: 0,
                dial_status: proto::DialStatus::Unused as i32,
            },
            Some((idx, addr)) => {
                let dial_status = match self
                    .dial_back(peer, addr, request.nonce, request_conn)
                    .await
                {
                    Ok(()) => proto::DialStatus::Ok,
                    Err(e) => {
                        log::debug!("dial-back to {peer} failed: {e}");
                        proto::DialStatus::EDialError
                    }
                };
                proto::DialResponse {
                    status: proto::ResponseStatus::Ok as i32,
                    addr_idx: idx as u32,
                    dial_status: dial_status as i32,
                }
            }
        };
        let _ = io::write_proto(&mut stream, &response).await;
        use tokio::io::AsyncWriteExt;
        let _ = stream.shutdown().await;
    }

    async fn dial_back(
        &self,
        peer: PeerId,
        addr: Multiaddr,
        nonce: u64,
        request_conn: Option<Connection>,
    ) -> Result<(), AutoNatError> {
        self.swarm
            .peerstore()
            .add_addrs(peer, [addr], TEMP_ADDR_TTL);
        // The reachability proof is completing a fresh dial and upgrade to
        // the candidate address; the nonce confirmation runs over the
        // stable request connection, since the fresh one may lose the
        // remote's connection deduplication.
        let conn = self
            .swarm
            .dial_with(
                peer,
                DialHints::default()
                    .force_direct()
                    .force_new()
                    .with_timeout(Duration::from_secs(15)),
            )
            .await?;
        let mut stream = match request_conn {
            Some(request_conn) => {
                request_conn
                    .new_stream(&[DIAL_BACK_PROTOCOL.to_string()], Duration::from_secs(10))
                    .await?
            }
            None => {
                self.swarm
                    .new_stream(
                        peer,
                        &[DIAL_BACK_PROTOCOL.to_string()],
                        DialHints::default().allow_limited().no_dial(),
                    )
                    .await?
            }
        };
        io::write_proto(&mut stream, &proto::DialBack { nonce }).await?;
        use tokio::io::AsyncWriteExt;
        let _ = stream.shutdown().await;
        conn.close().await;
        Ok(())
    }

    /// Client side of the dial-back: confirm the nonce belongs to one of
    /// our in-flight probes.
    async fn handle_dial_back(&self, mut stream: Stream) {
        if let Ok(msg) = io::read_proto::<_, proto::DialBack>(&mut stream, MAX_MESSAGE_SIZE).await
        {
            match self.pending_nonces.lock().get(&msg.nonce) {
                Some(flag) => flag.store(true, Ordering::SeqCst),
                None => log::debug!("dial-back with unknown nonce {}", msg.nonce),
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AutoNatError {
    #[error(transparent)]
    Swarm(#[from] peerlink_swarm::SwarmError),
    #[error(transparent)]
    Dial(#[from] peerlink_swarm::DialError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("server rejected the probe")]
    Refused,
    #[error("probe timed out")]
    Timeout,
}
