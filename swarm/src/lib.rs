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

//! The swarm: the single owner of connections. It deduplicates concurrent
//! dials, races candidate addresses with staggered starts, indexes live
//! connections by peer, opens negotiated streams and dispatches inbound
//! streams to registered protocol handlers.

mod connection;
mod dial;
mod error;
mod gater;
mod registry;

pub use connection::{Connection, Stream};
pub use error::{AttemptError, DialError, SwarmError};
pub use gater::ConnGater;
pub use registry::{StreamHandler, StreamHandlers};

use connection::ConnectionInner;
use parking_lot::{Mutex, RwLock};
use peerlink_core::{
    bus::{Event, EventBus},
    peerstore::{PeerStore, RECENT_ADDR_TTL},
    rcmgr::{ConnectionScope, ResourceManager},
    transport::{BoxListener, Transport, TransportError},
    upgrader::{Upgraded, Upgrader},
    Multiaddr, PeerId,
};
use peerlink_multistream_select as multistream;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::watch;

/// Who initiated the underlying connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Caller-supplied hints for dials and stream opens.
#[derive(Clone, Debug, Default)]
pub struct DialHints {
    /// Ignore relay addresses entirely.
    pub force_direct: bool,
    /// Accept a limited (relayed) connection.
    pub allow_limited: bool,
    /// Never dial; fail if no usable connection exists.
    pub no_dial: bool,
    /// Dial even when a connection already exists, and keep the result.
    pub force_new: bool,
    /// Expect a simultaneous open from the remote (hole punching).
    pub simultaneous_connect: bool,
    /// Overall dial deadline, defaulting to the swarm's.
    pub timeout: Option<Duration>,
}

impl DialHints {
    pub fn force_direct(mut self) -> Self {
        self.force_direct = true;
        self
    }

    pub fn allow_limited(mut self) -> Self {
        self.allow_limited = true;
        self
    }

    pub fn no_dial(mut self) -> Self {
        self.no_dial = true;
        self
    }

    pub fn force_new(mut self) -> Self {
        self.force_new = true;
        self
    }

    pub fn simultaneous_connect(mut self) -> Self {
        self.simultaneous_connect = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Clone, Debug)]
pub struct SwarmConfig {
    pub dial_timeout: Duration,
    pub negotiation_timeout: Duration,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        SwarmConfig {
            dial_timeout: Duration::from_secs(60),
            negotiation_timeout: Duration::from_secs(30),
        }
    }
}

/// Lifecycle observer, invoked synchronously on connection and listener
/// changes.
pub trait Notifiee: Send + Sync {
    fn connected(&self, _conn: &Connection) {}
    fn disconnected(&self, _conn: &Connection) {}
    fn listen(&self, _addr: &Multiaddr) {}
    fn listen_close(&self, _addr: &Multiaddr) {}
}

struct ListenerEntry {
    addr: Multiaddr,
    task: tokio::task::JoinHandle<()>,
}

pub(crate) struct SwarmState {
    connections: HashMap<PeerId, Vec<Connection>>,
    listeners: Vec<ListenerEntry>,
    next_conn_id: u64,
    closed: bool,
}

pub(crate) struct SwarmInner {
    pub local_peer: PeerId,
    pub transports: RwLock<Vec<Arc<dyn Transport>>>,
    pub upgrader: Upgrader,
    pub peerstore: PeerStore,
    pub rcmgr: ResourceManager,
    pub gater: Arc<dyn ConnGater>,
    pub handlers: StreamHandlers,
    pub bus: EventBus,
    pub config: SwarmConfig,
    notifiees: RwLock<Vec<Arc<dyn Notifiee>>>,
    state: Mutex<SwarmState>,
    dials: Mutex<HashMap<PeerId, watch::Receiver<Option<Result<Connection, DialError>>>>>,
}

/// A shared handle to the swarm. Cheap to clone.
#[derive(Clone)]
pub struct Swarm {
    inner: Arc<SwarmInner>,
}

impl Swarm {
    pub fn new(
        local_peer: PeerId,
        upgrader: Upgrader,
        peerstore: PeerStore,
        bus: EventBus,
        rcmgr: ResourceManager,
        gater: Option<Arc<dyn ConnGater>>,
        config: SwarmConfig,
    ) -> Swarm {
        Swarm {
            inner: Arc::new(SwarmInner {
                local_peer,
                transports: RwLock::new(Vec::new()),
                upgrader,
                peerstore,
                rcmgr,
                gater: gater.unwrap_or_else(|| Arc::new(gater::AllowAll)),
                handlers: StreamHandlers::new(),
                bus,
                config,
                notifiees: RwLock::new(Vec::new()),
                state: Mutex::new(SwarmState {
                    connections: HashMap::new(),
                    listeners: Vec::new(),
                    next_conn_id: 0,
                    closed: false,
                }),
                dials: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn local_peer(&self) -> PeerId {
        self.inner.local_peer
    }

    pub fn peerstore(&self) -> &PeerStore {
        &self.inner.peerstore
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// The handler registry shared with the host.
    pub fn handlers(&self) -> StreamHandlers {
        self.inner.handlers.clone()
    }

    /// Transports are registered at build time; the set is append-only.
    pub fn add_transport(&self, transport: Arc<dyn Transport>) {
        self.inner.transports.write().push(transport);
    }

    pub fn register_notifiee(&self, notifiee: Arc<dyn Notifiee>) {
        self.inner.notifiees.write().push(notifiee);
    }

    /// Dial `peer` with default hints, reusing an existing connection when
    /// one exists.
    pub async fn dial(&self, peer: PeerId) -> Result<Connection, DialError> {
        self.dial_with(peer, DialHints::default().allow_limited()).await
    }

    /// Dial `peer`. Concurrent dials to the same peer collapse onto one
    /// running pipeline and share its outcome.
    pub async fn dial_with(&self, peer: PeerId, hints: DialHints) -> Result<Connection, DialError> {
        if peer == self.inner.local_peer {
            return Err(DialError::SelfDial);
        }
        if self.inner.state.lock().closed {
            return Err(DialError::Closed);
        }
        if !hints.force_new {
            if let Some(existing) = self.best_connection(&peer, hints.allow_limited) {
                return Ok(existing);
            }
        }
        if hints.force_new {
            // Explicitly requested fresh connections (hole punching) skip
            // both the aggregation map and the install-time dedup.
            return dial::do_dial(self.inner.clone(), peer, hints).await;
        }

        let mut rx = {
            let mut dials = self.inner.dials.lock();
            match dials.get(&peer) {
                Some(rx) => rx.clone(),
                None => {
                    let (tx, rx) = watch::channel(None);
                    dials.insert(peer, rx.clone());
                    let inner = self.inner.clone();
                    tokio::spawn(async move {
                        let result = dial::do_dial(inner.clone(), peer, hints).await;
                        inner.dials.lock().remove(&peer);
                        let _ = tx.send(Some(result));
                    });
                    rx
                }
            }
        };
        loop {
            if let Some(result) = rx.borrow().clone() {
                return result;
            }
            if rx.changed().await.is_err() {
                return Err(DialError::Closed);
            }
        }
    }

    /// All non-closed connections to `peer`.
    pub fn conns_to_peer(&self, peer: &PeerId) -> Vec<Connection> {
        self.inner
            .state
            .lock()
            .connections
            .get(peer)
            .map(|conns| {
                conns
                    .iter()
                    .filter(|c| !c.is_closed())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Peers with at least one live connection.
    pub fn peers(&self) -> Vec<PeerId> {
        self.inner
            .state
            .lock()
            .connections
            .iter()
            .filter(|(_, conns)| conns.iter().any(|c| !c.is_closed()))
            .map(|(p, _)| *p)
            .collect()
    }

    /// The preferred connection for new streams: the newest non-limited
    /// one, or the newest limited one if the caller accepts those.
    pub fn best_connection(&self, peer: &PeerId, allow_limited: bool) -> Option<Connection> {
        let state = self.inner.state.lock();
        let conns = state.connections.get(peer)?;
        let live = conns.iter().filter(|c| !c.is_closed());
        if let Some(best) = live
            .clone()
            .filter(|c| !c.is_limited())
            .max_by_key(|c| c.id())
        {
            return Some(best.clone());
        }
        if allow_limited {
            return live.max_by_key(|c| c.id()).cloned();
        }
        None
    }

    /// Open a stream to `peer` speaking the first of `protocols` the remote
    /// accepts, dialing if needed and permitted.
    pub async fn new_stream(
        &self,
        peer: PeerId,
        protocols: &[String],
        hints: DialHints,
    ) -> Result<Stream, SwarmError> {
        let conn = match self.best_connection(&peer, hints.allow_limited) {
            Some(conn) => conn,
            None if hints.no_dial => {
                if self.best_connection(&peer, true).is_some() {
                    return Err(SwarmError::Limited(peer));
                }
                return Err(SwarmError::NoConnection(peer));
            }
            None => {
                let conn = self.dial_with(peer, hints.clone()).await?;
                if conn.is_limited() && !hints.allow_limited {
                    return Err(SwarmError::Limited(peer));
                }
                conn
            }
        };
        conn.new_stream(protocols, self.inner.config.negotiation_timeout)
            .await
    }

    /// Bind a listener and start accepting. Returns the concrete bound
    /// address.
    pub async fn listen(&self, addr: &Multiaddr) -> Result<Multiaddr, SwarmError> {
        if self.inner.state.lock().closed {
            return Err(SwarmError::Closed);
        }
        let transports: Vec<Arc<dyn Transport>> = self.inner.transports.read().clone();
        for transport in transports {
            match transport.listen(addr).await {
                Ok(listener) => {
                    let local_addr = listener.local_addr();
                    let task = tokio::spawn(run_listener(
                        self.inner.clone(),
                        listener,
                        transport.name(),
                    ));
                    self.inner.state.lock().listeners.push(ListenerEntry {
                        addr: local_addr.clone(),
                        task,
                    });
                    for n in self.inner.notifiees.read().iter() {
                        n.listen(&local_addr);
                    }
                    return Ok(local_addr);
                }
                Err(TransportError::UnsupportedAddress(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(SwarmError::ListenUnsupported(addr.clone()))
    }

    /// The bound listener addresses.
    pub fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.inner
            .state
            .lock()
            .listeners
            .iter()
            .map(|l| l.addr.clone())
            .collect()
    }

    /// Feed an externally accepted pipe (e.g. the data phase of a relayed
    /// STOP stream) through the inbound upgrade path, as if a listener had
    /// produced it.
    pub fn add_incoming(
        &self,
        pipe: peerlink_core::io::BoxPipe,
        transport: &'static str,
        local_addr: Option<Multiaddr>,
        remote_addr: Multiaddr,
    ) {
        if self.inner.state.lock().closed {
            return;
        }
        if !self.inner.gater.intercept_accept(&remote_addr) {
            return;
        }
        let inner = self.inner.clone();
        tokio::spawn(async move {
            handle_inbound(
                inner,
                pipe,
                transport,
                local_addr.unwrap_or_default(),
                remote_addr,
            )
            .await;
        });
    }

    /// Stop listeners and close every connection. Idempotent.
    pub async fn close(&self) {
        let (listeners, connections) = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let listeners = std::mem::take(&mut state.listeners);
            let connections: Vec<Connection> = state
                .connections
                .values()
                .flatten()
                .cloned()
                .collect();
            (listeners, connections)
        };
        for entry in listeners {
            entry.task.abort();
            for n in self.inner.notifiees.read().iter() {
                n.listen_close(&entry.addr);
            }
        }
        for conn in connections {
            conn.close().await;
        }
    }
}

/// Register an upgraded connection, atomically deduplicating against a
/// connection that appeared while the upgrade ran.
pub(crate) fn install_connection(
    inner: &Arc<SwarmInner>,
    upgraded: Upgraded,
    scope: ConnectionScope,
    direction: Direction,
    local_addr: Option<Multiaddr>,
    remote_addr: Multiaddr,
    hints: &DialHints,
) -> Option<Connection> {
    let peer = upgraded.peer;
    let limited = remote_addr.is_circuit();
    let mut state = inner.state.lock();
    if state.closed {
        return None;
    }
    if !hints.force_new {
        let existing = state
            .connections
            .get(&peer)
            .and_then(|conns| conns.iter().filter(|c| !c.is_closed()).max_by_key(|c| c.id()))
            .cloned();
        if let Some(existing) = existing {
            // Simultaneous connect: both sides keep the connection dialed
            // by the peer with the smaller id, so the pair converges on one
            // connection instead of zero or two. A direct connection is
            // never discarded in favor of a relayed one.
            let canonical = if inner.local_peer < peer {
                Direction::Outbound
            } else {
                Direction::Inbound
            };
            if direction != canonical && (!existing.is_limited() || limited) {
                log::debug!("duplicate connection to {peer}, reusing existing");
                drop(state);
                let muxer = upgraded.muxer;
                tokio::spawn(async move {
                    let _ = muxer.close().await;
                });
                return Some(existing);
            }
        }
    }

    let id = state.next_conn_id;
    state.next_conn_id += 1;
    let conn = Connection {
        inner: Arc::new(ConnectionInner {
            id,
            local_peer: inner.local_peer,
            remote_peer: peer,
            local_addr,
            remote_addr: remote_addr.clone(),
            direction,
            info: upgraded.info,
            muxer: upgraded.muxer,
            scope,
            limited,
            opened_at: Instant::now(),
        }),
    };
    let entry = state.connections.entry(peer).or_default();
    let newly_connected = !entry.iter().any(|c| !c.is_closed());
    entry.push(conn.clone());
    drop(state);

    log::debug!(
        "installed {direction:?} connection {id} to {peer} via {remote_addr} (limited: {limited})"
    );
    inner.peerstore.pin(peer);
    if direction == Direction::Outbound {
        inner
            .peerstore
            .add_addrs(peer, [remote_addr], RECENT_ADDR_TTL);
    }
    tokio::spawn(run_connection(inner.clone(), conn.clone()));
    for n in inner.notifiees.read().iter() {
        n.connected(&conn);
    }
    if newly_connected {
        inner.bus.publish(Event::PeerConnected { peer });
    }
    Some(conn)
}

async fn run_listener(inner: Arc<SwarmInner>, mut listener: BoxListener, transport: &'static str) {
    let local_addr = listener.local_addr();
    loop {
        match listener.accept().await {
            Ok((pipe, remote_addr)) => {
                if !inner.gater.intercept_accept(&remote_addr) {
                    log::debug!("gater refused inbound pipe from {remote_addr}");
                    continue;
                }
                tokio::spawn(handle_inbound(
                    inner.clone(),
                    pipe,
                    transport,
                    local_addr.clone(),
                    remote_addr,
                ));
            }
            Err(e) => {
                log::debug!("listener {local_addr} failed: {e}");
                break;
            }
        }
    }
}

async fn handle_inbound(
    inner: Arc<SwarmInner>,
    pipe: peerlink_core::io::BoxPipe,
    transport: &'static str,
    local_addr: Multiaddr,
    remote_addr: Multiaddr,
) {
    let Ok(scope) = inner.rcmgr.open_connection() else {
        log::debug!("inbound pipe from {remote_addr} rejected: resource limit");
        return;
    };
    let upgraded = match inner.upgrader.upgrade_inbound(pipe, transport).await {
        Ok(upgraded) => upgraded,
        Err(e) => {
            log::debug!("inbound upgrade from {remote_addr} failed: {e}");
            return;
        }
    };
    if !inner.gater.intercept_secured(Direction::Inbound, &upgraded.peer) {
        return;
    }
    if scope.assign_peer(upgraded.peer).is_err() {
        return;
    }
    install_connection(
        &inner,
        upgraded,
        scope,
        Direction::Inbound,
        Some(local_addr),
        remote_addr,
        &DialHints::default(),
    );
}

/// Per-connection task: accept inbound streams until the session dies,
/// then unregister the connection.
async fn run_connection(inner: Arc<SwarmInner>, conn: Connection) {
    loop {
        match conn.muxer().accept_stream().await {
            Ok(substream) => {
                tokio::spawn(dispatch_inbound(inner.clone(), conn.clone(), substream));
            }
            Err(e) => {
                log::debug!(
                    "connection {} to {} ended: {e}",
                    conn.id(),
                    conn.remote_peer()
                );
                break;
            }
        }
    }
    let _ = conn.muxer().close().await;

    let peer = conn.remote_peer();
    let last = {
        let mut state = inner.state.lock();
        if let Some(conns) = state.connections.get_mut(&peer) {
            conns.retain(|c| c.id() != conn.id());
            let last = !conns.iter().any(|c| !c.is_closed());
            if conns.is_empty() {
                state.connections.remove(&peer);
            }
            last
        } else {
            true
        }
    };
    inner.peerstore.unpin(&peer);
    for n in inner.notifiees.read().iter() {
        n.disconnected(&conn);
    }
    if last {
        inner.bus.publish(Event::PeerDisconnected { peer });
    }
}

async fn dispatch_inbound(
    inner: Arc<SwarmInner>,
    conn: Connection,
    mut substream: peerlink_core::muxing::BoxSubstream,
) {
    let Ok(scope) = conn.inner.scope.open_stream() else {
        substream.reset();
        return;
    };
    let protocols = inner.handlers.protocols();
    let protocol = match tokio::time::timeout(
        inner.config.negotiation_timeout,
        multistream::listener_select(&mut substream, &protocols),
    )
    .await
    {
        Ok(Ok(protocol)) => protocol,
        Ok(Err(e)) => {
            log::debug!("inbound stream negotiation failed: {e}");
            substream.reset();
            return;
        }
        Err(_) => {
            substream.reset();
            return;
        }
    };
    let Some(handler) = inner.handlers.get(&protocol) else {
        substream.reset();
        return;
    };
    let stream = Stream::new(
        substream,
        protocol,
        conn.remote_peer(),
        Arc::downgrade(&conn.inner),
        scope,
    );
    handler(stream).await;
}
