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

//! Scoped resource accounting: system → transient → peer → connection →
//! stream. Scopes are RAII guards; dropping a guard releases what it
//! reserved. A failed reservation surfaces as [`ResourceLimitExceeded`].

use parking_lot::Mutex;
use peerlink_identity::PeerId;
use std::{collections::HashMap, sync::Arc};

/// Reservation caps. `usize::MAX` disables a cap.
#[derive(Clone, Copy, Debug)]
pub struct ResourceLimits {
    pub max_connections: usize,
    /// Connections not yet attributed to a peer (mid-upgrade).
    pub max_transient_connections: usize,
    pub max_connections_per_peer: usize,
    pub max_streams: usize,
    pub max_streams_per_peer: usize,
    pub max_memory: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        ResourceLimits {
            max_connections: 1024,
            max_transient_connections: 256,
            max_connections_per_peer: 8,
            max_streams: 16 * 1024,
            max_streams_per_peer: 512,
            max_memory: 256 * 1024 * 1024,
        }
    }
}

/// The resource reservation failed at the named scope.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("resource limit exceeded in {scope} scope: {what}")]
pub struct ResourceLimitExceeded {
    pub scope: &'static str,
    pub what: &'static str,
}

#[derive(Default)]
struct Counters {
    connections: usize,
    transient_connections: usize,
    streams: usize,
    memory: usize,
    peers: HashMap<PeerId, PeerCounters>,
}

#[derive(Default)]
struct PeerCounters {
    connections: usize,
    streams: usize,
}

struct Inner {
    limits: ResourceLimits,
    counters: Mutex<Counters>,
}

/// Tracks resource usage per scope. Cheap to clone.
#[derive(Clone)]
pub struct ResourceManager {
    inner: Arc<Inner>,
}

impl Default for ResourceManager {
    fn default() -> Self {
        ResourceManager::new(ResourceLimits::default())
    }
}

impl ResourceManager {
    pub fn new(limits: ResourceLimits) -> ResourceManager {
        ResourceManager {
            inner: Arc::new(Inner {
                limits,
                counters: Mutex::new(Counters::default()),
            }),
        }
    }

    /// Reserve room for a new, not yet peer-attributed connection.
    pub fn open_connection(&self) -> Result<ConnectionScope, ResourceLimitExceeded> {
        let limits = &self.inner.limits;
        let mut c = self.inner.counters.lock();
        if c.connections >= limits.max_connections {
            return Err(ResourceLimitExceeded {
                scope: "system",
                what: "connections",
            });
        }
        if c.transient_connections >= limits.max_transient_connections {
            return Err(ResourceLimitExceeded {
                scope: "transient",
                what: "connections",
            });
        }
        c.connections += 1;
        c.transient_connections += 1;
        Ok(ConnectionScope {
            mgr: self.clone(),
            peer: Mutex::new(None),
            memory: Mutex::new(0),
        })
    }

    pub fn connections(&self) -> usize {
        self.inner.counters.lock().connections
    }

    pub fn streams(&self) -> usize {
        self.inner.counters.lock().streams
    }
}

/// Accounting scope of one connection.
pub struct ConnectionScope {
    mgr: ResourceManager,
    peer: Mutex<Option<PeerId>>,
    memory: Mutex<usize>,
}

impl ConnectionScope {
    /// Attribute the connection to `peer`, moving it out of the transient
    /// scope. Called once the security handshake identified the remote.
    pub fn assign_peer(&self, peer: PeerId) -> Result<(), ResourceLimitExceeded> {
        let mut slot = self.peer.lock();
        if slot.is_some() {
            return Ok(());
        }
        let limits = &self.mgr.inner.limits;
        let mut c = self.mgr.inner.counters.lock();
        let per_peer = c.peers.entry(peer).or_default();
        if per_peer.connections >= limits.max_connections_per_peer {
            return Err(ResourceLimitExceeded {
                scope: "peer",
                what: "connections",
            });
        }
        per_peer.connections += 1;
        c.transient_connections = c.transient_connections.saturating_sub(1);
        *slot = Some(peer);
        Ok(())
    }

    /// Reserve room for one stream on this connection.
    pub fn open_stream(&self) -> Result<StreamScope, ResourceLimitExceeded> {
        let limits = &self.mgr.inner.limits;
        let peer = *self.peer.lock();
        let mut c = self.mgr.inner.counters.lock();
        if c.streams >= limits.max_streams {
            return Err(ResourceLimitExceeded {
                scope: "system",
                what: "streams",
            });
        }
        if let Some(peer) = peer {
            let per_peer = c.peers.entry(peer).or_default();
            if per_peer.streams >= limits.max_streams_per_peer {
                return Err(ResourceLimitExceeded {
                    scope: "peer",
                    what: "streams",
                });
            }
            per_peer.streams += 1;
        }
        c.streams += 1;
        Ok(StreamScope {
            mgr: self.mgr.clone(),
            peer,
        })
    }

    /// Grow this connection's memory reservation by `bytes`.
    pub fn reserve_memory(&self, bytes: usize) -> Result<(), ResourceLimitExceeded> {
        let limits = &self.mgr.inner.limits;
        let mut c = self.mgr.inner.counters.lock();
        if c.memory.saturating_add(bytes) > limits.max_memory {
            return Err(ResourceLimitExceeded {
                scope: "system",
                what: "memory",
            });
        }
        c.memory += bytes;
        *self.memory.lock() += bytes;
        Ok(())
    }
}

impl Drop for ConnectionScope {
    fn drop(&mut self) {
        let peer = *self.peer.lock();
        let memory = *self.memory.lock();
        let mut c = self.mgr.inner.counters.lock();
        c.connections = c.connections.saturating_sub(1);
        c.memory = c.memory.saturating_sub(memory);
        match peer {
            Some(peer) => {
                if let Some(per_peer) = c.peers.get_mut(&peer) {
                    per_peer.connections = per_peer.connections.saturating_sub(1);
                    if per_peer.connections == 0 && per_peer.streams == 0 {
                        c.peers.remove(&peer);
                    }
                }
            }
            None => c.transient_connections = c.transient_connections.saturating_sub(1),
        }
    }
}

/// Accounting scope of one stream.
pub struct StreamScope {
    mgr: ResourceManager,
    peer: Option<PeerId>,
}

impl Drop for StreamScope {
    fn drop(&mut self) {
        let mut c = self.mgr.inner.counters.lock();
        c.streams = c.streams.saturating_sub(1);
        if let Some(peer) = self.peer {
            if let Some(per_peer) = c.peers.get_mut(&peer) {
                per_peer.streams = per_peer.streams.saturating_sub(1);
                if per_peer.connections == 0 && per_peer.streams == 0 {
                    c.peers.remove(&peer);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_caps_enforced() {
        let mgr = ResourceManager::new(ResourceLimits {
            max_connections: 2,
            ..Default::default()
        });
        let _a = mgr.open_connection().unwrap();
        let _b = mgr.open_connection().unwrap();
        assert!(mgr.open_connection().is_err());
        drop(_a);
        assert!(mgr.open_connection().is_ok());
    }

    #[test]
    fn per_peer_caps_enforced() {
        let mgr = ResourceManager::new(ResourceLimits {
            max_connections_per_peer: 1,
            ..Default::default()
        });
        let peer = PeerId::random();
        let a = mgr.open_connection().unwrap();
        a.assign_peer(peer).unwrap();
        let b = mgr.open_connection().unwrap();
        assert_eq!(
            b.assign_peer(peer).unwrap_err().scope,
            "peer"
        );
    }

    #[test]
    fn stream_release_on_drop() {
        let mgr = ResourceManager::default();
        let conn = mgr.open_connection().unwrap();
        conn.assign_peer(PeerId::random()).unwrap();
        let s = conn.open_stream().unwrap();
        assert_eq!(mgr.streams(), 1);
        drop(s);
        assert_eq!(mgr.streams(), 0);
    }
}
