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

//! The peer store: TTL'd books mapping peers to addresses, keys, supported
//! protocols and signed peer records.

use crate::{signed_record::SignedEnvelope, Multiaddr};
use parking_lot::Mutex;
use peerlink_identity::{PeerId, PublicKey};
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

/// TTL for addresses learned in passing (e.g. an unconfirmed observed
/// address).
pub const TEMP_ADDR_TTL: Duration = Duration::from_secs(2 * 60);
/// TTL for addresses of peers we have recently been connected to.
pub const RECENT_ADDR_TTL: Duration = Duration::from_secs(30 * 60);
/// TTL for addresses configured explicitly (static relays, bootstrap).
pub const PERMANENT_ADDR_TTL: Duration = Duration::from_secs(60 * 60 * 24 * 365);

const DEFAULT_MAX_PEERS: usize = 64 * 1024;

#[derive(Debug, Clone)]
struct AddrEntry {
    addr: Multiaddr,
    expiry: Instant,
}

#[derive(Default)]
struct PeerEntry {
    addrs: Vec<AddrEntry>,
    key: Option<PublicKey>,
    protocols: Vec<String>,
    signed_record: Option<SignedEnvelope>,
    /// Number of live connections referencing the peer. Non-zero pins the
    /// entry past address expiry.
    pins: usize,
}

impl PeerEntry {
    fn latest_expiry(&self) -> Option<Instant> {
        self.addrs.iter().map(|a| a.expiry).max()
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.pins == 0 && self.addrs.iter().all(|a| a.expiry <= now)
    }
}

/// A shared handle to the peer store. Cheap to clone.
#[derive(Clone)]
pub struct PeerStore {
    inner: Arc<Mutex<Books>>,
}

struct Books {
    peers: HashMap<PeerId, PeerEntry>,
    max_peers: usize,
}

impl Default for PeerStore {
    fn default() -> Self {
        PeerStore::new(DEFAULT_MAX_PEERS)
    }
}

impl PeerStore {
    pub fn new(max_peers: usize) -> PeerStore {
        PeerStore {
            inner: Arc::new(Mutex::new(Books {
                peers: HashMap::new(),
                max_peers,
            })),
        }
    }

    /// Add addresses for `peer`, valid for `ttl`. An address already in the
    /// book keeps the larger of its current and the new expiry.
    pub fn add_addrs(&self, peer: PeerId, addrs: impl IntoIterator<Item = Multiaddr>, ttl: Duration) {
        let now = Instant::now();
        let expiry = now + ttl;
        let mut books = self.inner.lock();
        if !books.ensure_entry(peer, now) {
            return;
        }
        let entry = books.peers.entry(peer).or_default();
        for addr in addrs {
            let addr = strip_self_suffix(addr, peer);
            match entry.addrs.iter_mut().find(|e| e.addr == addr) {
                Some(existing) => existing.expiry = existing.expiry.max(expiry),
                None => entry.addrs.push(AddrEntry { addr, expiry }),
            }
        }
    }

    /// Replace the addresses (and their TTLs) recorded for `peer`.
    pub fn set_addrs(&self, peer: PeerId, addrs: impl IntoIterator<Item = Multiaddr>, ttl: Duration) {
        let now = Instant::now();
        let expiry = now + ttl;
        let mut books = self.inner.lock();
        if !books.ensure_entry(peer, now) {
            return;
        }
        let entry = books.peers.entry(peer).or_default();
        entry.addrs = addrs
            .into_iter()
            .map(|addr| AddrEntry {
                addr: strip_self_suffix(addr, peer),
                expiry,
            })
            .collect();
    }

    /// Forget all addresses of `peer` (a TTL of zero).
    pub fn clear_addrs(&self, peer: &PeerId) {
        let mut books = self.inner.lock();
        if let Some(entry) = books.peers.get_mut(peer) {
            entry.addrs.clear();
            entry.signed_record = None;
        }
    }

    /// The non-expired addresses of `peer`.
    pub fn addrs(&self, peer: &PeerId) -> Vec<Multiaddr> {
        let now = Instant::now();
        self.inner
            .lock()
            .peers
            .get(peer)
            .map(|e| {
                e.addrs
                    .iter()
                    .filter(|a| a.expiry > now)
                    .map(|a| a.addr.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn set_key(&self, peer: PeerId, key: PublicKey) {
        let now = Instant::now();
        let mut books = self.inner.lock();
        if !books.ensure_entry(peer, now) {
            return;
        }
        books.peers.entry(peer).or_default().key = Some(key);
    }

    pub fn key(&self, peer: &PeerId) -> Option<PublicKey> {
        self.inner.lock().peers.get(peer).and_then(|e| e.key.clone())
    }

    /// Record the protocols `peer` advertises, replacing earlier knowledge.
    pub fn set_protocols(&self, peer: PeerId, protocols: Vec<String>) {
        let now = Instant::now();
        let mut books = self.inner.lock();
        if !books.ensure_entry(peer, now) {
            return;
        }
        books.peers.entry(peer).or_default().protocols = protocols;
    }

    pub fn protocols(&self, peer: &PeerId) -> Vec<String> {
        self.inner
            .lock()
            .peers
            .get(peer)
            .map(|e| e.protocols.clone())
            .unwrap_or_default()
    }

    /// The first of `protocols` the peer is known to support.
    pub fn first_supported(&self, peer: &PeerId, protocols: &[String]) -> Option<String> {
        let books = self.inner.lock();
        let known = &books.peers.get(peer)?.protocols;
        protocols.iter().find(|p| known.contains(p)).cloned()
    }

    /// Attach a signed peer record. Kept as long as any address for the
    /// peer remains.
    pub fn set_signed_record(&self, peer: PeerId, record: SignedEnvelope) {
        let now = Instant::now();
        let mut books = self.inner.lock();
        if !books.ensure_entry(peer, now) {
            return;
        }
        books.peers.entry(peer).or_default().signed_record = Some(record);
    }

    pub fn signed_record(&self, peer: &PeerId) -> Option<SignedEnvelope> {
        self.inner
            .lock()
            .peers
            .get(peer)
            .and_then(|e| e.signed_record.clone())
    }

    /// Mark a live connection to `peer`; pinned peers survive address expiry.
    pub fn pin(&self, peer: PeerId) {
        let mut books = self.inner.lock();
        books.peers.entry(peer).or_default().pins += 1;
    }

    pub fn unpin(&self, peer: &PeerId) {
        let mut books = self.inner.lock();
        if let Some(entry) = books.peers.get_mut(peer) {
            entry.pins = entry.pins.saturating_sub(1);
        }
    }

    /// All peers with at least one live address.
    pub fn peers_with_addrs(&self) -> Vec<PeerId> {
        let now = Instant::now();
        self.inner
            .lock()
            .peers
            .iter()
            .filter(|(_, e)| e.addrs.iter().any(|a| a.expiry > now))
            .map(|(p, _)| *p)
            .collect()
    }

    /// Drop expired addresses and entries nobody references anymore.
    pub fn gc(&self) {
        let now = Instant::now();
        let mut books = self.inner.lock();
        books.peers.retain(|_, entry| {
            entry.addrs.retain(|a| a.expiry > now);
            if entry.addrs.is_empty() {
                // Signed records only live as long as some address does.
                entry.signed_record = None;
            }
            entry.pins > 0 || !entry.addrs.is_empty() || entry.key.is_some()
        });
    }
}

impl Books {
    /// Make room for a new entry, evicting the peer whose addresses expire
    /// soonest. Returns false when the write must be dropped.
    fn ensure_entry(&mut self, peer: PeerId, now: Instant) -> bool {
        if self.peers.contains_key(&peer) || self.peers.len() < self.max_peers {
            return true;
        }
        let victim = self
            .peers
            .iter()
            .filter(|(_, e)| e.pins == 0)
            .min_by_key(|(_, e)| e.latest_expiry().unwrap_or(now))
            .map(|(p, _)| *p);
        match victim {
            Some(victim) => {
                log::debug!("peer store full, evicting {victim}");
                self.peers.remove(&victim);
                true
            }
            // Every entry is pinned by a live connection: drop the write.
            None => false,
        }
    }
}

/// Book entries never carry the peer's own `/p2p/` suffix.
fn strip_self_suffix(addr: Multiaddr, peer: PeerId) -> Multiaddr {
    match addr.split_peer_suffix() {
        (base, Some(p)) if p == peer => base,
        _ => addr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ma(s: &str) -> Multiaddr {
        s.parse().unwrap()
    }

    #[test]
    fn add_extends_ttl_to_max() {
        let store = PeerStore::default();
        let peer = PeerId::random();
        let addr = ma("/ip4/1.2.3.4/tcp/1");
        store.add_addrs(peer, [addr.clone()], Duration::from_secs(100));
        // A shorter TTL for a known address must not shorten its lifetime.
        store.add_addrs(peer, [addr.clone()], Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(store.addrs(&peer), vec![addr]);
    }

    #[test]
    fn set_replaces_ttl() {
        let store = PeerStore::default();
        let peer = PeerId::random();
        let addr = ma("/ip4/1.2.3.4/tcp/1");
        store.add_addrs(peer, [addr.clone()], Duration::from_secs(100));
        store.set_addrs(peer, [addr], Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        assert!(store.addrs(&peer).is_empty());
    }

    #[test]
    fn clear_is_ttl_zero() {
        let store = PeerStore::default();
        let peer = PeerId::random();
        store.add_addrs(peer, [ma("/ip4/1.2.3.4/tcp/1")], Duration::from_secs(100));
        store.clear_addrs(&peer);
        assert!(store.addrs(&peer).is_empty());
    }

    #[test]
    fn gc_drops_expired_unpinned() {
        let store = PeerStore::default();
        let peer = PeerId::random();
        store.add_addrs(peer, [ma("/ip4/1.2.3.4/tcp/1")], Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        store.gc();
        assert!(store.peers_with_addrs().is_empty());
    }

    #[test]
    fn pinned_peer_survives_gc() {
        let store = PeerStore::default();
        let peer = PeerId::random();
        store.add_addrs(peer, [ma("/ip4/1.2.3.4/tcp/1")], Duration::from_millis(1));
        store.pin(peer);
        std::thread::sleep(Duration::from_millis(5));
        store.gc();
        store.set_protocols(peer, vec!["/x/1".into()]);
        assert_eq!(store.protocols(&peer), vec!["/x/1".to_string()]);
    }

    #[test]
    fn eviction_prefers_oldest_expiring() {
        let store = PeerStore::new(2);
        let a = PeerId::random();
        let b = PeerId::random();
        let c = PeerId::random();
        store.add_addrs(a, [ma("/ip4/1.1.1.1/tcp/1")], Duration::from_secs(10));
        store.add_addrs(b, [ma("/ip4/2.2.2.2/tcp/1")], Duration::from_secs(1000));
        store.add_addrs(c, [ma("/ip4/3.3.3.3/tcp/1")], Duration::from_secs(500));
        assert!(store.addrs(&a).is_empty());
        assert!(!store.addrs(&b).is_empty());
        assert!(!store.addrs(&c).is_empty());
    }

    #[test]
    fn own_suffix_stripped() {
        let store = PeerStore::default();
        let peer = PeerId::random();
        let addr = ma("/ip4/1.2.3.4/tcp/1").with_peer(peer);
        store.add_addrs(peer, [addr], Duration::from_secs(10));
        assert_eq!(store.addrs(&peer), vec![ma("/ip4/1.2.3.4/tcp/1")]);
    }
}
