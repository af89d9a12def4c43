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

//! Composable, self-describing network addresses.

mod protocol;

pub use protocol::{
    Protocol, CODE_CERTHASH, CODE_DNS4, CODE_DNS6, CODE_DNSADDR, CODE_IP4, CODE_IP6, CODE_P2P,
    CODE_P2P_CIRCUIT, CODE_QUIC_V1, CODE_SNI, CODE_TCP, CODE_UDP, CODE_UDX, CODE_UNIX,
    CODE_WEBTRANSPORT,
};

use peerlink_identity::PeerId;
use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    str::FromStr,
};

/// An ordered sequence of [`Protocol`] components describing a network
/// address, e.g. `/ip4/127.0.0.1/tcp/4001/p2p/12D3Koo…`.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Multiaddr {
    components: Vec<Protocol>,
}

impl Multiaddr {
    /// The empty address.
    pub fn empty() -> Multiaddr {
        Multiaddr::default()
    }

    /// Parse an address from its binary representation.
    pub fn from_bytes(mut bytes: &[u8]) -> Result<Multiaddr, Error> {
        let mut components = Vec::new();
        while !bytes.is_empty() {
            let (proto, rest) = Protocol::read_bytes(bytes)?;
            components.push(proto);
            bytes = rest;
        }
        Ok(Multiaddr { components })
    }

    /// The binary representation.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32);
        for proto in &self.components {
            proto.write_bytes(&mut out);
        }
        out
    }

    /// Iterate over the components.
    pub fn iter(&self) -> impl Iterator<Item = &Protocol> {
        self.components.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    /// Append a component.
    pub fn push(&mut self, proto: Protocol) {
        self.components.push(proto);
    }

    /// Return a copy with `proto` appended.
    #[must_use]
    pub fn with(mut self, proto: Protocol) -> Multiaddr {
        self.push(proto);
        self
    }

    /// Append all components of `suffix`.
    #[must_use]
    pub fn encapsulate(mut self, suffix: &Multiaddr) -> Multiaddr {
        self.components.extend(suffix.components.iter().cloned());
        self
    }

    /// Remove the last occurrence of the component with code `code` and
    /// everything following it. Returns whether anything was removed.
    pub fn decapsulate_code(&mut self, code: u64) -> bool {
        if let Some(i) = self.components.iter().rposition(|p| p.code() == code) {
            self.components.truncate(i);
            true
        } else {
            false
        }
    }

    /// Whether any component has code `code`.
    pub fn has(&self, code: u64) -> bool {
        self.components.iter().any(|p| p.code() == code)
    }

    /// The string value of the first component with code `code`. Absent,
    /// not empty, when the address has no such component or the component
    /// carries no value.
    pub fn value_for(&self, code: u64) -> Option<String> {
        self.components
            .iter()
            .find(|p| p.code() == code)
            .and_then(|p| p.value())
    }

    /// The first IP component, if any.
    pub fn ip(&self) -> Option<IpAddr> {
        self.components.iter().find_map(|p| match p {
            Protocol::Ip4(a) => Some(IpAddr::V4(*a)),
            Protocol::Ip6(a) => Some(IpAddr::V6(*a)),
            _ => None,
        })
    }

    /// The trailing `/p2p/<id>` component, if the address ends in one.
    pub fn peer_id(&self) -> Option<PeerId> {
        match self.components.last() {
            Some(Protocol::P2p(peer)) => Some(*peer),
            _ => None,
        }
    }

    /// Split a trailing `/p2p/<id>` component off the address.
    pub fn split_peer_suffix(&self) -> (Multiaddr, Option<PeerId>) {
        match self.components.last() {
            Some(Protocol::P2p(peer)) => {
                let peer = *peer;
                let mut addr = self.clone();
                addr.components.pop();
                (addr, Some(peer))
            }
            _ => (self.clone(), None),
        }
    }

    /// Return a copy that ends in `/p2p/<peer>`, appending the component if
    /// it is not already present.
    #[must_use]
    pub fn with_peer(self, peer: PeerId) -> Multiaddr {
        if self.peer_id() == Some(peer) {
            self
        } else {
            self.with(Protocol::P2p(peer))
        }
    }

    /// Whether this is a circuit-relay address.
    pub fn is_circuit(&self) -> bool {
        self.has(protocol::CODE_P2P_CIRCUIT)
    }

    /// The relay peer of a circuit address: the `/p2p/` component directly
    /// preceding `/p2p-circuit`. `None` for non-circuit addresses and for
    /// generic `/p2p-circuit` addresses that do not name their relay.
    pub fn relay_peer(&self) -> Option<PeerId> {
        let circuit = self
            .components
            .iter()
            .position(|p| matches!(p, Protocol::P2pCircuit))?;
        match circuit.checked_sub(1).map(|i| &self.components[i]) {
            Some(Protocol::P2p(peer)) => Some(*peer),
            _ => None,
        }
    }

    /// The destination peer of a circuit address: the `/p2p/` component
    /// following `/p2p-circuit`, if present.
    pub fn circuit_dst_peer(&self) -> Option<PeerId> {
        let circuit = self
            .components
            .iter()
            .position(|p| matches!(p, Protocol::P2pCircuit))?;
        self.components[circuit + 1..].iter().find_map(|p| match p {
            Protocol::P2p(peer) => Some(*peer),
            _ => None,
        })
    }

    /// The deduplication key for circuit dials: relay peer and destination
    /// peer. Addresses sharing a route key reach the same relay session, so
    /// only one of them should be dialed. Generic circuit addresses have no
    /// route key and are raced individually, last.
    pub fn circuit_route_key(&self, dst_hint: Option<PeerId>) -> Option<(PeerId, PeerId)> {
        let relay = self.relay_peer()?;
        let dst = self.circuit_dst_peer().or(dst_hint)?;
        Some((relay, dst))
    }

    /// The address up to and including `/p2p-circuit`, i.e. the relay part
    /// a circuit dial must reach first.
    pub fn circuit_relay_addr(&self) -> Option<Multiaddr> {
        let circuit = self
            .components
            .iter()
            .position(|p| matches!(p, Protocol::P2pCircuit))?;
        Some(Multiaddr {
            components: self.components[..circuit].to_vec(),
        })
    }

    /// Whether the address points at a loopback interface.
    pub fn is_loopback(&self) -> bool {
        match self.ip() {
            Some(ip) => ip.is_loopback(),
            None => false,
        }
    }

    /// Whether the address is in a private or otherwise non-routable range.
    pub fn is_private(&self) -> bool {
        match self.ip() {
            Some(IpAddr::V4(a)) => {
                a.is_private() || a.is_loopback() || a.is_link_local() || a.is_unspecified()
            }
            Some(IpAddr::V6(a)) => {
                a.is_loopback()
                    || a.is_unspecified()
                    || is_ipv6_link_local(&a)
                    || is_ipv6_unique_local(&a)
            }
            None => false,
        }
    }

    /// Whether the address is a globally routable direct address.
    pub fn is_public(&self) -> bool {
        !self.is_circuit() && self.ip().is_some() && !self.is_private()
    }

    /// The /64 prefix of the first IPv6 component. Distinct addresses within
    /// one /64 typically reach the same host, so dial schedules deduplicate
    /// on it.
    pub fn ipv6_prefix64(&self) -> Option<[u8; 8]> {
        self.components.iter().find_map(|p| match p {
            Protocol::Ip6(a) => {
                let mut prefix = [0u8; 8];
                prefix.copy_from_slice(&a.octets()[..8]);
                Some(prefix)
            }
            _ => None,
        })
    }

    /// Classify the address for dial ranking.
    pub fn class(&self) -> AddressClass {
        if self.is_circuit() {
            return if self.relay_peer().is_some() {
                AddressClass::RelaySpecific
            } else {
                AddressClass::RelayGeneric
            };
        }
        match self.ip() {
            Some(IpAddr::V6(a)) => {
                if a.is_loopback() || is_ipv6_link_local(&a) || is_ipv6_unique_local(&a) {
                    AddressClass::DirectIp6LinkLocal
                } else {
                    AddressClass::DirectIp6Public
                }
            }
            Some(IpAddr::V4(_)) => {
                if self.is_private() {
                    AddressClass::DirectIp4Private
                } else {
                    AddressClass::DirectIp4Public
                }
            }
            // Name-based addresses resolve out of band and rank with the
            // public direct ones.
            None => {
                if self.has(protocol::CODE_DNS6) {
                    AddressClass::DirectIp6Public
                } else {
                    AddressClass::DirectIp4Public
                }
            }
        }
    }
}

fn is_ipv6_link_local(a: &Ipv6Addr) -> bool {
    (a.segments()[0] & 0xffc0) == 0xfe80
}

fn is_ipv6_unique_local(a: &Ipv6Addr) -> bool {
    (a.segments()[0] & 0xfe00) == 0xfc00
}

/// Dial-ranking classes, ordered by preference.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AddressClass {
    DirectIp6Public,
    DirectIp4Public,
    DirectIp6LinkLocal,
    DirectIp4Private,
    RelaySpecific,
    RelayGeneric,
}

impl AddressClass {
    pub fn is_relay(&self) -> bool {
        matches!(self, AddressClass::RelaySpecific | AddressClass::RelayGeneric)
    }
}

impl FromStr for Multiaddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Multiaddr, Error> {
        if s.is_empty() {
            return Ok(Multiaddr::empty());
        }
        let mut parts = s.split('/');
        if parts.next() != Some("") {
            return Err(Error::MissingSlash);
        }
        let mut components = Vec::new();
        while let Some(tag) = parts.next() {
            if tag.is_empty() {
                return Err(Error::MissingSlash);
            }
            components.push(Protocol::from_parts(tag, &mut parts)?);
        }
        Ok(Multiaddr { components })
    }
}

impl fmt::Display for Multiaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for proto in &self.components {
            fmt::Display::fmt(proto, f)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Multiaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl FromIterator<Protocol> for Multiaddr {
    fn from_iter<T: IntoIterator<Item = Protocol>>(iter: T) -> Multiaddr {
        Multiaddr {
            components: iter.into_iter().collect(),
        }
    }
}

impl From<Protocol> for Multiaddr {
    fn from(proto: Protocol) -> Multiaddr {
        Multiaddr {
            components: vec![proto],
        }
    }
}

impl From<IpAddr> for Multiaddr {
    fn from(ip: IpAddr) -> Multiaddr {
        match ip {
            IpAddr::V4(a) => Protocol::Ip4(a).into(),
            IpAddr::V6(a) => Protocol::Ip6(a).into(),
        }
    }
}

impl From<Ipv4Addr> for Multiaddr {
    fn from(a: Ipv4Addr) -> Multiaddr {
        Protocol::Ip4(a).into()
    }
}

/// Errors when parsing a multiaddr.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("multiaddr must begin with '/'")]
    MissingSlash,
    #[error("component is missing its value")]
    MissingValue,
    #[error("invalid component value")]
    InvalidValue,
    #[error("unknown protocol '{0}'")]
    UnknownProtocol(String),
    #[error("unknown protocol code {0}")]
    UnknownProtocolCode(u64),
    #[error("invalid binary representation")]
    InvalidBytes,
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::{Arbitrary, Gen};

    fn ma(s: &str) -> Multiaddr {
        s.parse().unwrap()
    }

    #[derive(Clone, Debug)]
    struct Ma(Multiaddr);

    impl Arbitrary for Ma {
        fn arbitrary(g: &mut Gen) -> Ma {
            let len = usize::arbitrary(g) % 4;
            let components = (0..len)
                .map(|_| {
                    match u8::arbitrary(g) % 9 {
                        0 => Protocol::Ip4(Ipv4Addr::from(u32::arbitrary(g))),
                        1 => Protocol::Ip6(Ipv6Addr::from(u128::arbitrary(g))),
                        2 => Protocol::Tcp(u16::arbitrary(g)),
                        3 => Protocol::Udp(u16::arbitrary(g)),
                        4 => Protocol::Udx(u16::arbitrary(g)),
                        5 => Protocol::Dns4("example.com".into()),
                        6 => Protocol::P2p(peerlink_identity::PeerId::random()),
                        7 => Protocol::P2pCircuit,
                        _ => Protocol::QuicV1,
                    }
                })
                .collect();
            Ma(Multiaddr { components })
        }
    }

    quickcheck::quickcheck! {
        fn string_roundtrip(addr: Ma) -> bool {
            addr.0.to_string().parse::<Multiaddr>().unwrap() == addr.0
        }

        fn bytes_roundtrip(addr: Ma) -> bool {
            Multiaddr::from_bytes(&addr.0.to_bytes()).unwrap() == addr.0
        }
    }

    #[test]
    fn parse_basic() {
        let addr = ma("/ip4/127.0.0.1/tcp/4001");
        assert_eq!(addr.len(), 2);
        assert_eq!(addr.value_for(protocol::CODE_TCP), Some("4001".into()));
        assert_eq!(addr.value_for(protocol::CODE_UDP), None);
        assert!(addr.is_loopback());
    }

    #[test]
    fn zone_suffix_stripped() {
        let addr = ma("/ip6/fe80::1%eth0/tcp/4001");
        assert_eq!(addr.to_string(), "/ip6/fe80::1/tcp/4001");
    }

    #[test]
    fn peer_suffix() {
        let peer = PeerId::random();
        let addr = ma("/ip4/1.2.3.4/tcp/1").with_peer(peer);
        assert_eq!(addr.peer_id(), Some(peer));
        let (base, found) = addr.split_peer_suffix();
        assert_eq!(found, Some(peer));
        assert_eq!(base, ma("/ip4/1.2.3.4/tcp/1"));
        // Appending the same peer again is a no-op.
        assert_eq!(base.with_peer(peer).with_peer(peer).len(), 3);
    }

    #[test]
    fn classification() {
        assert_eq!(ma("/ip4/8.8.8.8/tcp/1").class(), AddressClass::DirectIp4Public);
        assert_eq!(
            ma("/ip4/192.168.1.4/tcp/1").class(),
            AddressClass::DirectIp4Private
        );
        assert_eq!(
            ma("/ip6/2001:db8::1/tcp/1").class(),
            AddressClass::DirectIp6Public
        );
        assert_eq!(
            ma("/ip6/fe80::1/tcp/1").class(),
            AddressClass::DirectIp6LinkLocal
        );
        assert_eq!(ma("/dns4/example.com/tcp/1").class(), AddressClass::DirectIp4Public);
        // Ranking order.
        assert!(AddressClass::DirectIp6Public < AddressClass::DirectIp4Public);
        assert!(AddressClass::DirectIp4Private < AddressClass::RelaySpecific);
        assert!(AddressClass::RelaySpecific < AddressClass::RelayGeneric);
    }

    #[test]
    fn circuit_addresses() {
        let relay = PeerId::random();
        let dst = PeerId::random();
        let addr: Multiaddr = format!("/ip4/9.9.9.9/tcp/443/p2p/{relay}/p2p-circuit/p2p/{dst}")
            .parse()
            .unwrap();
        assert!(addr.is_circuit());
        assert_eq!(addr.class(), AddressClass::RelaySpecific);
        assert_eq!(addr.relay_peer(), Some(relay));
        assert_eq!(addr.circuit_dst_peer(), Some(dst));
        assert_eq!(addr.circuit_route_key(None), Some((relay, dst)));
        assert_eq!(
            addr.circuit_relay_addr().unwrap().to_string(),
            format!("/ip4/9.9.9.9/tcp/443/p2p/{relay}")
        );

        let generic = ma("/p2p-circuit");
        assert_eq!(generic.class(), AddressClass::RelayGeneric);
        assert_eq!(generic.circuit_route_key(Some(dst)), None);
    }

    #[test]
    fn decapsulate() {
        let mut addr = ma("/ip4/1.2.3.4/tcp/1/p2p-circuit/tcp/2");
        assert!(addr.decapsulate_code(protocol::CODE_P2P_CIRCUIT));
        assert_eq!(addr, ma("/ip4/1.2.3.4/tcp/1"));
        assert!(!addr.decapsulate_code(protocol::CODE_P2P_CIRCUIT));
    }

    #[test]
    fn ipv6_prefix() {
        let addr = ma("/ip6/2001:db8:1:2:3:4:5:6/tcp/1");
        assert_eq!(
            addr.ipv6_prefix64(),
            Some([0x20, 0x01, 0x0d, 0xb8, 0x00, 0x01, 0x00, 0x02])
        );
        assert_eq!(ma("/ip4/1.2.3.4/tcp/1").ipv6_prefix64(), None);
    }

    #[test]
    fn udx_and_quic_parse() {
        assert_eq!(ma("/ip4/1.2.3.4/udp/5/quic-v1").to_string(), "/ip4/1.2.3.4/udp/5/quic-v1");
        assert_eq!(ma("/ip4/1.2.3.4/udx/5").to_string(), "/ip4/1.2.3.4/udx/5");
    }
}
