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

//! The single components a multiaddr is composed of.

use super::Error;
use peerlink_identity::PeerId;
use std::{
    fmt,
    net::{Ipv4Addr, Ipv6Addr},
};

// Multicodec protocol numbers.
pub const CODE_IP4: u64 = 4;
pub const CODE_TCP: u64 = 6;
pub const CODE_IP6: u64 = 41;
pub const CODE_DNS4: u64 = 54;
pub const CODE_DNS6: u64 = 55;
pub const CODE_DNSADDR: u64 = 56;
pub const CODE_UDP: u64 = 273;
pub const CODE_P2P_CIRCUIT: u64 = 290;
pub const CODE_UDX: u64 = 301;
pub const CODE_UNIX: u64 = 400;
pub const CODE_P2P: u64 = 421;
pub const CODE_SNI: u64 = 448;
pub const CODE_QUIC_V1: u64 = 461;
pub const CODE_WEBTRANSPORT: u64 = 465;
pub const CODE_CERTHASH: u64 = 466;

/// A single typed component of a [`Multiaddr`](super::Multiaddr).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Protocol {
    Ip4(Ipv4Addr),
    Ip6(Ipv6Addr),
    Tcp(u16),
    Udp(u16),
    /// UDX session port, carried over UDP.
    Udx(u16),
    Dns4(String),
    Dns6(String),
    Dnsaddr(String),
    P2p(PeerId),
    P2pCircuit,
    Unix(String),
    /// Multihash of a TLS certificate, as used by webtransport.
    Certhash(Vec<u8>),
    Sni(String),
    QuicV1,
    Webtransport,
}

impl Protocol {
    /// The multicodec number of this component.
    pub fn code(&self) -> u64 {
        match self {
            Protocol::Ip4(_) => CODE_IP4,
            Protocol::Ip6(_) => CODE_IP6,
            Protocol::Tcp(_) => CODE_TCP,
            Protocol::Udp(_) => CODE_UDP,
            Protocol::Udx(_) => CODE_UDX,
            Protocol::Dns4(_) => CODE_DNS4,
            Protocol::Dns6(_) => CODE_DNS6,
            Protocol::Dnsaddr(_) => CODE_DNSADDR,
            Protocol::P2p(_) => CODE_P2P,
            Protocol::P2pCircuit => CODE_P2P_CIRCUIT,
            Protocol::Unix(_) => CODE_UNIX,
            Protocol::Certhash(_) => CODE_CERTHASH,
            Protocol::Sni(_) => CODE_SNI,
            Protocol::QuicV1 => CODE_QUIC_V1,
            Protocol::Webtransport => CODE_WEBTRANSPORT,
        }
    }

    /// The name used in the string representation.
    pub fn tag(&self) -> &'static str {
        match self {
            Protocol::Ip4(_) => "ip4",
            Protocol::Ip6(_) => "ip6",
            Protocol::Tcp(_) => "tcp",
            Protocol::Udp(_) => "udp",
            Protocol::Udx(_) => "udx",
            Protocol::Dns4(_) => "dns4",
            Protocol::Dns6(_) => "dns6",
            Protocol::Dnsaddr(_) => "dnsaddr",
            Protocol::P2p(_) => "p2p",
            Protocol::P2pCircuit => "p2p-circuit",
            Protocol::Unix(_) => "unix",
            Protocol::Certhash(_) => "certhash",
            Protocol::Sni(_) => "sni",
            Protocol::QuicV1 => "quic-v1",
            Protocol::Webtransport => "webtransport",
        }
    }

    /// The value part of the string representation, if the component
    /// carries one.
    pub fn value(&self) -> Option<String> {
        match self {
            Protocol::Ip4(a) => Some(a.to_string()),
            Protocol::Ip6(a) => Some(a.to_string()),
            Protocol::Tcp(p) | Protocol::Udp(p) | Protocol::Udx(p) => Some(p.to_string()),
            Protocol::Dns4(h) | Protocol::Dns6(h) | Protocol::Dnsaddr(h) => Some(h.clone()),
            Protocol::P2p(p) => Some(p.to_base58()),
            Protocol::Unix(p) => Some(p.clone()),
            Protocol::Certhash(h) => Some(format!(
                "u{}",
                data_encoding::BASE64URL_NOPAD.encode(h)
            )),
            Protocol::Sni(s) => Some(s.clone()),
            Protocol::P2pCircuit | Protocol::QuicV1 | Protocol::Webtransport => None,
        }
    }

    /// Parse the component named `tag`, consuming a value from `parts` if
    /// the component requires one.
    pub(super) fn from_parts<'a>(
        tag: &str,
        parts: &mut impl Iterator<Item = &'a str>,
    ) -> Result<Protocol, Error> {
        let mut value = || parts.next().ok_or(Error::MissingValue);
        let proto = match tag {
            "ip4" => Protocol::Ip4(value()?.parse().map_err(|_| Error::InvalidValue)?),
            "ip6" => {
                // Zone suffixes (`%iface`) are dropped on parse.
                let v = value()?;
                let v = v.split('%').next().unwrap_or(v);
                Protocol::Ip6(v.parse().map_err(|_| Error::InvalidValue)?)
            }
            "tcp" => Protocol::Tcp(value()?.parse().map_err(|_| Error::InvalidValue)?),
            "udp" => Protocol::Udp(value()?.parse().map_err(|_| Error::InvalidValue)?),
            "udx" => Protocol::Udx(value()?.parse().map_err(|_| Error::InvalidValue)?),
            "dns4" => Protocol::Dns4(value()?.to_owned()),
            "dns6" => Protocol::Dns6(value()?.to_owned()),
            "dnsaddr" => Protocol::Dnsaddr(value()?.to_owned()),
            "p2p" | "ipfs" => {
                Protocol::P2p(value()?.parse().map_err(|_| Error::InvalidValue)?)
            }
            "p2p-circuit" => Protocol::P2pCircuit,
            "unix" => Protocol::Unix(value()?.to_owned()),
            "certhash" => {
                let v = value()?;
                let rest = v.strip_prefix('u').ok_or(Error::InvalidValue)?;
                let bytes = data_encoding::BASE64URL_NOPAD
                    .decode(rest.as_bytes())
                    .map_err(|_| Error::InvalidValue)?;
                Protocol::Certhash(bytes)
            }
            "sni" => Protocol::Sni(value()?.to_owned()),
            "quic-v1" => Protocol::QuicV1,
            "webtransport" => Protocol::Webtransport,
            other => return Err(Error::UnknownProtocol(other.to_owned())),
        };
        Ok(proto)
    }

    /// Append the binary representation (code and value) to `out`.
    pub(super) fn write_bytes(&self, out: &mut Vec<u8>) {
        let mut buf = unsigned_varint::encode::u64_buffer();
        out.extend_from_slice(unsigned_varint::encode::u64(self.code(), &mut buf));
        match self {
            Protocol::Ip4(a) => out.extend_from_slice(&a.octets()),
            Protocol::Ip6(a) => out.extend_from_slice(&a.octets()),
            Protocol::Tcp(p) | Protocol::Udp(p) | Protocol::Udx(p) => {
                out.extend_from_slice(&p.to_be_bytes())
            }
            Protocol::Dns4(h) | Protocol::Dns6(h) | Protocol::Dnsaddr(h) => {
                write_sized(out, h.as_bytes())
            }
            Protocol::P2p(p) => write_sized(out, &p.to_bytes()),
            Protocol::Unix(p) => write_sized(out, p.as_bytes()),
            Protocol::Certhash(h) => write_sized(out, h),
            Protocol::Sni(s) => write_sized(out, s.as_bytes()),
            Protocol::P2pCircuit | Protocol::QuicV1 | Protocol::Webtransport => {}
        }
    }

    /// Parse one component from the front of `bytes`, returning it together
    /// with the remainder.
    pub(super) fn read_bytes(bytes: &[u8]) -> Result<(Protocol, &[u8]), Error> {
        let (code, rest) =
            unsigned_varint::decode::u64(bytes).map_err(|_| Error::InvalidBytes)?;
        let fixed = |n: usize| -> Result<(&[u8], &[u8]), Error> {
            if rest.len() < n {
                return Err(Error::InvalidBytes);
            }
            Ok(rest.split_at(n))
        };
        let proto = match code {
            CODE_IP4 => {
                let (v, rest) = fixed(4)?;
                let octets: [u8; 4] = v.try_into().expect("split_at yields 4 bytes");
                return Ok((Protocol::Ip4(Ipv4Addr::from(octets)), rest));
            }
            CODE_IP6 => {
                let (v, rest) = fixed(16)?;
                let octets: [u8; 16] = v.try_into().expect("split_at yields 16 bytes");
                return Ok((Protocol::Ip6(Ipv6Addr::from(octets)), rest));
            }
            CODE_TCP | CODE_UDP | CODE_UDX => {
                let (v, rest) = fixed(2)?;
                let port = u16::from_be_bytes(v.try_into().expect("split_at yields 2 bytes"));
                let proto = match code {
                    CODE_TCP => Protocol::Tcp(port),
                    CODE_UDP => Protocol::Udp(port),
                    _ => Protocol::Udx(port),
                };
                return Ok((proto, rest));
            }
            CODE_DNS4 | CODE_DNS6 | CODE_DNSADDR | CODE_UNIX | CODE_SNI => {
                let (v, rest) = read_sized(rest)?;
                let s = std::str::from_utf8(v)
                    .map_err(|_| Error::InvalidBytes)?
                    .to_owned();
                let proto = match code {
                    CODE_DNS4 => Protocol::Dns4(s),
                    CODE_DNS6 => Protocol::Dns6(s),
                    CODE_DNSADDR => Protocol::Dnsaddr(s),
                    CODE_UNIX => Protocol::Unix(s),
                    _ => Protocol::Sni(s),
                };
                return Ok((proto, rest));
            }
            CODE_P2P => {
                let (v, rest) = read_sized(rest)?;
                let peer = PeerId::from_bytes(v).map_err(|_| Error::InvalidBytes)?;
                return Ok((Protocol::P2p(peer), rest));
            }
            CODE_CERTHASH => {
                let (v, rest) = read_sized(rest)?;
                return Ok((Protocol::Certhash(v.to_vec()), rest));
            }
            CODE_P2P_CIRCUIT => Protocol::P2pCircuit,
            CODE_QUIC_V1 => Protocol::QuicV1,
            CODE_WEBTRANSPORT => Protocol::Webtransport,
            _ => return Err(Error::UnknownProtocolCode(code)),
        };
        Ok((proto, rest))
    }
}

fn write_sized(out: &mut Vec<u8>, value: &[u8]) {
    let mut buf = unsigned_varint::encode::usize_buffer();
    out.extend_from_slice(unsigned_varint::encode::usize(value.len(), &mut buf));
    out.extend_from_slice(value);
}

fn read_sized(bytes: &[u8]) -> Result<(&[u8], &[u8]), Error> {
    let (len, rest) = unsigned_varint::decode::usize(bytes).map_err(|_| Error::InvalidBytes)?;
    if rest.len() < len {
        return Err(Error::InvalidBytes);
    }
    Ok(rest.split_at(len))
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.tag())?;
        if let Some(value) = self.value() {
            write!(f, "/{value}")?;
        }
        Ok(())
    }
}
