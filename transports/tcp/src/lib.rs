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

//! TCP byte pipes for `/ip4`, `/ip6`, `/dns4` and `/dns6` multiaddrs.

use async_trait::async_trait;
use peerlink_core::{
    io::BoxPipe,
    transport::{BoxListener, Listener, Transport, TransportError},
    Multiaddr, Protocol,
};
use std::net::{IpAddr, SocketAddr};
use tokio::net::{TcpListener, TcpStream};

/// The TCP transport. Stateless: every dial opens a fresh socket.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> TcpTransport {
        TcpTransport
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn can_dial(&self, addr: &Multiaddr) -> bool {
        host_and_port(addr).is_some()
    }

    async fn dial(&self, addr: &Multiaddr) -> Result<BoxPipe, TransportError> {
        let (host, port) = host_and_port(addr)
            .ok_or_else(|| TransportError::UnsupportedAddress(addr.clone()))?;
        log::debug!("dialing {host}:{port}");
        let stream = TcpStream::connect((host.as_str(), port)).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    async fn listen(&self, addr: &Multiaddr) -> Result<BoxListener, TransportError> {
        let (host, port) = host_and_port(addr)
            .ok_or_else(|| TransportError::UnsupportedAddress(addr.clone()))?;
        let listener = TcpListener::bind((host.as_str(), port)).await?;
        let local_addr = socket_to_multiaddr(listener.local_addr()?);
        log::debug!("listening on {local_addr}");
        Ok(Box::new(TcpListenerStream {
            listener,
            local_addr,
        }))
    }
}

struct TcpListenerStream {
    listener: TcpListener,
    local_addr: Multiaddr,
}

#[async_trait]
impl Listener for TcpListenerStream {
    fn local_addr(&self) -> Multiaddr {
        self.local_addr.clone()
    }

    async fn accept(&mut self) -> Result<(BoxPipe, Multiaddr), TransportError> {
        let (stream, remote) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok((Box::new(stream), socket_to_multiaddr(remote)))
    }
}

/// Extract the host and TCP port, tolerating a trailing `/p2p/` component.
/// Circuit addresses are not TCP-dialable, whatever their prefix.
fn host_and_port(addr: &Multiaddr) -> Option<(String, u16)> {
    if addr.is_circuit() {
        return None;
    }
    let mut components = addr.iter();
    let host = match components.next()? {
        Protocol::Ip4(a) => a.to_string(),
        Protocol::Ip6(a) => a.to_string(),
        Protocol::Dns4(h) | Protocol::Dns6(h) => h.clone(),
        _ => return None,
    };
    let port = match components.next()? {
        Protocol::Tcp(p) => *p,
        _ => return None,
    };
    match components.next() {
        None | Some(Protocol::P2p(_)) => Some((host, port)),
        _ => None,
    }
}

fn socket_to_multiaddr(addr: SocketAddr) -> Multiaddr {
    let ip = match addr.ip() {
        IpAddr::V4(a) => Protocol::Ip4(a),
        IpAddr::V6(a) => Protocol::Ip6(a),
    };
    Multiaddr::from(ip).with(Protocol::Tcp(addr.port()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn dialability() {
        let t = TcpTransport::new();
        let ok = |s: &str| t.can_dial(&s.parse().unwrap());
        assert!(ok("/ip4/127.0.0.1/tcp/4001"));
        assert!(ok("/dns4/example.com/tcp/443"));
        assert!(ok(
            "/ip4/127.0.0.1/tcp/4001/p2p/12D3KooWDpJ7As7BWAwRMfu1VU2WCqNjvq387JEYKDBj4kx6nXTN"
        ));
        assert!(!ok("/ip4/127.0.0.1/udp/4001"));
        assert!(!ok("/ip4/127.0.0.1/udp/4001/quic-v1"));
        assert!(!ok(
            "/ip4/127.0.0.1/tcp/4001/p2p/12D3KooWDpJ7As7BWAwRMfu1VU2WCqNjvq387JEYKDBj4kx6nXTN/p2p-circuit/p2p/12D3KooWPjceQrSwdWXPyLLeABRXmuqt69Rg3sBYbU1Nft9HyQ6X"
        ));
    }

    #[tokio::test]
    async fn listen_dial_roundtrip() {
        let t = TcpTransport::new();
        let mut listener = t.listen(&"/ip4/127.0.0.1/tcp/0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr();
        assert!(addr.to_string().starts_with("/ip4/127.0.0.1/tcp/"));

        let dial = tokio::spawn(async move {
            let mut pipe = TcpTransport::new().dial(&addr).await.unwrap();
            pipe.write_all(b"hi").await.unwrap();
        });
        let (mut pipe, remote) = listener.accept().await.unwrap();
        assert!(remote.to_string().starts_with("/ip4/127.0.0.1/tcp/"));
        let mut buf = [0u8; 2];
        pipe.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
        dial.await.unwrap();
    }
}
