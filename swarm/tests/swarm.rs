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

//! Swarm behavior over the real tcp/noise/yamux stack on loopback.

use async_trait::async_trait;
use futures::FutureExt;
use peerlink_core::{
    bus::EventBus,
    io::BoxPipe,
    peerstore::{PeerStore, PERMANENT_ADDR_TTL},
    rcmgr::ResourceManager,
    transport::{BoxListener, Transport, TransportError},
    upgrader::Upgrader,
    Keypair, Multiaddr, PeerId,
};
use peerlink_swarm::{ConnGater, DialError, DialHints, Swarm, SwarmConfig};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const ECHO: &str = "/test/echo/1.0.0";

/// Counts dials so tests can observe how often the transport was hit.
struct CountingTransport {
    inner: peerlink_tcp::TcpTransport,
    dials: Arc<AtomicUsize>,
}

#[async_trait]
impl Transport for CountingTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn can_dial(&self, addr: &Multiaddr) -> bool {
        self.inner.can_dial(addr)
    }

    async fn dial(&self, addr: &Multiaddr) -> Result<BoxPipe, TransportError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        self.inner.dial(addr).await
    }

    async fn listen(&self, addr: &Multiaddr) -> Result<BoxListener, TransportError> {
        self.inner.listen(addr).await
    }
}

fn new_swarm() -> (Swarm, PeerId, Arc<AtomicUsize>) {
    let key = Keypair::generate_ed25519();
    let peer = key.public().to_peer_id();
    let upgrader = Upgrader::new(
        vec![Arc::new(peerlink_noise::Config::new(&key))],
        vec![Arc::new(
            peerlink_yamux::Config::default().with_keepalive_interval(None),
        )],
    );
    let swarm = Swarm::new(
        peer,
        upgrader,
        PeerStore::default(),
        EventBus::new(),
        ResourceManager::default(),
        None,
        SwarmConfig::default(),
    );
    let dials = Arc::new(AtomicUsize::new(0));
    swarm.add_transport(Arc::new(CountingTransport {
        inner: peerlink_tcp::TcpTransport::new(),
        dials: dials.clone(),
    }));
    (swarm, peer, dials)
}

fn register_echo(swarm: &Swarm) {
    swarm.handlers().set(
        ECHO,
        Arc::new(|mut stream| {
            async move {
                let mut buf = Vec::new();
                if stream.read_to_end(&mut buf).await.is_ok() {
                    let _ = stream.write_all(&buf).await;
                    let _ = stream.shutdown().await;
                }
            }
            .boxed()
        }),
    );
}

async fn listen_and_share(server: &Swarm, client: &Swarm, server_peer: PeerId) -> Multiaddr {
    let addr = server
        .listen(&"/ip4/127.0.0.1/tcp/0".parse().unwrap())
        .await
        .unwrap();
    client
        .peerstore()
        .add_addrs(server_peer, [addr.clone()], PERMANENT_ADDR_TTL);
    addr
}

#[tokio::test]
async fn dial_and_echo() {
    let (a, _a_peer, _) = new_swarm();
    let (b, b_peer, _) = new_swarm();
    register_echo(&b);
    listen_and_share(&b, &a, b_peer).await;

    let mut stream = a
        .new_stream(b_peer, &[ECHO.to_string()], DialHints::default())
        .await
        .unwrap();
    assert_eq!(stream.protocol(), ECHO);
    stream.write_all(b"around the swarm").await.unwrap();
    stream.shutdown().await.unwrap();
    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).await.unwrap();
    assert_eq!(reply, b"around the swarm");

    assert_eq!(a.peers(), vec![b_peer]);
    assert_eq!(a.conns_to_peer(&b_peer).len(), 1);
}

#[tokio::test]
async fn concurrent_dials_collapse() {
    let (a, _, dials) = new_swarm();
    let (b, b_peer, _) = new_swarm();
    listen_and_share(&b, &a, b_peer).await;

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let a = a.clone();
        tasks.push(tokio::spawn(async move { a.dial(b_peer).await }));
    }
    let mut ids = Vec::new();
    for task in tasks {
        ids.push(task.await.unwrap().unwrap().id());
    }
    // Every caller shares the one connection the single pipeline produced.
    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(dials.load(Ordering::SeqCst), 1);
    assert_eq!(a.conns_to_peer(&b_peer).len(), 1);
}

#[tokio::test]
async fn bidirectional_reuse() {
    let (a, a_peer, _) = new_swarm();
    let (b, b_peer, b_dials) = new_swarm();
    listen_and_share(&b, &a, b_peer).await;

    let conn = a.dial(b_peer).await.unwrap();
    // Wait until B indexed the inbound connection.
    for _ in 0..50 {
        if !b.conns_to_peer(&a_peer).is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Dialing back reuses the existing connection rather than opening one.
    let back = b.dial(a_peer).await.unwrap();
    assert_eq!(b_dials.load(Ordering::SeqCst), 0);
    assert_eq!(back.remote_peer(), a_peer);
    assert_eq!(a.conns_to_peer(&b_peer).len(), 1);
    assert_eq!(b.conns_to_peer(&a_peer).len(), 1);
    assert_eq!(conn.remote_peer(), b_peer);
}

#[tokio::test]
async fn simultaneous_dials_converge() {
    let (a, a_peer, _) = new_swarm();
    let (b, b_peer, _) = new_swarm();
    let a_addr = a.listen(&"/ip4/127.0.0.1/tcp/0".parse().unwrap()).await.unwrap();
    let b_addr = b.listen(&"/ip4/127.0.0.1/tcp/0".parse().unwrap()).await.unwrap();
    a.peerstore().add_addrs(b_peer, [b_addr], PERMANENT_ADDR_TTL);
    b.peerstore().add_addrs(a_peer, [a_addr], PERMANENT_ADDR_TTL);

    let a2 = a.clone();
    let b2 = b.clone();
    let (ra, rb) = tokio::join!(
        tokio::spawn(async move { a2.dial(b_peer).await }),
        tokio::spawn(async move { b2.dial(a_peer).await }),
    );
    ra.unwrap().unwrap();
    rb.unwrap().unwrap();

    // Whatever the race produced, both sides settle on one connection.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let a_conns = a.conns_to_peer(&b_peer).len();
        let b_conns = b.conns_to_peer(&a_peer).len();
        if a_conns == 1 && b_conns == 1 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "still {a_conns}/{b_conns} connections"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn no_addresses_error() {
    let (a, _, _) = new_swarm();
    let stranger = PeerId::random();
    assert!(matches!(
        a.dial(stranger).await,
        Err(DialError::NoAddresses(p)) if p == stranger
    ));
}

#[tokio::test]
async fn gater_vetoes_dials() {
    struct NoDials;
    impl ConnGater for NoDials {
        fn intercept_peer_dial(&self, _peer: &PeerId) -> bool {
            false
        }
    }

    let key = Keypair::generate_ed25519();
    let peer = key.public().to_peer_id();
    let upgrader = Upgrader::new(
        vec![Arc::new(peerlink_noise::Config::new(&key))],
        vec![Arc::new(peerlink_yamux::Config::default())],
    );
    let swarm = Swarm::new(
        peer,
        upgrader,
        PeerStore::default(),
        EventBus::new(),
        ResourceManager::default(),
        Some(Arc::new(NoDials)),
        SwarmConfig::default(),
    );
    swarm.add_transport(Arc::new(peerlink_tcp::TcpTransport::new()));

    let target = PeerId::random();
    swarm.peerstore().add_addrs(
        target,
        ["/ip4/127.0.0.1/tcp/1".parse().unwrap()],
        PERMANENT_ADDR_TTL,
    );
    assert!(matches!(
        swarm.dial(target).await,
        Err(DialError::Gated(_))
    ));
}

#[tokio::test]
async fn wrong_peer_id_fails_attempt() {
    let (a, _, _) = new_swarm();
    let (b, _b_peer, _) = new_swarm();
    let imposter = PeerId::random();
    // B's address filed under a peer id B cannot authenticate as.
    listen_and_share(&b, &a, imposter).await;

    match a.dial(imposter).await {
        Err(DialError::AllAttemptsFailed { attempts, .. }) => {
            assert_eq!(attempts.len(), 1);
            assert!(attempts[0].error.contains("does not match"), "{attempts:?}");
        }
        other => panic!("expected aggregate failure, got {other:?}"),
    }
}

#[tokio::test]
async fn close_tears_everything_down() {
    let (a, _, _) = new_swarm();
    let (b, b_peer, _) = new_swarm();
    listen_and_share(&b, &a, b_peer).await;
    a.dial(b_peer).await.unwrap();

    a.close().await;
    assert!(a.listen_addrs().is_empty() || a.conns_to_peer(&b_peer).is_empty());
    assert!(matches!(a.dial(b_peer).await, Err(DialError::Closed)));
}
