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

//! Relayed connectivity: reservations, cross dials and circuit-route
//! deduplication.

use peerlink::{AddrInfo, Config, Host, Keypair, Multiaddr, Reachability};
use std::time::Duration;

fn base_config() -> Config {
    let mut config = Config::new(Keypair::generate_ed25519());
    config.enable_hole_punching = false;
    config.relay_client.tick_interval = Duration::from_millis(200);
    config
}

async fn relay_host() -> Host {
    let host = Host::new(
        base_config()
            .with_listen_addrs(["/ip4/127.0.0.1/tcp/0".parse().unwrap()])
            .with_forced_reachability(Reachability::Public)
            .with_relay_server(),
    );
    host.start().await.unwrap();
    host
}

/// A host that believes it is private and keeps a reservation on `relay`.
async fn private_host(relay: &Host) -> Host {
    let relay_addr = relay.addrs()[0].clone().with_peer(relay.id());
    let host = Host::new(
        base_config()
            .with_forced_reachability(Reachability::Private)
            .with_static_relays([relay_addr]),
    );
    host.start().await.unwrap();
    host
}

async fn public_host() -> Host {
    let host = Host::new(
        base_config()
            .with_listen_addrs(["/ip4/127.0.0.1/tcp/0".parse().unwrap()])
            .with_forced_reachability(Reachability::Public),
    );
    host.start().await.unwrap();
    host
}

/// Wait until the private host advertises a circuit address.
async fn circuit_addr(host: &Host) -> Multiaddr {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(addr) = host.addrs().into_iter().find(|a| a.is_circuit()) {
            return addr;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "no reservation appeared"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn reservation_and_cross_dial() {
    let relay = relay_host().await;
    let a = private_host(&relay).await;
    let addr = circuit_addr(&a).await;
    assert_eq!(relay.relay_server().unwrap().reservations(), 1);

    let b = public_host().await;
    b.connect(AddrInfo {
        peer: a.id(),
        addrs: vec![addr],
    })
    .await
    .unwrap();

    // Ping works in both directions over the one relayed connection.
    let rtt = b.ping_service().ping(a.id()).await.unwrap();
    assert!(rtt < Duration::from_secs(1), "rtt {rtt:?}");
    let rtt = a.ping_service().ping(b.id()).await.unwrap();
    assert!(rtt < Duration::from_secs(1), "reverse rtt {rtt:?}");

    assert_eq!(b.swarm().conns_to_peer(&a.id()).len(), 1);
    assert_eq!(a.swarm().conns_to_peer(&b.id()).len(), 1);
    assert!(b.swarm().conns_to_peer(&a.id())[0].is_limited());
    // The relay carries exactly one circuit for the pair.
    assert_eq!(relay.relay_server().unwrap().active_circuits(), 1);

    b.close().await;
    a.close().await;
    relay.close().await;
}

#[tokio::test]
async fn duplicate_circuit_routes_dial_once() {
    let relay = relay_host().await;
    let a = private_host(&relay).await;
    let addr = circuit_addr(&a).await;

    // Three circuit addresses through the same relay: different transport
    // addresses, one routing key.
    let relay_id = relay.id();
    let variant_b: Multiaddr = format!("/ip4/127.0.0.2/tcp/1/p2p/{relay_id}/p2p-circuit")
        .parse()
        .unwrap();
    let variant_c: Multiaddr = format!("/dns4/relay.invalid/tcp/1/p2p/{relay_id}/p2p-circuit")
        .parse()
        .unwrap();

    let b = public_host().await;
    b.connect(AddrInfo {
        peer: a.id(),
        addrs: vec![addr, variant_b, variant_c],
    })
    .await
    .unwrap();

    assert_eq!(
        relay.relay_server().unwrap().connect_attempts(),
        1,
        "duplicate circuit routes must collapse into one HOP request"
    );

    b.close().await;
    a.close().await;
    relay.close().await;
}

#[tokio::test]
async fn reservation_is_renewed() {
    // A relay that hands out short-lived reservations.
    let mut relay_config = base_config()
        .with_listen_addrs(["/ip4/127.0.0.1/tcp/0".parse().unwrap()])
        .with_forced_reachability(Reachability::Public)
        .with_relay_server();
    relay_config.relay_server.reservation_ttl = Duration::from_secs(3);
    let relay = Host::new(relay_config);
    relay.start().await.unwrap();

    let relay_addr = relay.addrs()[0].clone().with_peer(relay.id());
    let mut config = base_config()
        .with_forced_reachability(Reachability::Private)
        .with_static_relays([relay_addr]);
    config.relay_client.tick_interval = Duration::from_millis(100);
    let a = Host::new(config);
    a.start().await.unwrap();

    circuit_addr(&a).await;
    // The client refreshes at a third of the TTL before expiry; while it
    // stays private the reservation never lapses, across several renewal
    // windows.
    for _ in 0..15 {
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(relay.relay_server().unwrap().reservations(), 1);
    }

    a.close().await;
    relay.close().await;
}
