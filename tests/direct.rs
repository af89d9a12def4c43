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

//! Direct connectivity between two hosts on loopback.

use peerlink::{AddrInfo, Config, Host, Keypair, Reachability};
use std::time::Duration;

async fn new_host() -> Host {
    let config = Config::new(Keypair::generate_ed25519())
        .with_listen_addrs(["/ip4/127.0.0.1/tcp/0".parse().unwrap()])
        .with_forced_reachability(Reachability::Public);
    let host = Host::new(config);
    host.start().await.unwrap();
    host
}

async fn wait_for(mut check: impl FnMut() -> bool, what: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn direct_connect_and_ping() {
    let a = new_host().await;
    let b = new_host().await;

    b.connect(AddrInfo {
        peer: a.id(),
        addrs: a.addrs(),
    })
    .await
    .unwrap();

    let rtt = b.ping_service().ping(a.id()).await.unwrap();
    assert!(rtt < Duration::from_millis(100), "rtt {rtt:?}");

    // Both sides list the other exactly once.
    wait_for(
        || {
            a.swarm().peers() == vec![b.id()]
                && b.swarm().peers() == vec![a.id()]
                && a.swarm().conns_to_peer(&b.id()).len() == 1
                && b.swarm().conns_to_peer(&a.id()).len() == 1
        },
        "both peer lists to settle",
    )
    .await;

    // The reverse direction works over the same connection.
    let rtt = a.ping_service().ping(b.id()).await.unwrap();
    assert!(rtt < Duration::from_millis(100), "reverse rtt {rtt:?}");

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn simultaneous_dials_collapse() {
    let a = new_host().await;
    let b = new_host().await;
    a.peerstore().add_addrs(
        b.id(),
        b.addrs(),
        Duration::from_secs(600),
    );
    b.peerstore().add_addrs(
        a.id(),
        a.addrs(),
        Duration::from_secs(600),
    );

    let (ra, rb) = tokio::join!(a.swarm().dial(b.id()), b.swarm().dial(a.id()));
    ra.unwrap();
    rb.unwrap();

    wait_for(
        || {
            a.swarm().conns_to_peer(&b.id()).len() == 1
                && b.swarm().conns_to_peer(&a.id()).len() == 1
        },
        "connection counts to converge to one",
    )
    .await;

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn identify_populates_the_peer_store() {
    let a = new_host().await;
    let b = new_host().await;

    b.connect(AddrInfo {
        peer: a.id(),
        addrs: a.addrs(),
    })
    .await
    .unwrap();

    b.identify().wait_identified(a.id()).await;
    let protocols = b.peerstore().protocols(&a.id());
    assert!(
        protocols.iter().any(|p| p == peerlink::ping::PROTOCOL_NAME),
        "expected ping in {protocols:?}"
    );
    // Identify verified and stored A's public key.
    assert_eq!(
        b.peerstore().key(&a.id()).map(|k| k.to_peer_id()),
        Some(a.id())
    );

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn start_is_idempotent_and_close_releases() {
    let a = new_host().await;
    a.start().await.unwrap();
    a.start().await.unwrap();
    assert!(!a.addrs().is_empty());
    a.close().await;
    a.close().await;
    assert!(a.swarm().listen_addrs().is_empty());
}
