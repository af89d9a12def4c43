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

//! Reachability detection and the relayed-to-direct connection upgrade.

use peerlink::{AddrInfo, Config, Host, Keypair, Reachability};
use std::time::Duration;

#[tokio::test]
async fn autonat_detects_public_reachability() {
    let mut config = Config::new(Keypair::generate_ed25519())
        .with_listen_addrs(["/ip4/127.0.0.1/tcp/0".parse().unwrap()]);
    config.enable_hole_punching = false;
    config.autonat.boot_delay = Duration::from_millis(100);
    config.autonat.retry_interval = Duration::from_millis(500);
    let a = Host::new(config.clone());
    a.start().await.unwrap();

    let b = Host::new(Config::new(Keypair::generate_ed25519()).with_listen_addrs([
        "/ip4/127.0.0.1/tcp/0".parse().unwrap(),
    ]));
    b.start().await.unwrap();

    // Once connected and identified, A's orchestrator probes via B, B
    // dials A back on a fresh connection and confirms the nonce.
    a.connect(AddrInfo {
        peer: b.id(),
        addrs: b.addrs(),
    })
    .await
    .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let (reachability, _confidence) = a.reachability();
        if reachability == Reachability::Public {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "reachability stayed {reachability:?}"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn dcutr_upgrades_relayed_connection() {
    // Relay in the middle.
    let mut relay_config = Config::new(Keypair::generate_ed25519())
        .with_listen_addrs(["/ip4/127.0.0.1/tcp/0".parse().unwrap()])
        .with_forced_reachability(Reachability::Public)
        .with_relay_server();
    relay_config.enable_hole_punching = false;
    let relay = Host::new(relay_config);
    relay.start().await.unwrap();
    let relay_addr = relay.addrs()[0].clone().with_peer(relay.id());

    // A considers itself private but does have a dialable loopback
    // listener, which is exactly the situation hole punching exploits.
    let mut a_config = Config::new(Keypair::generate_ed25519())
        .with_listen_addrs(["/ip4/127.0.0.1/tcp/0".parse().unwrap()])
        .with_forced_reachability(Reachability::Private)
        .with_static_relays([relay_addr]);
    a_config.relay_client.tick_interval = Duration::from_millis(200);
    let a = Host::new(a_config);
    a.start().await.unwrap();

    let b = Host::new(
        Config::new(Keypair::generate_ed25519())
            .with_listen_addrs(["/ip4/127.0.0.1/tcp/0".parse().unwrap()])
            .with_forced_reachability(Reachability::Public),
    );
    b.start().await.unwrap();

    // Wait for A's reservation, then dial it through the relay.
    let circuit = {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(addr) = a.addrs().into_iter().find(|x| x.is_circuit()) {
                break addr;
            }
            assert!(tokio::time::Instant::now() < deadline, "no reservation");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    };
    b.connect(AddrInfo {
        peer: a.id(),
        addrs: vec![circuit],
    })
    .await
    .unwrap();

    // The inbound relayed connection triggers the coordinated dial; both
    // sides end up with a direct connection shortly after.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let a_direct = a
            .swarm()
            .conns_to_peer(&b.id())
            .iter()
            .any(|c| !c.is_limited());
        let b_direct = b
            .swarm()
            .conns_to_peer(&a.id())
            .iter()
            .any(|c| !c.is_limited());
        if a_direct && b_direct {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "no direct connection emerged"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // New streams prefer the direct connection over the relayed one.
    let stream = b
        .new_stream(a.id(), &[peerlink::ping::PROTOCOL_NAME.to_string()])
        .await
        .unwrap();
    let conn = stream.connection().expect("connection still alive");
    assert!(!conn.is_limited());

    b.close().await;
    a.close().await;
    relay.close().await;
}
