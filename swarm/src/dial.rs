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

//! The dial pipeline: resolve and filter candidate addresses, deduplicate
//! circuit routes, rank, stagger, race, upgrade, install.

use crate::{
    error::{AttemptError, DialError},
    Connection, DialHints, Direction, SwarmInner,
};
use peerlink_core::{rcmgr::ConnectionScope, upgrader::Upgraded, Multiaddr, PeerId};
use std::{collections::HashSet, sync::Arc, time::Duration};
use tokio::sync::{mpsc, watch};

/// Stagger between successive direct dial attempts.
const DIAL_STAGGER: Duration = Duration::from_millis(250);

/// Head start granted to direct addresses before the first relay attempt.
/// Relay handshakes take on the order of a second; starting them earlier
/// only wastes relay resources on dials a direct attempt is about to win.
const RELAY_DELAY: Duration = Duration::from_secs(1);

/// One scheduled dial attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ScheduledAddr {
    pub addr: Multiaddr,
    pub delay: Duration,
}

/// Deduplicate circuit routes and produce the staggered dial schedule.
///
/// Circuit addresses with the same `(relay, destination)` routing key reach
/// the same relay session; dialing more than one of them makes the relay
/// open duplicate HOP sessions and trips its per-client limits, so only the
/// first survives. IPv6 addresses within one /64 are assumed to reach the
/// same host and share a delay slot.
pub(crate) fn plan_schedule(addrs: Vec<Multiaddr>, target: PeerId) -> Vec<ScheduledAddr> {
    let mut seen_routes = HashSet::new();
    let mut candidates: Vec<Multiaddr> = Vec::with_capacity(addrs.len());
    for addr in addrs {
        if let Some(route) = addr.circuit_route_key(Some(target)) {
            if !seen_routes.insert(route) {
                log::debug!("dropping duplicate circuit route {addr}");
                continue;
            }
        }
        candidates.push(addr);
    }

    // Stable sort keeps insertion order within each class.
    candidates.sort_by_key(|a| a.class());

    let mut schedule = Vec::with_capacity(candidates.len());
    let mut direct_slots: usize = 0;
    let mut last_direct_start = Duration::ZERO;
    let mut v6_prefixes: Vec<([u8; 8], Duration)> = Vec::new();
    let mut relay_slots: usize = 0;
    let mut any_direct = false;

    for addr in candidates {
        let delay = if addr.class().is_relay() {
            let base = if any_direct {
                last_direct_start + RELAY_DELAY
            } else {
                Duration::ZERO
            };
            let delay = base + DIAL_STAGGER * relay_slots as u32;
            relay_slots += 1;
            delay
        } else {
            any_direct = true;
            if let Some(prefix) = addr.ipv6_prefix64() {
                if let Some((_, delay)) = v6_prefixes.iter().find(|(p, _)| *p == prefix) {
                    // Same /64, same host: no extra stagger slot.
                    schedule.push(ScheduledAddr {
                        addr,
                        delay: *delay,
                    });
                    continue;
                }
                let delay = DIAL_STAGGER * direct_slots as u32;
                v6_prefixes.push((prefix, delay));
                direct_slots += 1;
                last_direct_start = last_direct_start.max(delay);
                delay
            } else {
                let delay = DIAL_STAGGER * direct_slots as u32;
                direct_slots += 1;
                last_direct_start = last_direct_start.max(delay);
                delay
            }
        };
        schedule.push(ScheduledAddr { addr, delay });
    }
    schedule
}

enum AttemptOutcome {
    Ok(Box<Upgraded>, ConnectionScope, Multiaddr),
    Err(AttemptError),
}

/// Run the full pipeline for one deduplicated dial request.
pub(crate) async fn do_dial(
    inner: Arc<SwarmInner>,
    peer: PeerId,
    hints: DialHints,
) -> Result<Connection, DialError> {
    if !inner.gater.intercept_peer_dial(&peer) {
        return Err(DialError::Gated(peer));
    }

    let mut addrs = inner.peerstore.addrs(&peer);
    if hints.force_direct {
        addrs.retain(|a| !a.is_circuit());
    }
    addrs.retain(|a| {
        inner
            .transports
            .read()
            .iter()
            .any(|t| t.can_dial(a))
    });
    addrs.retain(|a| inner.gater.intercept_addr_dial(&peer, a));
    if addrs.is_empty() {
        return Err(DialError::NoAddresses(peer));
    }

    let schedule = plan_schedule(addrs, peer);
    log::debug!("dialing {peer} across {} addresses", schedule.len());

    let (outcome_tx, mut outcome_rx) = mpsc::channel(schedule.len());
    let (cancel_tx, _) = watch::channel(false);
    for scheduled in schedule {
        tokio::spawn(attempt(
            inner.clone(),
            peer,
            scheduled,
            outcome_tx.clone(),
            cancel_tx.subscribe(),
        ));
    }
    drop(outcome_tx);

    let deadline = hints.timeout.unwrap_or(inner.config.dial_timeout);
    let mut attempts = Vec::new();
    let winner = tokio::time::timeout(deadline, async {
        while let Some(outcome) = outcome_rx.recv().await {
            match outcome {
                AttemptOutcome::Ok(upgraded, scope, addr) => return Some((upgraded, scope, addr)),
                AttemptOutcome::Err(e) => {
                    log::debug!("dial attempt to {} failed: {}", e.addr, e.error);
                    attempts.push(e);
                }
            }
        }
        None
    })
    .await;
    // First success cancels everything still outstanding; laggards that
    // complete anyway find the outcome channel closed and tear down.
    let _ = cancel_tx.send(true);

    match winner {
        Ok(Some((upgraded, scope, addr))) => crate::install_connection(
            &inner,
            *upgraded,
            scope,
            Direction::Outbound,
            None,
            addr,
            &hints,
        )
        .ok_or(DialError::Closed),
        Ok(None) => Err(DialError::AllAttemptsFailed { peer, attempts }),
        Err(_) => Err(DialError::Timeout { peer, attempts }),
    }
}

async fn attempt(
    inner: Arc<SwarmInner>,
    peer: PeerId,
    scheduled: ScheduledAddr,
    outcome_tx: mpsc::Sender<AttemptOutcome>,
    mut cancel_rx: watch::Receiver<bool>,
) {
    let ScheduledAddr { addr, delay } = scheduled;
    if !delay.is_zero() {
        tokio::select! {
            _ = cancel_rx.changed() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    let scope = match inner.rcmgr.open_connection() {
        Ok(scope) => scope,
        Err(e) => {
            let _ = outcome_tx
                .send(AttemptOutcome::Err(AttemptError {
                    addr,
                    error: e.to_string(),
                }))
                .await;
            return;
        }
    };

    let transport = inner
        .transports
        .read()
        .iter()
        .find(|t| t.can_dial(&addr))
        .cloned();
    let Some(transport) = transport else { return };

    // Transports see the fully qualified address: circuit dials need the
    // destination suffix, and TCP tolerates it.
    let dial_addr = addr.clone().with_peer(peer);
    let dial_and_upgrade = async {
        let pipe = transport
            .dial(&dial_addr)
            .await
            .map_err(|e| e.to_string())?;
        let upgraded = inner
            .upgrader
            .upgrade_outbound(pipe, transport.name(), Some(peer))
            .await
            .map_err(|e| e.to_string())?;
        scope.assign_peer(upgraded.peer).map_err(|e| e.to_string())?;
        Ok::<_, String>(upgraded)
    };

    let outcome = tokio::select! {
        // Cancellation drops the in-flight dial, closing its pipe.
        _ = cancel_rx.changed() => return,
        result = dial_and_upgrade => result,
    };
    match outcome {
        Ok(upgraded) => {
            // If we lost the race the channel is gone and dropping the
            // session closes the freshly upgraded pipe.
            let _ = outcome_tx
                .send(AttemptOutcome::Ok(Box::new(upgraded), scope, addr))
                .await;
        }
        Err(error) => {
            let _ = outcome_tx
                .send(AttemptOutcome::Err(AttemptError { addr, error }))
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ma(s: &str) -> Multiaddr {
        s.parse().unwrap()
    }

    #[test]
    fn ranking_order() {
        let target = PeerId::random();
        let relay = PeerId::random();
        let schedule = plan_schedule(
            vec![
                ma("/p2p-circuit"),
                ma("/ip4/10.0.0.1/tcp/1"),
                ma(&format!("/ip4/9.9.9.9/tcp/443/p2p/{relay}/p2p-circuit")),
                ma("/ip4/8.8.8.8/tcp/1"),
                ma("/ip6/2001:db8::1/tcp/1"),
            ],
            target,
        );
        let order: Vec<String> = schedule.iter().map(|s| s.addr.to_string()).collect();
        assert_eq!(
            order,
            vec![
                "/ip6/2001:db8::1/tcp/1".to_string(),
                "/ip4/8.8.8.8/tcp/1".to_string(),
                "/ip4/10.0.0.1/tcp/1".to_string(),
                format!("/ip4/9.9.9.9/tcp/443/p2p/{relay}/p2p-circuit"),
                "/p2p-circuit".to_string(),
            ]
        );
    }

    #[test]
    fn direct_stagger_and_relay_head_start() {
        let target = PeerId::random();
        let relay = PeerId::random();
        let schedule = plan_schedule(
            vec![
                ma("/ip4/8.8.8.8/tcp/1"),
                ma("/ip4/8.8.4.4/tcp/1"),
                ma(&format!("/ip4/9.9.9.9/tcp/443/p2p/{relay}/p2p-circuit")),
            ],
            target,
        );
        assert_eq!(schedule[0].delay, Duration::ZERO);
        assert_eq!(schedule[1].delay, Duration::from_millis(250));
        // Last direct attempt starts at 250 ms; the relay waits 1 s more.
        assert_eq!(schedule[2].delay, Duration::from_millis(1250));
    }

    #[test]
    fn relay_only_dial_starts_immediately() {
        let target = PeerId::random();
        let relay = PeerId::random();
        let schedule = plan_schedule(
            vec![ma(&format!("/ip4/9.9.9.9/tcp/443/p2p/{relay}/p2p-circuit"))],
            target,
        );
        assert_eq!(schedule[0].delay, Duration::ZERO);
    }

    #[test]
    fn circuit_routes_deduplicated() {
        let target = PeerId::random();
        let relay = PeerId::random();
        // Three IP variants of the same relay: one route key, one attempt.
        let schedule = plan_schedule(
            vec![
                ma(&format!("/ip4/9.9.9.9/tcp/443/p2p/{relay}/p2p-circuit")),
                ma(&format!("/ip4/9.9.9.10/tcp/443/p2p/{relay}/p2p-circuit")),
                ma(&format!("/ip6/2001:db8::9/tcp/443/p2p/{relay}/p2p-circuit")),
            ],
            target,
        );
        assert_eq!(schedule.len(), 1);
    }

    #[test]
    fn distinct_relays_kept() {
        let target = PeerId::random();
        let r1 = PeerId::random();
        let r2 = PeerId::random();
        let schedule = plan_schedule(
            vec![
                ma(&format!("/ip4/9.9.9.9/tcp/443/p2p/{r1}/p2p-circuit")),
                ma(&format!("/ip4/9.9.9.9/tcp/443/p2p/{r2}/p2p-circuit")),
            ],
            target,
        );
        assert_eq!(schedule.len(), 2);
    }

    #[test]
    fn same_v6_prefix_shares_slot() {
        let target = PeerId::random();
        let schedule = plan_schedule(
            vec![
                ma("/ip6/2001:db8:0:1::1/tcp/1"),
                ma("/ip6/2001:db8:0:1::2/tcp/1"),
                ma("/ip6/2001:db8:0:2::1/tcp/1"),
            ],
            target,
        );
        assert_eq!(schedule[0].delay, schedule[1].delay);
        assert_eq!(schedule[2].delay, Duration::from_millis(250));
    }
}
