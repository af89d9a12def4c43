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

//! The ping protocol: echo 32 random bytes, measure the round trip.

use futures::FutureExt;
use peerlink_core::{
    bus::{Event, EventBus},
    PeerId,
};
use peerlink_swarm::{DialHints, Swarm, SwarmError};
use rand::RngCore;
use std::{sync::Arc, time::Duration};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;

pub const PROTOCOL_NAME: &str = "/ipfs/ping/1.0.0";

/// Size of the ping payload.
pub const PING_SIZE: usize = 32;

#[derive(Clone, Debug)]
pub struct Config {
    /// Time allowed for one round trip.
    pub timeout: Duration,
    /// Interval between pings on an idle connection.
    pub interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            timeout: Duration::from_secs(20),
            interval: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PingError {
    #[error(transparent)]
    Swarm(#[from] SwarmError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("remote returned different bytes")]
    PayloadMismatch,
    #[error("ping timed out")]
    Timeout,
}

/// The ping service: answers inbound pings and keeps connected peers
/// probed.
pub struct Ping {
    swarm: Swarm,
    config: Config,
}

impl Ping {
    pub fn new(swarm: Swarm, config: Config) -> Arc<Ping> {
        Arc::new(Ping { swarm, config })
    }

    /// Register the echo handler for inbound pings.
    pub fn register(&self) {
        self.swarm.handlers().set(
            PROTOCOL_NAME,
            Arc::new(|mut stream| {
                async move {
                    // Echo until the peer hangs up.
                    let mut buf = [0u8; PING_SIZE];
                    loop {
                        match stream.read_exact(&mut buf).await {
                            Ok(_) => {
                                if stream.write_all(&buf).await.is_err() {
                                    break;
                                }
                            }
                            Err(_) => break,
                        }
                    }
                }
                .boxed()
            }),
        );
    }

    /// Start pinging every connected peer on the configured interval,
    /// publishing results on the bus. Returns the driving task.
    pub fn start(self: Arc<Self>, bus: EventBus) -> tokio::task::JoinHandle<()> {
        let ping = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ping.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                for peer in ping.swarm.peers() {
                    let ping = ping.clone();
                    let bus = bus.clone();
                    tokio::spawn(async move {
                        match ping.ping(peer).await {
                            Ok(rtt) => bus.publish(Event::PingResult { peer, rtt }),
                            Err(e) => log::debug!("ping to {peer} failed: {e}"),
                        }
                    });
                }
            }
        })
    }

    /// Ping `peer` once over an existing connection and return the round
    /// trip time.
    pub async fn ping(&self, peer: PeerId) -> Result<Duration, PingError> {
        let mut stream = self
            .swarm
            .new_stream(
                peer,
                &[PROTOCOL_NAME.to_string()],
                DialHints::default().allow_limited().no_dial(),
            )
            .await?;
        let mut payload = [0u8; PING_SIZE];
        rand::thread_rng().fill_bytes(&mut payload);
        let started = Instant::now();

        let rtt = tokio::time::timeout(self.config.timeout, async {
            stream.write_all(&payload).await?;
            stream.flush().await?;
            let mut echoed = [0u8; PING_SIZE];
            stream.read_exact(&mut echoed).await?;
            if echoed != payload {
                return Err(PingError::PayloadMismatch);
            }
            Ok(started.elapsed())
        })
        .await
        .map_err(|_| PingError::Timeout)??;

        log::trace!("ping to {peer}: {rtt:?}");
        Ok(rtt)
    }
}
