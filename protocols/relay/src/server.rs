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

//! The relay service: reservations over HOP, circuit establishment towards
//! the destination over STOP, and limited bidirectional forwarding.

use crate::{
    proto::{self, HopMessageType, Status, StopMessageType},
    voucher::ReservationVoucher,
    AddrsSource, HOP_PROTOCOL_NAME, STOP_PROTOCOL_NAME,
};
use futures::FutureExt;
use parking_lot::Mutex;
use peerlink_core::{io, Keypair, PeerId};
use peerlink_swarm::{DialHints, Stream, Swarm};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;

const MAX_CONTROL_MESSAGE: usize = 4096;
const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);
const FORWARD_BUF_SIZE: usize = 4096;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub reservation_ttl: Duration,
    pub max_reservations: usize,
    /// Concurrent circuits, total and per source peer.
    pub max_circuits: usize,
    pub max_circuits_per_peer: usize,
    /// Per-circuit caps handed out with every reservation. Zero disables
    /// the respective cap.
    pub limit_duration: Duration,
    pub limit_data: u64,
    pub gc_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            reservation_ttl: Duration::from_secs(3600),
            max_reservations: 128,
            max_circuits: 16,
            max_circuits_per_peer: 4,
            limit_duration: Duration::from_secs(2 * 60),
            limit_data: 1 << 17,
            gc_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Default)]
struct ServerState {
    reservations: HashMap<PeerId, Instant>,
    circuits_per_peer: HashMap<PeerId, usize>,
    total_circuits: usize,
    connect_attempts: u64,
}

/// The relay server. Register it on a publicly reachable host.
pub struct RelayServer {
    swarm: Swarm,
    keypair: Keypair,
    config: ServerConfig,
    addrs: AddrsSource,
    state: Mutex<ServerState>,
}

impl RelayServer {
    pub fn new(
        swarm: Swarm,
        keypair: Keypair,
        config: ServerConfig,
        addrs: AddrsSource,
    ) -> Arc<RelayServer> {
        Arc::new(RelayServer {
            swarm,
            keypair,
            config,
            addrs,
            state: Mutex::new(ServerState::default()),
        })
    }

    /// Register the HOP handler.
    pub fn register(self: Arc<Self>) {
        let server = self.clone();
        self.swarm.handlers().set(
            HOP_PROTOCOL_NAME,
            Arc::new(move |stream| {
                let server = server.clone();
                async move { server.handle_hop(stream).await }.boxed()
            }),
        );
    }

    /// Start the reservation sweeper.
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let server = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(server.config.gc_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let now = Instant::now();
                let mut state = server.state.lock();
                let before = state.reservations.len();
                state.reservations.retain(|_, expire| *expire > now);
                let expired = before - state.reservations.len();
                if expired > 0 {
                    log::debug!("expired {expired} relay reservations");
                }
            }
        })
    }

    /// Number of live reservations, for introspection and tests.
    pub fn reservations(&self) -> usize {
        let now = Instant::now();
        self.state
            .lock()
            .reservations
            .values()
            .filter(|e| **e > now)
            .count()
    }

    /// Number of circuits currently being forwarded.
    pub fn active_circuits(&self) -> usize {
        self.state.lock().total_circuits
    }

    /// Total HOP connect requests seen, successful or not.
    pub fn connect_attempts(&self) -> u64 {
        self.state.lock().connect_attempts
    }

    async fn handle_hop(&self, mut stream: Stream) {
        let src = stream.peer();
        let msg = match tokio::time::timeout(
            CONTROL_TIMEOUT,
            io::read_proto::<_, proto::HopMessage>(&mut stream, MAX_CONTROL_MESSAGE),
        )
        .await
        {
            Ok(Ok(msg)) => msg,
            _ => {
                stream.reset();
                return;
            }
        };
        match HopMessageType::from_i32(msg.r#type) {
            Some(HopMessageType::Reserve) => self.handle_reserve(src, stream).await,
            Some(HopMessageType::Connect) => self.handle_connect(src, msg, stream).await,
            _ => {
                let _ = write_hop_status(&mut stream, Status::UnexpectedMessage).await;
            }
        }
    }

    async fn handle_reserve(&self, src: PeerId, mut stream: Stream) {
        let at_capacity = {
            let mut state = self.state.lock();
            let refresh = state.reservations.contains_key(&src);
            if !refresh && state.reservations.len() >= self.config.max_reservations {
                true
            } else {
                state
                    .reservations
                    .insert(src, Instant::now() + self.config.reservation_ttl);
                false
            }
        };
        if at_capacity {
            log::debug!("refusing reservation for {src}: at capacity");
            let _ = write_hop_status(&mut stream, Status::ResourceLimitExceeded).await;
            return;
        }

        let expire = unix_now() + self.config.reservation_ttl.as_secs();
        let voucher = ReservationVoucher {
            relay: self.swarm.local_peer(),
            peer: src,
            expiration: expire,
        }
        .into_signed_envelope(&self.keypair)
        .map(|envelope| envelope.encode())
        .unwrap_or_default();

        let relay_id = self.swarm.local_peer();
        let addrs: Vec<Vec<u8>> = (self.addrs)()
            .into_iter()
            .filter(|a| !a.is_circuit())
            .map(|a| a.with_peer(relay_id).to_bytes())
            .collect();

        let reply = proto::HopMessage {
            r#type: HopMessageType::Status as i32,
            peer: None,
            reservation: Some(proto::Reservation {
                expire,
                addrs,
                voucher,
            }),
            limit: Some(self.limit()),
            status: Status::Ok as i32,
        };
        log::debug!("reserved relay slot for {src} until unix {expire}");
        let _ = io::write_proto(&mut stream, &reply).await;
        let _ = stream.shutdown().await;
    }

    async fn handle_connect(&self, src: PeerId, msg: proto::HopMessage, mut stream: Stream) {
        self.state.lock().connect_attempts += 1;
        let dst = match msg
            .peer
            .as_ref()
            .and_then(|p| PeerId::from_bytes(&p.id).ok())
        {
            Some(dst) => dst,
            None => {
                let _ = write_hop_status(&mut stream, Status::MalformedMessage).await;
                return;
            }
        };

        // Admission: destination must hold a live reservation, and the
        // source must be within its circuit allowance.
        let refused = {
            let mut state = self.state.lock();
            match state.reservations.get(&dst) {
                Some(expire) if *expire > Instant::now() => {
                    let per_src = state.circuits_per_peer.get(&src).copied().unwrap_or(0);
                    if state.total_circuits >= self.config.max_circuits
                        || per_src >= self.config.max_circuits_per_peer
                    {
                        Some(Status::ResourceLimitExceeded)
                    } else {
                        state.total_circuits += 1;
                        *state.circuits_per_peer.entry(src).or_insert(0) += 1;
                        None
                    }
                }
                _ => Some(Status::NoReservation),
            }
        };
        if let Some(status) = refused {
            if status == Status::ResourceLimitExceeded {
                log::debug!("refusing circuit {src} -> {dst}: at capacity");
            }
            let _ = write_hop_status(&mut stream, status).await;
            return;
        }
        let result = self.connect_and_forward(src, dst, &mut stream).await;
        {
            let mut state = self.state.lock();
            state.total_circuits -= 1;
            if let Some(count) = state.circuits_per_peer.get_mut(&src) {
                *count -= 1;
                if *count == 0 {
                    state.circuits_per_peer.remove(&src);
                }
            }
        }
        if let Err(status) = result {
            let _ = write_hop_status(&mut stream, status).await;
        }
    }

    async fn connect_and_forward(
        &self,
        src: PeerId,
        dst: PeerId,
        hop_stream: &mut Stream,
    ) -> Result<(), Status> {
        // The destination is expected to be connected already; a relay
        // never dials out on behalf of clients.
        let mut stop_stream = self
            .swarm
            .new_stream(
                dst,
                &[STOP_PROTOCOL_NAME.to_string()],
                DialHints::default().no_dial(),
            )
            .await
            .map_err(|e| {
                log::debug!("opening stop stream to {dst} failed: {e}");
                Status::ConnectionFailed
            })?;

        let stop_msg = proto::StopMessage {
            r#type: StopMessageType::Connect as i32,
            peer: Some(proto::Peer {
                id: src.to_bytes(),
                addrs: Vec::new(),
            }),
            limit: Some(self.limit()),
            status: Status::Unused as i32,
        };
        io::write_proto(&mut stop_stream, &stop_msg)
            .await
            .map_err(|_| Status::ConnectionFailed)?;
        let response = tokio::time::timeout(
            CONTROL_TIMEOUT,
            io::read_proto::<_, proto::StopMessage>(&mut stop_stream, MAX_CONTROL_MESSAGE),
        )
        .await
        .map_err(|_| Status::ConnectionFailed)?
        .map_err(|_| Status::ConnectionFailed)?;
        if StopMessageType::from_i32(response.r#type) != Some(StopMessageType::Status)
            || Status::from_i32(response.status) != Some(Status::Ok)
        {
            log::debug!("destination {dst} refused circuit from {src}");
            return Err(Status::ConnectionFailed);
        }

        write_hop_status(hop_stream, Status::Ok)
            .await
            .map_err(|_| Status::ConnectionFailed)?;

        log::debug!("relaying {src} <-> {dst}");
        self.forward(hop_stream, &mut stop_stream).await;
        Ok(())
    }

    fn limit(&self) -> proto::Limit {
        proto::Limit {
            duration: self.config.limit_duration.as_secs() as u32,
            data: self.config.limit_data,
        }
    }

    /// Copy bytes between the two streams until both directions reached
    /// EOF, an error occurred, or a limit was hit. EOF propagates as a
    /// half-close of the opposite direction; an error in one direction
    /// still lets the other drain.
    async fn forward(&self, hop: &mut Stream, stop: &mut Stream) {
        let budget = Arc::new(AtomicI64::new(if self.config.limit_data == 0 {
            i64::MAX
        } else {
            self.config.limit_data as i64
        }));
        let deadline = if self.config.limit_duration.is_zero() {
            Instant::now() + Duration::from_secs(60 * 60 * 24 * 365)
        } else {
            Instant::now() + self.config.limit_duration
        };
        let (mut hop_rd, mut hop_wr) = tokio::io::split(hop);
        let (mut stop_rd, mut stop_wr) = tokio::io::split(stop);
        let (sent, received) = tokio::join!(
            copy_limited(&mut hop_rd, &mut stop_wr, budget.clone(), deadline),
            copy_limited(&mut stop_rd, &mut hop_wr, budget, deadline),
        );
        log::debug!("circuit closed after {sent}+{received} bytes");
    }
}

async fn copy_limited<R, W>(
    rd: &mut R,
    wr: &mut W,
    budget: Arc<AtomicI64>,
    deadline: Instant,
) -> u64
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let mut buf = vec![0u8; FORWARD_BUF_SIZE];
    loop {
        let n = tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                log::debug!("circuit duration limit reached");
                break;
            }
            n = rd.read(&mut buf) => match n {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            },
        };
        if budget.fetch_sub(n as i64, Ordering::SeqCst) < n as i64 {
            log::debug!("circuit data limit reached");
            break;
        }
        if wr.write_all(&buf[..n]).await.is_err() {
            break;
        }
        total += n as u64;
    }
    let _ = wr.shutdown().await;
    total
}

async fn write_hop_status(stream: &mut Stream, status: Status) -> std::io::Result<()> {
    let msg = proto::HopMessage {
        r#type: HopMessageType::Status as i32,
        peer: None,
        reservation: None,
        limit: None,
        status: status as i32,
    };
    io::write_proto(stream, &msg).await
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
