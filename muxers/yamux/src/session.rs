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

//! The yamux session: one frame-reader task over the pipe, one writer task
//! serializing frames through the frame-writer lock, and an optional
//! keepalive task.

use crate::{
    frame::{self, flags, go_away, FrameType, Header, DEFAULT_WINDOW},
    stream::{Cmd, Stream, StreamShared},
    Config,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use peerlink_core::{
    io::BoxPipe,
    muxing::{BoxSubstream, MuxerError, Role, StreamMuxer},
};
use std::{collections::HashMap, io, sync::Arc};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::{mpsc, watch},
};

/// Inbound streams the application has not accepted yet.
const ACCEPT_BACKLOG: usize = 32;

/// Why a session ended. Kept separately from [`MuxerError`] so it can be
/// cloned into every pending call.
#[derive(Clone, Debug)]
enum Terminal {
    Closed,
    GoAway(u32),
    KeepaliveTimeout,
    Protocol(String),
    Io(io::ErrorKind),
}

impl Terminal {
    fn to_error(&self) -> MuxerError {
        match self {
            Terminal::Closed => MuxerError::Closed,
            Terminal::GoAway(code) => MuxerError::GoAway(*code),
            Terminal::KeepaliveTimeout => MuxerError::KeepaliveTimeout,
            Terminal::Protocol(msg) => MuxerError::Protocol(msg.clone()),
            Terminal::Io(kind) => MuxerError::Io(io::Error::from(*kind)),
        }
    }
}

struct SessionState {
    next_id: u32,
    streams: HashMap<u32, Arc<StreamShared>>,
    local_closed: bool,
    remote_go_away: bool,
    error: Option<Terminal>,
    pings_outstanding: u32,
    next_ping: u32,
}

struct Shared {
    config: Config,
    role: Role,
    state: Mutex<SessionState>,
    cmd_tx: mpsc::UnboundedSender<Cmd>,
    /// The frame-writer lock: every frame leaving the session goes through
    /// it, whether from the writer task or from teardown.
    writer: tokio::sync::Mutex<WriteHalf<BoxPipe>>,
    shutdown_tx: watch::Sender<bool>,
}

/// A yamux multiplexing session over one byte pipe.
pub struct Session {
    shared: Arc<Shared>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<Stream>>,
}

impl Session {
    pub fn new(pipe: BoxPipe, role: Role, config: Config) -> Session {
        let (rd, wr) = tokio::io::split(pipe);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BACKLOG);
        let (shutdown_tx, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            state: Mutex::new(SessionState {
                next_id: match role {
                    Role::Initiator => 1,
                    Role::Responder => 2,
                },
                streams: HashMap::new(),
                local_closed: false,
                remote_go_away: false,
                error: None,
                pings_outstanding: 0,
                next_ping: 0,
            }),
            config,
            role,
            cmd_tx,
            writer: tokio::sync::Mutex::new(wr),
            shutdown_tx,
        });

        tokio::spawn(run_reader(shared.clone(), rd, accept_tx));
        tokio::spawn(run_writer(shared.clone(), cmd_rx));
        if let Some(interval) = shared.config.keepalive_interval {
            tokio::spawn(run_keepalive(shared.clone(), interval));
        }

        Session {
            shared,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
        }
    }

    fn pending_error(&self) -> Option<MuxerError> {
        let state = self.shared.state.lock();
        if let Some(terminal) = &state.error {
            return Some(terminal.to_error());
        }
        if state.local_closed {
            return Some(MuxerError::Closed);
        }
        None
    }
}

#[async_trait]
impl StreamMuxer for Session {
    async fn open_stream(&self) -> Result<BoxSubstream, MuxerError> {
        let (shared_stream, header) = {
            let mut state = self.shared.state.lock();
            if let Some(terminal) = &state.error {
                return Err(terminal.to_error());
            }
            if state.local_closed || state.remote_go_away {
                return Err(MuxerError::Closed);
            }
            if state.streams.len() >= self.shared.config.max_concurrent_streams {
                return Err(MuxerError::StreamLimitExceeded);
            }
            let id = state.next_id;
            state.next_id = state.next_id.wrapping_add(2);
            let shared_stream =
                StreamShared::new(id, self.shared.config.receive_window, DEFAULT_WINDOW);
            state.streams.insert(id, shared_stream.clone());
            let header = Header::new(
                FrameType::WindowUpdate,
                flags::SYN,
                id,
                self.shared.config.receive_window.saturating_sub(DEFAULT_WINDOW),
            );
            (shared_stream, header)
        };
        self.shared
            .cmd_tx
            .send(Cmd::Frame(header, Bytes::new()))
            .map_err(|_| MuxerError::Closed)?;
        Ok(Box::new(Stream::new(shared_stream, self.shared.cmd_tx.clone())))
    }

    async fn accept_stream(&self) -> Result<BoxSubstream, MuxerError> {
        if let Some(err) = self.pending_error() {
            return Err(err);
        }
        let mut rx = self.accept_rx.lock().await;
        match rx.recv().await {
            Some(stream) => Ok(Box::new(stream)),
            None => Err(self.pending_error().unwrap_or(MuxerError::Closed)),
        }
    }

    async fn close(&self) -> Result<(), MuxerError> {
        {
            let mut state = self.shared.state.lock();
            if state.local_closed || state.error.is_some() {
                return Ok(());
            }
            state.local_closed = true;
        }
        let header = Header::new(FrameType::GoAway, 0, 0, go_away::NORMAL);
        let _ = self.shared.cmd_tx.send(Cmd::Frame(header, Bytes::new()));
        Ok(())
    }

    fn is_closed(&self) -> bool {
        let state = self.shared.state.lock();
        state.local_closed || state.error.is_some()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.shared.shutdown_tx.send(true);
        let mut state = self.shared.state.lock();
        if state.error.is_none() {
            state.error = Some(Terminal::Closed);
        }
        for stream in state.streams.values() {
            stream.mark_reset();
        }
    }
}

/// Mark the session dead and reset every stream.
fn teardown(shared: &Shared, terminal: Terminal) {
    let mut state = shared.state.lock();
    if state.error.is_none() {
        log::debug!("session terminated: {terminal:?}");
        state.error = Some(terminal);
    }
    for stream in state.streams.values() {
        stream.mark_reset();
    }
    drop(state);
    let _ = shared.shutdown_tx.send(true);
}

async fn run_reader(shared: Arc<Shared>, mut rd: ReadHalf<BoxPipe>, accept_tx: mpsc::Sender<Stream>) {
    let mut shutdown_rx = shared.shutdown_tx.subscribe();
    let mut accept_tx = Some(accept_tx);
    let terminal = loop {
        let header = tokio::select! {
            _ = shutdown_rx.changed() => break Terminal::Closed,
            header = frame::read_header(&mut rd) => match header {
                Ok(header) => header,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break Terminal::Closed,
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    break Terminal::Protocol(e.to_string())
                }
                Err(e) => break Terminal::Io(e.kind()),
            },
        };
        let result = match header.frame_type {
            FrameType::Data => handle_data(&shared, accept_tx.as_ref(), header, &mut rd).await,
            FrameType::WindowUpdate => handle_window_update(&shared, accept_tx.as_ref(), header),
            FrameType::Ping => {
                handle_ping(&shared, header);
                Ok(())
            }
            FrameType::GoAway => {
                if header.length == go_away::NORMAL {
                    shared.state.lock().remote_go_away = true;
                    // No new inbound streams will arrive; unblock the
                    // accept loop while existing streams drain.
                    accept_tx = None;
                    Ok(())
                } else {
                    break Terminal::GoAway(header.length);
                }
            }
        };
        if let Err(terminal) = result {
            break terminal;
        }
    };
    // Let the remote know when it misbehaved.
    if let Terminal::Protocol(_) = &terminal {
        let mut writer = shared.writer.lock().await;
        let header = Header::new(FrameType::GoAway, 0, 0, go_away::PROTOCOL_ERROR);
        let _ = frame::write_frame(&mut *writer, &header, &[]).await;
        let _ = writer.shutdown().await;
    }
    teardown(&shared, terminal);
}

async fn handle_data(
    shared: &Arc<Shared>,
    accept_tx: Option<&mpsc::Sender<Stream>>,
    header: Header,
    rd: &mut ReadHalf<BoxPipe>,
) -> Result<(), Terminal> {
    let len = header.length as usize;
    if len > frame::DEFAULT_WINDOW as usize * 4 {
        return Err(Terminal::Protocol(format!("data frame of {len} bytes")));
    }
    let mut payload = vec![0u8; len];
    if len > 0 {
        rd.read_exact(&mut payload)
            .await
            .map_err(|e| Terminal::Io(e.kind()))?;
    }

    if header.has(flags::SYN) {
        open_inbound(shared, accept_tx, &header, DEFAULT_WINDOW)?;
    }

    let stream = shared.state.lock().streams.get(&header.stream_id).cloned();
    let Some(stream) = stream else {
        log::trace!("data for unknown stream {}, discarding", header.stream_id);
        return Ok(());
    };

    if len > 0 {
        let mut state = stream.state.lock();
        if (state.recv_window_remaining as usize) < len {
            return Err(Terminal::Protocol(format!(
                "stream {} window exceeded",
                header.stream_id
            )));
        }
        state.recv_window_remaining -= len as u32;
        state.buffered += len as u32;
        state.recv_buf.push_back(Bytes::from(payload));
        if let Some(w) = state.read_waker.take() {
            w.wake();
        }
    }

    apply_close_flags(&stream, &header);
    Ok(())
}

fn handle_window_update(
    shared: &Arc<Shared>,
    accept_tx: Option<&mpsc::Sender<Stream>>,
    header: Header,
) -> Result<(), Terminal> {
    if header.has(flags::SYN) {
        open_inbound(shared, accept_tx, &header, DEFAULT_WINDOW + header.length)?;
        let stream = shared.state.lock().streams.get(&header.stream_id).cloned();
        if let Some(stream) = stream {
            apply_close_flags(&stream, &header);
        }
        return Ok(());
    }

    let stream = shared.state.lock().streams.get(&header.stream_id).cloned();
    let Some(stream) = stream else {
        log::trace!("window update for unknown stream {}", header.stream_id);
        return Ok(());
    };
    {
        let mut state = stream.state.lock();
        if header.has(flags::ACK) {
            state.acked = true;
        }
        if header.length > 0 {
            state.send_window = state.send_window.saturating_add(header.length);
            if let Some(w) = state.write_waker.take() {
                w.wake();
            }
        }
    }
    apply_close_flags(&stream, &header);
    Ok(())
}

fn apply_close_flags(stream: &Arc<StreamShared>, header: &Header) {
    if header.has(flags::RST) {
        stream.mark_reset();
        return;
    }
    if header.has(flags::FIN) {
        let mut state = stream.state.lock();
        state.remote_fin = true;
        if let Some(w) = state.read_waker.take() {
            w.wake();
        }
    }
}

fn open_inbound(
    shared: &Arc<Shared>,
    accept_tx: Option<&mpsc::Sender<Stream>>,
    header: &Header,
    send_window: u32,
) -> Result<(), Terminal> {
    let id = header.stream_id;
    let expected_parity = match shared.role {
        // The initiator allocates odd ids, so inbound ones must be even,
        // and vice versa.
        Role::Initiator => 0,
        Role::Responder => 1,
    };
    if id % 2 != expected_parity {
        return Err(Terminal::Protocol(format!(
            "inbound stream id {id} has wrong parity"
        )));
    }

    let mut state = shared.state.lock();
    if state.streams.contains_key(&id) {
        return Err(Terminal::Protocol(format!("stream id {id} reused")));
    }
    if state.local_closed || state.streams.len() >= shared.config.max_concurrent_streams {
        drop(state);
        let rst = Header::new(FrameType::WindowUpdate, flags::RST, id, 0);
        let _ = shared.cmd_tx.send(Cmd::Frame(rst, Bytes::new()));
        return Ok(());
    }
    let stream_shared = StreamShared::new(id, shared.config.receive_window, send_window);
    state.streams.insert(id, stream_shared.clone());
    drop(state);

    // Acknowledge, announcing any window beyond the protocol default.
    let ack = Header::new(
        FrameType::WindowUpdate,
        flags::ACK,
        id,
        shared.config.receive_window.saturating_sub(DEFAULT_WINDOW),
    );
    let _ = shared.cmd_tx.send(Cmd::Frame(ack, Bytes::new()));

    let stream = Stream::new(stream_shared, shared.cmd_tx.clone());
    match accept_tx {
        Some(accept_tx) => {
            // Backlog overflow refuses the stream rather than buffering
            // without bound. Dropping the handle sends the reset.
            if accept_tx.try_send(stream).is_err() {
                log::debug!("accept backlog full, resetting inbound stream {id}");
            }
        }
        None => {
            log::debug!("nobody accepting inbound stream {id}, resetting");
            drop(stream);
        }
    }
    Ok(())
}

fn handle_ping(shared: &Arc<Shared>, header: Header) {
    if header.has(flags::SYN) {
        let pong = Header::new(FrameType::Ping, flags::ACK, 0, header.length);
        let _ = shared.cmd_tx.send(Cmd::Frame(pong, Bytes::new()));
    } else if header.has(flags::ACK) {
        shared.state.lock().pings_outstanding = 0;
    }
}

async fn run_writer(shared: Arc<Shared>, mut cmd_rx: mpsc::UnboundedReceiver<Cmd>) {
    let mut shutdown_rx = shared.shutdown_tx.subscribe();
    loop {
        let cmd = tokio::select! {
            _ = shutdown_rx.changed() => break,
            cmd = cmd_rx.recv() => match cmd {
                Some(cmd) => cmd,
                None => break,
            },
        };
        match cmd {
            Cmd::Frame(header, payload) => {
                let mut writer = shared.writer.lock().await;
                if let Err(e) = frame::write_frame(&mut *writer, &header, &payload).await {
                    drop(writer);
                    teardown(&shared, Terminal::Io(e.kind()));
                    break;
                }
            }
            Cmd::Dropped(id) => {
                shared.state.lock().streams.remove(&id);
            }
        }
    }
    // Drain the pipe so the remote sees our final frames, then close it.
    let mut writer = shared.writer.lock().await;
    let _ = writer.shutdown().await;
}

async fn run_keepalive(shared: Arc<Shared>, interval: std::time::Duration) {
    let mut shutdown_rx = shared.shutdown_tx.subscribe();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // immediate first tick
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => return,
            _ = ticker.tick() => {}
        }
        let ping = {
            let mut state = shared.state.lock();
            if state.error.is_some() {
                return;
            }
            if state.pings_outstanding >= 2 {
                None
            } else {
                state.pings_outstanding += 1;
                state.next_ping = state.next_ping.wrapping_add(1);
                Some(state.next_ping)
            }
        };
        match ping {
            Some(value) => {
                let header = Header::new(FrameType::Ping, flags::SYN, 0, value);
                let _ = shared.cmd_tx.send(Cmd::Frame(header, Bytes::new()));
            }
            None => {
                // Two keepalive intervals without a pong: the session is
                // dead. Tell the remote and tear down.
                log::debug!("keepalive timeout, terminating session");
                let mut writer = shared.writer.lock().await;
                let header = Header::new(FrameType::GoAway, 0, 0, go_away::TIMEOUT);
                let _ = frame::write_frame(&mut *writer, &header, &[]).await;
                let _ = writer.shutdown().await;
                drop(writer);
                teardown(&shared, Terminal::KeepaliveTimeout);
                return;
            }
        }
    }
}
