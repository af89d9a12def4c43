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

//! A single yamux stream.
//!
//! Streams never touch the pipe themselves. Reads drain a buffer the
//! session's frame reader fills; writes debit the remote's receive window
//! up front and enqueue `Data` frames with the session's frame writer, so a
//! stream can never have more bytes in flight than the window it was
//! granted.

use crate::frame::{flags, FrameType, Header};
use bytes::Bytes;
use parking_lot::Mutex;
use peerlink_core::muxing::{stream_reset_error, Substream};
use std::{
    collections::VecDeque,
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, Waker},
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

/// Upper bound for a single `Data` frame payload.
const MAX_FRAME_LEN: usize = 16 * 1024;

pub(crate) enum Cmd {
    /// Write a frame to the pipe.
    Frame(Header, Bytes),
    /// A stream handle was dropped; forget its state.
    Dropped(u32),
}

pub(crate) struct StreamShared {
    pub id: u32,
    /// The receive window size this side grants, fixed at stream creation.
    pub window: u32,
    pub state: Mutex<StreamState>,
}

pub(crate) struct StreamState {
    pub recv_buf: VecDeque<Bytes>,
    /// Bytes in `recv_buf`, i.e. received but not yet consumed.
    pub buffered: u32,
    /// Credit consumed by the application but not yet returned to the
    /// remote via a window update.
    pub credit_pending: u32,
    /// What the remote may still send us.
    pub recv_window_remaining: u32,
    /// What we may still send the remote.
    pub send_window: u32,
    pub local_fin: bool,
    pub remote_fin: bool,
    pub reset: bool,
    pub acked: bool,
    pub read_waker: Option<Waker>,
    pub write_waker: Option<Waker>,
}

impl StreamShared {
    pub fn new(id: u32, window: u32, send_window: u32) -> Arc<StreamShared> {
        Arc::new(StreamShared {
            id,
            window,
            state: Mutex::new(StreamState {
                recv_buf: VecDeque::new(),
                buffered: 0,
                credit_pending: 0,
                recv_window_remaining: window,
                send_window,
                local_fin: false,
                remote_fin: false,
                reset: false,
                acked: false,
                read_waker: None,
                write_waker: None,
            }),
        })
    }

    /// Mark the stream reset (remote RST, session teardown) and wake any
    /// parked readers or writers.
    pub fn mark_reset(&self) {
        let mut state = self.state.lock();
        state.reset = true;
        wake(&mut state);
    }

    pub fn wake_all(&self) {
        wake(&mut self.state.lock());
    }
}

fn wake(state: &mut StreamState) {
    if let Some(w) = state.read_waker.take() {
        w.wake();
    }
    if let Some(w) = state.write_waker.take() {
        w.wake();
    }
}

/// One bidirectional channel within a yamux session.
pub struct Stream {
    shared: Arc<StreamShared>,
    cmd: mpsc::UnboundedSender<Cmd>,
}

impl Stream {
    pub(crate) fn new(shared: Arc<StreamShared>, cmd: mpsc::UnboundedSender<Cmd>) -> Stream {
        Stream { shared, cmd }
    }

    pub fn id(&self) -> u32 {
        self.shared.id
    }

    fn send_frame(&self, header: Header, payload: Bytes) -> io::Result<()> {
        self.cmd
            .send(Cmd::Frame(header, payload))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "session closed"))
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let mut state = this.shared.state.lock();

        if !state.recv_buf.is_empty() {
            let mut copied = 0u32;
            while buf.remaining() > 0 {
                let Some(front) = state.recv_buf.front_mut() else { break };
                let n = front.len().min(buf.remaining());
                buf.put_slice(&front[..n]);
                copied += n as u32;
                if n == front.len() {
                    state.recv_buf.pop_front();
                } else {
                    let _ = front.split_to(n);
                }
            }
            state.buffered -= copied;
            state.credit_pending += copied;
            // Window-update coalescing: return credit once half the window
            // has been consumed.
            if !state.remote_fin && !state.reset && state.credit_pending >= this.shared.window / 2
            {
                let credit = state.credit_pending;
                state.credit_pending = 0;
                state.recv_window_remaining += credit;
                drop(state);
                let header =
                    Header::new(FrameType::WindowUpdate, 0, this.shared.id, credit);
                let _ = this.send_frame(header, Bytes::new());
            }
            return Poll::Ready(Ok(()));
        }

        if state.reset {
            return Poll::Ready(Err(stream_reset_error()));
        }
        if state.remote_fin {
            return Poll::Ready(Ok(())); // EOF
        }
        state.read_waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let mut state = this.shared.state.lock();

        if state.reset {
            return Poll::Ready(Err(stream_reset_error()));
        }
        if state.local_fin {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write after shutdown",
            )));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if state.send_window == 0 {
            state.write_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let n = buf
            .len()
            .min(state.send_window as usize)
            .min(MAX_FRAME_LEN);
        state.send_window -= n as u32;
        drop(state);

        let header = Header::new(FrameType::Data, 0, this.shared.id, n as u32);
        this.send_frame(header, Bytes::copy_from_slice(&buf[..n]))?;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are flushed by the session's writer as they are enqueued.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let mut state = this.shared.state.lock();
        if state.local_fin || state.reset {
            return Poll::Ready(Ok(()));
        }
        state.local_fin = true;
        drop(state);
        let header = Header::new(FrameType::Data, flags::FIN, this.shared.id, 0);
        Poll::Ready(this.send_frame(header, Bytes::new()))
    }
}

impl Substream for Stream {
    fn reset(&mut self) {
        let mut state = self.shared.state.lock();
        if state.reset {
            return;
        }
        state.reset = true;
        state.local_fin = true;
        state.remote_fin = true;
        wake(&mut state);
        drop(state);
        let header = Header::new(FrameType::WindowUpdate, flags::RST, self.shared.id, 0);
        let _ = self.send_frame(header, Bytes::new());
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        let state = self.shared.state.lock();
        // A stream dropped after a clean write-side close just goes away;
        // only an abrupt drop resets the remote.
        let needs_reset = !state.reset && !state.local_fin;
        drop(state);
        if needs_reset {
            let header = Header::new(FrameType::WindowUpdate, flags::RST, self.shared.id, 0);
            let _ = self.send_frame(header, Bytes::new());
        }
        let _ = self.cmd.send(Cmd::Dropped(self.shared.id));
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream").field("id", &self.shared.id).finish()
    }
}
