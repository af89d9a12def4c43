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

//! The authenticated, encrypted pipe produced by a completed handshake.
//!
//! Frames on the wire are a 2-byte big-endian ciphertext length followed by
//! at most 65535 bytes of ciphertext (16-byte tag included). Each direction
//! keeps its own cipher state with a monotonically increasing nonce; any
//! decryption failure poisons the pipe for good.

use peerlink_core::io::BoxPipe;
use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Maximum ciphertext frame size, tag included.
pub const MAX_FRAME_LEN: usize = 65535;
/// Maximum plaintext per frame (frame minus the 16-byte tag).
pub const MAX_PLAINTEXT_LEN: usize = MAX_FRAME_LEN - 16;

enum ReadState {
    /// Reading the 2-byte length prefix.
    Len { buf: [u8; 2], off: usize },
    /// Reading `len` bytes of ciphertext.
    Frame { len: usize },
    /// A decryption failure happened; the pipe is dead.
    Poisoned,
}

pub struct NoiseOutput {
    io: BoxPipe,
    session: snow::TransportState,
    read_state: ReadState,
    read_buf: Vec<u8>,
    read_off: usize,
    decrypted: Vec<u8>,
    decrypted_off: usize,
    write_buf: Vec<u8>,
    write_off: usize,
}

impl NoiseOutput {
    pub(crate) fn new(io: BoxPipe, session: snow::TransportState) -> NoiseOutput {
        NoiseOutput {
            io,
            session,
            read_state: ReadState::Len {
                buf: [0u8; 2],
                off: 0,
            },
            read_buf: vec![0u8; MAX_FRAME_LEN],
            read_off: 0,
            decrypted: Vec::new(),
            decrypted_off: 0,
            write_buf: Vec::new(),
            write_off: 0,
        }
    }

    /// Flush as much pending ciphertext as the pipe accepts.
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.write_off < self.write_buf.len() {
            let n = std::task::ready!(
                Pin::new(&mut self.io).poll_write(cx, &self.write_buf[self.write_off..])
            )?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.write_off += n;
        }
        self.write_buf.clear();
        self.write_off = 0;
        Poll::Ready(Ok(()))
    }
}

impl AsyncRead for NoiseOutput {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.decrypted_off < this.decrypted.len() {
                let n = (this.decrypted.len() - this.decrypted_off).min(buf.remaining());
                buf.put_slice(&this.decrypted[this.decrypted_off..this.decrypted_off + n]);
                this.decrypted_off += n;
                return Poll::Ready(Ok(()));
            }
            match &mut this.read_state {
                ReadState::Poisoned => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "secure channel poisoned by earlier failure",
                    )))
                }
                ReadState::Len { buf: len_buf, off } => {
                    while *off < 2 {
                        let mut rb = ReadBuf::new(&mut len_buf[*off..]);
                        std::task::ready!(Pin::new(&mut this.io).poll_read(cx, &mut rb))?;
                        let n = rb.filled().len();
                        if n == 0 {
                            return if *off == 0 {
                                // Clean EOF between frames.
                                Poll::Ready(Ok(()))
                            } else {
                                Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()))
                            };
                        }
                        *off += n;
                    }
                    let len = u16::from_be_bytes(*len_buf) as usize;
                    this.read_state = ReadState::Frame { len };
                    this.read_off = 0;
                }
                ReadState::Frame { len } => {
                    let len = *len;
                    while this.read_off < len {
                        let mut rb = ReadBuf::new(&mut this.read_buf[this.read_off..len]);
                        std::task::ready!(Pin::new(&mut this.io).poll_read(cx, &mut rb))?;
                        let n = rb.filled().len();
                        if n == 0 {
                            return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                        }
                        this.read_off += n;
                    }
                    let mut plaintext = vec![0u8; len];
                    match this.session.read_message(&this.read_buf[..len], &mut plaintext) {
                        Ok(n) => {
                            plaintext.truncate(n);
                            this.decrypted = plaintext;
                            this.decrypted_off = 0;
                            this.read_state = ReadState::Len {
                                buf: [0u8; 2],
                                off: 0,
                            };
                        }
                        Err(e) => {
                            // A bad tag is fatal to the whole connection.
                            this.read_state = ReadState::Poisoned;
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::InvalidData,
                                format!("noise decrypt failed: {e}"),
                            )));
                        }
                    }
                }
            }
        }
    }
}

impl AsyncWrite for NoiseOutput {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        std::task::ready!(this.poll_drain(cx))?;

        let n = buf.len().min(MAX_PLAINTEXT_LEN);
        let mut ciphertext = vec![0u8; n + 16];
        let len = this
            .session
            .write_message(&buf[..n], &mut ciphertext)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("noise encrypt failed: {e}")))?;
        this.write_buf.clear();
        this.write_buf
            .extend_from_slice(&(len as u16).to_be_bytes());
        this.write_buf.extend_from_slice(&ciphertext[..len]);
        this.write_off = 0;
        // Best effort immediate drain; leftovers go out on the next call.
        match this.poll_drain(cx) {
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) | Poll::Pending => {}
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        std::task::ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        std::task::ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.io).poll_shutdown(cx)
    }
}
