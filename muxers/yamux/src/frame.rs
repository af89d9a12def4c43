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

//! Yamux v0 frame layout.
//!
//! Every frame starts with a 12-byte header: version, type, flags (u16),
//! stream id (u32), length (u32), all big-endian. Only `Data` frames carry a
//! payload; for the other types the length field doubles as the window
//! delta, ping opaque value or go-away code.

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const PROTOCOL_VERSION: u8 = 0;
pub const HEADER_LEN: usize = 12;

/// The initial window every stream starts with, per the yamux spec.
/// Receivers advertising a larger window announce the difference with a
/// window update.
pub const DEFAULT_WINDOW: u32 = 256 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Data = 0x0,
    WindowUpdate = 0x1,
    Ping = 0x2,
    GoAway = 0x3,
}

impl FrameType {
    fn from_u8(v: u8) -> Option<FrameType> {
        match v {
            0x0 => Some(FrameType::Data),
            0x1 => Some(FrameType::WindowUpdate),
            0x2 => Some(FrameType::Ping),
            0x3 => Some(FrameType::GoAway),
            _ => None,
        }
    }
}

pub mod flags {
    pub const SYN: u16 = 0x1;
    pub const ACK: u16 = 0x2;
    pub const FIN: u16 = 0x4;
    pub const RST: u16 = 0x8;
}

pub mod go_away {
    /// Clean termination: streams drain, no new streams.
    pub const NORMAL: u32 = 0x0;
    pub const PROTOCOL_ERROR: u32 = 0x1;
    pub const INTERNAL_ERROR: u32 = 0x2;
    /// The remote stopped answering keepalive pings.
    pub const TIMEOUT: u32 = 0x3;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub frame_type: FrameType,
    pub flags: u16,
    pub stream_id: u32,
    /// Payload length for `Data`; the value for every other type.
    pub length: u32,
}

impl Header {
    pub fn new(frame_type: FrameType, flags: u16, stream_id: u32, length: u32) -> Header {
        Header {
            frame_type,
            flags,
            stream_id,
            length,
        }
    }

    pub fn has(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = PROTOCOL_VERSION;
        buf[1] = self.frame_type as u8;
        buf[2..4].copy_from_slice(&self.flags.to_be_bytes());
        buf[4..8].copy_from_slice(&self.stream_id.to_be_bytes());
        buf[8..12].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8; HEADER_LEN]) -> Result<Header, FrameDecodeError> {
        if buf[0] != PROTOCOL_VERSION {
            return Err(FrameDecodeError::UnsupportedVersion(buf[0]));
        }
        let frame_type =
            FrameType::from_u8(buf[1]).ok_or(FrameDecodeError::UnknownType(buf[1]))?;
        Ok(Header {
            frame_type,
            flags: u16::from_be_bytes([buf[2], buf[3]]),
            stream_id: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            length: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("unsupported yamux version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown frame type {0}")]
    UnknownType(u8),
}

/// Read the next frame header from `io`.
pub async fn read_header<R>(io: &mut R) -> io::Result<Header>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; HEADER_LEN];
    io.read_exact(&mut buf).await?;
    Header::decode(&buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Write a header and optional payload as one frame.
pub async fn write_frame<W>(io: &mut W, header: &Header, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    debug_assert!(
        header.frame_type != FrameType::Data || header.length as usize == payload.len()
    );
    io.write_all(&header.encode()).await?;
    if !payload.is_empty() {
        io.write_all(payload).await?;
    }
    io.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let header = Header::new(FrameType::WindowUpdate, flags::SYN | flags::ACK, 7, 65536);
        assert_eq!(Header::decode(&header.encode()).unwrap(), header);
    }

    #[test]
    fn bad_version_rejected() {
        let mut buf = Header::new(FrameType::Data, 0, 1, 0).encode();
        buf[0] = 9;
        assert!(matches!(
            Header::decode(&buf),
            Err(FrameDecodeError::UnsupportedVersion(9))
        ));
    }
}
