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

//! Byte-pipe plumbing shared by transports and protocols.
//!
//! Control messages on streams are protobuf, delimited by an unsigned-varint
//! length prefix. All readers here consume exactly the delimited bytes and
//! never read ahead, so bytes arriving right after a control message (e.g.
//! the first bytes of a pipelined handshake) stay in the pipe for whoever
//! reads next.

use std::io;

use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// An ordered reliable byte pipe.
pub trait AsyncIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncIo for T {}

/// A boxed byte pipe, as produced by transports and consumed by upgrades.
pub type BoxPipe = Box<dyn AsyncIo>;

/// Read an unsigned varint from `io`, one byte at a time.
pub async fn read_varint<S>(io: &mut S) -> io::Result<u64>
where
    S: AsyncRead + Unpin,
{
    let mut value = 0u64;
    for i in 0..9 {
        let b = io.read_u8().await?;
        value |= u64::from(b & 0x7f) << (i * 7);
        if b & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        "varint length prefix too large",
    ))
}

/// Write an unsigned varint to `io`.
pub async fn write_varint<S>(io: &mut S, value: u64) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut buf = unsigned_varint::encode::u64_buffer();
    io.write_all(unsigned_varint::encode::u64(value, &mut buf))
        .await
}

/// Read one varint-length-prefixed frame of at most `max_len` bytes.
pub async fn read_length_prefixed<S>(io: &mut S, max_len: usize) -> io::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let len = read_varint(io).await? as usize;
    if len > max_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds maximum {max_len}"),
        ));
    }
    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Write one varint-length-prefixed frame.
pub async fn write_length_prefixed<S>(io: &mut S, data: &[u8]) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    write_varint(io, data.len() as u64).await?;
    io.write_all(data).await?;
    io.flush().await
}

/// Read one length-delimited protobuf message.
pub async fn read_proto<S, M>(io: &mut S, max_len: usize) -> io::Result<M>
where
    S: AsyncRead + Unpin,
    M: Message + Default,
{
    let buf = read_length_prefixed(io, max_len).await?;
    M::decode(buf.as_slice()).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Write one length-delimited protobuf message.
pub async fn write_proto<S, M>(io: &mut S, msg: &M) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
    M: Message,
{
    write_length_prefixed(io, &msg.encode_to_vec()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn length_prefixed_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_length_prefixed(&mut a, b"hello").await.unwrap();
        assert_eq!(read_length_prefixed(&mut b, 64).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_length_prefixed(&mut a, &[0u8; 64]).await.unwrap();
        let err = read_length_prefixed(&mut b, 16).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn trailing_bytes_stay_in_the_pipe() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_length_prefixed(&mut a, b"ctl").await.unwrap();
        a.write_all(b"payload").await.unwrap();
        assert_eq!(read_length_prefixed(&mut b, 64).await.unwrap(), b"ctl");
        let mut rest = [0u8; 7];
        b.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"payload");
    }
}
