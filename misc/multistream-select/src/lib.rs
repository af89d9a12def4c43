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

//! Multistream-select 1.0: in-band, line-based negotiation of the protocol
//! to speak over a freshly opened byte stream.
//!
//! Every message on the wire is an unsigned-varint length prefix followed by
//! the payload, which is terminated by a newline that counts towards the
//! length. Both sides begin by sending the protocol header; the dialer then
//! proposes protocols one at a time and the listener either echoes the
//! accepted proposal or answers `na`.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// The multistream-select header line (without the trailing newline).
pub const PROTOCOL_ID: &str = "/multistream/1.0.0";

const MSG_NA: &str = "na";

/// Negotiation messages are short protocol identifiers; anything beyond this
/// is a protocol violation.
const MAX_MESSAGE_LEN: usize = 1024;

/// Dialer-side negotiation flavour.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Version {
    /// Propose, then wait for the answer before using the stream.
    V1,
    /// Optimistically pipeline header and the (single) proposal in one
    /// flush and only reconcile the answers later. Used to piggy-back the
    /// muxer proposal onto the tail of a security handshake.
    V1Lazy,
}

/// Errors occurring during protocol negotiation.
#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    /// The remote supports none of the proposed protocols.
    #[error("remote does not support any of the proposed protocols")]
    Failed,
    /// The remote violated the negotiation protocol.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

async fn write_message<S>(io: &mut S, msg: &str) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut buf = unsigned_varint::encode::usize_buffer();
    let len = unsigned_varint::encode::usize(msg.len() + 1, &mut buf);
    io.write_all(len).await?;
    io.write_all(msg.as_bytes()).await?;
    io.write_all(b"\n").await?;
    Ok(())
}

async fn read_message<S>(io: &mut S) -> Result<String, NegotiationError>
where
    S: AsyncRead + Unpin,
{
    let mut len: usize = 0;
    for i in 0.. {
        let b = io.read_u8().await?;
        len |= ((b & 0x7f) as usize) << (i * 7);
        if b & 0x80 == 0 {
            break;
        }
        if i >= 3 {
            return Err(NegotiationError::ProtocolViolation(
                "message length varint too large".into(),
            ));
        }
    }
    if len == 0 || len > MAX_MESSAGE_LEN {
        return Err(NegotiationError::ProtocolViolation(format!(
            "message length {len} out of bounds"
        )));
    }
    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await?;
    if buf.pop() != Some(b'\n') {
        return Err(NegotiationError::ProtocolViolation(
            "message not newline-terminated".into(),
        ));
    }
    String::from_utf8(buf)
        .map_err(|_| NegotiationError::ProtocolViolation("message not utf-8".into()))
}

async fn expect_header<S>(io: &mut S) -> Result<(), NegotiationError>
where
    S: AsyncRead + Unpin,
{
    let msg = read_message(io).await?;
    if msg != PROTOCOL_ID {
        return Err(NegotiationError::ProtocolViolation(format!(
            "unexpected header {msg:?}"
        )));
    }
    Ok(())
}

/// Negotiate one of `protocols` as the dialer, in proposal order. Returns
/// the agreed protocol.
pub async fn dialer_select<S, I>(
    io: &mut S,
    protocols: I,
    version: Version,
) -> Result<String, NegotiationError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    let mut protocols = protocols.into_iter().peekable();
    let first = protocols
        .peek()
        .ok_or(NegotiationError::Failed)?
        .as_ref()
        .to_owned();

    match version {
        Version::V1 => {
            write_message(io, PROTOCOL_ID).await?;
            io.flush().await?;
            expect_header(io).await?;
            for proto in protocols {
                let proto = proto.as_ref();
                write_message(io, proto).await?;
                io.flush().await?;
                let answer = read_message(io).await?;
                if answer == proto {
                    log::debug!("dialer: negotiated {proto}");
                    return Ok(proto.to_owned());
                }
                if answer != MSG_NA {
                    return Err(NegotiationError::ProtocolViolation(format!(
                        "unexpected answer {answer:?}"
                    )));
                }
                log::trace!("dialer: {proto} rejected");
            }
            Err(NegotiationError::Failed)
        }
        Version::V1Lazy => {
            // One flush for header and proposal. The remote must accept
            // either the pipelined or the sequential form.
            write_message(io, PROTOCOL_ID).await?;
            write_message(io, &first).await?;
            io.flush().await?;
            expect_header(io).await?;
            let answer = read_message(io).await?;
            if answer == first {
                log::debug!("dialer: negotiated {first} (lazy)");
                return Ok(first);
            }
            if answer == MSG_NA {
                return Err(NegotiationError::Failed);
            }
            Err(NegotiationError::ProtocolViolation(format!(
                "unexpected answer {answer:?}"
            )))
        }
    }
}

/// Answer a dialer's proposals as the listener, accepting the first proposal
/// contained in `supported`. Returns the agreed protocol.
pub async fn listener_select<S, P>(
    io: &mut S,
    supported: &[P],
) -> Result<String, NegotiationError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    P: AsRef<str>,
{
    write_message(io, PROTOCOL_ID).await?;
    io.flush().await?;
    expect_header(io).await?;
    loop {
        let proposal = read_message(io).await?;
        if supported.iter().any(|p| p.as_ref() == proposal) {
            write_message(io, &proposal).await?;
            io.flush().await?;
            log::debug!("listener: negotiated {proposal}");
            return Ok(proposal);
        }
        log::trace!("listener: rejecting {proposal}");
        write_message(io, MSG_NA).await?;
        io.flush().await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn select_first_overlap() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let dialer = tokio::spawn(async move {
            dialer_select(&mut a, ["/other/1.0.0", "/ping/1.0.0"], Version::V1).await
        });
        let listener =
            tokio::spawn(
                async move { listener_select(&mut b, &["/ping/1.0.0", "/id/1.0.0"]).await },
            );
        assert_eq!(dialer.await.unwrap().unwrap(), "/ping/1.0.0");
        assert_eq!(listener.await.unwrap().unwrap(), "/ping/1.0.0");
    }

    #[tokio::test]
    async fn lazy_dialer_against_plain_listener() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let dialer = tokio::spawn(async move {
            dialer_select(&mut a, ["/yamux/1.0.0"], Version::V1Lazy).await
        });
        let listener =
            tokio::spawn(async move { listener_select(&mut b, &["/yamux/1.0.0"]).await });
        assert_eq!(dialer.await.unwrap().unwrap(), "/yamux/1.0.0");
        assert_eq!(listener.await.unwrap().unwrap(), "/yamux/1.0.0");
    }

    #[tokio::test]
    async fn no_overlap_fails_dialer() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let dialer =
            tokio::spawn(async move { dialer_select(&mut a, ["/foo/1.0.0"], Version::V1).await });
        // Listener keeps answering na until the dialer gives up and the
        // stream closes.
        tokio::spawn(async move {
            let _ = listener_select(&mut b, &["/bar/1.0.0"]).await;
        });
        assert!(matches!(
            dialer.await.unwrap(),
            Err(NegotiationError::Failed)
        ));
    }

    #[tokio::test]
    async fn garbage_header_rejected() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            a.write_all(b"\x13/not-multistream!!\n").await.unwrap();
        });
        assert!(matches!(
            listener_select(&mut b, &["/x/1"]).await,
            Err(NegotiationError::ProtocolViolation(_))
        ));
    }
}
