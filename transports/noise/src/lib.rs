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

//! Noise XX security for peerlink connections: mutual authentication of
//! peer ids and an encrypted, framed pipe for everything after the
//! handshake.

mod handshake;
mod io;
mod proto;

pub use io::{NoiseOutput, MAX_FRAME_LEN, MAX_PLAINTEXT_LEN};

use async_trait::async_trait;
use peerlink_core::{
    io::BoxPipe,
    upgrader::{SecurityUpgrade, UpgradeError},
};
use peerlink_identity::{Keypair, PeerId};
use std::time::Duration;

pub const PROTOCOL_NAME: &str = "/noise";

/// Noise configuration; hand it to the upgrader as a security protocol.
#[derive(Clone)]
pub struct Config {
    identity: Keypair,
    /// Deadline for the three handshake messages.
    pub timeout: Duration,
}

impl Config {
    pub fn new(identity: &Keypair) -> Config {
        Config {
            identity: identity.clone(),
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Config {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl SecurityUpgrade for Config {
    fn protocol_name(&self) -> &'static str {
        PROTOCOL_NAME
    }

    async fn secure_outbound(
        &self,
        pipe: BoxPipe,
        expected: Option<PeerId>,
    ) -> Result<(PeerId, BoxPipe), UpgradeError> {
        let (peer, output) = tokio::time::timeout(
            self.timeout,
            handshake::initiator(pipe, &self.identity, expected),
        )
        .await
        .map_err(|_| UpgradeError::HandshakeTimeout)?
        .map_err(into_upgrade_error)?;
        Ok((peer, Box::new(output)))
    }

    async fn secure_inbound(&self, pipe: BoxPipe) -> Result<(PeerId, BoxPipe), UpgradeError> {
        let (peer, output) =
            tokio::time::timeout(self.timeout, handshake::responder(pipe, &self.identity))
                .await
                .map_err(|_| UpgradeError::HandshakeTimeout)?
                .map_err(into_upgrade_error)?;
        Ok((peer, Box::new(output)))
    }
}

fn into_upgrade_error(e: NoiseError) -> UpgradeError {
    match e {
        NoiseError::PeerIdMismatch { expected, actual } => {
            UpgradeError::PeerIdMismatch { expected, actual }
        }
        e => UpgradeError::Security(Box::new(e)),
    }
}

/// Errors raised while establishing or using a noise session.
#[derive(Debug, thiserror::Error)]
pub enum NoiseError {
    #[error(transparent)]
    Snow(#[from] snow::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// The handshake payload is missing or undecodable.
    #[error("invalid handshake payload")]
    BadHandshakePayload,
    /// The identity signature over the static key does not verify.
    #[error("invalid static key signature")]
    InvalidStaticKeySignature,
    #[error("signing the static key failed")]
    SigningFailed,
    /// The authenticated peer is not who the dialer expected.
    #[error("authenticated peer {actual}, expected {expected}")]
    PeerIdMismatch { expected: PeerId, actual: PeerId },
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn pipe_pair() -> (BoxPipe, BoxPipe) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (Box::new(a), Box::new(b))
    }

    #[tokio::test]
    async fn handshake_authenticates_both_sides() {
        let dialer_key = Keypair::generate_ed25519();
        let listener_key = Keypair::generate_ed25519();
        let dialer = Config::new(&dialer_key);
        let listener = Config::new(&listener_key);
        let listener_peer = listener_key.public().to_peer_id();
        let dialer_peer = dialer_key.public().to_peer_id();

        let (a, b) = pipe_pair();
        let server = tokio::spawn(async move { listener.secure_inbound(b).await });
        let (peer, mut out_a) = dialer
            .secure_outbound(a, Some(listener_peer))
            .await
            .unwrap();
        assert_eq!(peer, listener_peer);
        let (peer, mut out_b) = server.await.unwrap().unwrap();
        assert_eq!(peer, dialer_peer);

        // Data flows both ways through the encrypted pipe.
        out_a.write_all(b"ping over noise").await.unwrap();
        out_a.flush().await.unwrap();
        let mut buf = [0u8; 15];
        out_b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping over noise");

        out_b.write_all(&buf).await.unwrap();
        out_b.flush().await.unwrap();
        let mut echo = [0u8; 15];
        out_a.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo, b"ping over noise");
    }

    #[tokio::test]
    async fn large_payload_spans_frames() {
        let dialer = Config::new(&Keypair::generate_ed25519());
        let listener = Config::new(&Keypair::generate_ed25519());
        let (a, b) = pipe_pair();
        let server = tokio::spawn(async move { listener.secure_inbound(b).await });
        let (_, mut out_a) = dialer.secure_outbound(a, None).await.unwrap();
        let (_, mut out_b) = server.await.unwrap().unwrap();

        let payload: Vec<u8> = (0..200_000u32).map(|i| i as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            out_a.write_all(&payload).await.unwrap();
            out_a.flush().await.unwrap();
            out_a
        });
        let mut received = vec![0u8; expected.len()];
        out_b.read_exact(&mut received).await.unwrap();
        assert_eq!(received, expected);
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn peer_id_mismatch_fails_the_dial() {
        let dialer = Config::new(&Keypair::generate_ed25519());
        let listener = Config::new(&Keypair::generate_ed25519());
        let (a, b) = pipe_pair();
        let imposter = PeerId::random();
        let server = tokio::spawn(async move {
            let _ = listener.secure_inbound(b).await;
        });
        let err = dialer
            .secure_outbound(a, Some(imposter))
            .await
            .err()
            .expect("expected an error");
        assert!(matches!(err, UpgradeError::PeerIdMismatch { .. }));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn handshake_timeout_fires() {
        let dialer = Config::new(&Keypair::generate_ed25519())
            .with_timeout(Duration::from_millis(50));
        // A listener that never answers.
        let (a, _b) = pipe_pair();
        let err = dialer
            .secure_outbound(a, None)
            .await
            .err()
            .expect("expected an error");
        assert!(matches!(err, UpgradeError::HandshakeTimeout));
    }
}
