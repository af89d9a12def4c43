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

//! The three-message XX handshake.
//!
//! A fresh noise static key is generated for every connection; the
//! handshake payload binds it to the long-lived identity key with a
//! signature over the domain-separated static key, so completing the
//! handshake authenticates the remote's peer id.

use crate::{
    io::{NoiseOutput, MAX_FRAME_LEN},
    proto::NoiseHandshakePayload,
    NoiseError,
};
use once_cell::sync::Lazy;
use peerlink_core::io::BoxPipe;
use peerlink_identity::{Keypair, PeerId, PublicKey};
use prost::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

static PARAMS: Lazy<snow::params::NoiseParams> = Lazy::new(|| {
    "Noise_XX_25519_ChaChaPoly_SHA256"
        .parse()
        .expect("well-formed noise pattern name")
});

const STATIC_KEY_DOMAIN: &[u8] = b"noise-libp2p-static-key:";

pub(crate) async fn initiator(
    mut pipe: BoxPipe,
    identity: &Keypair,
    expected: Option<PeerId>,
) -> Result<(PeerId, NoiseOutput), NoiseError> {
    let static_keypair = snow::Builder::new(PARAMS.clone()).generate_keypair()?;
    let mut hs = snow::Builder::new(PARAMS.clone())
        .local_private_key(&static_keypair.private)
        .build_initiator()?;
    let our_payload = signed_payload(identity, &static_keypair.public)?;
    let mut buf = vec![0u8; MAX_FRAME_LEN];

    // -> e
    let n = hs.write_message(&[], &mut buf)?;
    send(&mut pipe, &buf[..n]).await?;

    // <- e, ee, s, es  (carries the responder's identity assertion)
    let msg = recv(&mut pipe).await?;
    let mut plaintext = vec![0u8; MAX_FRAME_LEN];
    let n = hs.read_message(&msg, &mut plaintext)?;
    let remote_static = hs
        .get_remote_static()
        .ok_or(NoiseError::BadHandshakePayload)?
        .to_vec();
    let peer = verify_payload(&plaintext[..n], &remote_static)?;

    // -> s, se  (carries ours)
    let n = hs.write_message(&our_payload, &mut buf)?;
    send(&mut pipe, &buf[..n]).await?;

    if let Some(expected) = expected {
        if expected != peer {
            return Err(NoiseError::PeerIdMismatch {
                expected,
                actual: peer,
            });
        }
    }

    let transport = hs.into_transport_mode()?;
    Ok((peer, NoiseOutput::new(pipe, transport)))
}

pub(crate) async fn responder(
    mut pipe: BoxPipe,
    identity: &Keypair,
) -> Result<(PeerId, NoiseOutput), NoiseError> {
    let static_keypair = snow::Builder::new(PARAMS.clone()).generate_keypair()?;
    let mut hs = snow::Builder::new(PARAMS.clone())
        .local_private_key(&static_keypair.private)
        .build_responder()?;
    let our_payload = signed_payload(identity, &static_keypair.public)?;
    let mut buf = vec![0u8; MAX_FRAME_LEN];
    let mut plaintext = vec![0u8; MAX_FRAME_LEN];

    // <- e
    let msg = recv(&mut pipe).await?;
    hs.read_message(&msg, &mut plaintext)?;

    // -> e, ee, s, es
    let n = hs.write_message(&our_payload, &mut buf)?;
    send(&mut pipe, &buf[..n]).await?;

    // <- s, se
    let msg = recv(&mut pipe).await?;
    let n = hs.read_message(&msg, &mut plaintext)?;
    let remote_static = hs
        .get_remote_static()
        .ok_or(NoiseError::BadHandshakePayload)?
        .to_vec();
    let peer = verify_payload(&plaintext[..n], &remote_static)?;

    let transport = hs.into_transport_mode()?;
    Ok((peer, NoiseOutput::new(pipe, transport)))
}

/// Build our handshake payload: identity key plus a signature binding the
/// per-connection noise static key to it.
fn signed_payload(identity: &Keypair, static_public: &[u8]) -> Result<Vec<u8>, NoiseError> {
    let mut to_sign = Vec::with_capacity(STATIC_KEY_DOMAIN.len() + static_public.len());
    to_sign.extend_from_slice(STATIC_KEY_DOMAIN);
    to_sign.extend_from_slice(static_public);
    let identity_sig = identity
        .sign(&to_sign)
        .map_err(|_| NoiseError::SigningFailed)?;
    Ok(NoiseHandshakePayload {
        identity_key: identity.public().to_protobuf_encoding(),
        identity_sig,
    }
    .encode_to_vec())
}

/// Check the remote's identity assertion against the static key the
/// handshake authenticated, yielding the remote peer id.
pub(crate) fn verify_payload(
    payload: &[u8],
    remote_static: &[u8],
) -> Result<PeerId, NoiseError> {
    let payload = NoiseHandshakePayload::decode(payload)
        .map_err(|_| NoiseError::BadHandshakePayload)?;
    let identity_key = PublicKey::from_protobuf_encoding(&payload.identity_key)
        .map_err(|_| NoiseError::BadHandshakePayload)?;
    let mut signed = Vec::with_capacity(STATIC_KEY_DOMAIN.len() + remote_static.len());
    signed.extend_from_slice(STATIC_KEY_DOMAIN);
    signed.extend_from_slice(remote_static);
    if !identity_key.verify(&signed, &payload.identity_sig) {
        return Err(NoiseError::InvalidStaticKeySignature);
    }
    Ok(identity_key.to_peer_id())
}

async fn send(pipe: &mut BoxPipe, msg: &[u8]) -> Result<(), NoiseError> {
    debug_assert!(msg.len() <= MAX_FRAME_LEN);
    pipe.write_all(&(msg.len() as u16).to_be_bytes()).await?;
    pipe.write_all(msg).await?;
    pipe.flush().await?;
    Ok(())
}

async fn recv(pipe: &mut BoxPipe) -> Result<Vec<u8>, NoiseError> {
    let len = pipe.read_u16().await? as usize;
    let mut buf = vec![0u8; len];
    pipe.read_exact(&mut buf).await?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forged_static_key_rejected() {
        let identity = Keypair::generate_ed25519();
        let static_keypair = snow::Builder::new(PARAMS.clone())
            .generate_keypair()
            .unwrap();
        let payload = signed_payload(&identity, &static_keypair.public).unwrap();
        // Signature checks out against the key it was made for...
        assert!(verify_payload(&payload, &static_keypair.public).is_ok());
        // ...but not against a key an attacker substituted.
        let other = snow::Builder::new(PARAMS.clone()).generate_keypair().unwrap();
        assert!(matches!(
            verify_payload(&payload, &other.public),
            Err(NoiseError::InvalidStaticKeySignature)
        ));
    }
}
