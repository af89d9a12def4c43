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

//! Peer identities: cryptographic keypairs and the [`PeerId`]s derived from
//! their public keys.
//!
//! A peer is identified by the multihash of the protobuf encoding of its
//! public key, making the identifier self-certifying: possession of the
//! public key is enough to verify that it belongs to a given [`PeerId`].

pub mod ed25519;

mod error;
mod peer_id;
mod proto;

pub use error::{DecodingError, SigningError};
pub use peer_id::{ParseError, PeerId};

use prost::Message;

/// A node's identity keypair.
#[derive(Clone)]
pub enum Keypair {
    Ed25519(ed25519::Keypair),
}

impl Keypair {
    /// Generate a new Ed25519 keypair.
    pub fn generate_ed25519() -> Keypair {
        Keypair::Ed25519(ed25519::Keypair::generate())
    }

    /// Sign `msg` with this keypair's secret key.
    pub fn sign(&self, msg: &[u8]) -> Result<Vec<u8>, SigningError> {
        match self {
            Keypair::Ed25519(kp) => Ok(kp.sign(msg)),
        }
    }

    /// The public half of this keypair.
    pub fn public(&self) -> PublicKey {
        match self {
            Keypair::Ed25519(kp) => PublicKey::Ed25519(kp.public()),
        }
    }

    /// Decode a keypair from the protobuf encoding of its private key.
    pub fn from_protobuf_encoding(bytes: &[u8]) -> Result<Keypair, DecodingError> {
        let pk = proto::PrivateKey::decode(bytes).map_err(DecodingError::bad_protobuf)?;
        match proto::KeyType::from_i32(pk.r#type) {
            Some(proto::KeyType::Ed25519) => {
                Ok(Keypair::Ed25519(ed25519::Keypair::from_bytes(&pk.data)?))
            }
            _ => Err(DecodingError::unsupported_key_type(pk.r#type)),
        }
    }

    /// Encode the private key into its protobuf envelope.
    pub fn to_protobuf_encoding(&self) -> Vec<u8> {
        let pk = match self {
            Keypair::Ed25519(kp) => proto::PrivateKey {
                r#type: proto::KeyType::Ed25519 as i32,
                data: kp.to_bytes().to_vec(),
            },
        };
        pk.encode_to_vec()
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public", &self.public())
            .finish()
    }
}

/// The public key of a node's identity keypair.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum PublicKey {
    Ed25519(ed25519::PublicKey),
}

impl PublicKey {
    /// Verify a signature over `msg` made with the corresponding private key.
    #[must_use]
    pub fn verify(&self, msg: &[u8], sig: &[u8]) -> bool {
        match self {
            PublicKey::Ed25519(pk) => pk.verify(msg, sig),
        }
    }

    /// Encode the public key into the protobuf envelope used on the wire
    /// (handshake payloads, signed records, identify messages).
    pub fn to_protobuf_encoding(&self) -> Vec<u8> {
        let pk = match self {
            PublicKey::Ed25519(pk) => proto::PublicKey {
                r#type: proto::KeyType::Ed25519 as i32,
                data: pk.to_bytes().to_vec(),
            },
        };
        pk.encode_to_vec()
    }

    /// Decode a public key from its protobuf envelope.
    pub fn from_protobuf_encoding(bytes: &[u8]) -> Result<PublicKey, DecodingError> {
        let pk = proto::PublicKey::decode(bytes).map_err(DecodingError::bad_protobuf)?;
        match proto::KeyType::from_i32(pk.r#type) {
            Some(proto::KeyType::Ed25519) => {
                Ok(PublicKey::Ed25519(ed25519::PublicKey::from_bytes(&pk.data)?))
            }
            _ => Err(DecodingError::unsupported_key_type(pk.r#type)),
        }
    }

    /// The [`PeerId`] derived from this public key.
    pub fn to_peer_id(&self) -> PeerId {
        PeerId::from_public_key(self)
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", self.to_peer_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let kp = Keypair::generate_ed25519();
        let msg = b"hello world";
        let sig = kp.sign(msg).unwrap();
        assert!(kp.public().verify(msg, &sig));
        assert!(!kp.public().verify(b"hello worle", &sig));
    }

    #[test]
    fn keypair_protobuf_roundtrip() {
        let kp = Keypair::generate_ed25519();
        let encoded = kp.to_protobuf_encoding();
        let decoded = Keypair::from_protobuf_encoding(&encoded).unwrap();
        assert_eq!(kp.public(), decoded.public());
    }

    #[test]
    fn public_key_protobuf_roundtrip() {
        let pk = Keypair::generate_ed25519().public();
        let decoded = PublicKey::from_protobuf_encoding(&pk.to_protobuf_encoding()).unwrap();
        assert_eq!(pk, decoded);
    }
}
