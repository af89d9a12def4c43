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

//! Signed records: a generic envelope binding a payload to a key, and the
//! peer record carried in it.
//!
//! The signature covers a domain-separated concatenation so a record signed
//! for one purpose can never be replayed as another:
//! `len(domain) || domain || len(payload_type) || payload_type ||
//! len(payload) || payload`, with unsigned-varint lengths.

use crate::Multiaddr;
use peerlink_identity::{Keypair, PeerId, PublicKey, SigningError};
use prost::Message;

/// Domain separator and payload type for peer records.
pub const PEER_RECORD_DOMAIN: &str = "libp2p-peer-record";
pub const PEER_RECORD_PAYLOAD_TYPE: &[u8] = b"libp2p-peer-record";

mod proto {
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Envelope {
        #[prost(bytes = "vec", tag = "1")]
        pub public_key: Vec<u8>,
        #[prost(bytes = "vec", tag = "2")]
        pub payload_type: Vec<u8>,
        #[prost(bytes = "vec", tag = "3")]
        pub payload: Vec<u8>,
        #[prost(bytes = "vec", tag = "5")]
        pub signature: Vec<u8>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct PeerRecord {
        #[prost(bytes = "vec", tag = "1")]
        pub peer_id: Vec<u8>,
        #[prost(uint64, tag = "2")]
        pub seq: u64,
        #[prost(message, repeated, tag = "3")]
        pub addresses: Vec<AddressInfo>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct AddressInfo {
        #[prost(bytes = "vec", tag = "1")]
        pub multiaddr: Vec<u8>,
    }
}

/// A payload of a known type, signed by a key under a domain separator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedEnvelope {
    public_key: PublicKey,
    payload_type: Vec<u8>,
    payload: Vec<u8>,
    signature: Vec<u8>,
}

impl SignedEnvelope {
    /// Sign `payload` with `key` for the given `domain` and `payload_type`.
    pub fn sign(
        key: &Keypair,
        domain: &str,
        payload_type: Vec<u8>,
        payload: Vec<u8>,
    ) -> Result<SignedEnvelope, SigningError> {
        let buffer = signature_payload(domain, &payload_type, &payload);
        let signature = key.sign(&buffer)?;
        Ok(SignedEnvelope {
            public_key: key.public(),
            payload_type,
            payload,
            signature,
        })
    }

    /// Verify the signature against `domain`.
    #[must_use]
    pub fn verify(&self, domain: &str) -> bool {
        let buffer = signature_payload(domain, &self.payload_type, &self.payload);
        self.public_key.verify(&buffer, &self.signature)
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn payload_type(&self) -> &[u8] {
        &self.payload_type
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// The wire form of the envelope.
    pub fn encode(&self) -> Vec<u8> {
        proto::Envelope {
            public_key: self.public_key.to_protobuf_encoding(),
            payload_type: self.payload_type.clone(),
            payload: self.payload.clone(),
            signature: self.signature.clone(),
        }
        .encode_to_vec()
    }

    pub fn decode(bytes: &[u8]) -> Result<SignedEnvelope, RecordError> {
        let env = proto::Envelope::decode(bytes).map_err(|_| RecordError::Malformed)?;
        let public_key = PublicKey::from_protobuf_encoding(&env.public_key)
            .map_err(|_| RecordError::Malformed)?;
        Ok(SignedEnvelope {
            public_key,
            payload_type: env.payload_type,
            payload: env.payload,
            signature: env.signature,
        })
    }
}

fn signature_payload(domain: &str, payload_type: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut buf = unsigned_varint::encode::usize_buffer();
    let mut out = Vec::with_capacity(domain.len() + payload_type.len() + payload.len() + 12);
    out.extend_from_slice(unsigned_varint::encode::usize(domain.len(), &mut buf));
    out.extend_from_slice(domain.as_bytes());
    out.extend_from_slice(unsigned_varint::encode::usize(payload_type.len(), &mut buf));
    out.extend_from_slice(payload_type);
    out.extend_from_slice(unsigned_varint::encode::usize(payload.len(), &mut buf));
    out.extend_from_slice(payload);
    out
}

/// A peer's self-signed assertion of its listen addresses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerRecord {
    pub peer: PeerId,
    pub seq: u64,
    pub addresses: Vec<Multiaddr>,
}

impl PeerRecord {
    /// Sign this record into an envelope. `seq` should increase with every
    /// newly issued record (wall-clock seconds serve fine).
    pub fn into_signed_envelope(self, key: &Keypair) -> Result<SignedEnvelope, SigningError> {
        let payload = proto::PeerRecord {
            peer_id: self.peer.to_bytes(),
            seq: self.seq,
            addresses: self
                .addresses
                .iter()
                .map(|a| proto::AddressInfo {
                    multiaddr: a.to_bytes(),
                })
                .collect(),
        }
        .encode_to_vec();
        SignedEnvelope::sign(
            key,
            PEER_RECORD_DOMAIN,
            PEER_RECORD_PAYLOAD_TYPE.to_vec(),
            payload,
        )
    }

    /// Extract and verify a peer record from an envelope: the signature must
    /// check out under the peer-record domain, the payload type must match,
    /// and the record's peer id must be derived from the signing key.
    pub fn from_signed_envelope(envelope: &SignedEnvelope) -> Result<PeerRecord, RecordError> {
        if envelope.payload_type() != PEER_RECORD_PAYLOAD_TYPE {
            return Err(RecordError::UnexpectedPayloadType);
        }
        if !envelope.verify(PEER_RECORD_DOMAIN) {
            return Err(RecordError::InvalidSignature);
        }
        let record =
            proto::PeerRecord::decode(envelope.payload()).map_err(|_| RecordError::Malformed)?;
        let peer = PeerId::from_bytes(&record.peer_id).map_err(|_| RecordError::Malformed)?;
        if !peer.matches_public_key(envelope.public_key()) {
            return Err(RecordError::PeerIdMismatch);
        }
        let addresses = record
            .addresses
            .iter()
            .filter_map(|a| Multiaddr::from_bytes(&a.multiaddr).ok())
            .collect();
        Ok(PeerRecord {
            peer,
            seq: record.seq,
            addresses,
        })
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("record payload or envelope is malformed")]
    Malformed,
    #[error("envelope signature does not verify")]
    InvalidSignature,
    #[error("envelope carries an unexpected payload type")]
    UnexpectedPayloadType,
    #[error("record peer id is not derived from the signing key")]
    PeerIdMismatch,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_record_roundtrip() {
        let key = Keypair::generate_ed25519();
        let record = PeerRecord {
            peer: key.public().to_peer_id(),
            seq: 7,
            addresses: vec!["/ip4/1.2.3.4/tcp/4001".parse().unwrap()],
        };
        let envelope = record.clone().into_signed_envelope(&key).unwrap();
        let decoded = SignedEnvelope::decode(&envelope.encode()).unwrap();
        assert_eq!(PeerRecord::from_signed_envelope(&decoded).unwrap(), record);
    }

    #[test]
    fn wrong_domain_rejected() {
        let key = Keypair::generate_ed25519();
        let envelope =
            SignedEnvelope::sign(&key, "domain-a", b"type".to_vec(), b"payload".to_vec()).unwrap();
        assert!(envelope.verify("domain-a"));
        assert!(!envelope.verify("domain-b"));
    }

    #[test]
    fn foreign_key_rejected() {
        let key = Keypair::generate_ed25519();
        let other = Keypair::generate_ed25519();
        // Record claims a peer id the signing key cannot produce.
        let record = PeerRecord {
            peer: other.public().to_peer_id(),
            seq: 1,
            addresses: vec![],
        };
        let envelope = record.into_signed_envelope(&key).unwrap();
        assert_eq!(
            PeerRecord::from_signed_envelope(&envelope).unwrap_err(),
            RecordError::PeerIdMismatch
        );
    }
}
