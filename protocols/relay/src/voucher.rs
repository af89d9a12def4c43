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

//! The reservation voucher: a record signed by the relay binding
//! `{relay, client, expiration}`.

use peerlink_core::signed_record::SignedEnvelope;
use peerlink_identity::{Keypair, PeerId, SigningError};
use prost::Message;

const VOUCHER_DOMAIN: &str = "libp2p-relay-rsvp";
const VOUCHER_PAYLOAD_TYPE: &[u8] = &[0x03, 0x02];

mod proto {
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Voucher {
        #[prost(bytes = "vec", tag = "1")]
        pub relay: Vec<u8>,
        #[prost(bytes = "vec", tag = "2")]
        pub peer: Vec<u8>,
        #[prost(uint64, tag = "3")]
        pub expiration: u64,
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReservationVoucher {
    pub relay: PeerId,
    pub peer: PeerId,
    /// Unix timestamp in seconds.
    pub expiration: u64,
}

impl ReservationVoucher {
    /// Sign the voucher with the relay's identity key.
    pub fn into_signed_envelope(self, relay_key: &Keypair) -> Result<SignedEnvelope, SigningError> {
        let payload = proto::Voucher {
            relay: self.relay.to_bytes(),
            peer: self.peer.to_bytes(),
            expiration: self.expiration,
        }
        .encode_to_vec();
        SignedEnvelope::sign(
            relay_key,
            VOUCHER_DOMAIN,
            VOUCHER_PAYLOAD_TYPE.to_vec(),
            payload,
        )
    }

    /// Extract and verify a voucher; the signing key must belong to the
    /// relay the voucher names.
    pub fn from_signed_envelope(envelope: &SignedEnvelope) -> Result<ReservationVoucher, VoucherError> {
        if envelope.payload_type() != VOUCHER_PAYLOAD_TYPE {
            return Err(VoucherError::UnexpectedPayloadType);
        }
        if !envelope.verify(VOUCHER_DOMAIN) {
            return Err(VoucherError::InvalidSignature);
        }
        let voucher =
            proto::Voucher::decode(envelope.payload()).map_err(|_| VoucherError::Malformed)?;
        let relay = PeerId::from_bytes(&voucher.relay).map_err(|_| VoucherError::Malformed)?;
        let peer = PeerId::from_bytes(&voucher.peer).map_err(|_| VoucherError::Malformed)?;
        if !relay.matches_public_key(envelope.public_key()) {
            return Err(VoucherError::ForeignSigner);
        }
        Ok(ReservationVoucher {
            relay,
            peer,
            expiration: voucher.expiration,
        })
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum VoucherError {
    #[error("voucher envelope is malformed")]
    Malformed,
    #[error("voucher signature does not verify")]
    InvalidSignature,
    #[error("voucher carries an unexpected payload type")]
    UnexpectedPayloadType,
    #[error("voucher was not signed by the relay it names")]
    ForeignSigner,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn voucher_roundtrip() {
        let relay_key = Keypair::generate_ed25519();
        let voucher = ReservationVoucher {
            relay: relay_key.public().to_peer_id(),
            peer: PeerId::random(),
            expiration: 1_700_000_000,
        };
        let envelope = voucher.clone().into_signed_envelope(&relay_key).unwrap();
        let decoded = SignedEnvelope::decode(&envelope.encode()).unwrap();
        assert_eq!(
            ReservationVoucher::from_signed_envelope(&decoded).unwrap(),
            voucher
        );
    }

    #[test]
    fn voucher_signed_by_third_party_rejected() {
        let relay_key = Keypair::generate_ed25519();
        let other_key = Keypair::generate_ed25519();
        let voucher = ReservationVoucher {
            relay: relay_key.public().to_peer_id(),
            peer: PeerId::random(),
            expiration: 1_700_000_000,
        };
        let envelope = voucher.into_signed_envelope(&other_key).unwrap();
        assert_eq!(
            ReservationVoucher::from_signed_envelope(&envelope).unwrap_err(),
            VoucherError::ForeignSigner
        );
    }
}
