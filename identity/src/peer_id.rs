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

use crate::PublicKey;
use multihash::{Code, Multihash, MultihashDigest};
use rand::Rng;
use std::{fmt, str::FromStr};

/// Public keys whose protobuf encoding is at most this many bytes are
/// embedded verbatim in the peer id with the identity multihash code.
const MAX_INLINE_KEY_LENGTH: usize = 42;

const MULTIHASH_IDENTITY_CODE: u64 = 0x00;
const MULTIHASH_SHA256_CODE: u64 = 0x12;

/// The multicodec for libp2p public keys, used in the CIDv1 string form.
const LIBP2P_KEY_CODEC: u64 = 0x72;

/// Identifier of a peer, derived from its public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId {
    multihash: Multihash,
}

impl PartialOrd for PeerId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PeerId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.multihash.code(), self.multihash.digest())
            .cmp(&(other.multihash.code(), other.multihash.digest()))
    }
}

impl PeerId {
    /// Build a `PeerId` from a public key.
    pub fn from_public_key(key: &PublicKey) -> PeerId {
        let key_enc = key.to_protobuf_encoding();
        let code = if key_enc.len() <= MAX_INLINE_KEY_LENGTH {
            Code::Identity
        } else {
            Code::Sha2_256
        };
        PeerId {
            multihash: code.digest(&key_enc),
        }
    }

    /// Parse a `PeerId` from its multihash bytes.
    pub fn from_bytes(data: &[u8]) -> Result<PeerId, ParseError> {
        let multihash = Multihash::from_bytes(data).map_err(|_| ParseError::InvalidMultihash)?;
        PeerId::from_multihash(multihash)
    }

    /// Interpret a multihash as a `PeerId`. Only SHA-256 and identity
    /// multihashes are valid peer ids.
    pub fn from_multihash(multihash: Multihash) -> Result<PeerId, ParseError> {
        match multihash.code() {
            MULTIHASH_SHA256_CODE | MULTIHASH_IDENTITY_CODE => Ok(PeerId { multihash }),
            _ => Err(ParseError::UnsupportedCode),
        }
    }

    /// Generate a random peer id, not derived from any key. Useful as a
    /// placeholder in tests.
    pub fn random() -> PeerId {
        let digest: [u8; 32] = rand::thread_rng().gen();
        PeerId {
            multihash: Multihash::wrap(MULTIHASH_SHA256_CODE, &digest)
                .expect("digest fits the multihash size bound"),
        }
    }

    /// The canonical byte representation, i.e. the raw multihash.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.multihash.to_bytes()
    }

    /// The base58btc string form.
    pub fn to_base58(&self) -> String {
        bs58::encode(self.to_bytes()).into_string()
    }

    /// Whether deriving a peer id from `key` reproduces this exact id.
    pub fn matches_public_key(&self, key: &PublicKey) -> bool {
        PeerId::from_public_key(key) == *self
    }

    /// If this peer id embeds the public key (identity multihash), extract it.
    pub fn as_public_key(&self) -> Option<PublicKey> {
        if self.multihash.code() == MULTIHASH_IDENTITY_CODE {
            PublicKey::from_protobuf_encoding(self.multihash.digest()).ok()
        } else {
            None
        }
    }
}

impl From<&PublicKey> for PeerId {
    fn from(key: &PublicKey) -> PeerId {
        PeerId::from_public_key(key)
    }
}

impl From<PublicKey> for PeerId {
    fn from(key: PublicKey) -> PeerId {
        PeerId::from_public_key(&key)
    }
}

impl FromStr for PeerId {
    type Err = ParseError;

    /// Accepts both the legacy base58btc multihash form (`Qm…`, `12D3…`)
    /// and the CIDv1 `libp2p-key` form (`bafz…`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix('b') {
            let bytes = data_encoding::BASE32_NOPAD
                .decode(rest.to_ascii_uppercase().as_bytes())
                .map_err(|_| ParseError::InvalidEncoding)?;
            return peer_id_from_cid_bytes(&bytes);
        }
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|_| ParseError::InvalidEncoding)?;
        PeerId::from_bytes(&bytes)
    }
}

fn peer_id_from_cid_bytes(bytes: &[u8]) -> Result<PeerId, ParseError> {
    let (version, rest) =
        unsigned_varint_u64(bytes).ok_or(ParseError::InvalidMultihash)?;
    let (codec, rest) = unsigned_varint_u64(rest).ok_or(ParseError::InvalidMultihash)?;
    if version != 1 || codec != LIBP2P_KEY_CODEC {
        return Err(ParseError::UnsupportedCode);
    }
    PeerId::from_bytes(rest)
}

fn unsigned_varint_u64(bytes: &[u8]) -> Option<(u64, &[u8])> {
    let mut value = 0u64;
    for (i, b) in bytes.iter().enumerate() {
        if i >= 9 {
            return None;
        }
        value |= u64::from(b & 0x7f) << (i * 7);
        if b & 0x80 == 0 {
            return Some((value, &bytes[i + 1..]));
        }
    }
    None
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.to_base58().fmt(f)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PeerId").field(&self.to_base58()).finish()
    }
}

/// A string or byte sequence could not be interpreted as a peer id.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("not a valid base58 or base32 encoding")]
    InvalidEncoding,
    #[error("not a valid multihash")]
    InvalidMultihash,
    #[error("multihash or cid code unsupported for peer ids")]
    UnsupportedCode,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Keypair;

    #[test]
    fn derived_id_matches_key() {
        let kp = Keypair::generate_ed25519();
        let id = PeerId::from_public_key(&kp.public());
        assert!(id.matches_public_key(&kp.public()));
    }

    #[test]
    fn distinct_keys_distinct_ids() {
        let a = PeerId::from(Keypair::generate_ed25519().public());
        let b = PeerId::from(Keypair::generate_ed25519().public());
        assert_ne!(a, b);
    }

    #[test]
    fn ed25519_keys_are_inlined() {
        let kp = Keypair::generate_ed25519();
        let id = PeerId::from_public_key(&kp.public());
        assert_eq!(id.as_public_key(), Some(kp.public()));
        // Base58 of an identity multihash over an ed25519 key starts 12D3Koo.
        assert!(id.to_base58().starts_with("12D3Koo"), "{id}");
    }

    #[test]
    fn base58_roundtrip() {
        let id = PeerId::random();
        assert_eq!(id.to_base58().parse::<PeerId>().unwrap(), id);
    }

    #[test]
    fn bytes_roundtrip() {
        let id = PeerId::random();
        assert_eq!(PeerId::from_bytes(&id.to_bytes()).unwrap(), id);
    }

    #[test]
    fn cidv1_form_accepted() {
        let id = PeerId::random();
        let mut cid = vec![0x01, 0x72];
        cid.extend_from_slice(&id.to_bytes());
        let s = format!(
            "b{}",
            data_encoding::BASE32_NOPAD.encode(&cid).to_ascii_lowercase()
        );
        assert_eq!(s.parse::<PeerId>().unwrap(), id);
    }

    #[test]
    fn arbitrary_multihash_rejected() {
        // sha2-512 code 0x13 is not a valid peer id code.
        let mh = multihash::Code::Sha2_512.digest(b"x");
        assert_eq!(
            PeerId::from_multihash(mh).unwrap_err(),
            ParseError::UnsupportedCode
        );
    }
}
