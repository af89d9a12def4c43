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

//! Ed25519 keys.

use crate::DecodingError;
use ed25519_dalek::{self as ed25519, Signer as _, Verifier as _};
use rand::RngCore;
use zeroize::Zeroize;

/// An Ed25519 keypair.
pub struct Keypair(ed25519::Keypair);

impl Keypair {
    /// Generate a new random Ed25519 keypair.
    pub fn generate() -> Keypair {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let secret = ed25519::SecretKey::from_bytes(&bytes)
            .expect("32 bytes are a valid ed25519 secret key");
        bytes.zeroize();
        let public = ed25519::PublicKey::from(&secret);
        Keypair(ed25519::Keypair { secret, public })
    }

    /// Sign a message with this keypair.
    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        self.0.sign(msg).to_bytes().to_vec()
    }

    /// The public half of this keypair.
    pub fn public(&self) -> PublicKey {
        PublicKey(self.0.public)
    }

    /// Encode the keypair into 64 bytes, secret key followed by public key.
    pub fn to_bytes(&self) -> [u8; 64] {
        self.0.to_bytes()
    }

    /// Decode a keypair from 64 bytes (secret followed by public) or from a
    /// bare 32-byte secret key.
    pub fn from_bytes(bytes: &[u8]) -> Result<Keypair, DecodingError> {
        match bytes.len() {
            64 => ed25519::Keypair::from_bytes(bytes)
                .map(Keypair)
                .map_err(|e| DecodingError::bad_key("ed25519 keypair", e)),
            32 => {
                let secret = ed25519::SecretKey::from_bytes(bytes)
                    .map_err(|e| DecodingError::bad_key("ed25519 secret key", e))?;
                let public = ed25519::PublicKey::from(&secret);
                Ok(Keypair(ed25519::Keypair { secret, public }))
            }
            n => Err(DecodingError::bad_key_len("ed25519 keypair", n)),
        }
    }
}

impl Clone for Keypair {
    fn clone(&self) -> Keypair {
        let secret = ed25519::SecretKey::from_bytes(self.0.secret.as_bytes())
            .expect("key bytes were validated on construction");
        Keypair(ed25519::Keypair {
            secret,
            public: self.0.public,
        })
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public", &self.0.public)
            .finish()
    }
}

/// An Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(ed25519::PublicKey);

impl PublicKey {
    /// Verify `sig` as a signature over `msg` by the corresponding secret key.
    pub fn verify(&self, msg: &[u8], sig: &[u8]) -> bool {
        ed25519::Signature::try_from(sig)
            .map(|s| self.0.verify(msg, &s).is_ok())
            .unwrap_or(false)
    }

    /// The raw 32 key bytes.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    /// Decode a public key from its raw 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<PublicKey, DecodingError> {
        ed25519::PublicKey::from_bytes(bytes)
            .map(PublicKey)
            .map_err(|e| DecodingError::bad_key("ed25519 public key", e))
    }
}

impl std::hash::Hash for PublicKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.as_bytes().hash(state)
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey(ed25519)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keypair_bytes_roundtrip() {
        let kp = Keypair::generate();
        let restored = Keypair::from_bytes(&kp.to_bytes()).unwrap();
        assert_eq!(kp.public(), restored.public());
    }

    #[test]
    fn secret_only_roundtrip() {
        let kp = Keypair::generate();
        let restored = Keypair::from_bytes(&kp.to_bytes()[..32]).unwrap();
        assert_eq!(kp.public(), restored.public());
    }

    #[test]
    fn bad_signature_rejected() {
        let kp = Keypair::generate();
        let mut sig = kp.sign(b"msg");
        sig[0] ^= 0xff;
        assert!(!kp.public().verify(b"msg", &sig));
    }
}
