//! Hashes, Ed25519 keys and signatures.
//!
//! All byte-oriented values serialize as lowercase hex strings so that
//! persisted records and wire messages stay human-inspectable.

use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

/// Errors produced by key and signature handling.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// The signature did not verify.
    #[error("signature verification failed")]
    InvalidSignature,

    /// The public key bytes are not a valid Ed25519 point.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// A hex string could not be decoded to the expected length.
    #[error("invalid hex: {0}")]
    InvalidHex(String),
}

fn decode_fixed<const N: usize>(s: &str) -> Result<[u8; N], CryptoError> {
    let mut out = [0u8; N];
    hex::decode_to_slice(s, &mut out).map_err(|e| CryptoError::InvalidHex(e.to_string()))?;
    Ok(out)
}

macro_rules! hex_serde {
    ($ty:ident, $len:expr) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&hex::encode(self.0))
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                decode_fixed::<$len>(&s)
                    .map($ty)
                    .map_err(serde::de::Error::custom)
            }
        }

        impl $ty {
            /// Returns the hex representation.
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            /// Parses from a hex string.
            pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
                decode_fixed::<$len>(s).map($ty)
            }

            /// Returns the raw bytes.
            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }
        }
    };
}

/// A SHA-256 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash(pub [u8; 32]);

hex_serde!(Hash, 32);

impl Hash {
    /// The all-zero hash, used as the previous hash of block 0 and as the
    /// Merkle root of an empty transaction list.
    pub const ZERO: Self = Self([0u8; 32]);

    /// Hashes arbitrary bytes.
    pub fn digest(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    /// Hashes the concatenation of two hashes.
    pub fn combine(left: &Hash, right: &Hash) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(left.0);
        hasher.update(right.0);
        Self(hasher.finalize().into())
    }

    /// Returns true for the all-zero hash.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// First eight hex characters, for log fields.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.short())
    }
}

/// An Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey(pub [u8; 32]);

hex_serde!(PublicKey, 32);

impl PublicKey {
    /// Verifies `signature` over `message`.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), CryptoError> {
        let key = ed25519_consensus::VerificationKey::try_from(self.0)
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
        key.verify(&ed25519_consensus::Signature::from(signature.0), message)
            .map_err(|_| CryptoError::InvalidSignature)
    }

    /// Returns a short identifier (first 8 bytes as hex).
    pub fn short_id(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short_id())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.short_id())
    }
}

/// An Ed25519 signature.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature(pub [u8; 64]);

hex_serde!(Signature, 64);

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", hex::encode(&self.0[..8]))
    }
}

/// An Ed25519 signing keypair.
#[derive(Clone)]
pub struct Keypair {
    signing_key: ed25519_consensus::SigningKey,
}

impl Keypair {
    /// Generates a new random keypair.
    pub fn generate() -> Self {
        Self {
            signing_key: ed25519_consensus::SigningKey::new(OsRng),
        }
    }

    /// Creates a keypair from 32 secret bytes.
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Self {
            signing_key: ed25519_consensus::SigningKey::from(bytes),
        }
    }

    /// Parses a keypair from a hex-encoded secret key.
    pub fn from_secret_hex(s: &str) -> Result<Self, CryptoError> {
        decode_fixed::<32>(s).map(Self::from_secret_bytes)
    }

    /// Deterministic keypair for devnets and tests.
    pub fn from_seed(seed: u64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"hiera-seed:");
        hasher.update(seed.to_le_bytes());
        Self::from_secret_bytes(hasher.finalize().into())
    }

    /// Returns the public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing_key.verification_key().to_bytes())
    }

    /// Signs a message.
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.signing_key.sign(message).to_bytes())
    }

    /// Returns the hex-encoded secret key.
    pub fn secret_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let kp = Keypair::from_seed(7);
        let sig = kp.sign(b"hello");
        assert!(kp.public_key().verify(b"hello", &sig).is_ok());
        assert_eq!(
            kp.public_key().verify(b"other", &sig),
            Err(CryptoError::InvalidSignature)
        );
    }

    #[test]
    fn test_seeded_keys_are_deterministic() {
        assert_eq!(
            Keypair::from_seed(1).public_key(),
            Keypair::from_seed(1).public_key()
        );
        assert_ne!(
            Keypair::from_seed(1).public_key(),
            Keypair::from_seed(2).public_key()
        );
    }

    #[test]
    fn test_secret_hex_roundtrip() {
        let kp = Keypair::generate();
        let restored = Keypair::from_secret_hex(&kp.secret_hex()).unwrap();
        assert_eq!(kp.public_key(), restored.public_key());
    }

    #[test]
    fn test_hash_serializes_as_hex() {
        let h = Hash::digest(b"abc");
        let json = serde_json::to_string(&h).unwrap();
        assert_eq!(json, format!("\"{}\"", h.to_hex()));
        let back: Hash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, h);
    }

    #[test]
    fn test_bad_hex_rejected() {
        assert!(Hash::from_hex("zz").is_err());
        assert!(PublicKey::from_hex(&"ab".repeat(31)).is_err());
    }
}
