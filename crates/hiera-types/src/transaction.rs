//! Transactions and their payloads.

use crate::crypto::{CryptoError, Hash, Keypair, Signature};
use crate::identity::Identity;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    /// Creates a channel id.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ChannelId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A unique transaction identifier.
pub type TransactionId = Hash;

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

/// Transaction payload.
///
/// Private data never travels through consensus: only its commitment hash
/// does, and the bytes are handled out-of-band by the private-data store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Payload {
    /// Opaque bytes.
    Inline(#[serde(with = "hex_bytes")] Vec<u8>),
    /// Hash commitment to private data.
    Commitment(Hash),
}

impl Payload {
    /// Builds a commitment payload from a hex digest, checking its format.
    pub fn commitment_from_hex(s: &str) -> Result<Self, CryptoError> {
        Hash::from_hex(s).map(Payload::Commitment)
    }

    /// Returns the commitment hash for private payloads.
    pub fn commitment(&self) -> Option<&Hash> {
        match self {
            Payload::Commitment(h) => Some(h),
            Payload::Inline(_) => None,
        }
    }

    /// Payload size as carried in a block.
    pub fn len(&self) -> usize {
        match self {
            Payload::Inline(bytes) => bytes.len(),
            Payload::Commitment(_) => 32,
        }
    }

    /// Returns true for an empty inline payload.
    pub fn is_empty(&self) -> bool {
        matches!(self, Payload::Inline(bytes) if bytes.is_empty())
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Payload::Inline(bytes) => {
                out.push(0);
                out.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
                out.extend_from_slice(bytes);
            }
            Payload::Commitment(hash) => {
                out.push(1);
                out.extend_from_slice(hash.as_bytes());
            }
        }
    }
}

/// A signed transaction addressed to one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Transaction id, derived from the signed content and the submitter.
    pub id: TransactionId,
    /// Target channel.
    pub channel: ChannelId,
    /// Payload.
    pub payload: Payload,
    /// Submission time (unix milliseconds), chosen by the submitter.
    pub timestamp: u64,
    /// Submitter identity.
    pub submitter: Identity,
    /// Submitter signature over (channel, payload, timestamp).
    pub signature: Signature,
}

impl Transaction {
    /// Returns the bytes the submitter signs.
    pub fn signing_data(channel: &ChannelId, payload: &Payload, timestamp: u64) -> Vec<u8> {
        let mut data = Vec::with_capacity(64 + payload.len());
        data.extend_from_slice(b"TX:");
        data.extend_from_slice(&(channel.as_str().len() as u32).to_le_bytes());
        data.extend_from_slice(channel.as_str().as_bytes());
        payload.encode_into(&mut data);
        data.extend_from_slice(&timestamp.to_le_bytes());
        data
    }

    /// Derives the id for the given content.
    pub fn compute_id(
        channel: &ChannelId,
        payload: &Payload,
        timestamp: u64,
        submitter: &Identity,
    ) -> TransactionId {
        let mut data = Self::signing_data(channel, payload, timestamp);
        data.extend_from_slice(submitter.public_key().as_bytes());
        Hash::digest(&data)
    }

    /// Assembles a transaction from an externally produced signature.
    pub fn new(
        channel: ChannelId,
        payload: Payload,
        timestamp: u64,
        submitter: Identity,
        signature: Signature,
    ) -> Self {
        let id = Self::compute_id(&channel, &payload, timestamp, &submitter);
        Self {
            id,
            channel,
            payload,
            timestamp,
            submitter,
            signature,
        }
    }

    /// Signs and assembles a transaction.
    pub fn signed(
        channel: ChannelId,
        payload: Payload,
        timestamp: u64,
        submitter: Identity,
        key: &Keypair,
    ) -> Self {
        let signature = key.sign(&Self::signing_data(&channel, &payload, timestamp));
        Self::new(channel, payload, timestamp, submitter, signature)
    }

    /// Signing data for this transaction.
    pub fn to_signing_data(&self) -> Vec<u8> {
        Self::signing_data(&self.channel, &self.payload, self.timestamp)
    }

    /// Returns true when the carried id matches the content.
    pub fn id_is_consistent(&self) -> bool {
        self.id == Self::compute_id(&self.channel, &self.payload, self.timestamp, &self.submitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Certificate, Role};
    use std::collections::BTreeMap;

    fn identity(key: &Keypair) -> Identity {
        let subject = key.public_key();
        let signature = key.sign(&Certificate::signing_data(
            &subject,
            Role::Client,
            &BTreeMap::new(),
            &subject,
            0,
        ));
        Identity::new(Certificate {
            subject,
            role: Role::Client,
            attributes: BTreeMap::new(),
            issuer: subject,
            issued_at: 0,
            signature,
        })
    }

    #[test]
    fn test_transaction_id_depends_on_channel() {
        let key = Keypair::from_seed(1);
        let payload = Payload::Inline(b"x".to_vec());
        let a = Transaction::signed("a".into(), payload.clone(), 1, identity(&key), &key);
        let b = Transaction::signed("b".into(), payload, 1, identity(&key), &key);
        assert_ne!(a.id, b.id);
        assert!(a.id_is_consistent());
    }

    #[test]
    fn test_tampered_id_detected() {
        let key = Keypair::from_seed(1);
        let mut tx = Transaction::signed(
            "a".into(),
            Payload::Inline(b"x".to_vec()),
            1,
            identity(&key),
            &key,
        );
        tx.timestamp = 2;
        assert!(!tx.id_is_consistent());
    }

    #[test]
    fn test_commitment_format() {
        assert!(Payload::commitment_from_hex(&"ab".repeat(32)).is_ok());
        assert!(Payload::commitment_from_hex("not-a-hash").is_err());
    }

    #[test]
    fn test_payload_serialization() {
        let p = Payload::Inline(vec![0xde, 0xad]);
        let json = serde_json::to_string(&p).unwrap();
        assert_eq!(json, r#"{"kind":"inline","data":"dead"}"#);
        let back: Payload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }
}
