//! Identity records issued by a membership authority.
//!
//! Identities are immutable once issued. Revocation is a separate signed
//! record, never a mutation of the certificate.

use crate::crypto::{Hash, PublicKey, Signature};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Role carried by a certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Channel administrator.
    Admin,
    /// Transaction submitter.
    Client,
    /// Consensus voter.
    Endorser,
    /// Read-only participant.
    Observer,
    /// Intermediate issuer in a certificate chain.
    Authority,
}

impl Role {
    /// Parse from string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "admin" => Some(Role::Admin),
            "client" | "submitter" => Some(Role::Client),
            "endorser" | "peer" | "validator" => Some(Role::Endorser),
            "observer" | "viewer" => Some(Role::Observer),
            "authority" | "ca" => Some(Role::Authority),
            _ => None,
        }
    }

    fn tag(&self) -> u8 {
        match self {
            Role::Admin => 1,
            Role::Client => 2,
            Role::Endorser => 3,
            Role::Observer => 4,
            Role::Authority => 5,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Admin => write!(f, "admin"),
            Role::Client => write!(f, "client"),
            Role::Endorser => write!(f, "endorser"),
            Role::Observer => write!(f, "observer"),
            Role::Authority => write!(f, "authority"),
        }
    }
}

/// A certificate binding a subject key to a role, signed by its issuer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    /// Key being certified.
    pub subject: PublicKey,
    /// Role granted to the subject.
    pub role: Role,
    /// Free-form attributes (department, location, ...).
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// Key of the issuer.
    pub issuer: PublicKey,
    /// Issue time (unix milliseconds).
    pub issued_at: u64,
    /// Issuer's signature over [`Certificate::signing_data`].
    pub signature: Signature,
}

impl Certificate {
    /// Returns the bytes the issuer signs.
    pub fn signing_data(
        subject: &PublicKey,
        role: Role,
        attributes: &BTreeMap<String, String>,
        issuer: &PublicKey,
        issued_at: u64,
    ) -> Vec<u8> {
        let mut data = Vec::with_capacity(128);
        data.extend_from_slice(b"CERT:");
        data.extend_from_slice(subject.as_bytes());
        data.push(role.tag());
        for (k, v) in attributes {
            data.extend_from_slice(&(k.len() as u32).to_le_bytes());
            data.extend_from_slice(k.as_bytes());
            data.extend_from_slice(&(v.len() as u32).to_le_bytes());
            data.extend_from_slice(v.as_bytes());
        }
        data.extend_from_slice(issuer.as_bytes());
        data.extend_from_slice(&issued_at.to_le_bytes());
        data
    }

    /// Signing data for this certificate.
    pub fn to_signing_data(&self) -> Vec<u8> {
        Self::signing_data(
            &self.subject,
            self.role,
            &self.attributes,
            &self.issuer,
            self.issued_at,
        )
    }

    /// Fingerprint of the certificate contents.
    pub fn fingerprint(&self) -> Hash {
        Hash::digest(&self.to_signing_data())
    }
}

/// A member identity: a leaf certificate plus the intermediates linking it
/// to a trusted root.
///
/// `intermediates[0]` issued the leaf, `intermediates[1]` issued
/// `intermediates[0]`, and so on; the last certificate (or the leaf itself
/// when there are no intermediates) is issued by a root key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Leaf certificate.
    pub certificate: Certificate,
    /// Intermediate issuer certificates, nearest first.
    #[serde(default)]
    pub intermediates: Vec<Certificate>,
}

impl Identity {
    /// Creates an identity directly issued by a root.
    pub fn new(certificate: Certificate) -> Self {
        Self {
            certificate,
            intermediates: Vec::new(),
        }
    }

    /// Adds an intermediate certificate.
    pub fn with_intermediate(mut self, certificate: Certificate) -> Self {
        self.intermediates.push(certificate);
        self
    }

    /// Returns the subject key.
    pub fn public_key(&self) -> &PublicKey {
        &self.certificate.subject
    }

    /// Returns the leaf role.
    pub fn role(&self) -> Role {
        self.certificate.role
    }

    /// Returns the key that must be a trusted root for this chain.
    pub fn root_issuer(&self) -> &PublicKey {
        self.intermediates
            .last()
            .map(|c| &c.issuer)
            .unwrap_or(&self.certificate.issuer)
    }
}

/// A signed statement that a subject key is no longer valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationRecord {
    /// Revoked key.
    pub subject: PublicKey,
    /// Human-readable reason.
    pub reason: String,
    /// Revocation time (unix milliseconds).
    pub revoked_at: u64,
    /// Key of the revoking authority.
    pub issuer: PublicKey,
    /// Issuer's signature over [`RevocationRecord::signing_data`].
    pub signature: Signature,
}

impl RevocationRecord {
    /// Returns the bytes the revoking authority signs.
    pub fn signing_data(subject: &PublicKey, reason: &str, revoked_at: u64) -> Vec<u8> {
        let mut data = Vec::with_capacity(64 + reason.len());
        data.extend_from_slice(b"REVOKE:");
        data.extend_from_slice(subject.as_bytes());
        data.extend_from_slice(&revoked_at.to_le_bytes());
        data.extend_from_slice(reason.as_bytes());
        data
    }

    /// Signing data for this record.
    pub fn to_signing_data(&self) -> Vec<u8> {
        Self::signing_data(&self.subject, &self.reason, self.revoked_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parse() {
        assert_eq!(Role::parse("validator"), Some(Role::Endorser));
        assert_eq!(Role::parse("CLIENT"), Some(Role::Client));
        assert_eq!(Role::parse("nobody"), None);
    }

    #[test]
    fn test_signing_data_covers_attributes() {
        let key = PublicKey([1u8; 32]);
        let mut attrs = BTreeMap::new();
        let a = Certificate::signing_data(&key, Role::Client, &attrs, &key, 5);
        attrs.insert("department".into(), "ops".into());
        let b = Certificate::signing_data(&key, Role::Client, &attrs, &key, 5);
        assert_ne!(a, b);
    }
}
