//! Identity issuance interface.
//!
//! Issuance and key custody belong to an external authority. The core only
//! consumes the records it produces; [`LocalAuthority`] is an in-process
//! issuer for development networks and tests.

use hiera_types::{now_millis, Certificate, Identity, Keypair, PublicKey, RevocationRecord, Role};
use std::collections::BTreeMap;

/// Something that issues identities and revocations.
pub trait IdentityIssuer: Send + Sync {
    /// The issuer's key.
    fn public_key(&self) -> PublicKey;

    /// Issues an identity for `subject`.
    fn issue(&self, subject: PublicKey, role: Role, attributes: BTreeMap<String, String>)
        -> Identity;

    /// Issues a revocation record for `subject`.
    fn revoke(&self, subject: PublicKey, reason: &str) -> RevocationRecord;
}

/// An in-process certificate authority.
#[derive(Debug, Clone)]
pub struct LocalAuthority {
    keypair: Keypair,
    /// Certificates linking this authority to its root, nearest first.
    chain: Vec<Certificate>,
}

impl LocalAuthority {
    /// Creates a root authority.
    pub fn root(keypair: Keypair) -> Self {
        Self {
            keypair,
            chain: Vec::new(),
        }
    }

    /// Creates an intermediate authority certified by `parent`.
    pub fn intermediate(parent: &LocalAuthority, keypair: Keypair) -> Self {
        let cert = parent
            .issue(keypair.public_key(), Role::Authority, BTreeMap::new())
            .certificate;
        let mut chain = vec![cert];
        chain.extend(parent.chain.iter().cloned());
        Self { keypair, chain }
    }

    /// Issues a certificate without attributes.
    pub fn issue_role(&self, subject: PublicKey, role: Role) -> Identity {
        self.issue(subject, role, BTreeMap::new())
    }
}

impl IdentityIssuer for LocalAuthority {
    fn public_key(&self) -> PublicKey {
        self.keypair.public_key()
    }

    fn issue(
        &self,
        subject: PublicKey,
        role: Role,
        attributes: BTreeMap<String, String>,
    ) -> Identity {
        let issuer = self.keypair.public_key();
        let issued_at = now_millis();
        let signature = self.keypair.sign(&Certificate::signing_data(
            &subject,
            role,
            &attributes,
            &issuer,
            issued_at,
        ));
        Identity {
            certificate: Certificate {
                subject,
                role,
                attributes,
                issuer,
                issued_at,
                signature,
            },
            intermediates: self.chain.clone(),
        }
    }

    fn revoke(&self, subject: PublicKey, reason: &str) -> RevocationRecord {
        let revoked_at = now_millis();
        let signature = self
            .keypair
            .sign(&RevocationRecord::signing_data(&subject, reason, revoked_at));
        RevocationRecord {
            subject,
            reason: reason.to_string(),
            revoked_at,
            issuer: self.keypair.public_key(),
            signature,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issued_certificate_verifies() {
        let ca = LocalAuthority::root(Keypair::from_seed(100));
        let id = ca.issue_role(Keypair::from_seed(1).public_key(), Role::Client);
        let cert = &id.certificate;
        assert!(ca
            .public_key()
            .verify(&cert.to_signing_data(), &cert.signature)
            .is_ok());
        assert_eq!(id.root_issuer(), &ca.public_key());
    }

    #[test]
    fn test_intermediate_chain() {
        let root = LocalAuthority::root(Keypair::from_seed(100));
        let inter = LocalAuthority::intermediate(&root, Keypair::from_seed(101));
        let id = inter.issue_role(Keypair::from_seed(1).public_key(), Role::Client);
        assert_eq!(id.intermediates.len(), 1);
        assert_eq!(id.certificate.issuer, inter.public_key());
        assert_eq!(id.root_issuer(), &root.public_key());
    }
}
