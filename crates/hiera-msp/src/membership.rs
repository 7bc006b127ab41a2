//! Channel membership definitions and resolved effective membership.

use crate::error::{IdentityError, Result};
use crate::policy::{Action, Policy};
use hiera_types::{ChannelId, Identity, PublicKey, RevocationRecord, Signature};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// A member organization, identified by its root key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    /// Organization name.
    pub name: String,
    /// Trusted root key.
    pub root: PublicKey,
}

impl Organization {
    /// Creates an organization.
    pub fn new(name: impl Into<String>, root: PublicKey) -> Self {
        Self {
            name: name.into(),
            root,
        }
    }
}

/// Declared membership of a channel, before inheritance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelDefinition {
    /// Channel id.
    pub id: ChannelId,
    /// Parent channel whose membership this one inherits and extends.
    #[serde(default)]
    pub parent: Option<ChannelId>,
    /// Member organizations declared on this channel.
    #[serde(default)]
    pub organizations: Vec<Organization>,
    /// Consensus voters declared on this channel.
    #[serde(default)]
    pub validators: Vec<Identity>,
    /// Policy override. Inherited from the parent when absent.
    #[serde(default)]
    pub policy: Option<Policy>,
}

impl ChannelDefinition {
    /// Creates a root channel definition.
    pub fn new(id: impl Into<ChannelId>) -> Self {
        Self {
            id: id.into(),
            parent: None,
            organizations: Vec::new(),
            validators: Vec::new(),
            policy: None,
        }
    }

    /// Sets the parent channel.
    pub fn with_parent(mut self, parent: impl Into<ChannelId>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    /// Adds an organization.
    pub fn with_organization(mut self, org: Organization) -> Self {
        self.organizations.push(org);
        self
    }

    /// Adds a validator.
    pub fn with_validator(mut self, validator: Identity) -> Self {
        self.validators.push(validator);
        self
    }

    /// Sets a policy override.
    pub fn with_policy(mut self, policy: Policy) -> Self {
        self.policy = Some(policy);
        self
    }
}

/// Membership of a channel after applying inheritance.
///
/// Resolved once per membership change and shared behind an `Arc`; the
/// verification hot path never walks the channel tree.
#[derive(Debug, Clone)]
pub struct EffectiveMembership {
    channel: ChannelId,
    lineage: Vec<ChannelId>,
    organizations: Vec<Organization>,
    roots: HashSet<PublicKey>,
    revoked: HashMap<PublicKey, RevocationRecord>,
    policy: Policy,
    validators: BTreeMap<PublicKey, Identity>,
}

impl EffectiveMembership {
    /// Resolves membership from a definition, its own revocations, and the
    /// parent's effective membership.
    pub(crate) fn resolve(
        definition: &ChannelDefinition,
        revocations: &[RevocationRecord],
        parent: Option<&EffectiveMembership>,
    ) -> Self {
        let mut resolved = match parent {
            Some(p) => Self {
                channel: definition.id.clone(),
                lineage: std::iter::once(definition.id.clone())
                    .chain(p.lineage.iter().cloned())
                    .collect(),
                organizations: p.organizations.clone(),
                roots: p.roots.clone(),
                revoked: p.revoked.clone(),
                policy: definition.policy.clone().unwrap_or_else(|| p.policy.clone()),
                validators: p.validators.clone(),
            },
            None => Self {
                channel: definition.id.clone(),
                lineage: vec![definition.id.clone()],
                organizations: Vec::new(),
                roots: HashSet::new(),
                revoked: HashMap::new(),
                policy: definition.policy.clone().unwrap_or_default(),
                validators: BTreeMap::new(),
            },
        };

        for org in &definition.organizations {
            if resolved.roots.insert(org.root) {
                resolved.organizations.push(org.clone());
            }
        }
        for validator in &definition.validators {
            resolved
                .validators
                .insert(*validator.public_key(), validator.clone());
        }
        for record in revocations {
            resolved.revoked.insert(record.subject, record.clone());
        }
        resolved
    }

    /// Channel id.
    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    /// This channel followed by its ancestors.
    pub fn lineage(&self) -> &[ChannelId] {
        &self.lineage
    }

    /// Member organizations, including inherited ones.
    pub fn organizations(&self) -> &[Organization] {
        &self.organizations
    }

    /// Effective policy.
    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Checks whether `key` is a trusted root.
    pub fn is_root(&self, key: &PublicKey) -> bool {
        self.roots.contains(key)
    }

    /// Checks whether `key` is revoked.
    pub fn is_revoked(&self, key: &PublicKey) -> bool {
        self.revoked.contains_key(key)
    }

    /// Revocation record for `key`, if any.
    pub fn revocation(&self, key: &PublicKey) -> Option<&RevocationRecord> {
        self.revoked.get(key)
    }

    /// All declared validators, sorted by key, including revoked ones.
    pub fn validators(&self) -> impl Iterator<Item = &Identity> {
        self.validators.values()
    }

    /// Keys of validators that are currently allowed to vote, sorted.
    pub fn voting_members(&self) -> Vec<PublicKey> {
        self.validators
            .keys()
            .filter(|k| !self.is_revoked(k))
            .copied()
            .collect()
    }

    /// Checks the identity's certificate chain and revocation status.
    pub fn verify_chain(&self, identity: &Identity) -> Result<()> {
        let mut cert = &identity.certificate;
        let mut subjects = vec![cert.subject];

        for intermediate in &identity.intermediates {
            if intermediate.subject != cert.issuer
                || !self.policy.permits(intermediate.role, Action::Issue)
            {
                return Err(IdentityError::UnknownIssuer);
            }
            intermediate
                .subject
                .verify(&cert.to_signing_data(), &cert.signature)
                .map_err(|_| IdentityError::UnknownIssuer)?;
            subjects.push(intermediate.subject);
            cert = intermediate;
        }

        if !self.roots.contains(&cert.issuer) {
            return Err(IdentityError::UnknownIssuer);
        }
        cert.issuer
            .verify(&cert.to_signing_data(), &cert.signature)
            .map_err(|_| IdentityError::UnknownIssuer)?;

        if subjects.iter().any(|s| self.is_revoked(s)) {
            return Err(IdentityError::Revoked);
        }
        Ok(())
    }

    /// Verifies that `identity` signed `message` and may perform `action`
    /// on this channel.
    pub fn verify(
        &self,
        identity: &Identity,
        signature: &Signature,
        message: &[u8],
        action: Action,
    ) -> Result<()> {
        self.verify_chain(identity)?;
        identity
            .public_key()
            .verify(message, signature)
            .map_err(|_| IdentityError::BadSignature)?;
        if !self.policy.permits(identity.role(), action) {
            return Err(IdentityError::RoleNotPermitted {
                role: identity.role(),
                action,
            });
        }
        Ok(())
    }

    /// Verifies a consensus vote from `voter`.
    pub fn verify_voter(
        &self,
        voter: &PublicKey,
        signature: &Signature,
        message: &[u8],
    ) -> Result<()> {
        let identity = self
            .validators
            .get(voter)
            .ok_or(IdentityError::UnknownVoter)?;
        self.verify(identity, signature, message, Action::Endorse)
    }
}
