//! Channel registry with cached effective membership.

use crate::audit::{AuditEventType, AuditLog};
use crate::error::{IdentityError, Result};
use crate::membership::{ChannelDefinition, EffectiveMembership, Organization};
use crate::policy::Action;
use hiera_types::{ChannelId, Identity, RevocationRecord, Signature};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

#[derive(Debug, Default)]
struct RegistryState {
    definitions: HashMap<ChannelId, ChannelDefinition>,
    revocations: HashMap<ChannelId, Vec<RevocationRecord>>,
    children: HashMap<ChannelId, BTreeSet<ChannelId>>,
    effective: HashMap<ChannelId, Arc<EffectiveMembership>>,
}

impl RegistryState {
    fn resolve(&self, id: &ChannelId) -> Option<EffectiveMembership> {
        let definition = self.definitions.get(id)?;
        let parent = match &definition.parent {
            Some(p) => Some(self.effective.get(p)?.as_ref()),
            None => None,
        };
        let revocations = self.revocations.get(id).map(Vec::as_slice).unwrap_or(&[]);
        Some(EffectiveMembership::resolve(definition, revocations, parent))
    }

    /// Recomputes `id` and every descendant, parents before children.
    fn recompute_from(&mut self, id: &ChannelId) {
        let mut queue = VecDeque::from([id.clone()]);
        while let Some(next) = queue.pop_front() {
            if let Some(resolved) = self.resolve(&next) {
                self.effective.insert(next.clone(), Arc::new(resolved));
            }
            if let Some(children) = self.children.get(&next) {
                queue.extend(children.iter().cloned());
            }
        }
    }

    fn effective(&self, id: &ChannelId) -> Result<Arc<EffectiveMembership>> {
        self.effective
            .get(id)
            .cloned()
            .ok_or_else(|| IdentityError::UnknownChannel(id.to_string()))
    }
}

/// Registry of channel membership.
///
/// Parents are fixed at registration and must already exist, so the channel
/// graph is always a forest.
#[derive(Debug, Default)]
pub struct MembershipRegistry {
    state: RwLock<RegistryState>,
    audit: Arc<AuditLog>,
}

impl MembershipRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a channel.
    pub fn register(&self, definition: ChannelDefinition) -> Result<Arc<EffectiveMembership>> {
        let mut state = self.state.write();
        let id = definition.id.clone();

        if state.definitions.contains_key(&id) {
            return Err(self.reject(&id, IdentityError::ChannelExists(id.to_string())));
        }
        if let Some(parent) = &definition.parent {
            if parent == &id {
                return Err(self.reject(
                    &id,
                    IdentityError::InvalidRecord("channel cannot be its own parent".into()),
                ));
            }
            if !state.definitions.contains_key(parent) {
                return Err(self.reject(&id, IdentityError::UnknownParent(parent.to_string())));
            }
        }

        let parent_effective = match &definition.parent {
            Some(p) => Some(state.effective(p)?),
            None => None,
        };
        let resolved = EffectiveMembership::resolve(&definition, &[], parent_effective.as_deref());
        for validator in &definition.validators {
            if let Err(e) = check_validator(&resolved, validator) {
                return Err(self.reject(&id, e));
            }
        }

        if let Some(parent) = &definition.parent {
            state
                .children
                .entry(parent.clone())
                .or_default()
                .insert(id.clone());
        }
        let resolved = Arc::new(resolved);
        state.definitions.insert(id.clone(), definition);
        state.effective.insert(id.clone(), resolved.clone());

        self.audit
            .record(AuditEventType::ChannelCreated, &id, None, "channel registered");
        Ok(resolved)
    }

    /// Removes a channel without children.
    pub fn remove(&self, id: &ChannelId) -> Result<ChannelDefinition> {
        let mut state = self.state.write();
        if !state.definitions.contains_key(id) {
            return Err(IdentityError::UnknownChannel(id.to_string()));
        }
        if state.children.get(id).is_some_and(|c| !c.is_empty()) {
            return Err(self.reject(id, IdentityError::HasChildren(id.to_string())));
        }

        let definition = state
            .definitions
            .remove(id)
            .ok_or_else(|| IdentityError::UnknownChannel(id.to_string()))?;
        state.effective.remove(id);
        state.revocations.remove(id);
        state.children.remove(id);
        if let Some(parent) = &definition.parent {
            if let Some(siblings) = state.children.get_mut(parent) {
                siblings.remove(id);
            }
        }

        self.audit
            .record(AuditEventType::ChannelRemoved, id, None, "channel removed");
        Ok(definition)
    }

    /// Adds an organization to a channel and its descendants.
    pub fn add_organization(&self, id: &ChannelId, org: Organization) -> Result<()> {
        let mut state = self.state.write();
        let definition = state
            .definitions
            .get_mut(id)
            .ok_or_else(|| IdentityError::UnknownChannel(id.to_string()))?;
        if definition.organizations.iter().any(|o| o.root == org.root) {
            return Ok(());
        }
        let root = org.root;
        let name = org.name.clone();
        definition.organizations.push(org);
        state.recompute_from(id);

        self.audit.record(
            AuditEventType::OrganizationAdded,
            id,
            Some(root),
            format!("organization {name} added"),
        );
        Ok(())
    }

    /// Adds a consensus voter to a channel and its descendants.
    pub fn add_validator(&self, id: &ChannelId, validator: Identity) -> Result<()> {
        let mut state = self.state.write();
        let effective = state.effective(id)?;
        if let Err(e) = check_validator(&effective, &validator) {
            return Err(self.reject(id, e));
        }

        let key = *validator.public_key();
        let definition = state
            .definitions
            .get_mut(id)
            .ok_or_else(|| IdentityError::UnknownChannel(id.to_string()))?;
        definition
            .validators
            .retain(|v| v.public_key() != validator.public_key());
        definition.validators.push(validator);
        state.recompute_from(id);

        self.audit
            .record(AuditEventType::ValidatorAdded, id, Some(key), "validator added");
        Ok(())
    }

    /// Appends a revocation record to a channel's revocation set.
    ///
    /// The record must be signed by a trusted root of the channel. The
    /// revocation applies to the channel and all of its descendants.
    pub fn revoke(&self, id: &ChannelId, record: RevocationRecord) -> Result<()> {
        let mut state = self.state.write();
        let effective = state.effective(id)?;
        if !effective.is_root(&record.issuer) {
            return Err(self.reject(id, IdentityError::UnknownIssuer));
        }
        if record
            .issuer
            .verify(&record.to_signing_data(), &record.signature)
            .is_err()
        {
            return Err(self.reject(id, IdentityError::BadSignature));
        }
        if effective.is_revoked(&record.subject) {
            return Ok(());
        }

        let subject = record.subject;
        let reason = record.reason.clone();
        state.revocations.entry(id.clone()).or_default().push(record);
        state.recompute_from(id);

        self.audit.record(
            AuditEventType::IdentityRevoked,
            id,
            Some(subject),
            format!("revoked: {reason}"),
        );
        Ok(())
    }

    /// Effective membership of a channel.
    pub fn effective(&self, id: &ChannelId) -> Result<Arc<EffectiveMembership>> {
        self.state.read().effective(id)
    }

    /// Verifies `identity`'s signature over `message` for `action` on a
    /// channel.
    pub fn verify(
        &self,
        channel: &ChannelId,
        identity: &Identity,
        signature: &Signature,
        message: &[u8],
        action: Action,
    ) -> Result<()> {
        let effective = self.effective(channel)?;
        effective
            .verify(identity, signature, message, action)
            .map_err(|e| {
                tracing::debug!(
                    channel = %channel,
                    subject = %identity.public_key().short_id(),
                    error = %e,
                    "identity rejected"
                );
                self.audit.record(
                    AuditEventType::VerificationRejected,
                    channel,
                    Some(*identity.public_key()),
                    format!("{action:?}: {e}"),
                );
                e
            })
    }

    /// Declared definition of a channel.
    pub fn definition(&self, id: &ChannelId) -> Option<ChannelDefinition> {
        self.state.read().definitions.get(id).cloned()
    }

    /// Direct children of a channel.
    pub fn children(&self, id: &ChannelId) -> Vec<ChannelId> {
        self.state
            .read()
            .children
            .get(id)
            .map(|c| c.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Registered channel ids, sorted.
    pub fn channels(&self) -> Vec<ChannelId> {
        let mut ids: Vec<_> = self.state.read().definitions.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Audit log.
    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Shared handle to the audit log, for components that verify against
    /// an [`EffectiveMembership`] snapshot directly.
    pub fn audit_log(&self) -> Arc<AuditLog> {
        self.audit.clone()
    }

    fn reject(&self, channel: &ChannelId, error: IdentityError) -> IdentityError {
        self.audit
            .record(AuditEventType::ChangeRejected, channel, None, error.to_string());
        error
    }
}

fn check_validator(membership: &EffectiveMembership, validator: &Identity) -> Result<()> {
    membership.verify_chain(validator)?;
    if !membership.policy().permits(validator.role(), Action::Endorse) {
        return Err(IdentityError::RoleNotPermitted {
            role: validator.role(),
            action: Action::Endorse,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::{IdentityIssuer, LocalAuthority};
    use crate::Policy;
    use hiera_types::{Keypair, Role};

    struct Fixture {
        registry: MembershipRegistry,
        org_a: LocalAuthority,
        org_b: LocalAuthority,
    }

    fn fixture() -> Fixture {
        let org_a = LocalAuthority::root(Keypair::from_seed(1000));
        let org_b = LocalAuthority::root(Keypair::from_seed(2000));
        let registry = MembershipRegistry::new();
        registry
            .register(
                ChannelDefinition::new("root")
                    .with_organization(Organization::new("org-a", org_a.public_key())),
            )
            .unwrap();
        Fixture {
            registry,
            org_a,
            org_b,
        }
    }

    fn client(ca: &LocalAuthority, seed: u64) -> (Keypair, Identity) {
        let kp = Keypair::from_seed(seed);
        let id = ca.issue_role(kp.public_key(), Role::Client);
        (kp, id)
    }

    #[test]
    fn test_verify_accepts_member() {
        let f = fixture();
        let (kp, id) = client(&f.org_a, 1);
        let sig = kp.sign(b"hello");
        assert!(f
            .registry
            .verify(&"root".into(), &id, &sig, b"hello", Action::Submit)
            .is_ok());
    }

    #[test]
    fn test_verify_unknown_issuer() {
        let f = fixture();
        let (kp, id) = client(&f.org_b, 1);
        let sig = kp.sign(b"hello");
        assert_eq!(
            f.registry
                .verify(&"root".into(), &id, &sig, b"hello", Action::Submit),
            Err(IdentityError::UnknownIssuer)
        );
    }

    #[test]
    fn test_verify_bad_signature() {
        let f = fixture();
        let (kp, id) = client(&f.org_a, 1);
        let sig = kp.sign(b"hello");
        assert_eq!(
            f.registry
                .verify(&"root".into(), &id, &sig, b"other", Action::Submit),
            Err(IdentityError::BadSignature)
        );
    }

    #[test]
    fn test_verify_role_not_permitted() {
        let f = fixture();
        let kp = Keypair::from_seed(1);
        let id = f.org_a.issue_role(kp.public_key(), Role::Observer);
        let sig = kp.sign(b"hello");
        assert!(matches!(
            f.registry
                .verify(&"root".into(), &id, &sig, b"hello", Action::Submit),
            Err(IdentityError::RoleNotPermitted { .. })
        ));
    }

    #[test]
    fn test_forged_certificate_rejected() {
        let f = fixture();
        let (kp, mut id) = client(&f.org_a, 1);
        id.certificate.role = Role::Admin;
        let sig = kp.sign(b"hello");
        assert_eq!(
            f.registry
                .verify(&"root".into(), &id, &sig, b"hello", Action::Submit),
            Err(IdentityError::UnknownIssuer)
        );
    }

    #[test]
    fn test_intermediate_chain_accepted_and_revocable() {
        let f = fixture();
        let inter = LocalAuthority::intermediate(&f.org_a, Keypair::from_seed(1001));
        let kp = Keypair::from_seed(5);
        let id = inter.issue_role(kp.public_key(), Role::Client);
        let sig = kp.sign(b"m");
        let root: ChannelId = "root".into();
        assert!(f
            .registry
            .verify(&root, &id, &sig, b"m", Action::Submit)
            .is_ok());

        f.registry
            .revoke(&root, f.org_a.revoke(inter.public_key(), "compromised"))
            .unwrap();
        assert_eq!(
            f.registry.verify(&root, &id, &sig, b"m", Action::Submit),
            Err(IdentityError::Revoked)
        );
    }

    #[test]
    fn test_child_inherits_and_extends() {
        let f = fixture();
        f.registry
            .register(
                ChannelDefinition::new("child")
                    .with_parent("root")
                    .with_organization(Organization::new("org-b", f.org_b.public_key())),
            )
            .unwrap();

        let child: ChannelId = "child".into();
        let root: ChannelId = "root".into();
        let (kp_a, id_a) = client(&f.org_a, 1);
        let (kp_b, id_b) = client(&f.org_b, 2);

        assert!(f
            .registry
            .verify(&child, &id_a, &kp_a.sign(b"x"), b"x", Action::Submit)
            .is_ok());
        assert!(f
            .registry
            .verify(&child, &id_b, &kp_b.sign(b"x"), b"x", Action::Submit)
            .is_ok());
        // Extension does not flow upward.
        assert_eq!(
            f.registry
                .verify(&root, &id_b, &kp_b.sign(b"x"), b"x", Action::Submit),
            Err(IdentityError::UnknownIssuer)
        );
        assert_eq!(f.registry.children(&root), vec![child.clone()]);
        assert_eq!(
            f.registry.effective(&child).unwrap().lineage(),
            &[child, root]
        );
    }

    #[test]
    fn test_parent_revocation_propagates_to_descendants() {
        let f = fixture();
        f.registry
            .register(ChannelDefinition::new("child").with_parent("root"))
            .unwrap();
        f.registry
            .register(ChannelDefinition::new("grandchild").with_parent("child"))
            .unwrap();

        let (kp, id) = client(&f.org_a, 1);
        let sig = kp.sign(b"x");
        let grandchild: ChannelId = "grandchild".into();
        assert!(f
            .registry
            .verify(&grandchild, &id, &sig, b"x", Action::Submit)
            .is_ok());

        f.registry
            .revoke(&"root".into(), f.org_a.revoke(*id.public_key(), "left"))
            .unwrap();
        assert_eq!(
            f.registry
                .verify(&grandchild, &id, &sig, b"x", Action::Submit),
            Err(IdentityError::Revoked)
        );
    }

    #[test]
    fn test_child_policy_override() {
        let f = fixture();
        f.registry
            .register(
                ChannelDefinition::new("readonly")
                    .with_parent("root")
                    .with_policy(Policy::empty().grant(Role::Client, [Action::Read])),
            )
            .unwrap();
        let (kp, id) = client(&f.org_a, 1);
        let sig = kp.sign(b"x");
        assert!(matches!(
            f.registry
                .verify(&"readonly".into(), &id, &sig, b"x", Action::Submit),
            Err(IdentityError::RoleNotPermitted { .. })
        ));
    }

    #[test]
    fn test_register_rejects_unknown_parent_and_duplicates() {
        let f = fixture();
        assert_eq!(
            f.registry
                .register(ChannelDefinition::new("x").with_parent("missing"))
                .unwrap_err(),
            IdentityError::UnknownParent("missing".into())
        );
        assert_eq!(
            f.registry
                .register(ChannelDefinition::new("root"))
                .unwrap_err(),
            IdentityError::ChannelExists("root".into())
        );
    }

    #[test]
    fn test_remove_rejects_parent_with_children() {
        let f = fixture();
        f.registry
            .register(ChannelDefinition::new("child").with_parent("root"))
            .unwrap();
        let root: ChannelId = "root".into();
        let child: ChannelId = "child".into();
        assert_eq!(
            f.registry.remove(&root).unwrap_err(),
            IdentityError::HasChildren("root".into())
        );
        f.registry.remove(&child).unwrap();
        f.registry.remove(&root).unwrap();
        assert!(f.registry.channels().is_empty());
    }

    #[test]
    fn test_revocation_requires_root_signature() {
        let f = fixture();
        let (_, id) = client(&f.org_a, 1);
        let forged = f.org_b.revoke(*id.public_key(), "nope");
        assert_eq!(
            f.registry.revoke(&"root".into(), forged),
            Err(IdentityError::UnknownIssuer)
        );
    }

    #[test]
    fn test_validator_requires_endorse_role() {
        let f = fixture();
        let root: ChannelId = "root".into();
        let (_, client_id) = client(&f.org_a, 1);
        assert!(f.registry.add_validator(&root, client_id).is_err());

        let voter = Keypair::from_seed(9);
        let endorser = f.org_a.issue_role(voter.public_key(), Role::Endorser);
        f.registry.add_validator(&root, endorser).unwrap();

        let effective = f.registry.effective(&root).unwrap();
        assert_eq!(effective.voting_members(), vec![voter.public_key()]);
        let sig = voter.sign(b"vote");
        assert!(effective
            .verify_voter(&voter.public_key(), &sig, b"vote")
            .is_ok());
        assert_eq!(
            effective.verify_voter(&Keypair::from_seed(10).public_key(), &sig, b"vote"),
            Err(IdentityError::UnknownVoter)
        );
    }

    #[test]
    fn test_audit_records_changes() {
        let f = fixture();
        let (_, id) = client(&f.org_a, 1);
        f.registry
            .revoke(&"root".into(), f.org_a.revoke(*id.public_key(), "left"))
            .unwrap();
        let entries = f.registry.audit().for_channel(&"root".into());
        assert!(entries
            .iter()
            .any(|e| e.event_type == AuditEventType::IdentityRevoked));
    }

    #[test]
    fn test_audit_records_rejected_verification() {
        let f = fixture();
        let audit = f.registry.audit_log();
        let (kp, id) = client(&f.org_a, 1);
        let before = audit.len();
        assert!(f
            .registry
            .verify(&"root".into(), &id, &kp.sign(b"a"), b"b", Action::Submit)
            .is_err());

        let last = audit.recent(1).pop().unwrap();
        assert_eq!(audit.len(), before + 1);
        assert_eq!(last.event_type, AuditEventType::VerificationRejected);
        assert_eq!(last.subject, Some(*id.public_key()));
        assert_eq!(
            f.registry.audit().for_channel(&"root".into()).last().unwrap().id,
            last.id
        );

        // Accepted verifications leave no trace.
        f.registry
            .verify(&"root".into(), &id, &kp.sign(b"a"), b"a", Action::Submit)
            .unwrap();
        assert_eq!(audit.len(), before + 1);
    }
}
