//! Voting membership of a channel.
//!
//! Validators are the nodes that vote in consensus. The set is derived from
//! the channel's effective membership; revoked validators drop out of it.

use crate::config::QuorumRule;
use hiera_msp::EffectiveMembership;
use hiera_types::{PublicKey, QuorumCertificate};
use std::collections::HashSet;

/// Sorted set of voters with the quorum rule applied to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorSet {
    validators: Vec<PublicKey>,
    quorum: usize,
}

impl ValidatorSet {
    /// Creates a validator set. Keys are sorted and deduplicated.
    pub fn new(mut validators: Vec<PublicKey>, rule: QuorumRule) -> Self {
        validators.sort();
        validators.dedup();
        let quorum = rule.quorum(validators.len());
        Self { validators, quorum }
    }

    /// Voting members of a channel.
    pub fn from_membership(membership: &EffectiveMembership, rule: QuorumRule) -> Self {
        Self::new(membership.voting_members(), rule)
    }

    /// Returns all validators, sorted.
    pub fn validators(&self) -> &[PublicKey] {
        &self.validators
    }

    /// Returns the number of validators.
    pub fn len(&self) -> usize {
        self.validators.len()
    }

    /// Returns true if there are no validators.
    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// Checks if a key belongs to a validator.
    pub fn contains(&self, key: &PublicKey) -> bool {
        self.validators.binary_search(key).is_ok()
    }

    /// Votes required for a quorum.
    pub fn quorum(&self) -> usize {
        self.quorum
    }

    /// Number of faulty voters the quorum tolerates.
    pub fn max_faulty(&self) -> usize {
        self.validators.len().saturating_sub(self.quorum)
    }

    /// Smallest vote count guaranteed to include an honest voter.
    pub fn join_threshold(&self) -> usize {
        self.max_faulty() + 1
    }

    /// Proposer for `(sequence, round)`, round-robin over the sorted set.
    pub fn proposer(&self, sequence: u64, round: u64) -> Option<&PublicKey> {
        if self.validators.is_empty() {
            return None;
        }
        let idx = (sequence.wrapping_add(round) % self.validators.len() as u64) as usize;
        self.validators.get(idx)
    }

    /// Verifies a quorum certificate for `block_hash` against this set.
    ///
    /// Signers must be distinct validators with valid endorse signatures and
    /// reach the quorum.
    pub fn verify_certificate(
        &self,
        certificate: &QuorumCertificate,
        membership: &EffectiveMembership,
    ) -> Result<(), String> {
        if &certificate.channel != membership.channel() {
            return Err(format!("certificate for channel {}", certificate.channel));
        }

        let signing_data = certificate.to_signing_data();
        let mut seen = HashSet::with_capacity(certificate.endorsements.len());
        for endorsement in &certificate.endorsements {
            if !seen.insert(endorsement.voter) {
                return Err(format!("duplicate signer {}", endorsement.voter.short_id()));
            }
            if !self.contains(&endorsement.voter) {
                return Err(format!("{} is not a voter", endorsement.voter.short_id()));
            }
            membership
                .verify_voter(&endorsement.voter, &endorsement.signature, &signing_data)
                .map_err(|e| format!("{}: {e}", endorsement.voter.short_id()))?;
        }

        if seen.len() < self.quorum {
            return Err(format!(
                "{} endorsements, quorum is {}",
                seen.len(),
                self.quorum
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hiera_types::Keypair;

    fn set(n: u64) -> ValidatorSet {
        ValidatorSet::new(
            (0..n).map(|i| Keypair::from_seed(i).public_key()).collect(),
            QuorumRule::default(),
        )
    }

    #[test]
    fn test_thresholds() {
        let four = set(4);
        assert_eq!(four.quorum(), 3);
        assert_eq!(four.max_faulty(), 1);
        assert_eq!(four.join_threshold(), 2);

        let seven = set(7);
        assert_eq!(seven.quorum(), 5);
        assert_eq!(seven.max_faulty(), 2);
    }

    #[test]
    fn test_proposer_rotation() {
        let s = set(4);
        let p0 = *s.proposer(0, 0).unwrap();
        assert_eq!(s.proposer(0, 1), s.proposer(1, 0));
        assert_ne!(s.proposer(0, 1), Some(&p0));
        assert_eq!(s.proposer(0, 4), Some(&p0));
    }

    #[test]
    fn test_sorted_and_deduplicated() {
        let key = Keypair::from_seed(1).public_key();
        let s = ValidatorSet::new(vec![key, key], QuorumRule::default());
        assert_eq!(s.len(), 1);
        assert!(s.contains(&key));
        assert!(set(0).proposer(0, 0).is_none());
    }
}
