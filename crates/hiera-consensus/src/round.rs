//! Per-round vote bookkeeping.

use hiera_types::{Endorsement, Hash, PublicKey, Signature};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Signed phase of a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Block proposal.
    Propose,
    /// First-phase vote.
    Prepare,
    /// Second-phase vote.
    Endorse,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Propose => write!(f, "propose"),
            Phase::Prepare => write!(f, "prepare"),
            Phase::Endorse => write!(f, "endorse"),
        }
    }
}

/// Result of recording a vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteOutcome {
    /// First vote from this voter.
    New,
    /// Same vote seen before.
    Duplicate,
    /// The voter already voted for a different block.
    Equivocation {
        /// Block of the first vote.
        first: Hash,
        /// Signature of the first vote.
        signature: Signature,
    },
}

/// One vote per voter for one phase of one round.
///
/// The first vote wins; a conflicting second vote is reported and dropped.
#[derive(Debug, Clone, Default)]
pub struct VoteSet {
    votes: BTreeMap<PublicKey, (Hash, Signature)>,
}

impl VoteSet {
    /// Creates an empty vote set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a verified vote.
    pub fn insert(&mut self, voter: PublicKey, hash: Hash, signature: Signature) -> VoteOutcome {
        match self.votes.get(&voter) {
            Some((existing, _)) if *existing == hash => VoteOutcome::Duplicate,
            Some((existing, sig)) => VoteOutcome::Equivocation {
                first: *existing,
                signature: *sig,
            },
            None => {
                self.votes.insert(voter, (hash, signature));
                VoteOutcome::New
            }
        }
    }

    /// Number of votes for `hash`.
    pub fn count_for(&self, hash: &Hash) -> usize {
        self.votes.values().filter(|(h, _)| h == hash).count()
    }

    /// Votes for `hash` as certificate entries, ordered by voter.
    pub fn endorsements_for(&self, hash: &Hash) -> Vec<Endorsement> {
        self.votes
            .iter()
            .filter(|(_, (h, _))| h == hash)
            .map(|(voter, (_, signature))| Endorsement {
                voter: *voter,
                signature: *signature,
            })
            .collect()
    }

    /// The block holding at least `threshold` votes, if any.
    pub fn quorum_block(&self, threshold: usize) -> Option<Hash> {
        let mut counts: BTreeMap<Hash, usize> = BTreeMap::new();
        for (hash, _) in self.votes.values() {
            let count = counts.entry(*hash).or_default();
            *count += 1;
            if *count >= threshold {
                return Some(*hash);
            }
        }
        None
    }

    /// Total number of voters.
    pub fn len(&self) -> usize {
        self.votes.len()
    }

    /// Checks whether no vote was recorded.
    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }
}

/// Proposal accepted for a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceptedProposal {
    /// Block hash.
    pub hash: Hash,
    /// Proposer signature, kept as equivocation evidence.
    pub signature: Signature,
}

/// State of one round at the current sequence.
#[derive(Debug, Clone, Default)]
pub struct RoundState {
    /// First proposal seen from the round's proposer.
    pub proposal: Option<AcceptedProposal>,
    /// A proposal arrived before the round started and awaits evaluation.
    pub deferred: Option<crate::message::ProposeMessage>,
    /// Prepare votes.
    pub prepares: VoteSet,
    /// Endorse votes.
    pub endorses: VoteSet,
    /// View-change voters.
    pub view_changes: BTreeMap<PublicKey, Signature>,
    /// This node proposed in the round.
    pub proposed: bool,
    /// Block this node prepared in the round.
    pub prepared: Option<Hash>,
    /// Block this node endorsed in the round.
    pub endorsed: Option<Hash>,
    /// This node voted to leave the round.
    pub view_change_sent: bool,
}

impl RoundState {
    /// Records a view-change vote. Returns false for a repeat.
    pub fn add_view_change(&mut self, voter: PublicKey, signature: Signature) -> bool {
        self.view_changes.insert(voter, signature).is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hiera_types::Keypair;

    fn sig(key: &Keypair, data: &[u8]) -> Signature {
        key.sign(data)
    }

    #[test]
    fn test_vote_set_detects_equivocation() {
        let key = Keypair::from_seed(1);
        let a = Hash::digest(b"a");
        let b = Hash::digest(b"b");
        let mut votes = VoteSet::new();

        assert_eq!(votes.insert(key.public_key(), a, sig(&key, b"a")), VoteOutcome::New);
        assert_eq!(
            votes.insert(key.public_key(), a, sig(&key, b"a")),
            VoteOutcome::Duplicate
        );
        assert!(matches!(
            votes.insert(key.public_key(), b, sig(&key, b"b")),
            VoteOutcome::Equivocation { first, .. } if first == a
        ));
        // The first vote is kept.
        assert_eq!(votes.count_for(&a), 1);
        assert_eq!(votes.count_for(&b), 0);
    }

    #[test]
    fn test_quorum_block() {
        let a = Hash::digest(b"a");
        let b = Hash::digest(b"b");
        let mut votes = VoteSet::new();
        for seed in 0..2 {
            let key = Keypair::from_seed(seed);
            votes.insert(key.public_key(), a, sig(&key, b"a"));
        }
        let other = Keypair::from_seed(9);
        votes.insert(other.public_key(), b, sig(&other, b"b"));

        assert_eq!(votes.quorum_block(3), None);
        assert_eq!(votes.quorum_block(2), Some(a));
        assert_eq!(votes.endorsements_for(&a).len(), 2);
        assert_eq!(votes.len(), 3);
    }

    #[test]
    fn test_view_change_repeat() {
        let key = Keypair::from_seed(3);
        let mut round = RoundState::default();
        assert!(round.add_view_change(key.public_key(), sig(&key, b"vc")));
        assert!(!round.add_view_change(key.public_key(), sig(&key, b"vc")));
        assert_eq!(round.view_changes.len(), 1);
    }
}
