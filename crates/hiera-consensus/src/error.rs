//! Consensus error types.

use crate::round::Phase;
use hiera_msp::IdentityError;
use hiera_storage::PersistenceError;
use hiera_types::{Hash, PublicKey};
use thiserror::Error;

/// Rejection of a submitted transaction.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    /// The id is already queued or was committed within the lookback window.
    #[error("duplicate transaction: {0}")]
    DuplicateId(Hash),

    /// The submitter failed membership verification.
    #[error("invalid signature: {0}")]
    InvalidSignature(#[from] IdentityError),

    /// The channel's queue is at capacity.
    #[error("queue full (capacity {capacity})")]
    QueueFull {
        /// Queue capacity.
        capacity: usize,
    },

    /// The transaction is structurally invalid.
    #[error("malformed transaction: {0}")]
    Malformed(String),
}

/// Protocol misbehavior observed by the engine.
///
/// Faults are recorded and may trigger a view change. They never stop the
/// engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConsensusFault {
    /// A node signed two different blocks in the same sequence, round and phase.
    #[error("equivocation by {offender} at {sequence}/{round} ({phase}): {first} vs {second}")]
    Equivocation {
        /// Offending key.
        offender: PublicKey,
        /// Sequence.
        sequence: u64,
        /// Round.
        round: u64,
        /// Phase in which both messages were signed.
        phase: Phase,
        /// Block hash of the first message.
        first: Hash,
        /// Block hash of the conflicting message.
        second: Hash,
    },

    /// A proposal failed validation.
    #[error("invalid proposal from {proposer} at {sequence}/{round}: {reason}")]
    InvalidProposal {
        /// Proposer key.
        proposer: PublicKey,
        /// Sequence.
        sequence: u64,
        /// Round.
        round: u64,
        /// Why the proposal was rejected.
        reason: String,
    },

    /// The round deadline elapsed without a commit.
    #[error("no quorum at {sequence}/{round} before deadline")]
    MissingQuorum {
        /// Sequence.
        sequence: u64,
        /// Round.
        round: u64,
    },

    /// A proposal came from a node that is not the round's proposer.
    #[error("unexpected proposer {sender} at {sequence}/{round}, expected {expected}")]
    UnexpectedProposer {
        /// Sender key.
        sender: PublicKey,
        /// Scheduled proposer.
        expected: PublicKey,
        /// Sequence.
        sequence: u64,
        /// Round.
        round: u64,
    },

    /// A vote or certificate failed verification.
    #[error("bad vote from {voter}: {reason}")]
    BadVote {
        /// Voter key.
        voter: PublicKey,
        /// Why the vote was rejected.
        reason: String,
    },
}

/// Reasons a certified block cannot extend a chain.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChainIntegrityError {
    /// A block already exists at that height.
    #[error("stale sequence {sequence}: chain already at {next}")]
    StaleSequence {
        /// Offered sequence.
        sequence: u64,
        /// Next sequence the chain expects.
        next: u64,
    },

    /// The block skips heights.
    #[error("sequence gap: expected {expected}, got {sequence}")]
    SequenceGap {
        /// Next sequence the chain expects.
        expected: u64,
        /// Offered sequence.
        sequence: u64,
    },

    /// The previous hash does not match the tip.
    #[error("hash mismatch: expected previous {expected}, got {actual}")]
    HashMismatch {
        /// Tip hash.
        expected: Hash,
        /// Offered previous hash.
        actual: Hash,
    },

    /// The Merkle root does not cover the transactions.
    #[error("merkle root mismatch at sequence {0}")]
    MerkleRootMismatch(u64),

    /// The quorum certificate does not verify against current membership.
    #[error("certificate invalid: {0}")]
    CertificateInvalid(String),
}

/// Errors surfaced by the node API.
#[derive(Debug, Error)]
pub enum ConsensusError {
    /// Membership error.
    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// Admission rejected the transaction.
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    /// Chain integrity violation.
    #[error(transparent)]
    Chain(#[from] ChainIntegrityError),

    /// Durable storage failure.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    /// The channel is not open on this node.
    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    /// The channel is already open on this node.
    #[error("channel already open: {0}")]
    ChannelExists(String),

    /// The channel stopped after a persistence or integrity failure.
    #[error("channel halted: {0}")]
    ChannelHalted(String),

    /// Private data store failure.
    #[error("private data: {0}")]
    PrivateData(String),

    /// Message encoding failed.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// A specialized Result type for consensus operations.
pub type Result<T> = std::result::Result<T, ConsensusError>;
