//! Common types for Hiera.
//!
//! The data model shared by every crate in the workspace: hashes and Ed25519
//! keys, member identities, transactions, blocks and quorum certificates.

mod block;
mod crypto;
mod identity;
mod transaction;

pub use block::{merkle_root, Block, BlockHeader, CertifiedBlock, Endorsement, QuorumCertificate};
pub use crypto::{CryptoError, Hash, Keypair, PublicKey, Signature};
pub use identity::{Certificate, Identity, RevocationRecord, Role};
pub use transaction::{ChannelId, Payload, Transaction, TransactionId};

/// Current unix time in milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
