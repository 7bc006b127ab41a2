//! Hiera Consensus
//!
//! Orders transactions into per-channel chains agreed on by a Byzantine
//! fault tolerant quorum of validators.
//!
//! # Components
//!
//! - [`AdmissionQueue`]: verified, deduplicated pending transactions
//! - [`OrderingService`]: cuts candidate blocks by count or interval
//! - [`ConsensusCore`]: the sans-IO agreement state machine
//! - [`Chain`]: certified blocks with hash-chain and certificate checks
//! - [`Node`]: runs one task per channel over a [`Transport`]
//!
//! # Transaction Flow
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │   Client     │────▶│     MSP      │────▶│  Admission   │
//! │  (submit)    │     │   (verify)   │     │    Queue     │
//! └──────────────┘     └──────────────┘     └──────┬───────┘
//!                                                   │ count / interval
//!                                                   ▼
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │   Endorse    │◀────│   Prepare    │◀────│   Proposer   │
//! │   (2f+1)     │     │   (2f+1)     │     │  cuts block  │
//! └──────┬───────┘     └──────────────┘     └──────────────┘
//!        │ quorum certificate
//!        ▼
//! ┌──────────────┐     ┌──────────────┐
//! │  Commit log  │────▶│    Chain     │────▶ BlockCommitted
//! │   (fsync)    │     │   (append)   │
//! └──────────────┘     └──────────────┘
//! ```
//!
//! A round that fails to commit before its deadline ends with a
//! view-change quorum and the next proposer retries the same sequence.

mod admission;
mod chain;
mod channel;
mod config;
mod engine;
mod error;
mod events;
mod message;
mod node;
mod ordering;
mod private_data;
mod round;
mod transport;
mod validator;

pub use admission::{check_transaction, AdmissionQueue, AdmissionStats};
pub use chain::{Chain, ChainTip};
pub use config::{
    AdmissionConfig, BatchConfig, ChannelConfig, EngineConfig, QuorumRule, RuntimeConfig,
};
pub use engine::{Action, ConsensusCore, EngineContext, Evidence};
pub use error::{AdmissionError, ChainIntegrityError, ConsensusError, ConsensusFault, Result};
pub use events::ConsensusEvent;
pub use message::{
    CertificateMessage, ConsensusMessage, EndorseMessage, PrepareCertificate, PrepareMessage,
    ProposeMessage, SyncRequestMessage, SyncResponseMessage, TransactionMessage,
    ViewChangeMessage,
};
pub use node::Node;
pub use ordering::OrderingService;
pub use private_data::{MemoryPrivateDataStore, PrivateDataStore};
pub use round::{Phase, RoundState, VoteOutcome, VoteSet};
pub use transport::{
    DeliveryFilter, Envelope, LocalNetwork, LocalTransport, Transport, DEFAULT_INBOX_CAPACITY,
};
pub use validator::ValidatorSet;

#[cfg(test)]
pub(crate) mod test_support {
    use crate::config::QuorumRule;
    use crate::validator::ValidatorSet;
    use hiera_msp::{
        ChannelDefinition, EffectiveMembership, IdentityIssuer, LocalAuthority,
        MembershipRegistry, Organization,
    };
    use hiera_types::{
        Block, CertifiedBlock, Endorsement, Identity, Keypair, Payload, QuorumCertificate, Role,
        Transaction,
    };
    use std::sync::Arc;

    /// `n` endorser identities and a client on channel "main", all issued
    /// by one organization.
    pub struct Cluster {
        pub authority: LocalAuthority,
        pub keys: Vec<Keypair>,
        pub identities: Vec<Identity>,
        pub client_key: Keypair,
        pub client: Identity,
        pub definition: ChannelDefinition,
        pub membership: Arc<EffectiveMembership>,
        pub validators: ValidatorSet,
    }

    impl Cluster {
        pub fn new(n: usize) -> Self {
            let authority = LocalAuthority::root(Keypair::from_seed(7_000));
            let keys: Vec<_> = (0..n as u64).map(|i| Keypair::from_seed(100 + i)).collect();
            let identities: Vec<_> = keys
                .iter()
                .map(|k| authority.issue_role(k.public_key(), Role::Endorser))
                .collect();
            let client_key = Keypair::from_seed(9_000);
            let client = authority.issue_role(client_key.public_key(), Role::Client);

            let mut definition = ChannelDefinition::new("main")
                .with_organization(Organization::new("org", authority.public_key()));
            for identity in &identities {
                definition = definition.with_validator(identity.clone());
            }
            let membership = MembershipRegistry::new().register(definition.clone()).unwrap();
            let validators = ValidatorSet::from_membership(&membership, QuorumRule::default());

            Self {
                authority,
                keys,
                identities,
                client_key,
                client,
                definition,
                membership,
                validators,
            }
        }

        /// Membership of "main" after the authority revokes `subject`.
        pub fn membership_without(&self, subject: hiera_types::PublicKey) -> Arc<EffectiveMembership> {
            let registry = MembershipRegistry::new();
            registry.register(self.definition.clone()).unwrap();
            registry
                .revoke(&"main".into(), self.authority.revoke(subject, "compromised"))
                .unwrap();
            registry.effective(&"main".into()).unwrap()
        }

        /// Deterministic client transaction number `i`.
        pub fn transaction(&self, i: u64) -> Transaction {
            self.transaction_with(Payload::Inline(format!("tx-{i}").into_bytes()), i)
        }

        pub fn transaction_with(&self, payload: Payload, i: u64) -> Transaction {
            Transaction::signed(
                "main".into(),
                payload,
                i,
                self.client.clone(),
                &self.client_key,
            )
        }
    }

    /// Builds the certificate `signers` would produce for `block`.
    pub fn certify(block: Block, round: u64, signers: &[Keypair]) -> CertifiedBlock {
        let hash = block.hash();
        let data =
            QuorumCertificate::signing_data(&block.header.channel, block.sequence(), round, &hash);
        let endorsements = signers
            .iter()
            .map(|k| Endorsement {
                voter: k.public_key(),
                signature: k.sign(&data),
            })
            .collect();
        CertifiedBlock {
            certificate: QuorumCertificate {
                channel: block.header.channel.clone(),
                sequence: block.sequence(),
                round,
                block_hash: hash,
                endorsements,
            },
            block,
        }
    }
}
