//! In-process cluster harness shared by the integration tests.

#![allow(dead_code)]

use hiera_consensus::{
    BatchConfig, ChannelConfig, ConsensusEvent, EngineConfig, LocalNetwork, Node, RuntimeConfig,
    ValidatorSet,
};
use hiera_msp::{IdentityIssuer, LocalAuthority, Organization};
use hiera_storage::{LogProvider, MemoryLogProvider};
use hiera_types::{
    merkle_root, CertifiedBlock, ChannelId, Hash, Identity, Keypair, Payload, PublicKey, Role,
    Transaction,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub const CHANNEL: &str = "main";

/// Runtime settings for virtual-time tests.
pub fn test_runtime(batch_size: usize) -> RuntimeConfig {
    RuntimeConfig {
        batch: BatchConfig {
            max_transactions: batch_size,
            interval: Duration::from_millis(50),
        },
        engine: EngineConfig {
            round_timeout: Duration::from_millis(1_000),
            timeout_cap: Duration::from_secs(8),
            ..EngineConfig::default()
        },
        ..RuntimeConfig::default()
    }
}

/// `n` validators of one organization on an in-process network.
pub struct TestCluster {
    pub network: LocalNetwork,
    pub authority: LocalAuthority,
    pub keys: Vec<Keypair>,
    pub identities: Vec<Identity>,
    pub client_key: Keypair,
    pub client: Identity,
    pub channel: ChannelConfig,
    pub runtime: RuntimeConfig,
    pub logs: Vec<Arc<dyn LogProvider>>,
    pub nodes: Vec<Option<Node>>,
}

impl TestCluster {
    /// Builds a cluster with in-memory logs. Nodes are not started.
    pub fn new(n: usize, runtime: RuntimeConfig) -> Self {
        let logs = (0..n)
            .map(|_| Arc::new(MemoryLogProvider::new()) as Arc<dyn LogProvider>)
            .collect();
        Self::with_logs(n, runtime, logs)
    }

    /// Builds a cluster over the given per-node log providers.
    pub fn with_logs(n: usize, runtime: RuntimeConfig, logs: Vec<Arc<dyn LogProvider>>) -> Self {
        assert_eq!(logs.len(), n);
        let authority = LocalAuthority::root(Keypair::from_seed(1_000));
        let keys: Vec<_> = (0..n as u64).map(|i| Keypair::from_seed(2_000 + i)).collect();
        let identities: Vec<_> = keys
            .iter()
            .map(|k| authority.issue_role(k.public_key(), Role::Endorser))
            .collect();
        let client_key = Keypair::from_seed(3_000);
        let client = authority.issue_role(client_key.public_key(), Role::Client);

        let mut channel = ChannelConfig::new(CHANNEL)
            .with_organization(Organization::new("org", authority.public_key()));
        for identity in &identities {
            channel = channel.with_validator(identity.clone());
        }

        Self {
            network: LocalNetwork::default(),
            authority,
            keys,
            identities,
            client_key,
            client,
            channel,
            runtime,
            logs,
            nodes: (0..n).map(|_| None).collect(),
        }
    }

    /// Starts every node.
    pub fn start(mut self) -> Self {
        for i in 0..self.keys.len() {
            self.start_node(i);
        }
        self
    }

    /// Starts node `i` and opens the cluster channel on it.
    pub fn start_node(&mut self, i: usize) {
        let key = self.keys[i].clone();
        let (transport, inbox) = self.network.register(key.public_key());
        let node = Node::start(
            key,
            Arc::new(transport),
            inbox,
            self.logs[i].clone(),
            self.runtime.clone(),
        );
        node.create_channel(self.channel.clone()).unwrap();
        self.nodes[i] = Some(node);
    }

    /// Stops node `i`.
    pub fn stop_node(&mut self, i: usize) {
        if let Some(node) = self.nodes[i].take() {
            node.shutdown();
        }
        self.network.unregister(&self.keys[i].public_key());
    }

    pub fn node(&self, i: usize) -> &Node {
        self.nodes[i].as_ref().expect("node not running")
    }

    pub fn running(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().flatten()
    }

    pub fn channel_id(&self) -> ChannelId {
        ChannelId::from(CHANNEL)
    }

    /// Index of the key a validator set would schedule to propose.
    pub fn proposer_index(&self, sequence: u64, round: u64) -> usize {
        let set = ValidatorSet::new(
            self.keys.iter().map(|k| k.public_key()).collect(),
            self.runtime.engine.quorum,
        );
        let proposer = *set.proposer(sequence, round).unwrap();
        self.index_of(&proposer)
    }

    pub fn index_of(&self, key: &PublicKey) -> usize {
        self.keys
            .iter()
            .position(|k| &k.public_key() == key)
            .unwrap()
    }

    /// Client transaction number `i`.
    pub fn transaction(&self, i: u64) -> Transaction {
        Transaction::signed(
            self.channel_id(),
            Payload::Inline(format!("tx-{i}").into_bytes()),
            i,
            self.client.clone(),
            &self.client_key,
        )
    }

    /// Committed blocks of node `i` in sequence order.
    pub fn blocks(&self, i: usize) -> Vec<CertifiedBlock> {
        let node = self.node(i);
        let channel = self.channel_id();
        let Some(tip) = node.get_chain_tip(&channel).unwrap() else {
            return Vec::new();
        };
        (0..=tip.sequence)
            .map(|s| node.get_block(&channel, s).unwrap().unwrap())
            .collect()
    }

    /// Number of blocks on node `i`.
    pub fn height(&self, i: usize) -> u64 {
        self.node(i)
            .get_chain_tip(&self.channel_id())
            .unwrap()
            .map(|t| t.sequence + 1)
            .unwrap_or(0)
    }

    /// Waits until every running node has at least `height` blocks.
    pub async fn wait_for_height(&self, height: u64, timeout: Duration) {
        let indices: Vec<_> = (0..self.nodes.len())
            .filter(|i| self.nodes[*i].is_some())
            .collect();
        self.wait_for_height_on(&indices, height, timeout).await;
    }

    /// Waits until the given nodes have at least `height` blocks.
    pub async fn wait_for_height_on(&self, indices: &[usize], height: u64, timeout: Duration) {
        let reached = tokio::time::timeout(timeout, async {
            loop {
                if indices.iter().all(|i| self.height(*i) >= height) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        if reached.is_err() {
            let heights: Vec<_> = indices.iter().map(|i| self.height(*i)).collect();
            panic!("timed out waiting for height {height}, heights {heights:?}");
        }
    }

    /// Asserts every pair of running nodes agrees on every common height.
    pub fn assert_agreement(&self) {
        let chains: Vec<_> = (0..self.nodes.len())
            .filter(|i| self.nodes[*i].is_some())
            .map(|i| self.blocks(i))
            .collect();
        for a in &chains {
            for b in &chains {
                for (x, y) in a.iter().zip(b) {
                    assert_eq!(
                        x.hash(),
                        y.hash(),
                        "conflicting blocks at sequence {}",
                        x.sequence()
                    );
                }
            }
        }
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        for node in self.nodes.iter().flatten() {
            node.shutdown();
        }
    }
}

/// Checks linkage, Merkle roots and certificates of a full chain.
pub fn assert_chain_integrity(blocks: &[CertifiedBlock], genesis_previous: Hash, quorum: usize) {
    let mut previous = genesis_previous;
    for (i, block) in blocks.iter().enumerate() {
        let header = &block.block.header;
        assert_eq!(header.sequence, i as u64, "sequence gap");
        assert_eq!(header.previous_hash, previous, "broken link at {i}");
        let ids: Vec<_> = block.block.transactions.iter().map(|tx| tx.id).collect();
        assert_eq!(header.merkle_root, merkle_root(&ids), "bad merkle root at {i}");
        assert_eq!(header.tx_count as usize, ids.len());

        let cert = &block.certificate;
        assert_eq!(cert.sequence, header.sequence);
        assert_eq!(cert.block_hash, block.hash());
        assert!(cert.endorsements.len() >= quorum, "thin certificate at {i}");
        let data = cert.to_signing_data();
        for endorsement in &cert.endorsements {
            endorsement
                .voter
                .verify(&data, &endorsement.signature)
                .expect("endorsement signature");
        }
        previous = block.hash();
    }
}

/// Drains an event receiver, keeping events that match.
pub fn drain<F>(events: &mut broadcast::Receiver<ConsensusEvent>, mut keep: F) -> Vec<ConsensusEvent>
where
    F: FnMut(&ConsensusEvent) -> bool,
{
    let mut kept = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) if keep(&event) => kept.push(event),
            Ok(_) => {}
            Err(broadcast::error::TryRecvError::Lagged(_)) => {}
            Err(_) => return kept,
        }
    }
}
