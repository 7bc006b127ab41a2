//! Multi-channel consensus node.

use crate::admission::AdmissionStats;
use crate::chain::ChainTip;
use crate::channel::{self, ChannelHandle, ChannelParams};
use crate::config::{ChannelConfig, RuntimeConfig};
use crate::error::{AdmissionError, ConsensusError, Result};
use crate::events::ConsensusEvent;
use crate::message::{ConsensusMessage, TransactionMessage};
use crate::transport::{Envelope, Transport};
use hiera_msp::MembershipRegistry;
use hiera_storage::LogProvider;
use hiera_types::{
    CertifiedBlock, ChannelId, Identity, Keypair, Payload, PublicKey, RevocationRecord, Signature,
    Transaction, TransactionId,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

type ChannelMap = Arc<RwLock<HashMap<ChannelId, Arc<ChannelHandle>>>>;

/// A node participating in any number of channels.
///
/// Each open channel runs in its own task. Inbound peer messages are routed
/// to the channel they name.
pub struct Node {
    keypair: Keypair,
    registry: Arc<MembershipRegistry>,
    logs: Arc<dyn LogProvider>,
    transport: Arc<dyn Transport>,
    config: RuntimeConfig,
    channels: ChannelMap,
    events: broadcast::Sender<ConsensusEvent>,
    router: JoinHandle<()>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("key", &self.keypair.public_key())
            .field("channels", &self.channels())
            .finish()
    }
}

impl Node {
    /// Starts a node with its own membership registry.
    ///
    /// Must be called within a tokio runtime.
    pub fn start(
        keypair: Keypair,
        transport: Arc<dyn Transport>,
        inbox: mpsc::Receiver<Envelope>,
        logs: Arc<dyn LogProvider>,
        config: RuntimeConfig,
    ) -> Self {
        Self::with_registry(
            keypair,
            Arc::new(MembershipRegistry::new()),
            transport,
            inbox,
            logs,
            config,
        )
    }

    /// Starts a node on an existing membership registry.
    pub fn with_registry(
        keypair: Keypair,
        registry: Arc<MembershipRegistry>,
        transport: Arc<dyn Transport>,
        inbox: mpsc::Receiver<Envelope>,
        logs: Arc<dyn LogProvider>,
        config: RuntimeConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let channels: ChannelMap = Arc::default();
        let router = tokio::spawn(route(inbox, channels.clone()));
        tracing::info!(node = %keypair.public_key(), "node started");
        Self {
            keypair,
            registry,
            logs,
            transport,
            config,
            channels,
            events,
            router,
        }
    }

    /// This node's key.
    pub fn public_key(&self) -> PublicKey {
        self.keypair.public_key()
    }

    /// Membership registry.
    pub fn registry(&self) -> &Arc<MembershipRegistry> {
        &self.registry
    }

    /// Subscribes to consensus events of every channel.
    pub fn subscribe(&self) -> broadcast::Receiver<ConsensusEvent> {
        self.events.subscribe()
    }

    /// Opens a channel: registers its membership, replays its commit log and
    /// joins consensus at the next sequence.
    ///
    /// A channel already known to the registry is opened with the
    /// registered membership.
    pub fn create_channel(&self, config: ChannelConfig) -> Result<()> {
        let id = config.id.clone();
        if self.channels.read().contains_key(&id) {
            return Err(ConsensusError::ChannelExists(id.to_string()));
        }

        let registered_here = self.registry.definition(&id).is_none();
        if registered_here {
            self.registry.register(config.definition())?;
        }
        let handle = match self.open_channel(config) {
            Ok(handle) => handle,
            Err(e) => {
                if registered_here {
                    let _ = self.registry.remove(&id);
                }
                return Err(e);
            }
        };

        self.channels.write().insert(id, Arc::new(handle));
        Ok(())
    }

    fn open_channel(&self, config: ChannelConfig) -> Result<ChannelHandle> {
        let log = self.logs.open(&config.id)?;
        let journal = self.logs.open_journal(&config.id)?;
        channel::spawn(ChannelParams {
            config,
            runtime: self.config.clone(),
            keypair: self.keypair.clone(),
            registry: self.registry.clone(),
            log,
            journal,
            transport: self.transport.clone(),
            events: self.events.clone(),
        })
    }

    /// Stops a channel and drops its membership. Channels with children
    /// cannot be removed.
    pub fn remove_channel(&self, id: &ChannelId) -> Result<()> {
        if !self.channels.read().contains_key(id) {
            return Err(ConsensusError::UnknownChannel(id.to_string()));
        }
        self.registry.remove(id)?;
        self.channels.write().remove(id);
        tracing::info!(channel = %id, "channel removed");
        Ok(())
    }

    /// Records a revocation on `channel` and its descendants.
    pub fn revoke(&self, channel: &ChannelId, record: RevocationRecord) -> Result<()> {
        self.registry.revoke(channel, record)?;
        Ok(())
    }

    /// Open channels, sorted.
    pub fn channels(&self) -> Vec<ChannelId> {
        let mut ids: Vec<_> = self.channels.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Submits a transaction from its parts.
    pub fn submit_transaction(
        &self,
        channel: &ChannelId,
        payload: Payload,
        timestamp: u64,
        identity: Identity,
        signature: Signature,
    ) -> Result<TransactionId> {
        self.submit(Transaction::new(
            channel.clone(),
            payload,
            timestamp,
            identity,
            signature,
        ))
    }

    /// Submits a signed transaction to its channel and gossips it to peers.
    ///
    /// Resubmitting a transaction that is queued or committed returns
    /// [`AdmissionError::DuplicateId`] and changes nothing.
    pub fn submit(&self, tx: Transaction) -> Result<TransactionId> {
        let handle = self.handle(&tx.channel)?;
        if let Some(reason) = handle.halt_reason() {
            return Err(ConsensusError::ChannelHalted(reason));
        }
        if handle.chain.read().contains_tx(&tx.id) {
            return Err(AdmissionError::DuplicateId(tx.id).into());
        }
        let membership = self.registry.effective(&tx.channel)?;
        let id = handle.queue.submit(tx.clone(), &membership)?;

        self.transport
            .broadcast(ConsensusMessage::Transaction(TransactionMessage { transaction: tx }));
        handle.notify.notify_one();
        Ok(id)
    }

    /// Tip of a channel's chain.
    pub fn get_chain_tip(&self, channel: &ChannelId) -> Result<Option<ChainTip>> {
        Ok(self.handle(channel)?.chain.read().tip())
    }

    /// Committed block at `sequence`.
    pub fn get_block(&self, channel: &ChannelId, sequence: u64) -> Result<Option<CertifiedBlock>> {
        Ok(self.handle(channel)?.chain.read().get(sequence).cloned())
    }

    /// Sequence of the block that committed a transaction.
    pub fn find_transaction(&self, channel: &ChannelId, id: &TransactionId) -> Result<Option<u64>> {
        Ok(self.handle(channel)?.chain.read().tx_sequence(id))
    }

    /// Admission queue statistics of a channel.
    pub fn admission_stats(&self, channel: &ChannelId) -> Result<AdmissionStats> {
        Ok(self.handle(channel)?.queue.stats())
    }

    /// Why a channel halted, if it did.
    pub fn halt_reason(&self, channel: &ChannelId) -> Result<Option<String>> {
        Ok(self.handle(channel)?.halt_reason())
    }

    /// Stops every channel.
    pub fn shutdown(&self) {
        self.router.abort();
        self.channels.write().clear();
        tracing::info!(node = %self.public_key(), "node stopped");
    }

    fn handle(&self, channel: &ChannelId) -> Result<Arc<ChannelHandle>> {
        self.channels
            .read()
            .get(channel)
            .cloned()
            .ok_or_else(|| ConsensusError::UnknownChannel(channel.to_string()))
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.router.abort();
        self.channels.write().clear();
    }
}

async fn route(mut inbox: mpsc::Receiver<Envelope>, channels: ChannelMap) {
    while let Some(envelope) = inbox.recv().await {
        let target = channels
            .read()
            .get(envelope.message.channel())
            .map(|handle| handle.inbox.clone());
        match target {
            Some(channel_inbox) => {
                if let Err(e) = channel_inbox.try_send(envelope) {
                    tracing::trace!(error = %e, "channel inbox full, dropping message");
                }
            }
            None => {
                tracing::trace!(
                    channel = %envelope.message.channel(),
                    kind = envelope.message.kind(),
                    "message for unopened channel"
                );
            }
        }
    }
}
