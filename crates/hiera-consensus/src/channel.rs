//! Channel pipeline runtime.
//!
//! One task per open channel owns its chain, commit log, ordering service
//! and consensus engine. It serializes every input (peer messages, the
//! round deadline, the batch tick and submission wake-ups) through a single
//! `select!` loop, so no consensus state is shared between threads.
//!
//! A block is persisted before it is appended to the chain and before it
//! is announced. Every proposal and vote this node signs is journaled
//! before it is sent, and replayed into the engine on restart. If either
//! write fails the channel halts.

use crate::admission::AdmissionQueue;
use crate::chain::Chain;
use crate::config::{ChannelConfig, QuorumRule, RuntimeConfig};
use crate::engine::{Action, ConsensusCore, EngineContext};
use crate::error::{AdmissionError, ConsensusError, ConsensusFault, Result};
use crate::events::ConsensusEvent;
use crate::message::ConsensusMessage;
use crate::ordering::OrderingService;
use crate::transport::{Envelope, Transport};
use crate::validator::ValidatorSet;
use hiera_msp::{AuditEventType, EffectiveMembership, MembershipRegistry};
use hiera_storage::{CommitLog, JournalEntry, VoteJournal};
use hiera_types::{CertifiedBlock, ChannelId, Keypair, PublicKey, Transaction};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior};

/// Inputs for opening a channel.
pub(crate) struct ChannelParams {
    pub config: ChannelConfig,
    pub runtime: RuntimeConfig,
    pub keypair: Keypair,
    pub registry: Arc<MembershipRegistry>,
    pub log: Arc<dyn CommitLog>,
    pub journal: Arc<dyn VoteJournal>,
    pub transport: Arc<dyn Transport>,
    pub events: broadcast::Sender<ConsensusEvent>,
}

/// Handle to a running channel task. Dropping it stops the task.
#[derive(Debug)]
pub(crate) struct ChannelHandle {
    pub inbox: mpsc::Sender<Envelope>,
    pub queue: Arc<AdmissionQueue>,
    pub chain: Arc<RwLock<Chain>>,
    pub notify: Arc<Notify>,
    halted: Arc<RwLock<Option<String>>>,
    task: JoinHandle<()>,
}

impl ChannelHandle {
    /// Why the channel halted, if it did.
    pub fn halt_reason(&self) -> Option<String> {
        self.halted.read().clone()
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Replays the channel's commit log and starts its task.
pub(crate) fn spawn(params: ChannelParams) -> Result<ChannelHandle> {
    let ChannelParams {
        config,
        runtime,
        keypair,
        registry,
        log,
        journal,
        transport,
        events,
    } = params;
    let channel = config.id.clone();
    let membership = registry.effective(&channel)?;

    let queue = Arc::new(
        AdmissionQueue::new(channel.clone(), runtime.admission.clone())
            .with_audit(registry.audit_log()),
    );
    let mut chain = Chain::new(channel.clone(), config.genesis_previous_hash);
    for block in log.replay()? {
        queue.mark_committed(block.block.transaction_ids());
        chain.restore(block)?;
    }
    if let Some(tip) = chain.tip() {
        tracing::info!(
            channel = %channel,
            sequence = tip.sequence,
            block = %tip.hash.short(),
            "replayed commit log"
        );
    }

    let mut signed = Vec::new();
    for entry in journal.entries() {
        if entry.sequence == chain.next_sequence() {
            signed.push(serde_json::from_value::<ConsensusMessage>(entry.message)?);
        }
    }

    let now = Instant::now();
    let quorum = runtime.engine.quorum;
    let engine = ConsensusCore::new(
        &chain,
        runtime.engine.clone(),
        keypair.clone(),
        runtime.admission.max_payload_bytes,
    );
    let chain = Arc::new(RwLock::new(chain));
    let (inbox, inbox_rx) = mpsc::channel(runtime.channel_inbox.max(1));
    let notify = Arc::new(Notify::new());
    let halted = Arc::new(RwLock::new(None));

    let task = ChannelTask {
        channel,
        me: keypair.public_key(),
        quorum,
        batch_interval: runtime.batch.interval.max(Duration::from_millis(1)),
        registry,
        validators: ValidatorSet::from_membership(&membership, quorum),
        membership,
        chain: chain.clone(),
        log,
        journal,
        queue: queue.clone(),
        ordering: OrderingService::new(runtime.batch.clone(), now),
        engine,
        transport,
        events,
        notify: notify.clone(),
        halted: halted.clone(),
    };
    let task = tokio::spawn(task.run(inbox_rx, signed));

    Ok(ChannelHandle {
        inbox,
        queue,
        chain,
        notify,
        halted,
        task,
    })
}

struct ChannelTask {
    channel: ChannelId,
    me: PublicKey,
    quorum: QuorumRule,
    batch_interval: Duration,
    registry: Arc<MembershipRegistry>,
    membership: Arc<EffectiveMembership>,
    validators: ValidatorSet,
    chain: Arc<RwLock<Chain>>,
    log: Arc<dyn CommitLog>,
    journal: Arc<dyn VoteJournal>,
    queue: Arc<AdmissionQueue>,
    ordering: OrderingService,
    engine: ConsensusCore,
    transport: Arc<dyn Transport>,
    events: broadcast::Sender<ConsensusEvent>,
    notify: Arc<Notify>,
    halted: Arc<RwLock<Option<String>>>,
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl ChannelTask {
    async fn run(mut self, mut inbox: mpsc::Receiver<Envelope>, signed: Vec<ConsensusMessage>) {
        let mut tick = tokio::time::interval(self.batch_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let notify = self.notify.clone();

        tracing::info!(
            channel = %self.channel,
            sequence = self.engine.sequence(),
            validators = self.validators.len(),
            "channel started"
        );
        if !signed.is_empty() {
            self.restore(signed);
        }

        loop {
            let deadline = self.engine.deadline();
            tokio::select! {
                envelope = inbox.recv() => match envelope {
                    Some(envelope) => self.on_envelope(envelope),
                    None => break,
                },
                _ = sleep_until(deadline) => self.on_timeout(),
                _ = tick.tick() => self.on_tick(),
                _ = notify.notified() => self.on_tick(),
            }
            if self.halted.read().is_some() {
                break;
            }
        }

        tracing::info!(channel = %self.channel, "channel stopped");
    }

    /// Feeds the journaled messages of the current sequence back into the
    /// engine and sends them again for peers that missed them.
    fn restore(&mut self, signed: Vec<ConsensusMessage>) {
        let now = Instant::now();
        self.refresh_membership();
        let actions = {
            let chain = self.chain.read();
            let ctx = EngineContext {
                chain: &chain,
                membership: &self.membership,
                validators: &self.validators,
            };
            self.engine.restore(signed.clone(), ctx, now)
        };
        for message in signed {
            if let ConsensusMessage::Propose(proposal) = &message {
                self.ordering.adopt(proposal.sequence, proposal.block_hash());
            }
            self.transport.broadcast(message);
        }
        self.apply(actions, now);
    }

    fn on_envelope(&mut self, envelope: Envelope) {
        let now = Instant::now();
        self.refresh_membership();
        let Envelope { from, message } = envelope;

        if let ConsensusMessage::Transaction(gossip) = message {
            self.on_transaction(from, gossip.transaction, now);
            return;
        }

        let actions = {
            let chain = self.chain.read();
            let ctx = EngineContext {
                chain: &chain,
                membership: &self.membership,
                validators: &self.validators,
            };
            self.engine.on_message(from, message, ctx, now)
        };
        self.apply(actions, now);
    }

    fn on_transaction(&mut self, from: PublicKey, tx: Transaction, now: Instant) {
        if self.chain.read().contains_tx(&tx.id) {
            return;
        }
        match self.queue.submit(tx, &self.membership) {
            Ok(_) => {
                self.engine.activate(now);
                self.apply(Vec::new(), now);
            }
            Err(AdmissionError::DuplicateId(_)) => {}
            Err(e) => {
                tracing::debug!(
                    channel = %self.channel,
                    peer = %from,
                    error = %e,
                    "rejected gossiped transaction"
                );
            }
        }
    }

    fn on_timeout(&mut self) {
        let now = Instant::now();
        self.refresh_membership();
        let actions = {
            let chain = self.chain.read();
            let ctx = EngineContext {
                chain: &chain,
                membership: &self.membership,
                validators: &self.validators,
            };
            self.engine.on_timeout(ctx, now)
        };
        self.apply(actions, now);
    }

    fn on_tick(&mut self) {
        let now = Instant::now();
        self.refresh_membership();
        self.queue.reap_expired();
        if !self.queue.is_empty() {
            self.engine.activate(now);
        }
        self.apply(Vec::new(), now);
    }

    /// Cuts and proposes a block when this node is the round's proposer.
    fn try_propose(&mut self, now: Instant) -> Vec<Action> {
        if !self.engine.needs_proposal(&self.validators) {
            return Vec::new();
        }
        let chain = self.chain.read();
        let Some(block) = self
            .ordering
            .cut(&self.queue, &chain, &self.membership, self.me, now)
        else {
            return Vec::new();
        };
        let ctx = EngineContext {
            chain: &chain,
            membership: &self.membership,
            validators: &self.validators,
        };
        self.engine.propose(block, ctx, now)
    }

    fn apply(&mut self, actions: Vec<Action>, now: Instant) {
        let mut pending: VecDeque<Action> = actions.into();
        loop {
            while let Some(action) = pending.pop_front() {
                if self.halted.read().is_some() {
                    return;
                }
                match action {
                    Action::Broadcast(message) => {
                        if let Err(e) = self.record_signed(&message) {
                            self.halt(format!("vote journal: {e}"));
                            return;
                        }
                        if let ConsensusMessage::Propose(proposal) = &message {
                            if proposal.proposer == self.me {
                                self.on_proposed(proposal.sequence, proposal.round, &message);
                            }
                        }
                        self.transport.broadcast(message);
                    }
                    Action::Send { to, message } => self.transport.send(&to, message),
                    Action::Commit(block) => match self.commit(block, now) {
                        Ok(()) => {
                            let more = {
                                let chain = self.chain.read();
                                let ctx = EngineContext {
                                    chain: &chain,
                                    membership: &self.membership,
                                    validators: &self.validators,
                                };
                                self.engine.committed(ctx, now)
                            };
                            pending.extend(more);
                            if !self.queue.is_empty() {
                                self.engine.activate(now);
                            }
                        }
                        Err(ConsensusError::Chain(e)) => {
                            tracing::error!(
                                channel = %self.channel,
                                sequence = self.engine.sequence(),
                                error = %e,
                                "refusing certified block"
                            );
                            self.engine.commit_rejected(now);
                        }
                        Err(e) => {
                            self.halt(e.to_string());
                            return;
                        }
                    },
                    Action::Abandoned {
                        sequence,
                        next_round,
                    } => {
                        self.ordering.on_abandoned();
                        self.emit(ConsensusEvent::RoundAbandoned {
                            channel: self.channel.clone(),
                            sequence,
                            next_round,
                        });
                    }
                    Action::Fault(fault) => {
                        if let ConsensusFault::BadVote { voter, reason } = &fault {
                            self.registry.audit().record(
                                AuditEventType::VerificationRejected,
                                &self.channel,
                                Some(*voter),
                                format!("vote: {reason}"),
                            );
                        }
                        self.emit(ConsensusEvent::FaultDetected {
                            channel: self.channel.clone(),
                            fault,
                        });
                    }
                }
            }

            let more = self.try_propose(now);
            if more.is_empty() {
                return;
            }
            pending.extend(more);
        }
    }

    /// Persists a proposal or vote signed by this node. Other messages are
    /// not journaled.
    fn record_signed(&self, message: &ConsensusMessage) -> Result<()> {
        let (signer, sequence) = match message {
            ConsensusMessage::Propose(m) => (m.proposer, m.sequence),
            ConsensusMessage::Prepare(m) => (m.voter, m.sequence),
            ConsensusMessage::Endorse(m) => (m.voter, m.sequence),
            ConsensusMessage::ViewChange(m) => (m.voter, m.sequence),
            _ => return Ok(()),
        };
        if signer != self.me {
            return Ok(());
        }
        self.journal.record(&JournalEntry {
            sequence,
            message: serde_json::to_value(message)?,
        })?;
        Ok(())
    }

    fn on_proposed(&mut self, sequence: u64, round: u64, message: &ConsensusMessage) {
        let ConsensusMessage::Propose(proposal) = message else {
            return;
        };
        let block_hash = proposal.block_hash();
        self.ordering.adopt(sequence, block_hash);
        self.emit(ConsensusEvent::BlockProposed {
            channel: self.channel.clone(),
            sequence,
            round,
            block_hash,
            tx_count: proposal.transactions.len(),
        });
    }

    /// Validates, persists and appends a certified block.
    fn commit(&mut self, block: CertifiedBlock, now: Instant) -> Result<()> {
        self.chain
            .read()
            .validate(&block, &self.membership, &self.validators)?;
        self.log.append(&block)?;
        self.chain
            .write()
            .append(block.clone(), &self.membership, &self.validators)?;

        let sequence = block.sequence();
        self.queue.mark_committed(block.block.transaction_ids());
        self.ordering.on_committed(sequence, now);
        tracing::info!(
            channel = %self.channel,
            sequence,
            round = block.certificate.round,
            block = %block.hash().short(),
            tx_count = block.block.tx_count(),
            "committed block"
        );
        self.emit(ConsensusEvent::BlockCommitted {
            channel: self.channel.clone(),
            block: Arc::new(block),
        });
        Ok(())
    }

    fn halt(&mut self, reason: String) {
        tracing::error!(channel = %self.channel, reason = %reason, "channel halted");
        *self.halted.write() = Some(reason.clone());
        self.emit(ConsensusEvent::ChannelHalted {
            channel: self.channel.clone(),
            reason,
        });
    }

    fn refresh_membership(&mut self) {
        let Ok(membership) = self.registry.effective(&self.channel) else {
            return;
        };
        if Arc::ptr_eq(&membership, &self.membership) {
            return;
        }
        self.validators = ValidatorSet::from_membership(&membership, self.quorum);
        self.membership = membership;
        let evicted = self.queue.revalidate(&self.membership);
        tracing::debug!(
            channel = %self.channel,
            validators = self.validators.len(),
            quorum = self.validators.quorum(),
            evicted,
            "membership updated"
        );
    }

    fn emit(&self, event: ConsensusEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
