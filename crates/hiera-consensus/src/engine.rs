//! BFT consensus engine.
//!
//! A sans-IO state machine for one channel. It consumes peer messages,
//! local proposals and timer events, and returns [`Action`]s for the channel
//! runtime to carry out. It never touches the network, the clock or the
//! commit log itself.
//!
//! # Protocol
//!
//! Each sequence runs one or more rounds. In round `r` the proposer
//! `validators[(sequence + r) % n]` broadcasts a block. Validators that
//! accept it broadcast a `prepare`. A prepare quorum locks a validator on
//! the block and it broadcasts an `endorse`. An endorse quorum is a
//! [`QuorumCertificate`]: the block commits.
//!
//! A locked validator prepares a different block only when the proposal
//! carries a prepare certificate from a round later than its lock. Together
//! with quorum intersection this keeps two certificates at one sequence from
//! naming different blocks.
//!
//! When the round deadline passes without a commit the validator votes
//! `view_change`. A view-change quorum moves everyone to round `r + 1`
//! with a longer deadline.

use crate::admission::check_transaction;
use crate::chain::Chain;
use crate::config::EngineConfig;
use crate::error::ConsensusFault;
use crate::message::{
    CertificateMessage, ConsensusMessage, EndorseMessage, PrepareCertificate, PrepareMessage,
    ProposeMessage, SyncRequestMessage, SyncResponseMessage, ViewChangeMessage,
};
use crate::round::{AcceptedProposal, Phase, RoundState, VoteOutcome};
use crate::validator::ValidatorSet;
use hiera_msp::EffectiveMembership;
use hiera_types::{
    now_millis, Block, CertifiedBlock, ChannelId, Hash, Keypair, PublicKey, QuorumCertificate,
    Signature,
};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use tokio::time::Instant;

const MAX_EVIDENCE: usize = 1024;
const MAX_SYNC_RESPONSES_TRACKED: usize = 4096;

/// Something the runtime must do on behalf of the engine.
#[derive(Debug, Clone)]
pub enum Action {
    /// Send to every other validator.
    Broadcast(ConsensusMessage),

    /// Send to one peer.
    Send {
        /// Recipient.
        to: PublicKey,
        /// Message.
        message: ConsensusMessage,
    },

    /// Persist and append the block, then call [`ConsensusCore::committed`].
    Commit(CertifiedBlock),

    /// The round ended without a commit.
    Abandoned {
        /// Sequence.
        sequence: u64,
        /// Round that starts now.
        next_round: u64,
    },

    /// Misbehavior was observed.
    Fault(ConsensusFault),
}

/// Read-only view of channel state the engine validates against.
#[derive(Debug, Clone, Copy)]
pub struct EngineContext<'a> {
    /// Committed chain.
    pub chain: &'a Chain,
    /// Current effective membership.
    pub membership: &'a EffectiveMembership,
    /// Voting validators derived from the membership.
    pub validators: &'a ValidatorSet,
}

/// Proof of equivocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evidence {
    /// The fault, naming both blocks.
    pub fault: ConsensusFault,
    /// Signature over the first block.
    pub first_signature: Signature,
    /// Signature over the conflicting block.
    pub second_signature: Signature,
    /// Observation time (unix milliseconds).
    pub observed_at: u64,
}

#[derive(Debug, Clone)]
struct ValidBlock {
    hash: Hash,
    round: u64,
    certificate: PrepareCertificate,
}

#[derive(Debug, Clone, Copy)]
struct SyncTarget {
    sequence: u64,
    requested_at: Instant,
}

/// Consensus state machine of one channel on one node.
#[derive(Debug)]
pub struct ConsensusCore {
    channel: ChannelId,
    config: EngineConfig,
    keypair: Keypair,
    max_payload_bytes: usize,

    sequence: u64,
    round: u64,
    rounds: BTreeMap<u64, RoundState>,
    /// Validated candidate blocks at the current sequence.
    blocks: HashMap<Hash, Block>,
    locked: Option<(Hash, u64)>,
    valid: Option<ValidBlock>,
    deadline: Option<Instant>,
    /// A commit was emitted and awaits [`ConsensusCore::committed`].
    committing: bool,

    /// Next-sequence messages, replayed after the current sequence commits.
    future: VecDeque<(PublicKey, ConsensusMessage)>,
    /// Blocks received through sync, not yet committed.
    synced: BTreeMap<u64, CertifiedBlock>,
    sync_target: Option<SyncTarget>,
    sync_responded: HashSet<(PublicKey, u64)>,

    evidence: VecDeque<Evidence>,
}

impl ConsensusCore {
    /// Creates an engine that resumes at `chain.next_sequence()`.
    pub fn new(
        chain: &Chain,
        config: EngineConfig,
        keypair: Keypair,
        max_payload_bytes: usize,
    ) -> Self {
        Self {
            channel: chain.channel().clone(),
            config,
            keypair,
            max_payload_bytes,
            sequence: chain.next_sequence(),
            round: 0,
            rounds: BTreeMap::new(),
            blocks: HashMap::new(),
            locked: None,
            valid: None,
            deadline: None,
            committing: false,
            future: VecDeque::new(),
            synced: BTreeMap::new(),
            sync_target: None,
            sync_responded: HashSet::new(),
            evidence: VecDeque::new(),
        }
    }

    /// Channel id.
    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    /// This node's key.
    pub fn public_key(&self) -> PublicKey {
        self.keypair.public_key()
    }

    /// Sequence being decided.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Current round.
    pub fn round(&self) -> u64 {
        self.round
    }

    /// Round deadline, when armed.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Block and round this node is locked on.
    pub fn locked(&self) -> Option<(Hash, u64)> {
        self.locked
    }

    /// Recorded equivocation evidence, oldest first.
    pub fn evidence(&self) -> impl Iterator<Item = &Evidence> {
        self.evidence.iter()
    }

    /// Number of buffered next-sequence messages.
    pub fn buffered(&self) -> usize {
        self.future.len()
    }

    /// Arms the round deadline if it is not running.
    ///
    /// Called when there is work to agree on.
    pub fn activate(&mut self, now: Instant) {
        if self.deadline.is_none() && !self.committing {
            self.deadline = Some(now + self.config.timeout_for(self.round));
        }
    }

    /// Checks whether this node must supply a fresh block for the current
    /// round.
    pub fn needs_proposal(&self, validators: &ValidatorSet) -> bool {
        let me = self.public_key();
        !self.committing
            && self.valid.is_none()
            && validators.proposer(self.sequence, self.round) == Some(&me)
            && !self.rounds.get(&self.round).is_some_and(|r| r.proposed)
    }

    /// Proposes a freshly cut block in the current round.
    ///
    /// Ignored unless [`ConsensusCore::needs_proposal`] holds and the block
    /// is for the current sequence.
    pub fn propose(&mut self, block: Block, ctx: EngineContext<'_>, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        if !self.needs_proposal(ctx.validators) || block.sequence() != self.sequence {
            return actions;
        }
        self.activate(now);
        self.round_mut(self.round).proposed = true;
        let message = ProposeMessage::new(self.round, block, None, &self.keypair);
        tracing::debug!(
            channel = %self.channel,
            sequence = self.sequence,
            round = self.round,
            block = %message.block_hash().short(),
            tx_count = message.transactions.len(),
            "proposing block"
        );
        self.cast(ConsensusMessage::Propose(message), ctx, now, &mut actions);
        actions
    }

    /// Resumes from messages this node signed at the current sequence before
    /// a restart.
    ///
    /// The engine jumps to the latest journaled round and keeps every vote it
    /// already cast, so it never signs a conflicting one. Nothing in
    /// `journal` is broadcast again by the engine.
    pub fn restore(
        &mut self,
        journal: Vec<ConsensusMessage>,
        ctx: EngineContext<'_>,
        now: Instant,
    ) -> Vec<Action> {
        let mut actions = Vec::new();
        let me = self.public_key();
        let own: Vec<_> = journal
            .into_iter()
            .filter(|m| m.channel() == &self.channel && m.sequence() == Some(self.sequence))
            .collect();
        if own.is_empty() {
            return actions;
        }

        for message in &own {
            match message {
                ConsensusMessage::Propose(p) if p.proposer == me => {
                    self.round = self.round.max(p.round);
                    self.round_mut(p.round).proposed = true;
                }
                ConsensusMessage::Prepare(v) if v.voter == me => {
                    self.round = self.round.max(v.round);
                    self.round_mut(v.round).prepared = Some(v.block_hash);
                }
                ConsensusMessage::Endorse(v) if v.voter == me => {
                    self.round = self.round.max(v.round);
                    self.round_mut(v.round).endorsed = Some(v.block_hash);
                    if !self.locked.is_some_and(|(_, r)| r >= v.round) {
                        self.locked = Some((v.block_hash, v.round));
                    }
                }
                ConsensusMessage::ViewChange(v) if v.voter == me => {
                    self.round = self.round.max(v.round);
                    self.round_mut(v.round).view_change_sent = true;
                }
                _ => {}
            }
        }
        tracing::info!(
            channel = %self.channel,
            sequence = self.sequence,
            round = self.round,
            messages = own.len(),
            locked = ?self.locked.map(|(h, r)| (h.short(), r)),
            "restored signed messages"
        );

        self.activate(now);
        for message in own {
            self.handle(me, message, ctx, now, &mut actions);
        }
        actions
    }

    /// Handles a message from a peer.
    pub fn on_message(
        &mut self,
        from: PublicKey,
        message: ConsensusMessage,
        ctx: EngineContext<'_>,
        now: Instant,
    ) -> Vec<Action> {
        let mut actions = Vec::new();
        self.handle(from, message, ctx, now, &mut actions);
        actions
    }

    /// Handles the round deadline.
    pub fn on_timeout(&mut self, ctx: EngineContext<'_>, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        match self.deadline {
            Some(deadline) if now >= deadline && !self.committing => {}
            _ => return actions,
        }

        tracing::info!(
            channel = %self.channel,
            sequence = self.sequence,
            round = self.round,
            "round deadline passed"
        );
        actions.push(Action::Fault(ConsensusFault::MissingQuorum {
            sequence: self.sequence,
            round: self.round,
        }));
        self.deadline = Some(now + self.config.timeout_for(self.round));

        // Re-send the vote: a lost view-change would otherwise stall the round.
        if self.round_mut(self.round).view_change_sent {
            if ctx.validators.contains(&self.public_key()) {
                let vote = ViewChangeMessage::new(
                    self.channel.clone(),
                    self.sequence,
                    self.round,
                    &self.keypair,
                );
                actions.push(Action::Broadcast(ConsensusMessage::ViewChange(vote)));
            }
        } else {
            self.vote_view_change(self.round, ctx, now, &mut actions);
        }
        self.request_sync_if_due(now, &mut actions);
        actions
    }

    /// The runtime refused the emitted commit. The round continues and
    /// times out normally.
    pub fn commit_rejected(&mut self, now: Instant) {
        if self.committing {
            self.committing = false;
            self.activate(now);
        }
    }

    /// Advances past a block the runtime has durably appended.
    pub fn committed(&mut self, ctx: EngineContext<'_>, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        let next = ctx.chain.next_sequence();
        if next <= self.sequence {
            return actions;
        }

        self.sequence = next;
        self.round = 0;
        self.rounds.clear();
        self.blocks.clear();
        self.locked = None;
        self.valid = None;
        self.deadline = None;
        self.committing = false;
        self.synced = self.synced.split_off(&next);

        if let Some(block) = self.synced.remove(&next) {
            match ctx.chain.validate(&block, ctx.membership, ctx.validators) {
                Ok(()) => {
                    self.committing = true;
                    actions.push(Action::Commit(block));
                    return actions;
                }
                Err(e) => {
                    tracing::warn!(
                        channel = %self.channel,
                        sequence = next,
                        error = %e,
                        "discarding synced block"
                    );
                    self.synced.clear();
                }
            }
        }

        if self.sync_target.is_some_and(|t| t.sequence >= next) {
            self.request_sync_if_due(now, &mut actions);
        } else {
            self.sync_target = None;
        }

        let buffered: Vec<_> = self.future.drain(..).collect();
        for (from, message) in buffered {
            if message.sequence() == Some(next) {
                self.handle(from, message, ctx, now, &mut actions);
            } else if message.sequence() == Some(next + 1) {
                self.buffer(from, message);
            }
        }
        actions
    }

    fn handle(
        &mut self,
        from: PublicKey,
        message: ConsensusMessage,
        ctx: EngineContext<'_>,
        now: Instant,
        actions: &mut Vec<Action>,
    ) {
        if message.channel() != &self.channel {
            return;
        }

        match message {
            ConsensusMessage::SyncRequest(request) => {
                self.on_sync_request(from, request, ctx, actions);
                return;
            }
            ConsensusMessage::SyncResponse(response) => {
                self.on_sync_response(response, ctx, now, actions);
                return;
            }
            ConsensusMessage::Transaction(_) => return,
            _ => {}
        }

        let Some(sequence) = message.sequence() else {
            return;
        };

        if sequence < self.sequence {
            self.help_lagging_peer(from, sequence, ctx, actions);
            return;
        }
        if sequence > self.sequence {
            // Peers are moving on; a missed commit surfaces at the deadline.
            self.activate(now);
            if sequence == self.sequence + 1 {
                self.buffer(from, message.clone());
            }
            if let ConsensusMessage::Certificate(_) = &message {
                self.note_ahead(from, sequence, now, actions);
            } else if sequence > self.sequence + 1 {
                self.note_ahead(from, sequence - 1, now, actions);
            }
            return;
        }
        if self.committing {
            return;
        }

        match message {
            ConsensusMessage::Propose(proposal) => self.on_propose(from, proposal, ctx, now, actions),
            ConsensusMessage::Prepare(vote) => self.on_prepare(vote, ctx, now, actions),
            ConsensusMessage::Endorse(vote) => self.on_endorse(from, vote, ctx, now, actions),
            ConsensusMessage::ViewChange(vote) => self.on_view_change(vote, ctx, now, actions),
            ConsensusMessage::Certificate(gossip) => {
                self.on_certificate(from, gossip, ctx, now, actions)
            }
            _ => {}
        }
    }

    fn on_propose(
        &mut self,
        from: PublicKey,
        proposal: ProposeMessage,
        ctx: EngineContext<'_>,
        now: Instant,
        actions: &mut Vec<Action>,
    ) {
        let round = proposal.round;
        if round > self.round + self.config.max_round_lookahead || !self.keeps_round(round) {
            return;
        }

        let Some(expected) = ctx.validators.proposer(self.sequence, round).copied() else {
            return;
        };
        if proposal.proposer != expected || from != expected {
            self.fault(
                ConsensusFault::UnexpectedProposer {
                    sender: from,
                    expected,
                    sequence: self.sequence,
                    round,
                },
                actions,
            );
            return;
        }
        let hash = proposal.block_hash();
        let signing_data = ProposeMessage::signing_data(&self.channel, self.sequence, round, &hash);
        if let Err(e) = ctx
            .membership
            .verify_voter(&proposal.proposer, &proposal.signature, &signing_data)
        {
            self.fault(
                ConsensusFault::BadVote {
                    voter: proposal.proposer,
                    reason: format!("proposal signature: {e}"),
                },
                actions,
            );
            return;
        }

        if let Some(first) = self.round_mut(round).proposal {
            if first.hash != hash {
                self.equivocation(
                    proposal.proposer,
                    round,
                    Phase::Propose,
                    first,
                    hash,
                    proposal.signature,
                    actions,
                );
                if round == self.round {
                    self.vote_view_change(round, ctx, now, actions);
                }
            }
            return;
        }
        if round > self.round {
            let state = self.round_mut(round);
            if state.deferred.is_none() {
                state.deferred = Some(proposal);
            }
            return;
        }
        self.accept_proposal(proposal, ctx, now, actions);
    }

    fn accept_proposal(
        &mut self,
        proposal: ProposeMessage,
        ctx: EngineContext<'_>,
        now: Instant,
        actions: &mut Vec<Action>,
    ) {
        let round = proposal.round;
        let hash = proposal.block_hash();
        self.round_mut(round).proposal = Some(AcceptedProposal {
            hash,
            signature: proposal.signature,
        });

        let block = proposal.block();
        if let Err(reason) = self.check_block(&block, &proposal.proposer, ctx) {
            self.reject_proposal(proposal.proposer, round, reason, ctx, now, actions);
            return;
        }
        if let Some(pc) = &proposal.justification {
            if let Err(reason) = self.check_prepare_certificate(pc, hash, round, ctx) {
                self.reject_proposal(proposal.proposer, round, reason, ctx, now, actions);
                return;
            }
        }

        tracing::debug!(
            channel = %self.channel,
            sequence = self.sequence,
            round,
            block = %hash.short(),
            proposer = %proposal.proposer,
            "accepted proposal"
        );
        self.blocks.insert(hash, block);
        if round == self.round {
            self.activate(now);
        }

        let may_prepare = match self.locked {
            None => true,
            Some((locked_hash, _)) if locked_hash == hash => true,
            Some((_, locked_round)) => proposal
                .justification
                .as_ref()
                .is_some_and(|pc| pc.round > locked_round),
        };
        if !may_prepare {
            tracing::debug!(
                channel = %self.channel,
                sequence = self.sequence,
                round,
                "locked on another block, abstaining"
            );
            return;
        }
        if round == self.round && self.round_mut(round).prepared.is_none() {
            self.round_mut(round).prepared = Some(hash);
            if ctx.validators.contains(&self.public_key()) {
                let vote =
                    PrepareMessage::new(self.channel.clone(), self.sequence, round, hash, &self.keypair);
                self.cast(ConsensusMessage::Prepare(vote), ctx, now, actions);
            }
        }
        // Votes may have outrun the proposal.
        self.check_prepare_quorum(round, ctx, now, actions);
        self.check_endorse_quorum(round, ctx, actions);
    }

    fn reject_proposal(
        &mut self,
        proposer: PublicKey,
        round: u64,
        reason: String,
        ctx: EngineContext<'_>,
        now: Instant,
        actions: &mut Vec<Action>,
    ) {
        self.fault(
            ConsensusFault::InvalidProposal {
                proposer,
                sequence: self.sequence,
                round,
                reason,
            },
            actions,
        );
        if round == self.round {
            self.activate(now);
            self.vote_view_change(round, ctx, now, actions);
        }
    }

    fn on_prepare(
        &mut self,
        vote: PrepareMessage,
        ctx: EngineContext<'_>,
        now: Instant,
        actions: &mut Vec<Action>,
    ) {
        let round = vote.round;
        if round > self.round + self.config.max_round_lookahead || !self.keeps_round(round) {
            return;
        }
        if !self.verify_vote(&vote.voter, &vote.signature, &vote.to_signing_data(), ctx, actions) {
            return;
        }
        match self
            .round_mut(round)
            .prepares
            .insert(vote.voter, vote.block_hash, vote.signature)
        {
            VoteOutcome::New => {}
            VoteOutcome::Duplicate => return,
            VoteOutcome::Equivocation { first, signature } => {
                self.equivocation(
                    vote.voter,
                    round,
                    Phase::Prepare,
                    AcceptedProposal {
                        hash: first,
                        signature,
                    },
                    vote.block_hash,
                    vote.signature,
                    actions,
                );
                return;
            }
        }
        tracing::trace!(
            channel = %self.channel,
            sequence = self.sequence,
            round,
            voter = %vote.voter,
            block = %vote.block_hash.short(),
            "prepare vote"
        );
        if round == self.round {
            self.activate(now);
        }
        self.check_prepare_quorum(round, ctx, now, actions);
    }

    fn check_prepare_quorum(
        &mut self,
        round: u64,
        ctx: EngineContext<'_>,
        now: Instant,
        actions: &mut Vec<Action>,
    ) {
        let quorum = ctx.validators.quorum();
        let Some(hash) = self
            .rounds
            .get(&round)
            .and_then(|r| r.prepares.quorum_block(quorum))
        else {
            return;
        };
        if !self.blocks.contains_key(&hash) {
            return;
        }

        let newer = match &self.valid {
            None => true,
            Some(valid) => round > valid.round,
        };
        if newer {
            let votes = self.rounds.get(&round).map(|r| r.prepares.endorsements_for(&hash));
            self.valid = Some(ValidBlock {
                hash,
                round,
                certificate: PrepareCertificate {
                    round,
                    block_hash: hash,
                    votes: votes.unwrap_or_default(),
                },
            });
        }

        if round != self.round || self.round_mut(round).endorsed.is_some() {
            return;
        }
        self.locked = Some((hash, round));
        self.round_mut(round).endorsed = Some(hash);
        tracing::debug!(
            channel = %self.channel,
            sequence = self.sequence,
            round,
            block = %hash.short(),
            "prepare quorum, locked"
        );
        if ctx.validators.contains(&self.public_key()) {
            let vote = EndorseMessage::new(self.channel.clone(), self.sequence, round, hash, &self.keypair);
            self.cast(ConsensusMessage::Endorse(vote), ctx, now, actions);
        }
    }

    fn on_endorse(
        &mut self,
        from: PublicKey,
        vote: EndorseMessage,
        ctx: EngineContext<'_>,
        now: Instant,
        actions: &mut Vec<Action>,
    ) {
        let round = vote.round;
        if round > self.round + self.config.max_round_lookahead || !self.keeps_round(round) {
            return;
        }
        if !self.verify_vote(&vote.voter, &vote.signature, &vote.to_signing_data(), ctx, actions) {
            return;
        }
        match self
            .round_mut(round)
            .endorses
            .insert(vote.voter, vote.block_hash, vote.signature)
        {
            VoteOutcome::New => {}
            VoteOutcome::Duplicate => return,
            VoteOutcome::Equivocation { first, signature } => {
                self.equivocation(
                    vote.voter,
                    round,
                    Phase::Endorse,
                    AcceptedProposal {
                        hash: first,
                        signature,
                    },
                    vote.block_hash,
                    vote.signature,
                    actions,
                );
                return;
            }
        }
        tracing::trace!(
            channel = %self.channel,
            sequence = self.sequence,
            round,
            voter = %vote.voter,
            block = %vote.block_hash.short(),
            "endorse vote"
        );
        if round == self.round {
            self.activate(now);
        }
        self.check_endorse_quorum(round, ctx, actions);
        if !self.committing {
            let quorum = ctx.validators.quorum();
            let unknown = self
                .rounds
                .get(&round)
                .and_then(|r| r.endorses.quorum_block(quorum))
                .filter(|h| !self.blocks.contains_key(h));
            if unknown.is_some() {
                self.note_ahead(from, self.sequence, now, actions);
            }
        }
    }

    fn check_endorse_quorum(&mut self, round: u64, ctx: EngineContext<'_>, actions: &mut Vec<Action>) {
        if self.committing {
            return;
        }
        let quorum = ctx.validators.quorum();
        let Some(state) = self.rounds.get(&round) else {
            return;
        };
        let Some(hash) = state.endorses.quorum_block(quorum) else {
            return;
        };
        let Some(block) = self.blocks.get(&hash) else {
            return;
        };
        let certificate = QuorumCertificate {
            channel: self.channel.clone(),
            sequence: self.sequence,
            round,
            block_hash: hash,
            endorsements: state.endorses.endorsements_for(&hash),
        };
        let certified = CertifiedBlock {
            block: block.clone(),
            certificate: certificate.clone(),
        };
        tracing::info!(
            channel = %self.channel,
            sequence = self.sequence,
            round,
            block = %hash.short(),
            endorsements = certificate.endorsements.len(),
            "quorum certificate formed"
        );
        self.finish(certified, actions);
        actions.push(Action::Broadcast(ConsensusMessage::Certificate(
            CertificateMessage { certificate },
        )));
    }

    fn on_view_change(
        &mut self,
        vote: ViewChangeMessage,
        ctx: EngineContext<'_>,
        now: Instant,
        actions: &mut Vec<Action>,
    ) {
        let round = vote.round;
        if round < self.round || round > self.round + self.config.max_round_lookahead {
            return;
        }
        if !self.verify_vote(&vote.voter, &vote.signature, &vote.to_signing_data(), ctx, actions) {
            return;
        }
        if !self.round_mut(round).add_view_change(vote.voter, vote.signature) {
            return;
        }
        let count = self.round_mut(round).view_changes.len();
        tracing::debug!(
            channel = %self.channel,
            sequence = self.sequence,
            round,
            voter = %vote.voter,
            votes = count,
            "view-change vote"
        );

        if count >= ctx.validators.join_threshold() && !self.round_mut(round).view_change_sent {
            self.vote_view_change(round, ctx, now, actions);
        }
        let count = self.round_mut(round).view_changes.len();
        if count >= ctx.validators.quorum() && round >= self.round {
            self.start_round(round + 1, ctx, now, actions);
        }
    }

    fn on_certificate(
        &mut self,
        from: PublicKey,
        gossip: CertificateMessage,
        ctx: EngineContext<'_>,
        now: Instant,
        actions: &mut Vec<Action>,
    ) {
        let certificate = gossip.certificate;
        if let Err(reason) = ctx.validators.verify_certificate(&certificate, ctx.membership) {
            self.fault(
                ConsensusFault::BadVote {
                    voter: from,
                    reason: format!("certificate: {reason}"),
                },
                actions,
            );
            return;
        }
        match self.blocks.get(&certificate.block_hash) {
            Some(block) => {
                let certified = CertifiedBlock {
                    block: block.clone(),
                    certificate,
                };
                tracing::debug!(
                    channel = %self.channel,
                    sequence = self.sequence,
                    block = %certified.hash().short(),
                    "committing from gossiped certificate"
                );
                self.finish(certified, actions);
            }
            None => self.note_ahead(from, self.sequence, now, actions),
        }
    }

    fn on_sync_request(
        &mut self,
        from: PublicKey,
        request: SyncRequestMessage,
        ctx: EngineContext<'_>,
        actions: &mut Vec<Action>,
    ) {
        let mut limit = self.config.sync_batch.max(1);
        if let Some(to) = request.to_sequence {
            if to < request.from_sequence {
                return;
            }
            let span = to.saturating_sub(request.from_sequence).saturating_add(1);
            limit = limit.min(usize::try_from(span).unwrap_or(usize::MAX));
        }
        let blocks = ctx.chain.range(request.from_sequence, limit);
        if blocks.is_empty() {
            return;
        }
        tracing::debug!(
            channel = %self.channel,
            peer = %from,
            from_sequence = request.from_sequence,
            count = blocks.len(),
            "serving sync request"
        );
        actions.push(Action::Send {
            to: from,
            message: ConsensusMessage::SyncResponse(SyncResponseMessage {
                channel: self.channel.clone(),
                blocks,
            }),
        });
    }

    fn on_sync_response(
        &mut self,
        response: SyncResponseMessage,
        ctx: EngineContext<'_>,
        now: Instant,
        actions: &mut Vec<Action>,
    ) {
        let horizon = self.sequence + self.config.sync_batch.max(1) as u64;
        for block in response.blocks {
            let sequence = block.sequence();
            if sequence >= self.sequence && sequence < horizon && block.block.header.channel == self.channel {
                self.synced.entry(sequence).or_insert(block);
            }
        }
        if self.committing {
            return;
        }
        let Some(block) = self.synced.remove(&self.sequence) else {
            return;
        };
        match ctx.chain.validate(&block, ctx.membership, ctx.validators) {
            Ok(()) => {
                tracing::debug!(
                    channel = %self.channel,
                    sequence = self.sequence,
                    block = %block.hash().short(),
                    "committing synced block"
                );
                self.finish(block, actions);
            }
            Err(e) => {
                tracing::warn!(
                    channel = %self.channel,
                    sequence = self.sequence,
                    error = %e,
                    "rejected synced block"
                );
                self.synced.clear();
                self.request_sync_if_due(now, actions);
            }
        }
    }

    fn start_round(
        &mut self,
        round: u64,
        ctx: EngineContext<'_>,
        now: Instant,
        actions: &mut Vec<Action>,
    ) {
        if round <= self.round {
            return;
        }
        tracing::info!(
            channel = %self.channel,
            sequence = self.sequence,
            round,
            proposer = ?ctx.validators.proposer(self.sequence, round),
            "view change"
        );
        actions.push(Action::Abandoned {
            sequence: self.sequence,
            next_round: round,
        });
        self.round = round;
        self.deadline = Some(now + self.config.timeout_for(round));
        let pinned = [self.valid.as_ref().map(|v| v.round), self.locked.map(|(_, r)| r)];
        self.rounds.retain(|r, state| {
            // The previous round may still finish on late endorsements.
            let keep = *r + 1 >= round || pinned.contains(&Some(*r));
            if keep && *r < round {
                state.deferred = None;
            }
            keep
        });

        let me = self.public_key();
        let proposed = self.rounds.get(&round).is_some_and(|r| r.proposed);
        if ctx.validators.proposer(self.sequence, round) == Some(&me) && !proposed {
            if let Some(valid) = self.valid.clone() {
                if let Some(block) = self.blocks.get(&valid.hash).cloned() {
                    self.round_mut(round).proposed = true;
                    tracing::debug!(
                        channel = %self.channel,
                        sequence = self.sequence,
                        round,
                        block = %valid.hash.short(),
                        prepared_in = valid.round,
                        "re-proposing prepared block"
                    );
                    let message =
                        ProposeMessage::new(round, block, Some(valid.certificate), &self.keypair);
                    self.cast(ConsensusMessage::Propose(message), ctx, now, actions);
                }
            }
        }

        if let Some(deferred) = self.round_mut(round).deferred.take() {
            self.accept_proposal(deferred, ctx, now, actions);
        }
        self.check_prepare_quorum(round, ctx, now, actions);
        self.check_endorse_quorum(round, ctx, actions);

        // A quorum may already have left this round too.
        let leave = self
            .rounds
            .get(&round)
            .is_some_and(|r| r.view_changes.len() >= ctx.validators.quorum());
        if leave && !self.committing {
            self.vote_view_change(round, ctx, now, actions);
            self.start_round(round + 1, ctx, now, actions);
        }
    }

    fn vote_view_change(
        &mut self,
        round: u64,
        ctx: EngineContext<'_>,
        now: Instant,
        actions: &mut Vec<Action>,
    ) {
        if self.committing || self.round_mut(round).view_change_sent {
            return;
        }
        self.round_mut(round).view_change_sent = true;
        if !ctx.validators.contains(&self.public_key()) {
            return;
        }
        let vote = ViewChangeMessage::new(self.channel.clone(), self.sequence, round, &self.keypair);
        self.cast(ConsensusMessage::ViewChange(vote), ctx, now, actions);
    }

    /// Broadcasts a message signed by this node and processes it locally.
    fn cast(
        &mut self,
        message: ConsensusMessage,
        ctx: EngineContext<'_>,
        now: Instant,
        actions: &mut Vec<Action>,
    ) {
        actions.push(Action::Broadcast(message.clone()));
        let me = self.public_key();
        self.handle(me, message, ctx, now, actions);
    }

    fn finish(&mut self, block: CertifiedBlock, actions: &mut Vec<Action>) {
        self.committing = true;
        self.deadline = None;
        actions.push(Action::Commit(block));
    }

    fn buffer(&mut self, from: PublicKey, message: ConsensusMessage) {
        if self.future.len() >= self.config.future_buffer {
            tracing::trace!(channel = %self.channel, "future buffer full, dropping message");
            return;
        }
        self.future.push_back((from, message));
    }

    fn help_lagging_peer(
        &mut self,
        peer: PublicKey,
        sequence: u64,
        ctx: EngineContext<'_>,
        actions: &mut Vec<Action>,
    ) {
        if peer == self.public_key() || !self.sync_responded.insert((peer, sequence)) {
            return;
        }
        if self.sync_responded.len() > MAX_SYNC_RESPONSES_TRACKED {
            self.sync_responded.clear();
            self.sync_responded.insert((peer, sequence));
        }
        let blocks = ctx.chain.range(sequence, self.config.sync_batch.max(1));
        if blocks.is_empty() {
            return;
        }
        actions.push(Action::Send {
            to: peer,
            message: ConsensusMessage::SyncResponse(SyncResponseMessage {
                channel: self.channel.clone(),
                blocks,
            }),
        });
    }

    /// A peer has committed at least up to `sequence`.
    fn note_ahead(
        &mut self,
        peer: PublicKey,
        sequence: u64,
        now: Instant,
        actions: &mut Vec<Action>,
    ) {
        let due = match self.sync_target {
            None => true,
            Some(target) => {
                sequence > target.sequence
                    || now >= target.requested_at + self.config.round_timeout
            }
        };
        if due {
            self.request_sync(peer, sequence, now, actions);
        }
    }

    fn request_sync(
        &mut self,
        peer: PublicKey,
        up_to: u64,
        now: Instant,
        actions: &mut Vec<Action>,
    ) {
        if peer == self.public_key() {
            return;
        }
        let target = self
            .sync_target
            .map_or(up_to, |t| t.sequence.max(up_to))
            .max(self.sequence);
        self.sync_target = Some(SyncTarget {
            sequence: target,
            requested_at: now,
        });
        tracing::debug!(
            channel = %self.channel,
            peer = %peer,
            from_sequence = self.sequence,
            to_sequence = target,
            "requesting sync"
        );
        actions.push(Action::Send {
            to: peer,
            message: ConsensusMessage::SyncRequest(SyncRequestMessage {
                channel: self.channel.clone(),
                from_sequence: self.sequence,
                to_sequence: Some(target),
            }),
        });
    }

    /// Repeats an outstanding sync request to every peer.
    fn request_sync_if_due(&mut self, now: Instant, actions: &mut Vec<Action>) {
        let Some(target) = self.sync_target else {
            return;
        };
        if target.sequence < self.sequence {
            self.sync_target = None;
            return;
        }
        self.sync_target = Some(SyncTarget {
            sequence: target.sequence,
            requested_at: now,
        });
        actions.push(Action::Broadcast(ConsensusMessage::SyncRequest(
            SyncRequestMessage {
                channel: self.channel.clone(),
                from_sequence: self.sequence,
                to_sequence: Some(target.sequence),
            },
        )));
    }

    fn verify_vote(
        &mut self,
        voter: &PublicKey,
        signature: &Signature,
        signing_data: &[u8],
        ctx: EngineContext<'_>,
        actions: &mut Vec<Action>,
    ) -> bool {
        let reason = if !ctx.validators.contains(voter) {
            Some("not a voting member".to_string())
        } else {
            ctx.membership
                .verify_voter(voter, signature, signing_data)
                .err()
                .map(|e| e.to_string())
        };
        match reason {
            None => true,
            Some(reason) => {
                self.fault(
                    ConsensusFault::BadVote {
                        voter: *voter,
                        reason,
                    },
                    actions,
                );
                false
            }
        }
    }

    /// Validates a proposed block against the chain tip and membership.
    fn check_block(
        &self,
        block: &Block,
        proposer: &PublicKey,
        ctx: EngineContext<'_>,
    ) -> Result<(), String> {
        let header = &block.header;
        if header.channel != self.channel {
            return Err(format!("block for channel {}", header.channel));
        }
        if header.sequence != self.sequence {
            return Err(format!("block sequence {}", header.sequence));
        }
        if header.previous_hash != ctx.chain.tip_hash() {
            return Err(format!(
                "previous hash {} does not match tip",
                header.previous_hash.short()
            ));
        }
        if &header.proposer != proposer {
            return Err("header names another proposer".into());
        }
        if block.transactions.is_empty() {
            return Err("empty block".into());
        }
        if !block.verify_merkle_root() {
            return Err("merkle root mismatch".into());
        }
        if !block.has_unique_transactions() {
            return Err("duplicate transaction in block".into());
        }
        for tx in &block.transactions {
            if ctx.chain.contains_tx(&tx.id) {
                return Err(format!("transaction {} already committed", tx.id.short()));
            }
            check_transaction(tx, &self.channel, ctx.membership, self.max_payload_bytes)
                .map_err(|e| format!("transaction {}: {e}", tx.id.short()))?;
        }
        Ok(())
    }

    fn check_prepare_certificate(
        &self,
        pc: &PrepareCertificate,
        hash: Hash,
        round: u64,
        ctx: EngineContext<'_>,
    ) -> Result<(), String> {
        if pc.block_hash != hash {
            return Err("justification names another block".into());
        }
        if pc.round >= round {
            return Err(format!("justification from round {}", pc.round));
        }
        let signing_data = PrepareMessage::signing_data(&self.channel, self.sequence, pc.round, &hash);
        let mut seen = HashSet::with_capacity(pc.votes.len());
        for vote in &pc.votes {
            if !seen.insert(vote.voter) || !ctx.validators.contains(&vote.voter) {
                return Err(format!("justification signer {}", vote.voter));
            }
            ctx.membership
                .verify_voter(&vote.voter, &vote.signature, &signing_data)
                .map_err(|e| format!("justification signer {}: {e}", vote.voter))?;
        }
        if seen.len() < ctx.validators.quorum() {
            return Err(format!("justification has {} votes", seen.len()));
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn equivocation(
        &mut self,
        offender: PublicKey,
        round: u64,
        phase: Phase,
        first: AcceptedProposal,
        second: Hash,
        second_signature: Signature,
        actions: &mut Vec<Action>,
    ) {
        let fault = ConsensusFault::Equivocation {
            offender,
            sequence: self.sequence,
            round,
            phase,
            first: first.hash,
            second,
        };
        if self.evidence.len() >= MAX_EVIDENCE {
            self.evidence.pop_front();
        }
        self.evidence.push_back(Evidence {
            fault: fault.clone(),
            first_signature: first.signature,
            second_signature,
            observed_at: now_millis(),
        });
        self.fault(fault, actions);
    }

    fn fault(&self, fault: ConsensusFault, actions: &mut Vec<Action>) {
        tracing::warn!(channel = %self.channel, sequence = self.sequence, fault = %fault, "consensus fault");
        actions.push(Action::Fault(fault));
    }

    /// Rounds behind the previous one are pruned unless they hold the lock
    /// or the valid block.
    fn keeps_round(&self, round: u64) -> bool {
        round + 1 >= self.round
            || self.locked.is_some_and(|(_, r)| r == round)
            || self.valid.as_ref().is_some_and(|v| v.round == round)
    }

    fn round_mut(&mut self, round: u64) -> &mut RoundState {
        self.rounds.entry(round).or_default()
    }
}
