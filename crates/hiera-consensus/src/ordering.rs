//! Batch cutting.
//!
//! Cuts a candidate block from the admission queue once the count threshold
//! is reached or the interval has elapsed since the last cut, whichever
//! comes first. At most one candidate per channel is in flight.

use crate::admission::AdmissionQueue;
use crate::chain::Chain;
use crate::config::BatchConfig;
use hiera_msp::EffectiveMembership;
use hiera_types::{now_millis, Block, Hash, PublicKey};
use tokio::time::Instant;

/// The ordering service of one channel.
#[derive(Debug)]
pub struct OrderingService {
    config: BatchConfig,
    last_cut: Instant,
    in_flight: Option<InFlight>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct InFlight {
    sequence: u64,
    hash: Hash,
}

impl OrderingService {
    /// Creates an ordering service.
    pub fn new(config: BatchConfig, now: Instant) -> Self {
        Self {
            config,
            last_cut: now,
            in_flight: None,
        }
    }

    /// Checks whether a candidate is awaiting a consensus outcome.
    pub fn has_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Time at which the interval rule next allows a cut.
    pub fn next_cut_at(&self) -> Instant {
        self.last_cut + self.config.interval
    }

    /// Checks whether the batching policy allows a cut now.
    pub fn ready(&self, queue: &AdmissionQueue, now: Instant) -> bool {
        if self.in_flight.is_some() {
            return false;
        }
        let pending = queue.len();
        pending >= self.config.max_transactions.max(1)
            || (pending > 0 && now >= self.next_cut_at())
    }

    /// Cuts a candidate block on top of the chain tip, if the policy allows.
    ///
    /// Pending transactions that fail admission under `membership` are
    /// evicted from the queue instead of proposed. An empty queue yields
    /// nothing.
    pub fn cut(
        &mut self,
        queue: &AdmissionQueue,
        chain: &Chain,
        membership: &EffectiveMembership,
        proposer: PublicKey,
        now: Instant,
    ) -> Option<Block> {
        if !self.ready(queue, now) {
            return None;
        }
        let (transactions, invalid): (Vec<_>, Vec<_>) = queue
            .pending_batch(self.config.max_transactions.max(1))
            .into_iter()
            .filter(|tx| !chain.contains_tx(&tx.id))
            .partition(|tx| queue.check(tx, membership).is_ok());
        if !invalid.is_empty() {
            let ids: Vec<_> = invalid.iter().map(|tx| tx.id).collect();
            let evicted = queue.evict(&ids);
            tracing::debug!(channel = %chain.channel(), evicted, "dropped invalid pending transactions");
        }
        if transactions.is_empty() {
            return None;
        }

        let block = Block::new(
            chain.channel().clone(),
            chain.next_sequence(),
            chain.tip_hash(),
            proposer,
            now_millis(),
            transactions,
        );
        self.last_cut = now;
        self.in_flight = Some(InFlight {
            sequence: block.sequence(),
            hash: block.hash(),
        });

        tracing::debug!(
            channel = %chain.channel(),
            sequence = block.sequence(),
            tx_count = block.tx_count(),
            block = %block.hash().short(),
            "cut candidate block"
        );
        Some(block)
    }

    /// Records the in-flight candidate as the block proposed elsewhere,
    /// if a re-proposal takes its place.
    pub fn adopt(&mut self, sequence: u64, hash: Hash) {
        self.in_flight = Some(InFlight { sequence, hash });
    }

    /// The round ended without a commit; the candidate's transactions stay
    /// queued for the next cut.
    pub fn on_abandoned(&mut self) {
        self.in_flight = None;
    }

    /// A block was committed at `sequence`.
    pub fn on_committed(&mut self, sequence: u64, now: Instant) {
        if self.in_flight.is_some_and(|f| f.sequence <= sequence) {
            self.in_flight = None;
            self.last_cut = now;
        }
    }
}
