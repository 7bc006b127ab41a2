//! Transaction admission queue.
//!
//! Holds verified transactions for one channel until they are committed.
//! Batches are read without removing anything, so a candidate that is
//! abandoned in consensus loses no transactions. Pending transactions are
//! checked again whenever the channel's membership changes.

use crate::config::AdmissionConfig;
use crate::error::AdmissionError;
use hiera_msp::{Action, AuditEventType, AuditLog, EffectiveMembership};
use hiera_types::{ChannelId, Payload, Transaction, TransactionId};
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::{Duration, Instant};

/// Structural and membership checks shared by admission and proposal
/// validation.
pub fn check_transaction(
    tx: &Transaction,
    channel: &ChannelId,
    membership: &EffectiveMembership,
    max_payload_bytes: usize,
) -> Result<(), AdmissionError> {
    if &tx.channel != channel {
        return Err(AdmissionError::Malformed(format!(
            "addressed to channel {}",
            tx.channel
        )));
    }
    if !tx.id_is_consistent() {
        return Err(AdmissionError::Malformed("id does not match content".into()));
    }
    if let Payload::Inline(bytes) = &tx.payload {
        if bytes.len() > max_payload_bytes {
            return Err(AdmissionError::Malformed(format!(
                "payload of {} bytes exceeds {max_payload_bytes}",
                bytes.len()
            )));
        }
    }
    membership.verify(
        &tx.submitter,
        &tx.signature,
        &tx.to_signing_data(),
        Action::Submit,
    )?;
    Ok(())
}

#[derive(Debug, Clone)]
struct Pending {
    transaction: Transaction,
    added_at: Instant,
}

#[derive(Debug)]
struct QueueState {
    pending: HashMap<TransactionId, Pending>,
    order: VecDeque<TransactionId>,
    committed: LruCache<TransactionId, ()>,
}

/// Per-channel bounded FIFO of admitted transactions.
#[derive(Debug)]
pub struct AdmissionQueue {
    channel: ChannelId,
    config: AdmissionConfig,
    state: Mutex<QueueState>,
    audit: Option<Arc<AuditLog>>,
    admitted: AtomicU64,
    rejected: AtomicU64,
}

impl AdmissionQueue {
    /// Creates an empty queue.
    pub fn new(channel: ChannelId, config: AdmissionConfig) -> Self {
        let window = NonZeroUsize::new(config.dedup_window.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            channel,
            config,
            state: Mutex::new(QueueState {
                pending: HashMap::new(),
                order: VecDeque::new(),
                committed: LruCache::new(window),
            }),
            audit: None,
            admitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Records identity and signature rejections in `audit`.
    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Channel id.
    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    /// Runs the admission checks against `membership` without enqueueing.
    pub fn check(
        &self,
        tx: &Transaction,
        membership: &EffectiveMembership,
    ) -> Result<(), AdmissionError> {
        check_transaction(tx, &self.channel, membership, self.config.max_payload_bytes)
    }

    /// Verifies and enqueues a transaction.
    ///
    /// A duplicate leaves the queue untouched and returns
    /// [`AdmissionError::DuplicateId`].
    pub fn submit(
        &self,
        tx: Transaction,
        membership: &EffectiveMembership,
    ) -> Result<TransactionId, AdmissionError> {
        let submitter = *tx.submitter.public_key();
        let result = self.try_submit(tx, membership);
        match &result {
            Ok(id) => {
                self.admitted.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(channel = %self.channel, tx = %id.short(), "transaction admitted");
            }
            Err(AdmissionError::DuplicateId(_)) => {}
            Err(e) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(channel = %self.channel, error = %e, "transaction rejected");
                if let (AdmissionError::InvalidSignature(reason), Some(audit)) = (e, &self.audit) {
                    audit.record(
                        AuditEventType::VerificationRejected,
                        &self.channel,
                        Some(submitter),
                        format!("transaction: {reason}"),
                    );
                }
            }
        }
        result
    }

    fn try_submit(
        &self,
        tx: Transaction,
        membership: &EffectiveMembership,
    ) -> Result<TransactionId, AdmissionError> {
        let id = tx.id;
        if self.is_known(&id) {
            return Err(AdmissionError::DuplicateId(id));
        }

        self.check(&tx, membership)?;

        let mut state = self.state.lock();
        // Re-check under the lock; another submitter may have raced us.
        if state.pending.contains_key(&id) || state.committed.contains(&id) {
            return Err(AdmissionError::DuplicateId(id));
        }
        if state.pending.len() >= self.config.capacity {
            return Err(AdmissionError::QueueFull {
                capacity: self.config.capacity,
            });
        }

        state.pending.insert(
            id,
            Pending {
                transaction: tx,
                added_at: Instant::now(),
            },
        );
        state.order.push_back(id);
        Ok(id)
    }

    fn is_known(&self, id: &TransactionId) -> bool {
        let state = self.state.lock();
        state.pending.contains_key(id) || state.committed.contains(id)
    }

    /// Up to `max` pending transactions in arrival order. Nothing is removed.
    pub fn pending_batch(&self, max: usize) -> Vec<Transaction> {
        let state = self.state.lock();
        state
            .order
            .iter()
            .filter_map(|id| state.pending.get(id))
            .take(max)
            .map(|p| p.transaction.clone())
            .collect()
    }

    /// Removes committed transactions and remembers their ids.
    pub fn mark_committed(&self, ids: impl IntoIterator<Item = TransactionId>) {
        let mut state = self.state.lock();
        let mut removed = 0usize;
        for id in ids {
            if state.pending.remove(&id).is_some() {
                removed += 1;
            }
            state.committed.put(id, ());
        }
        if removed > 0 {
            let QueueState { pending, order, .. } = &mut *state;
            order.retain(|id| pending.contains_key(id));
        }
    }

    /// Drops pending transactions by id. Their ids are not remembered, so
    /// they may be submitted again.
    pub fn evict(&self, ids: &[TransactionId]) -> usize {
        let mut state = self.state.lock();
        let removed = ids
            .iter()
            .filter(|id| state.pending.remove(id).is_some())
            .count();
        if removed > 0 {
            let QueueState { pending, order, .. } = &mut *state;
            order.retain(|id| pending.contains_key(id));
        }
        removed
    }

    /// Drops pending transactions that no longer pass admission under
    /// `membership`, such as those of a revoked submitter.
    pub fn revalidate(&self, membership: &EffectiveMembership) -> usize {
        let mut state = self.state.lock();
        let before = state.pending.len();
        state
            .pending
            .retain(|_, p| self.check(&p.transaction, membership).is_ok());
        let removed = before - state.pending.len();
        if removed > 0 {
            let QueueState { pending, order, .. } = &mut *state;
            order.retain(|id| pending.contains_key(id));
            self.rejected.fetch_add(removed as u64, Ordering::Relaxed);
            tracing::info!(
                channel = %self.channel,
                removed,
                "evicted pending transactions after membership change"
            );
        }
        removed
    }

    /// Gets a pending transaction by id.
    pub fn get(&self, id: &TransactionId) -> Option<Transaction> {
        self.state
            .lock()
            .pending
            .get(id)
            .map(|p| p.transaction.clone())
    }

    /// Checks if a transaction is pending.
    pub fn contains(&self, id: &TransactionId) -> bool {
        self.state.lock().pending.contains_key(id)
    }

    /// Checks if a transaction is within the committed lookback window.
    pub fn is_committed(&self, id: &TransactionId) -> bool {
        self.state.lock().committed.contains(id)
    }

    /// Returns the number of pending transactions.
    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Returns true if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.state.lock().pending.is_empty()
    }

    /// Drops pending transactions older than the configured age.
    pub fn reap_expired(&self) -> usize {
        let max_age = self.config.max_pending_age;
        let now = Instant::now();
        let mut state = self.state.lock();
        let before = state.pending.len();
        state
            .pending
            .retain(|_, p| now.duration_since(p.added_at) <= max_age);
        let removed = before - state.pending.len();
        if removed > 0 {
            let QueueState { pending, order, .. } = &mut *state;
            order.retain(|id| pending.contains_key(id));
            tracing::debug!(channel = %self.channel, removed, "reaped expired transactions");
        }
        removed
    }

    /// Returns statistics about the queue.
    pub fn stats(&self) -> AdmissionStats {
        let state = self.state.lock();
        let now = Instant::now();
        let oldest_age = state
            .order
            .front()
            .and_then(|id| state.pending.get(id))
            .map(|p| now.duration_since(p.added_at))
            .unwrap_or(Duration::ZERO);
        AdmissionStats {
            pending: state.pending.len(),
            capacity: self.config.capacity,
            oldest_age,
            admitted: self.admitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

/// Statistics about an admission queue.
#[derive(Debug, Clone)]
pub struct AdmissionStats {
    /// Number of pending transactions.
    pub pending: usize,

    /// Queue capacity.
    pub capacity: usize,

    /// Age of the oldest pending transaction.
    pub oldest_age: Duration,

    /// Transactions admitted since creation.
    pub admitted: u64,

    /// Transactions rejected since creation, excluding duplicates.
    pub rejected: u64,
}
