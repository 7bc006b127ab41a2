//! Library configuration.

use hiera_msp::{ChannelDefinition, Organization, Policy};
use hiera_types::{ChannelId, Hash, Identity};
use std::time::Duration;

/// Configuration for a channel's admission queue.
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Maximum number of pending transactions.
    pub capacity: usize,

    /// Number of committed transaction ids remembered for duplicate detection.
    pub dedup_window: usize,

    /// Pending transactions older than this are reaped.
    pub max_pending_age: Duration,

    /// Maximum inline payload size in bytes.
    pub max_payload_bytes: usize,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            dedup_window: 100_000,
            max_pending_age: Duration::from_secs(600), // 10 minutes
            max_payload_bytes: 1024 * 1024,
        }
    }
}

/// Batch cutting policy.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Cut as soon as this many transactions are pending.
    pub max_transactions: usize,

    /// Cut whatever is pending once this long has passed since the last cut.
    pub interval: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_transactions: 100,
            interval: Duration::from_millis(200),
        }
    }
}

/// Quorum size as a fraction of the voting membership.
///
/// The quorum is `floor(n * numerator / denominator) + 1`, never less than a
/// strict majority and never more than `n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuorumRule {
    /// Numerator.
    pub numerator: u64,
    /// Denominator.
    pub denominator: u64,
}

impl QuorumRule {
    /// Quorum size for `n` voters.
    pub fn quorum(&self, n: usize) -> usize {
        if n == 0 {
            return 1;
        }
        let n64 = n as u64;
        let fraction = (n64 * self.numerator / self.denominator.max(1)) as usize + 1;
        fraction.max(n / 2 + 1).min(n)
    }
}

impl Default for QuorumRule {
    fn default() -> Self {
        Self {
            numerator: 2,
            denominator: 3,
        }
    }
}

/// Configuration for the consensus engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Deadline of round 0.
    pub round_timeout: Duration,

    /// Each later round multiplies the deadline by this factor.
    pub backoff_factor: u32,

    /// Upper bound for a round deadline.
    pub timeout_cap: Duration,

    /// Maximum number of next-sequence messages buffered.
    pub future_buffer: usize,

    /// Votes for rounds further ahead than this are discarded.
    pub max_round_lookahead: u64,

    /// Maximum blocks per sync response.
    pub sync_batch: usize,

    /// Quorum fraction.
    pub quorum: QuorumRule,
}

impl EngineConfig {
    /// Deadline for `round`: `round_timeout * backoff_factor^round`, capped.
    pub fn timeout_for(&self, round: u64) -> Duration {
        let mut timeout = self.round_timeout;
        for _ in 0..round {
            timeout = timeout.saturating_mul(self.backoff_factor.max(1));
            if timeout >= self.timeout_cap {
                return self.timeout_cap;
            }
        }
        timeout.min(self.timeout_cap)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            round_timeout: Duration::from_millis(1000),
            backoff_factor: 2,
            timeout_cap: Duration::from_secs(30),
            future_buffer: 1024,
            max_round_lookahead: 16,
            sync_batch: 64,
            quorum: QuorumRule::default(),
        }
    }
}

/// Per-node runtime settings shared by every channel it opens.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Admission queue settings.
    pub admission: AdmissionConfig,

    /// Batch cutting settings.
    pub batch: BatchConfig,

    /// Consensus engine settings.
    pub engine: EngineConfig,

    /// Capacity of each channel's message inbox.
    pub channel_inbox: usize,

    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            admission: AdmissionConfig::default(),
            batch: BatchConfig::default(),
            engine: EngineConfig::default(),
            channel_inbox: 4096,
            event_capacity: 1024,
        }
    }
}

/// Everything needed to open a channel on a node.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Channel id.
    pub id: ChannelId,

    /// Parent channel whose membership is inherited.
    pub parent: Option<ChannelId>,

    /// Member organizations.
    pub organizations: Vec<Organization>,

    /// Consensus voters.
    pub validators: Vec<Identity>,

    /// Policy override.
    pub policy: Option<Policy>,

    /// Previous hash of block 0.
    pub genesis_previous_hash: Hash,
}

impl ChannelConfig {
    /// Creates a channel config with no members.
    pub fn new(id: impl Into<ChannelId>) -> Self {
        Self {
            id: id.into(),
            parent: None,
            organizations: Vec::new(),
            validators: Vec::new(),
            policy: None,
            genesis_previous_hash: Hash::ZERO,
        }
    }

    /// Sets the parent channel.
    pub fn with_parent(mut self, parent: impl Into<ChannelId>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    /// Adds an organization.
    pub fn with_organization(mut self, org: Organization) -> Self {
        self.organizations.push(org);
        self
    }

    /// Adds a validator.
    pub fn with_validator(mut self, validator: Identity) -> Self {
        self.validators.push(validator);
        self
    }

    /// Overrides the inherited policy.
    pub fn with_policy(mut self, policy: Policy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Membership definition registered with the MSP.
    pub fn definition(&self) -> ChannelDefinition {
        ChannelDefinition {
            id: self.id.clone(),
            parent: self.parent.clone(),
            organizations: self.organizations.clone(),
            validators: self.validators.clone(),
            policy: self.policy.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_quorum() {
        let rule = QuorumRule::default();
        assert_eq!(rule.quorum(1), 1);
        assert_eq!(rule.quorum(3), 3);
        assert_eq!(rule.quorum(4), 3);
        assert_eq!(rule.quorum(7), 5);
        assert_eq!(rule.quorum(10), 7);
    }

    #[test]
    fn test_quorum_is_at_least_majority() {
        let rule = QuorumRule {
            numerator: 1,
            denominator: 10,
        };
        assert_eq!(rule.quorum(10), 6);
    }

    #[test]
    fn test_timeout_backoff_is_capped() {
        let config = EngineConfig {
            round_timeout: Duration::from_millis(100),
            backoff_factor: 2,
            timeout_cap: Duration::from_millis(500),
            ..Default::default()
        };
        assert_eq!(config.timeout_for(0), Duration::from_millis(100));
        assert_eq!(config.timeout_for(2), Duration::from_millis(400));
        assert_eq!(config.timeout_for(3), Duration::from_millis(500));
        assert_eq!(config.timeout_for(1000), Duration::from_millis(500));
    }
}
