//! Node configuration.
//!
//! Loaded from a YAML file with `HIERA_`-prefixed environment overrides.
//! Nested keys use a double underscore, e.g. `HIERA_CONSENSUS__ROUND_TIMEOUT_MS`.
//!
//! ```yaml
//! private_key: "<64 hex chars>"
//! listen: "0.0.0.0:7100"
//! data_dir: "./data"
//! peers:
//!   - public_key: "<64 hex chars>"
//!     address: "10.0.0.2:7100"
//! channels:
//!   - id: root
//!     organizations:
//!       - name: org-a
//!         root: "<64 hex chars>"
//!     validators: [ ... ]   # identities, see `hiera-node issue`
//!   - id: payments
//!     parent: root
//! ```

use hiera_consensus::{
    AdmissionConfig, BatchConfig, ChannelConfig, EngineConfig, QuorumRule, RuntimeConfig,
};
use hiera_msp::{Organization, Policy};
use hiera_types::{ChannelId, Hash, Identity, Keypair, PublicKey};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "HIERA";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file or environment could not be read or parsed.
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    /// `data_dir` is empty.
    #[error("data_dir must not be empty")]
    EmptyDataDir,

    /// No channel is configured.
    #[error("at least one channel must be configured")]
    NoChannels,

    /// The private key is not a 32-byte hex string.
    #[error("invalid private key: {0}")]
    InvalidKey(String),

    /// Two channels share an id.
    #[error("duplicate channel: {0}")]
    DuplicateChannel(ChannelId),

    /// A channel names a parent that is not declared before it.
    #[error("channel {channel} names unknown parent {parent}")]
    UnknownParent {
        /// Declaring channel.
        channel: ChannelId,
        /// Missing parent.
        parent: ChannelId,
    },

    /// Two peers share a key.
    #[error("duplicate peer: {0}")]
    DuplicatePeer(PublicKey),

    /// A numeric setting is out of range.
    #[error("invalid setting {field}: {reason}")]
    InvalidSetting {
        /// Setting name.
        field: &'static str,
        /// What is wrong with it.
        reason: &'static str,
    },
}

/// Top-level node configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Ed25519 secret key (hex encoded).
    pub private_key: String,
    /// Peer listen address.
    pub listen: SocketAddr,
    /// Commit logs live under this directory.
    pub data_dir: PathBuf,
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
    /// Log format (pretty or json).
    pub log_format: String,
    /// Other validators.
    pub peers: Vec<PeerConfig>,
    /// Consensus tuning.
    pub consensus: ConsensusSettings,
    /// Channels to open at startup, parents first.
    pub channels: Vec<ChannelSettings>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            private_key: String::new(),
            listen: SocketAddr::from(([0, 0, 0, 0], 7100)),
            data_dir: PathBuf::from("./data"),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            peers: Vec::new(),
            consensus: ConsensusSettings::default(),
            channels: Vec::new(),
        }
    }
}

/// A remote validator.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PeerConfig {
    /// Peer key.
    pub public_key: PublicKey,
    /// Peer listen address.
    pub address: SocketAddr,
}

/// Consensus tuning knobs, in wire-friendly units.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConsensusSettings {
    /// Admission queue capacity per channel.
    pub queue_capacity: usize,
    /// Committed ids remembered for duplicate detection.
    pub dedup_window: usize,
    /// Pending transactions older than this are dropped.
    pub max_pending_age_secs: u64,
    /// Maximum inline payload size.
    pub max_payload_bytes: usize,
    /// Transactions per block.
    pub batch_size: usize,
    /// Maximum wait before a partial block is cut.
    pub batch_interval_ms: u64,
    /// Round 0 timeout.
    pub round_timeout_ms: u64,
    /// Timeout multiplier per round.
    pub backoff_factor: u32,
    /// Timeout ceiling.
    pub timeout_cap_ms: u64,
    /// Quorum fraction numerator.
    pub quorum_numerator: u64,
    /// Quorum fraction denominator.
    pub quorum_denominator: u64,
}

impl Default for ConsensusSettings {
    fn default() -> Self {
        let admission = AdmissionConfig::default();
        let batch = BatchConfig::default();
        let engine = EngineConfig::default();
        Self {
            queue_capacity: admission.capacity,
            dedup_window: admission.dedup_window,
            max_pending_age_secs: admission.max_pending_age.as_secs(),
            max_payload_bytes: admission.max_payload_bytes,
            batch_size: batch.max_transactions,
            batch_interval_ms: batch.interval.as_millis() as u64,
            round_timeout_ms: engine.round_timeout.as_millis() as u64,
            backoff_factor: engine.backoff_factor,
            timeout_cap_ms: engine.timeout_cap.as_millis() as u64,
            quorum_numerator: engine.quorum.numerator,
            quorum_denominator: engine.quorum.denominator,
        }
    }
}

/// A channel declaration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChannelSettings {
    /// Channel id.
    pub id: ChannelId,
    /// Parent channel.
    #[serde(default)]
    pub parent: Option<ChannelId>,
    /// Member organizations.
    #[serde(default)]
    pub organizations: Vec<Organization>,
    /// Consensus voters.
    #[serde(default)]
    pub validators: Vec<Identity>,
    /// Policy override.
    #[serde(default)]
    pub policy: Option<Policy>,
    /// Previous hash of block 0.
    #[serde(default)]
    pub genesis_previous_hash: Hash,
}

impl NodeConfig {
    /// Loads a config file with environment overrides and validates it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let settings = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Yaml))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;
        let config: NodeConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a YAML document and validates it.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()?;
        let config: NodeConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::EmptyDataDir);
        }
        self.keypair()?;

        if self.channels.is_empty() {
            return Err(ConfigError::NoChannels);
        }
        let mut seen = HashSet::new();
        for channel in &self.channels {
            if let Some(parent) = &channel.parent {
                if !seen.contains(parent) {
                    return Err(ConfigError::UnknownParent {
                        channel: channel.id.clone(),
                        parent: parent.clone(),
                    });
                }
            }
            if !seen.insert(channel.id.clone()) {
                return Err(ConfigError::DuplicateChannel(channel.id.clone()));
            }
        }

        let mut peers = HashSet::new();
        for peer in &self.peers {
            if !peers.insert(peer.public_key) {
                return Err(ConfigError::DuplicatePeer(peer.public_key));
            }
        }

        let c = &self.consensus;
        if c.batch_size == 0 {
            return Err(ConfigError::InvalidSetting {
                field: "consensus.batch_size",
                reason: "must be positive",
            });
        }
        if c.queue_capacity == 0 {
            return Err(ConfigError::InvalidSetting {
                field: "consensus.queue_capacity",
                reason: "must be positive",
            });
        }
        if c.round_timeout_ms == 0 || c.timeout_cap_ms < c.round_timeout_ms {
            return Err(ConfigError::InvalidSetting {
                field: "consensus.round_timeout_ms",
                reason: "must be positive and at most timeout_cap_ms",
            });
        }
        if c.backoff_factor == 0 {
            return Err(ConfigError::InvalidSetting {
                field: "consensus.backoff_factor",
                reason: "must be positive",
            });
        }
        if c.quorum_denominator == 0 || c.quorum_numerator > c.quorum_denominator {
            return Err(ConfigError::InvalidSetting {
                field: "consensus.quorum_numerator",
                reason: "quorum fraction must lie in [0, 1]",
            });
        }
        Ok(())
    }

    /// The node's signing key.
    pub fn keypair(&self) -> Result<Keypair, ConfigError> {
        Keypair::from_secret_hex(self.private_key.trim())
            .map_err(|e| ConfigError::InvalidKey(e.to_string()))
    }

    /// Runtime settings for the consensus node.
    pub fn runtime(&self) -> RuntimeConfig {
        let c = &self.consensus;
        RuntimeConfig {
            admission: AdmissionConfig {
                capacity: c.queue_capacity,
                dedup_window: c.dedup_window,
                max_pending_age: Duration::from_secs(c.max_pending_age_secs),
                max_payload_bytes: c.max_payload_bytes,
            },
            batch: BatchConfig {
                max_transactions: c.batch_size,
                interval: Duration::from_millis(c.batch_interval_ms),
            },
            engine: EngineConfig {
                round_timeout: Duration::from_millis(c.round_timeout_ms),
                backoff_factor: c.backoff_factor,
                timeout_cap: Duration::from_millis(c.timeout_cap_ms),
                quorum: QuorumRule {
                    numerator: c.quorum_numerator,
                    denominator: c.quorum_denominator,
                },
                ..EngineConfig::default()
            },
            ..RuntimeConfig::default()
        }
    }

    /// Channel configs in declaration order.
    pub fn channel_configs(&self) -> Vec<ChannelConfig> {
        self.channels
            .iter()
            .map(|c| ChannelConfig {
                id: c.id.clone(),
                parent: c.parent.clone(),
                organizations: c.organizations.clone(),
                validators: c.validators.clone(),
                policy: c.policy.clone(),
                genesis_previous_hash: c.genesis_previous_hash,
            })
            .collect()
    }

    /// Directory holding the per-channel commit logs.
    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("channels")
    }
}
