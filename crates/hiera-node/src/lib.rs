//! # Hiera Node
//!
//! Runs a validator: loads [`NodeConfig`], initializes logging, connects to
//! peers over TCP and opens the configured channels on a
//! [`hiera_consensus::Node`] backed by file commit logs.
//!
//! ```text
//! ┌────────────┐   frames   ┌──────────────┐   envelopes   ┌──────────────┐
//! │   peers    │◀──────────▶│ TcpTransport │──────────────▶│     Node     │
//! └────────────┘            └──────────────┘               │  (channels)  │
//!                                                          └──────┬───────┘
//!                                                                 │ append
//!                                                          ┌──────▼───────┐
//!                                                          │ <data>/      │
//!                                                          │   channels/  │
//!                                                          └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`config`] - YAML configuration with environment overrides
//! - [`logging`] - `tracing` subscriber setup
//! - [`net`] - length-delimited TCP transport
//! - [`service`] - process lifecycle

pub mod config;
pub mod logging;
pub mod net;
pub mod service;

pub use config::{ChannelSettings, ConfigError, ConsensusSettings, NodeConfig, PeerConfig};
pub use logging::{init_logging, LogFormat};
pub use net::TcpTransport;
pub use service::NodeService;
