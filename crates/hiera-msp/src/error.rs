//! Error types for membership operations.

use hiera_types::Role;
use thiserror::Error;

use crate::policy::Action;

/// Errors that can occur during identity verification and membership
/// management.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// The certificate chain does not lead to a trusted root of the channel.
    #[error("unknown issuer")]
    UnknownIssuer,

    /// The identity, or one of its issuers, has been revoked.
    #[error("identity revoked")]
    Revoked,

    /// The signature does not verify against the identity's key.
    #[error("bad signature")]
    BadSignature,

    /// The identity's role does not grant the requested action.
    #[error("role {role} is not permitted to {action}")]
    RoleNotPermitted {
        /// Role of the identity.
        role: Role,
        /// Requested action.
        action: Action,
    },

    /// The key is not in the channel's voting membership.
    #[error("not a voting member")]
    UnknownVoter,

    /// The channel is not registered.
    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    /// The channel is already registered.
    #[error("channel already exists: {0}")]
    ChannelExists(String),

    /// The declared parent channel is not registered.
    #[error("unknown parent channel: {0}")]
    UnknownParent(String),

    /// The channel still has child channels.
    #[error("channel {0} has child channels")]
    HasChildren(String),

    /// A membership record failed validation.
    #[error("invalid membership record: {0}")]
    InvalidRecord(String),
}

/// A specialized Result type for membership operations.
pub type Result<T> = std::result::Result<T, IdentityError>;
