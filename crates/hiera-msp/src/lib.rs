//! Hiera Membership Service Provider
//!
//! Validates member identities and enforces channel membership policy. Every
//! other component consults it before trusting a signature.
//!
//! # Verification
//!
//! [`EffectiveMembership::verify`] checks, in order:
//!
//! 1. the certificate chain leads to a trusted root of the channel
//!    ([`IdentityError::UnknownIssuer`])
//! 2. no certificate in the chain is revoked ([`IdentityError::Revoked`])
//! 3. the signature verifies against the identity key
//!    ([`IdentityError::BadSignature`])
//! 4. the role holds the requested [`Action`] under the channel's
//!    [`Policy`] ([`IdentityError::RoleNotPermitted`])
//!
//! # Channel hierarchy
//!
//! A channel may name a parent. Its effective membership is the parent's
//! (roots, revocations, validators) extended by its own declarations, with
//! the parent's policy unless it overrides it. The [`MembershipRegistry`]
//! resolves effective membership once per change and hands out shared
//! snapshots.
//!
//! ```text
//!        root ── org-a
//!       /    \
//!   child     audit ── org-b
//!     |
//! grandchild
//! ```

mod audit;
mod authority;
mod error;
mod membership;
mod policy;
mod registry;

pub use audit::{AuditEntry, AuditEventType, AuditLog};
pub use authority::{IdentityIssuer, LocalAuthority};
pub use error::{IdentityError, Result};
pub use membership::{ChannelDefinition, EffectiveMembership, Organization};
pub use policy::{Action, Policy};
pub use registry::MembershipRegistry;
