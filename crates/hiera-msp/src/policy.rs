//! Roles × actions access policy.

use hiera_types::Role;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// An action an identity may perform on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Submit transactions.
    Submit,
    /// Vote in consensus.
    Endorse,
    /// Read blocks.
    Read,
    /// Change channel membership.
    ManageMembership,
    /// Issue certificates.
    Issue,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Submit => write!(f, "submit"),
            Action::Endorse => write!(f, "endorse"),
            Action::Read => write!(f, "read"),
            Action::ManageMembership => write!(f, "manage_membership"),
            Action::Issue => write!(f, "issue"),
        }
    }
}

/// Explicit capability table: which actions each role may perform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    grants: BTreeMap<Role, BTreeSet<Action>>,
}

impl Policy {
    /// An empty policy that grants nothing.
    pub fn empty() -> Self {
        Self {
            grants: BTreeMap::new(),
        }
    }

    /// Grants `actions` to `role`.
    pub fn grant(mut self, role: Role, actions: impl IntoIterator<Item = Action>) -> Self {
        self.grants.entry(role).or_default().extend(actions);
        self
    }

    /// Checks whether `role` may perform `action`.
    pub fn permits(&self, role: Role, action: Action) -> bool {
        self.grants
            .get(&role)
            .map(|actions| actions.contains(&action))
            .unwrap_or(false)
    }

    /// Actions granted to `role`.
    pub fn actions(&self, role: Role) -> impl Iterator<Item = &Action> {
        self.grants.get(&role).into_iter().flatten()
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self::empty()
            .grant(
                Role::Admin,
                [Action::Submit, Action::Read, Action::ManageMembership],
            )
            .grant(Role::Client, [Action::Submit, Action::Read])
            .grant(Role::Endorser, [Action::Endorse, Action::Read])
            .grant(Role::Observer, [Action::Read])
            .grant(Role::Authority, [Action::Issue])
    }
}
