//! Caller identity and capability sets.
//!
//! The identity layer authenticates callers; this crate only receives the
//! resolved `(subscriber_id, role, capabilities)` triple and performs
//! business-level checks against it.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{LifecycleError, Result};

use super::{normalize_token, unknown_value};

/// Subscriber role, used both for capability defaults and for fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Master,
    Manager,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Master => "master",
            Role::Manager => "manager",
            Role::Admin => "admin",
        }
    }
}

impl FromStr for Role {
    type Err = LifecycleError;

    fn from_str(s: &str) -> Result<Self> {
        match normalize_token(s).as_str() {
            "user" => Ok(Role::User),
            "master" => Ok(Role::Master),
            "manager" | "group_leader" => Ok(Role::Manager),
            "admin" => Ok(Role::Admin),
            _ => Err(unknown_value("role", s)),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single business permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Request to join a group as oneself.
    JoinGroups,
    /// Approve, reject, pause, resume or remove other users' memberships.
    ManageMembers,
    /// Create groups, edit percentages, toggle active/paused.
    ManageGroups,
    /// Suspend, reactivate and delete groups.
    SuspendGroups,
    /// Decide IB change requests.
    ManageIb,
    SubmitSettlements,
    ApproveSettlements,
}

impl Capability {
    const ALL: [Capability; 7] = [
        Capability::JoinGroups,
        Capability::ManageMembers,
        Capability::ManageGroups,
        Capability::SuspendGroups,
        Capability::ManageIb,
        Capability::SubmitSettlements,
        Capability::ApproveSettlements,
    ];

    fn bit(self) -> u16 {
        1 << (self as u16)
    }
}

/// Compact set of capabilities, resolved once per request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilitySet(u16);

impl CapabilitySet {
    pub fn empty() -> Self {
        Self(0)
    }

    pub fn all() -> Self {
        Capability::ALL.iter().copied().collect()
    }

    /// Default capabilities granted to a role.
    pub fn for_role(role: Role) -> Self {
        let caps: &[Capability] = match role {
            Role::User => &[Capability::JoinGroups],
            Role::Master => &[Capability::ManageGroups, Capability::SubmitSettlements],
            Role::Manager => &[
                Capability::ManageMembers,
                Capability::ManageGroups,
                Capability::SubmitSettlements,
            ],
            Role::Admin => &Capability::ALL,
        };
        caps.iter().copied().collect()
    }

    pub fn with(mut self, cap: Capability) -> Self {
        self.0 |= cap.bit();
        self
    }

    pub fn contains(&self, cap: Capability) -> bool {
        self.0 & cap.bit() != 0
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        iter.into_iter()
            .fold(CapabilitySet::empty(), |set, cap| set.with(cap))
    }
}

/// The caller of a lifecycle operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub subscriber_id: String,
    pub role: Role,
    pub capabilities: CapabilitySet,
}

/// Subscriber id recorded for transitions the engine performs on its own.
pub const SYSTEM_ACTOR_ID: &str = "system";

impl Actor {
    pub fn new(subscriber_id: impl Into<String>, role: Role, capabilities: CapabilitySet) -> Self {
        Self {
            subscriber_id: subscriber_id.into(),
            role,
            capabilities,
        }
    }

    /// Actor with the role's default capability set.
    pub fn for_role(subscriber_id: impl Into<String>, role: Role) -> Self {
        Self::new(subscriber_id, role, CapabilitySet::for_role(role))
    }

    /// The engine itself, e.g. resuming trading after a settlement approval.
    pub fn system() -> Self {
        Self::new(SYSTEM_ACTOR_ID, Role::Admin, CapabilitySet::all())
    }

    pub fn can(&self, cap: Capability) -> bool {
        self.capabilities.contains(cap)
    }

    pub fn require(&self, cap: Capability) -> Result<()> {
        if self.can(cap) {
            Ok(())
        } else {
            Err(LifecycleError::InsufficientPrivilege(format!(
                "{} ({}) lacks {:?}",
                self.subscriber_id, self.role, cap
            )))
        }
    }

    /// Passes when the actor is `user_id` itself or holds `cap`.
    pub fn require_self_or(&self, user_id: &str, cap: Capability) -> Result<()> {
        if self.subscriber_id == user_id {
            Ok(())
        } else {
            self.require(cap)
        }
    }
}
