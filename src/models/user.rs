//! User records as seen by the lifecycle engine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{LifecycleError, Result};

use super::{normalize_token, unknown_value, Role};

/// Introducing-broker change approval state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IbStatus {
    NotChanged,
    Pending,
    Approved,
    Rejected,
}

impl IbStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IbStatus::NotChanged => "not_changed",
            IbStatus::Pending => "pending",
            IbStatus::Approved => "approved",
            IbStatus::Rejected => "rejected",
        }
    }
}

impl FromStr for IbStatus {
    type Err = LifecycleError;

    fn from_str(s: &str) -> Result<Self> {
        match normalize_token(s).as_str() {
            "not_changed" => Ok(IbStatus::NotChanged),
            "pending" => Ok(IbStatus::Pending),
            "approved" => Ok(IbStatus::Approved),
            "rejected" => Ok(IbStatus::Rejected),
            _ => Err(unknown_value("ib_status", s)),
        }
    }
}

impl fmt::Display for IbStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A platform user. Owned by the identity layer; the engine only reads the
/// IB status and maintains the `group_id` pointer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub user_id: String,
    pub name: String,
    pub role: Role,

    /// Group of the user's approved membership, if any
    pub group_id: Option<String>,

    pub ib_status: IbStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn new(user_id: impl Into<String>, name: impl Into<String>, role: Role) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.into(),
            name: name.into(),
            role,
            group_id: None,
            ib_status: IbStatus::NotChanged,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn can_join_groups(&self) -> bool {
        self.ib_status == IbStatus::Approved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ib_status_parsing() {
        assert_eq!("Approved".parse::<IbStatus>().unwrap(), IbStatus::Approved);
        assert_eq!("not-changed".parse::<IbStatus>().unwrap(), IbStatus::NotChanged);
        // Misspelled values are rejected rather than silently mapped.
        assert!("plending".parse::<IbStatus>().is_err());
    }

    #[test]
    fn test_new_user_cannot_join() {
        let user = User::new("u1", "Asha", Role::User);
        assert!(!user.can_join_groups());
        assert!(user.group_id.is_none());
    }
}
