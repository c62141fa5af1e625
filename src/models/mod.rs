//! Data models for users, groups, memberships, settlements and events.

mod event;
mod group;
mod identity;
mod member;
mod settlement;
mod user;

pub use event::{EventType, LifecycleEvent, Target};
pub use group::{
    Group, GroupStatus, NewGroup, SettlementCycle, TradingStatus, MAX_PROFIT_SHARE,
    MIN_PROFIT_SHARE,
};
pub use identity::{Actor, Capability, CapabilitySet, Role, SYSTEM_ACTOR_ID};
pub use member::{AccountDetails, Allocation, AllocationModel, Member, MemberStatus};
pub use settlement::{
    amount_due, Settlement, SettlementPeriod, SettlementStatus, SettlementSubmission,
};
pub use user::{IbStatus, User};

pub(crate) use group::validate_profit_share;

use crate::error::{LifecycleError, Result};

/// Normalize a status token from an external caller.
///
/// Trims, lower-cases and folds `-` and spaces into `_`. Misspellings are not
/// corrected; they fail parsing downstream.
pub(crate) fn normalize_token(raw: &str) -> String {
    raw.trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c == '-' || c == ' ' { '_' } else { c })
        .collect()
}

pub(crate) fn unknown_value(field: &str, raw: &str) -> LifecycleError {
    LifecycleError::Validation(format!("unknown {} value '{}'", field, raw))
}

/// Reject blank strings for required text fields.
pub(crate) fn require_text(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(LifecycleError::Validation(format!("{} must not be empty", field)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_token() {
        assert_eq!(normalize_token("  Pending "), "pending");
        assert_eq!(normalize_token("NOT-CHANGED"), "not_changed");
        assert_eq!(normalize_token("fixed lot"), "fixed_lot");
    }

    #[test]
    fn test_require_text() {
        assert!(require_text("broker", "IC Markets").is_ok());
        assert!(require_text("broker", "   ").is_err());
    }
}
