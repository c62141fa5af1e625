//! Group membership model and its status transitions.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{LifecycleError, Result};

use super::{normalize_token, require_text, unknown_value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    Pending,
    Active,
    Paused,
    Rejected,
    Left,
}

impl MemberStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberStatus::Pending => "pending",
            MemberStatus::Active => "active",
            MemberStatus::Paused => "paused",
            MemberStatus::Rejected => "rejected",
            MemberStatus::Left => "left",
        }
    }

    /// Counts against the one-group-per-user rule.
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            MemberStatus::Pending | MemberStatus::Active | MemberStatus::Paused
        )
    }

    /// The member has been approved and may hold the user's group pointer.
    pub fn is_approved(&self) -> bool {
        matches!(self, MemberStatus::Active | MemberStatus::Paused)
    }

    pub fn can_transition_to(&self, target: MemberStatus) -> bool {
        use MemberStatus::*;
        matches!(
            (self, target),
            (Pending, Active)
                | (Pending, Rejected)
                | (Active, Paused)
                | (Paused, Active)
                | (Pending, Left)
                | (Active, Left)
                | (Paused, Left)
                | (Rejected, Left)
        )
    }
}

impl FromStr for MemberStatus {
    type Err = LifecycleError;

    fn from_str(s: &str) -> Result<Self> {
        match normalize_token(s).as_str() {
            "pending" => Ok(MemberStatus::Pending),
            "active" => Ok(MemberStatus::Active),
            "paused" => Ok(MemberStatus::Paused),
            "rejected" => Ok(MemberStatus::Rejected),
            "left" => Ok(MemberStatus::Left),
            _ => Err(unknown_value("member status", s)),
        }
    }
}

impl fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How copied trade size is derived for the member account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationModel {
    Ratio,
    FixedLot,
    EquityProportional,
}

impl AllocationModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationModel::Ratio => "ratio",
            AllocationModel::FixedLot => "fixed_lot",
            AllocationModel::EquityProportional => "equity_proportional",
        }
    }
}

impl FromStr for AllocationModel {
    type Err = LifecycleError;

    fn from_str(s: &str) -> Result<Self> {
        match normalize_token(s).as_str() {
            "ratio" => Ok(AllocationModel::Ratio),
            "fixed_lot" => Ok(AllocationModel::FixedLot),
            "equity_proportional" => Ok(AllocationModel::EquityProportional),
            _ => Err(unknown_value("allocation_model", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub model: AllocationModel,
    /// Ratio multiplier, lot size or equity fraction depending on `model`
    pub value: Decimal,
}

impl Default for Allocation {
    fn default() -> Self {
        Self {
            model: AllocationModel::Ratio,
            value: Decimal::ONE,
        }
    }
}

/// Trading account the member links when requesting to join.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountDetails {
    /// Copy-engine account reference
    pub account_id: String,
    pub broker: String,
    pub server: String,
    pub opening_balance: Decimal,
    #[serde(default)]
    pub allocation: Allocation,
}

impl AccountDetails {
    pub fn validate(&self) -> Result<()> {
        require_text("account_id", &self.account_id)?;
        require_text("broker", &self.broker)?;
        require_text("server", &self.server)?;
        if self.opening_balance <= Decimal::ZERO {
            return Err(LifecycleError::Validation(
                "opening_balance must be positive".to_string(),
            ));
        }
        if self.allocation.value <= Decimal::ZERO {
            return Err(LifecycleError::Validation(
                "allocation value must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// A user's membership in one group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub member_id: String,
    pub user_id: String,
    pub group_id: String,
    pub account_id: String,
    pub broker: String,
    pub server: String,
    pub status: MemberStatus,

    // Financial snapshot; profit counts copied trades only
    pub opening_balance: Decimal,
    pub current_balance: Decimal,
    pub profit_till_date: Decimal,

    pub allocation: Allocation,

    pub approved_by: Option<String>,
    pub rejection_reason: Option<String>,
    pub copy_start_date: Option<DateTime<Utc>>,
    pub left_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Member {
    /// Build a fresh pending membership from a join request.
    pub fn pending(user_id: &str, group_id: &str, account: &AccountDetails) -> Self {
        let now = Utc::now();
        Self {
            member_id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            group_id: group_id.to_string(),
            account_id: account.account_id.trim().to_string(),
            broker: account.broker.trim().to_string(),
            server: account.server.trim().to_string(),
            status: MemberStatus::Pending,
            opening_balance: account.opening_balance,
            current_balance: account.opening_balance,
            profit_till_date: Decimal::ZERO,
            allocation: account.allocation,
            approved_by: None,
            rejection_reason: None,
            copy_start_date: None,
            left_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn account() -> AccountDetails {
        AccountDetails {
            account_id: "mt5-1001".to_string(),
            broker: "Exness".to_string(),
            server: "Exness-Real7".to_string(),
            opening_balance: dec!(2500),
            allocation: Allocation::default(),
        }
    }

    #[test]
    fn test_transitions() {
        use MemberStatus::*;
        assert!(Pending.can_transition_to(Active));
        assert!(Pending.can_transition_to(Rejected));
        assert!(Active.can_transition_to(Left));
        assert!(Rejected.can_transition_to(Left));
        assert!(!Rejected.can_transition_to(Active));
        assert!(!Left.can_transition_to(Pending));
        assert!(!Active.can_transition_to(Rejected));
    }

    #[test]
    fn test_open_statuses() {
        assert!(MemberStatus::Pending.is_open());
        assert!(MemberStatus::Paused.is_open());
        assert!(!MemberStatus::Rejected.is_open());
        assert!(!MemberStatus::Left.is_open());
    }

    #[test]
    fn test_account_validation() {
        assert!(account().validate().is_ok());

        let mut bad = account();
        bad.opening_balance = Decimal::ZERO;
        assert!(bad.validate().is_err());

        let mut bad = account();
        bad.broker = " ".to_string();
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_pending_member_snapshot() {
        let member = Member::pending("u1", "g1", &account());
        assert_eq!(member.status, MemberStatus::Pending);
        assert_eq!(member.current_balance, dec!(2500));
        assert_eq!(member.profit_till_date, Decimal::ZERO);
        assert!(member.copy_start_date.is_none());
    }
}
