//! Trading group model.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::{LifecycleError, Result};

use super::{normalize_token, require_text, unknown_value};

/// Lowest profit-sharing percentage a group may charge.
pub const MIN_PROFIT_SHARE: Decimal = dec!(10);
/// Highest profit-sharing percentage a group may charge.
pub const MAX_PROFIT_SHARE: Decimal = dec!(100);

/// Whether the copy engine mirrors the group's master trades.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradingStatus {
    Active,
    Paused,
    /// Admin override; left only by an admin.
    Suspended,
}

impl TradingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradingStatus::Active => "active",
            TradingStatus::Paused => "paused",
            TradingStatus::Suspended => "suspended",
        }
    }
}

impl FromStr for TradingStatus {
    type Err = LifecycleError;

    fn from_str(s: &str) -> Result<Self> {
        match normalize_token(s).as_str() {
            "active" => Ok(TradingStatus::Active),
            "paused" => Ok(TradingStatus::Paused),
            "suspended" => Ok(TradingStatus::Suspended),
            _ => Err(unknown_value("trading_status", s)),
        }
    }
}

impl fmt::Display for TradingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record status. Groups are never physically removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    Active,
    Deleted,
}

impl GroupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupStatus::Active => "active",
            GroupStatus::Deleted => "deleted",
        }
    }
}

impl FromStr for GroupStatus {
    type Err = LifecycleError;

    fn from_str(s: &str) -> Result<Self> {
        match normalize_token(s).as_str() {
            "active" => Ok(GroupStatus::Active),
            "deleted" => Ok(GroupStatus::Deleted),
            _ => Err(unknown_value("group status", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementCycle {
    Daily,
    Weekly,
    Monthly,
}

impl SettlementCycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementCycle::Daily => "daily",
            SettlementCycle::Weekly => "weekly",
            SettlementCycle::Monthly => "monthly",
        }
    }
}

impl FromStr for SettlementCycle {
    type Err = LifecycleError;

    fn from_str(s: &str) -> Result<Self> {
        match normalize_token(s).as_str() {
            "daily" => Ok(SettlementCycle::Daily),
            "weekly" => Ok(SettlementCycle::Weekly),
            "monthly" => Ok(SettlementCycle::Monthly),
            _ => Err(unknown_value("settlement_cycle", s)),
        }
    }
}

/// A copy-trading group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub group_id: String,
    pub name: String,
    pub company_name: String,

    /// Code handed out to prospective members
    pub referral_code: String,

    /// Alternate join credential, also used by integrations
    pub api_key: String,

    pub trading_status: TradingStatus,
    pub status: GroupStatus,

    /// Share of copied-trade profit owed per settlement (10 to 100)
    pub profit_sharing_percentage: Decimal,

    pub settlement_cycle: SettlementCycle,

    /// Settlement whose auto-pause still holds trading paused
    pub settlement_hold: Option<String>,

    // Derived counters, recomputed on every membership change
    pub total_members: i64,
    pub active_members: i64,

    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Group {
    pub fn is_deleted(&self) -> bool {
        self.status == GroupStatus::Deleted
    }
}

/// Input for creating a group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewGroup {
    pub name: String,
    pub company_name: String,
    pub profit_sharing_percentage: Decimal,
    pub settlement_cycle: SettlementCycle,
}

impl NewGroup {
    pub fn validate(&self) -> Result<()> {
        let name_len = self.name.trim().chars().count();
        if !(2..=100).contains(&name_len) {
            return Err(LifecycleError::Validation(
                "group name must be 2 to 100 characters".to_string(),
            ));
        }
        require_text("company_name", &self.company_name)?;
        validate_profit_share(self.profit_sharing_percentage)
    }
}

pub(crate) fn validate_profit_share(pct: Decimal) -> Result<()> {
    if pct < MIN_PROFIT_SHARE || pct > MAX_PROFIT_SHARE {
        return Err(LifecycleError::Validation(format!(
            "profit_sharing_percentage {} outside {}..={}",
            pct, MIN_PROFIT_SHARE, MAX_PROFIT_SHARE
        )));
    }
    Ok(())
}
