//! Row types as stored in SQLite and their conversion into domain models.
//!
//! Money is kept as TEXT so decimals round-trip exactly; status columns hold
//! the enums' wire names.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::error::{LifecycleError, Result};
use crate::models::{Allocation, Group, Member, Settlement, User};

/// Stored user record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredUser {
    pub user_id: String,
    pub name: String,
    pub role: String,
    pub group_id: Option<String>,
    pub ib_status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Stored group record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredGroup {
    pub group_id: String,
    pub name: String,
    pub company_name: String,
    pub referral_code: String,
    pub api_key: String,
    pub trading_status: String,
    pub status: String,
    pub profit_sharing_percentage: String,
    pub settlement_cycle: String,
    pub settlement_hold: Option<String>,
    pub total_members: i64,
    pub active_members: i64,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Stored membership record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredMember {
    pub member_id: String,
    pub user_id: String,
    pub group_id: String,
    pub account_id: String,
    pub broker: String,
    pub server: String,
    pub status: String,
    pub opening_balance: String,
    pub current_balance: String,
    pub profit_till_date: String,
    pub allocation_model: String,
    pub allocation_value: String,
    pub approved_by: Option<String>,
    pub rejection_reason: Option<String>,
    pub copy_start_date: Option<DateTime<Utc>>,
    pub left_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Stored settlement record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredSettlement {
    pub settlement_id: String,
    pub group_id: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub gross_profit: String,
    pub profit_sharing_percentage: String,
    pub amount_due: String,
    pub amount_paid: String,
    pub payment_method: String,
    pub payment_reference: String,
    pub status: String,
    pub submitted_by: String,
    pub decided_by: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
    pub auto_pause_triggered: bool,
    pub resume_time: Option<DateTime<Utc>>,
    pub remarks: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn column<T>(table: &str, field: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    T::from_str(raw).map_err(|e| {
        LifecycleError::Internal(format!("corrupt {}.{} value '{}': {}", table, field, raw, e))
    })
}

fn money(table: &str, field: &str, raw: &str) -> Result<Decimal> {
    column::<Decimal>(table, field, raw)
}

impl TryFrom<StoredUser> for User {
    type Error = LifecycleError;

    fn try_from(row: StoredUser) -> Result<Self> {
        Ok(User {
            role: column("users", "role", &row.role)?,
            ib_status: column("users", "ib_status", &row.ib_status)?,
            user_id: row.user_id,
            name: row.name,
            group_id: row.group_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

impl TryFrom<StoredGroup> for Group {
    type Error = LifecycleError;

    fn try_from(row: StoredGroup) -> Result<Self> {
        Ok(Group {
            trading_status: column("groups", "trading_status", &row.trading_status)?,
            status: column("groups", "status", &row.status)?,
            profit_sharing_percentage: money(
                "groups",
                "profit_sharing_percentage",
                &row.profit_sharing_percentage,
            )?,
            settlement_cycle: column("groups", "settlement_cycle", &row.settlement_cycle)?,
            settlement_hold: row.settlement_hold,
            group_id: row.group_id,
            name: row.name,
            company_name: row.company_name,
            referral_code: row.referral_code,
            api_key: row.api_key,
            total_members: row.total_members,
            active_members: row.active_members,
            created_by: row.created_by,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

impl TryFrom<StoredMember> for Member {
    type Error = LifecycleError;

    fn try_from(row: StoredMember) -> Result<Self> {
        Ok(Member {
            status: column("members", "status", &row.status)?,
            opening_balance: money("members", "opening_balance", &row.opening_balance)?,
            current_balance: money("members", "current_balance", &row.current_balance)?,
            profit_till_date: money("members", "profit_till_date", &row.profit_till_date)?,
            allocation: Allocation {
                model: column("members", "allocation_model", &row.allocation_model)?,
                value: money("members", "allocation_value", &row.allocation_value)?,
            },
            member_id: row.member_id,
            user_id: row.user_id,
            group_id: row.group_id,
            account_id: row.account_id,
            broker: row.broker,
            server: row.server,
            approved_by: row.approved_by,
            rejection_reason: row.rejection_reason,
            copy_start_date: row.copy_start_date,
            left_at: row.left_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

impl TryFrom<StoredSettlement> for Settlement {
    type Error = LifecycleError;

    fn try_from(row: StoredSettlement) -> Result<Self> {
        let settlement = Settlement {
            gross_profit: money("settlements", "gross_profit", &row.gross_profit)?,
            profit_sharing_percentage: money(
                "settlements",
                "profit_sharing_percentage",
                &row.profit_sharing_percentage,
            )?,
            amount_due: money("settlements", "amount_due", &row.amount_due)?,
            amount_paid: money("settlements", "amount_paid", &row.amount_paid)?,
            status: column("settlements", "status", &row.status)?,
            settlement_id: row.settlement_id,
            group_id: row.group_id,
            period_start: row.period_start,
            period_end: row.period_end,
            payment_method: row.payment_method,
            payment_reference: row.payment_reference,
            submitted_by: row.submitted_by,
            decided_by: row.decided_by,
            decided_at: row.decided_at,
            auto_pause_triggered: row.auto_pause_triggered,
            resume_time: row.resume_time,
            remarks: row.remarks,
            created_at: row.created_at,
            updated_at: row.updated_at,
        };

        settlement.period().map_err(|e| {
            LifecycleError::Internal(format!(
                "corrupt settlements period for {}: {}",
                settlement.settlement_id, e
            ))
        })?;
        Ok(settlement)
    }
}
