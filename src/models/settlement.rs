//! Profit-sharing settlement model.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{LifecycleError, Result};

use super::{normalize_token, require_text, unknown_value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementStatus {
    Pending,
    /// Under admin review
    Processing,
    Approved,
    Rejected,
}

impl SettlementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementStatus::Pending => "pending",
            SettlementStatus::Processing => "processing",
            SettlementStatus::Approved => "approved",
            SettlementStatus::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SettlementStatus::Approved | SettlementStatus::Rejected)
    }
}

impl FromStr for SettlementStatus {
    type Err = LifecycleError;

    fn from_str(s: &str) -> Result<Self> {
        match normalize_token(s).as_str() {
            "pending" => Ok(SettlementStatus::Pending),
            "processing" => Ok(SettlementStatus::Processing),
            "approved" => Ok(SettlementStatus::Approved),
            "rejected" => Ok(SettlementStatus::Rejected),
            _ => Err(unknown_value("settlement status", s)),
        }
    }
}

impl fmt::Display for SettlementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed settlement window, `end >= start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawPeriod")]
pub struct SettlementPeriod {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl SettlementPeriod {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if end < start {
            return Err(LifecycleError::InvalidPeriod { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }
}

#[derive(Deserialize)]
struct RawPeriod {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl TryFrom<RawPeriod> for SettlementPeriod {
    type Error = LifecycleError;

    fn try_from(raw: RawPeriod) -> Result<Self> {
        SettlementPeriod::new(raw.start, raw.end)
    }
}

/// Profit share owed for a period: `gross_profit * percentage / 100`.
pub fn amount_due(gross_profit: Decimal, profit_sharing_percentage: Decimal) -> Decimal {
    gross_profit * profit_sharing_percentage / Decimal::ONE_HUNDRED
}

/// Payment details supplied by the group when settling a period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementSubmission {
    pub group_id: String,
    pub period: SettlementPeriod,
    pub payment_method: String,
    pub payment_reference: String,
    pub amount_paid: Decimal,
}

impl SettlementSubmission {
    pub fn validate(&self) -> Result<()> {
        require_text("group_id", &self.group_id)?;
        require_text("payment_method", &self.payment_method)?;
        require_text("payment_reference", &self.payment_reference)?;
        if self.amount_paid <= Decimal::ZERO {
            return Err(LifecycleError::Validation(
                "amount_paid must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// A submitted settlement.
///
/// Once approved or rejected, only `remarks` may change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settlement {
    pub settlement_id: String,
    pub group_id: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,

    /// Profit reported by the copy engine for the period
    pub gross_profit: Decimal,

    /// Group percentage at submission time
    pub profit_sharing_percentage: Decimal,

    pub amount_due: Decimal,
    pub amount_paid: Decimal,
    pub payment_method: String,
    pub payment_reference: String,
    pub status: SettlementStatus,
    pub submitted_by: String,
    pub decided_by: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,

    /// Submission paused the group's trading
    pub auto_pause_triggered: bool,

    /// When approval resumed the group's trading
    pub resume_time: Option<DateTime<Utc>>,

    /// Audit trail, one remark per line
    pub remarks: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Settlement {
    pub fn new(
        submission: &SettlementSubmission,
        gross_profit: Decimal,
        profit_sharing_percentage: Decimal,
        submitted_by: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            settlement_id: uuid::Uuid::new_v4().to_string(),
            group_id: submission.group_id.clone(),
            period_start: submission.period.start(),
            period_end: submission.period.end(),
            gross_profit,
            profit_sharing_percentage,
            amount_due: amount_due(gross_profit, profit_sharing_percentage),
            amount_paid: submission.amount_paid,
            payment_method: submission.payment_method.trim().to_string(),
            payment_reference: submission.payment_reference.trim().to_string(),
            status: SettlementStatus::Pending,
            submitted_by: submitted_by.to_string(),
            decided_by: None,
            decided_at: None,
            auto_pause_triggered: false,
            resume_time: None,
            remarks: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn period(&self) -> Result<SettlementPeriod> {
        SettlementPeriod::new(self.period_start, self.period_end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    #[test]
    fn test_amount_due() {
        assert_eq!(amount_due(dec!(15000), dec!(80)), dec!(12000));
        assert_eq!(amount_due(dec!(1234.56), dec!(25)), dec!(308.64));
        assert_eq!(amount_due(dec!(0), dec!(50)), dec!(0));
    }

    #[test]
    fn test_period_ordering() {
        let start = Utc::now();
        assert!(SettlementPeriod::new(start, start).is_ok());
        assert!(SettlementPeriod::new(start, start + Duration::days(7)).is_ok());

        let err = SettlementPeriod::new(start, start - Duration::seconds(1)).unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidPeriod { .. }));
    }

    #[test]
    fn test_submission_validation() {
        let start = Utc::now() - Duration::days(7);
        let mut submission = SettlementSubmission {
            group_id: "g1".to_string(),
            period: SettlementPeriod::new(start, Utc::now()).unwrap(),
            payment_method: "bank_transfer".to_string(),
            payment_reference: "UTR-88121".to_string(),
            amount_paid: dec!(500),
        };
        assert!(submission.validate().is_ok());

        submission.amount_paid = dec!(-1);
        assert!(submission.validate().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(SettlementStatus::Approved.is_terminal());
        assert!(SettlementStatus::Rejected.is_terminal());
        assert!(!SettlementStatus::Processing.is_terminal());
    }
}
