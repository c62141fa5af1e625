//! Settlement lifecycle: quoting, submission with auto-pause, review and
//! approval with trading resume.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{info, warn};

use crate::api::CopyEngine;
use crate::db::Database;
use crate::error::{LifecycleError, Result};
use crate::models::{
    amount_due, Actor, Settlement, SettlementPeriod, SettlementStatus, SettlementSubmission,
    TradingStatus,
};

use super::{plan_transition, Change, Transition};

/// Lost races on approval are re-evaluated this many times.
const APPROVE_ATTEMPTS: usize = 3;

/// What a group owes for a period at the live percentage.
#[derive(Debug, Clone, Serialize)]
pub struct SettlementQuote {
    pub group_id: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub gross_profit: Decimal,
    pub profit_sharing_percentage: Decimal,
    pub amount_due: Decimal,
}

/// A settlement together with the group transition applied alongside it.
#[derive(Debug, Clone)]
pub struct SettlementDecision {
    pub settlement: Settlement,
    pub group_transition: Option<Transition>,
}

pub struct SettlementLifecycle {
    db: Database,
    copier: Arc<dyn CopyEngine>,
    auto_pause_on_submit: bool,
}

fn finalized(settlement: &Settlement) -> LifecycleError {
    LifecycleError::AlreadyFinalized(settlement.settlement_id.clone())
}

impl SettlementLifecycle {
    pub fn new(db: Database, copier: Arc<dyn CopyEngine>, auto_pause_on_submit: bool) -> Self {
        Self {
            db,
            copier,
            auto_pause_on_submit,
        }
    }

    /// Quote the settlement for a period. Fails with `InvalidPeriod` when
    /// `end` precedes `start`.
    pub async fn calculate(
        &self,
        group_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<SettlementQuote> {
        let period = SettlementPeriod::new(start, end)?;
        self.quote(group_id, &period).await
    }

    async fn quote(&self, group_id: &str, period: &SettlementPeriod) -> Result<SettlementQuote> {
        let group = self.db.get_group(group_id).await?;
        if group.is_deleted() {
            return Err(LifecycleError::not_found("group", group_id));
        }

        let gross_profit = self.copier.gross_profit(group_id, period).await?;
        let percentage = group.profit_sharing_percentage;

        Ok(SettlementQuote {
            group_id: group_id.to_string(),
            period_start: period.start(),
            period_end: period.end(),
            gross_profit,
            profit_sharing_percentage: percentage,
            amount_due: amount_due(gross_profit, percentage),
        })
    }

    /// Record a payment for a period, snapshotting the group's percentage.
    ///
    /// An active group is paused in the same transaction when auto-pause is
    /// enabled.
    pub async fn submit(
        &self,
        submission: &SettlementSubmission,
        submitted_by: &str,
    ) -> Result<SettlementDecision> {
        submission.validate()?;

        let quote = self.quote(&submission.group_id, &submission.period).await?;
        let draft = Settlement::new(
            submission,
            quote.gross_profit,
            quote.profit_sharing_percentage,
            submitted_by,
        );

        let settlement = self
            .db
            .insert_settlement(&draft, self.auto_pause_on_submit)
            .await?;

        info!(
            settlement_id = %settlement.settlement_id,
            group_id = %settlement.group_id,
            amount_due = %settlement.amount_due,
            amount_paid = %settlement.amount_paid,
            auto_paused = settlement.auto_pause_triggered,
            "Settlement submitted"
        );

        let group_transition = settlement.auto_pause_triggered.then_some(Transition {
            from: TradingStatus::Active,
            to: TradingStatus::Paused,
        });

        Ok(SettlementDecision {
            settlement,
            group_transition,
        })
    }

    /// pending -> processing. Already processing is a no-op.
    pub async fn begin_review(&self, settlement_id: &str) -> Result<Change<Settlement>> {
        let settlement = self.db.get_settlement(settlement_id).await?;
        match settlement.status {
            SettlementStatus::Processing => return Ok(Change::unchanged(settlement)),
            SettlementStatus::Pending => {}
            _ => return Err(finalized(&settlement)),
        }

        let settlement = self.db.mark_settlement_processing(settlement_id).await?;
        info!(settlement_id = %settlement_id, "Settlement under review");
        Ok(Change::applied(settlement))
    }

    /// Approve a pending or processing settlement.
    ///
    /// If submission auto-paused the group and it is still paused, trading is
    /// resumed in the same transaction. A suspended group stays suspended.
    pub async fn approve(&self, settlement_id: &str, approver: &str) -> Result<SettlementDecision> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_approve(settlement_id, approver).await {
                Err(LifecycleError::ConcurrentModification { entity, id })
                    if attempt < APPROVE_ATTEMPTS =>
                {
                    warn!(settlement_id = %settlement_id, entity, id = %id, attempt, "Approval raced, retrying");
                }
                other => return other,
            }
        }
    }

    async fn try_approve(&self, settlement_id: &str, approver: &str) -> Result<SettlementDecision> {
        let settlement = self.db.get_settlement(settlement_id).await?;
        if settlement.status.is_terminal() {
            return Err(finalized(&settlement));
        }

        let resume = if self.releases_hold(&settlement).await? {
            plan_transition(TradingStatus::Paused, TradingStatus::Active, &Actor::system())?
        } else {
            None
        };

        let approved = self
            .db
            .approve_settlement(&settlement, approver, resume.map(|t| (t.from, t.to)))
            .await?;

        info!(
            settlement_id = %settlement_id,
            group_id = %approved.group_id,
            approved_by = %approver,
            resumed = resume.is_some(),
            "Settlement approved"
        );

        Ok(SettlementDecision {
            settlement: approved,
            group_transition: resume,
        })
    }

    /// Whether approving `settlement` lifts the group's auto-pause.
    ///
    /// That is the case for the settlement that paused the group, or for a
    /// corrected one once the pausing settlement was rejected.
    async fn releases_hold(&self, settlement: &Settlement) -> Result<bool> {
        let group = self.db.get_group(&settlement.group_id).await?;
        if group.is_deleted() || group.trading_status != TradingStatus::Paused {
            return Ok(false);
        }

        match group.settlement_hold.as_deref() {
            None => Ok(false),
            Some(holder) if holder == settlement.settlement_id => Ok(true),
            Some(holder) => {
                let holder = self.db.get_settlement(holder).await?;
                Ok(holder.status == SettlementStatus::Rejected)
            }
        }
    }

    /// Reject a pending or processing settlement. Trading is not resumed;
    /// the group stays held until a corrected settlement is approved or an
    /// admin resumes it.
    pub async fn reject(
        &self,
        settlement_id: &str,
        decided_by: &str,
        reason: &str,
    ) -> Result<Settlement> {
        if reason.trim().is_empty() {
            return Err(LifecycleError::Validation(
                "rejection reason must not be empty".to_string(),
            ));
        }

        let settlement = self.db.get_settlement(settlement_id).await?;
        if settlement.status.is_terminal() {
            return Err(finalized(&settlement));
        }

        let rejected = match self
            .db
            .reject_settlement(&settlement, decided_by, reason.trim())
            .await
        {
            Ok(rejected) => rejected,
            Err(LifecycleError::ConcurrentModification { .. }) => {
                let current = self.db.get_settlement(settlement_id).await?;
                return Err(if current.status.is_terminal() {
                    finalized(&current)
                } else {
                    LifecycleError::conflict("settlement", settlement_id)
                });
            }
            Err(e) => return Err(e),
        };

        info!(settlement_id = %settlement_id, rejected_by = %decided_by, "Settlement rejected");
        Ok(rejected)
    }

    /// Append an audit remark at any status.
    pub async fn annotate(&self, settlement_id: &str, remark: &str) -> Result<Settlement> {
        let remark = remark.trim();
        if remark.is_empty() {
            return Err(LifecycleError::Validation("remark must not be empty".to_string()));
        }
        self.db.annotate_settlement(settlement_id, remark).await
    }

    /// Settlements awaiting a decision (pending or processing).
    pub async fn list_pending(&self, group_id: Option<&str>) -> Result<Vec<Settlement>> {
        let mut open = self
            .db
            .list_settlements(Some(SettlementStatus::Pending), group_id)
            .await?;
        open.extend(
            self.db
                .list_settlements(Some(SettlementStatus::Processing), group_id)
                .await?,
        );
        open.sort_by_key(|s| s.created_at);
        Ok(open)
    }

    pub async fn get(&self, settlement_id: &str) -> Result<Settlement> {
        self.db.get_settlement(settlement_id).await
    }

    pub async fn list(
        &self,
        status: Option<SettlementStatus>,
        group_id: Option<&str>,
    ) -> Result<Vec<Settlement>> {
        self.db.list_settlements(status, group_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MemoryCopyEngine;
    use crate::lifecycle::{testing, GroupStateMachine};
    use crate::models::{Group, NewGroup, Role, SettlementCycle};
    use chrono::Duration;
    use rust_decimal_macros::dec;

    struct Fixture {
        db: Database,
        engine: Arc<MemoryCopyEngine>,
        groups: GroupStateMachine,
        settlements: SettlementLifecycle,
        admin: Actor,
    }

    async fn fixture(auto_pause: bool) -> Fixture {
        let db = testing::database().await;
        let engine = testing::engine();
        Fixture {
            groups: GroupStateMachine::new(db.clone()),
            settlements: SettlementLifecycle::new(db.clone(), engine.clone(), auto_pause),
            db,
            engine,
            admin: Actor::for_role("adm", Role::Admin),
        }
    }

    async fn active_group(f: &Fixture, pct: Decimal) -> Group {
        let group = f
            .groups
            .create_group(
                &NewGroup {
                    name: "Alpha".to_string(),
                    company_name: "Alpha Desk".to_string(),
                    profit_sharing_percentage: pct,
                    settlement_cycle: SettlementCycle::Weekly,
                },
                &f.admin,
            )
            .await
            .unwrap();
        f.groups
            .set_trading_status(&group.group_id, TradingStatus::Active, &f.admin)
            .await
            .unwrap()
            .group
    }

    fn submission(group_id: &str, amount_paid: Decimal) -> SettlementSubmission {
        let end = Utc::now();
        SettlementSubmission {
            group_id: group_id.to_string(),
            period: SettlementPeriod::new(end - Duration::days(7), end).unwrap(),
            payment_method: "bank_transfer".to_string(),
            payment_reference: "UTR-2024-001".to_string(),
            amount_paid,
        }
    }

    #[tokio::test]
    async fn test_calculate_rejects_inverted_period() {
        let f = fixture(true).await;
        let group = active_group(&f, dec!(80)).await;
        let now = Utc::now();

        let err = f
            .settlements
            .calculate(&group.group_id, now, now - Duration::hours(1))
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidPeriod { .. }));

        f.engine.set_profit(&group.group_id, dec!(15000));
        let quote = f
            .settlements
            .calculate(&group.group_id, now - Duration::days(7), now)
            .await
            .unwrap();
        assert_eq!(quote.amount_due, dec!(12000));
    }

    #[tokio::test]
    async fn test_submit_approve_resumes_group() {
        let f = fixture(true).await;
        let group = active_group(&f, dec!(80)).await;
        f.engine.set_profit(&group.group_id, dec!(15000));

        let submitted = f
            .settlements
            .submit(&submission(&group.group_id, dec!(12000)), "master-1")
            .await
            .unwrap();
        assert_eq!(submitted.settlement.amount_due, dec!(12000));
        assert!(submitted.settlement.auto_pause_triggered);
        assert_eq!(
            f.db.get_group(&group.group_id).await.unwrap().trading_status,
            TradingStatus::Paused
        );

        let decision = f
            .settlements
            .approve(&submitted.settlement.settlement_id, "adm")
            .await
            .unwrap();
        assert_eq!(decision.settlement.status, SettlementStatus::Approved);
        assert!(decision.settlement.resume_time.is_some());
        assert_eq!(
            decision.group_transition,
            Some(Transition {
                from: TradingStatus::Paused,
                to: TradingStatus::Active
            })
        );
        assert_eq!(
            f.db.get_group(&group.group_id).await.unwrap().trading_status,
            TradingStatus::Active
        );

        let err = f
            .settlements
            .approve(&submitted.settlement.settlement_id, "adm")
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::AlreadyFinalized(_)));
    }

    #[tokio::test]
    async fn test_snapshot_survives_percentage_edit() {
        let f = fixture(true).await;
        let group = active_group(&f, dec!(80)).await;
        f.engine.set_profit(&group.group_id, dec!(1000));

        let submitted = f
            .settlements
            .submit(&submission(&group.group_id, dec!(800)), "master-1")
            .await
            .unwrap();
        f.groups
            .update_profit_sharing(&group.group_id, dec!(20), &f.admin)
            .await
            .unwrap();

        let stored = f
            .settlements
            .get(&submitted.settlement.settlement_id)
            .await
            .unwrap();
        assert_eq!(stored.profit_sharing_percentage, dec!(80));
        assert_eq!(stored.amount_due, dec!(800));
    }

    #[tokio::test]
    async fn test_rejection_keeps_group_held_until_corrected() {
        let f = fixture(true).await;
        let group = active_group(&f, dec!(50)).await;
        f.engine.set_profit(&group.group_id, dec!(1000));

        let first = f
            .settlements
            .submit(&submission(&group.group_id, dec!(100)), "master-1")
            .await
            .unwrap();
        f.settlements
            .reject(&first.settlement.settlement_id, "adm", "short payment")
            .await
            .unwrap();

        let manager = Actor::for_role("mgr", Role::Manager);
        let err = f
            .groups
            .set_trading_status(&group.group_id, TradingStatus::Active, &manager)
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::AwaitingSettlement { .. }));

        let corrected = f
            .settlements
            .submit(&submission(&group.group_id, dec!(500)), "master-1")
            .await
            .unwrap();
        assert!(!corrected.settlement.auto_pause_triggered);

        let decision = f
            .settlements
            .approve(&corrected.settlement.settlement_id, "adm")
            .await
            .unwrap();
        assert_eq!(
            decision.group_transition,
            Some(Transition {
                from: TradingStatus::Paused,
                to: TradingStatus::Active
            })
        );
        assert!(decision.settlement.resume_time.is_some());

        let group = f.groups.get_group(&group.group_id).await.unwrap();
        assert_eq!(group.trading_status, TradingStatus::Active);
        assert!(group.settlement_hold.is_none());
    }

    #[tokio::test]
    async fn test_suspended_group_stays_suspended() {
        let f = fixture(true).await;
        let group = active_group(&f, dec!(50)).await;

        let submitted = f
            .settlements
            .submit(&submission(&group.group_id, dec!(1)), "master-1")
            .await
            .unwrap();
        f.groups
            .set_trading_status(&group.group_id, TradingStatus::Suspended, &f.admin)
            .await
            .unwrap();

        let decision = f
            .settlements
            .approve(&submitted.settlement.settlement_id, "adm")
            .await
            .unwrap();
        assert!(decision.group_transition.is_none());
        assert!(decision.settlement.resume_time.is_none());
        assert_eq!(
            f.db.get_group(&group.group_id).await.unwrap().trading_status,
            TradingStatus::Suspended
        );
    }

    #[tokio::test]
    async fn test_no_auto_pause_when_disabled() {
        let f = fixture(false).await;
        let group = active_group(&f, dec!(50)).await;

        let submitted = f
            .settlements
            .submit(&submission(&group.group_id, dec!(5)), "master-1")
            .await
            .unwrap();
        assert!(!submitted.settlement.auto_pause_triggered);
        assert!(submitted.group_transition.is_none());
        assert_eq!(
            f.db.get_group(&group.group_id).await.unwrap().trading_status,
            TradingStatus::Active
        );
    }

    #[tokio::test]
    async fn test_review_reject_and_annotate() {
        let f = fixture(true).await;
        let group = active_group(&f, dec!(50)).await;
        let id = f
            .settlements
            .submit(&submission(&group.group_id, dec!(5)), "master-1")
            .await
            .unwrap()
            .settlement
            .settlement_id;

        assert!(f.settlements.begin_review(&id).await.unwrap().applied);
        assert!(!f.settlements.begin_review(&id).await.unwrap().applied);
        assert_eq!(f.settlements.list_pending(None).await.unwrap().len(), 1);

        let rejected = f.settlements.reject(&id, "adm", "reference mismatch").await.unwrap();
        assert_eq!(rejected.status, SettlementStatus::Rejected);
        // Rejection never resumes trading.
        assert_eq!(
            f.db.get_group(&group.group_id).await.unwrap().trading_status,
            TradingStatus::Paused
        );

        assert!(matches!(
            f.settlements.reject(&id, "adm", "again").await.unwrap_err(),
            LifecycleError::AlreadyFinalized(_)
        ));
        assert!(matches!(
            f.settlements.begin_review(&id).await.unwrap_err(),
            LifecycleError::AlreadyFinalized(_)
        ));

        let noted = f.settlements.annotate(&id, "payer notified").await.unwrap();
        assert!(noted.remarks.unwrap().ends_with("payer notified"));
        assert!(f.settlements.list_pending(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_copy_engine_outage_blocks_submit() {
        let f = fixture(true).await;
        let group = active_group(&f, dec!(50)).await;
        f.engine.fail_profit(true);

        let err = f
            .settlements
            .submit(&submission(&group.group_id, dec!(5)), "master-1")
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(f.settlements.list(None, None).await.unwrap().is_empty());
    }
}
