//! Membership lifecycle: join requests, approval, rejection, leaving and
//! pausing of copy-trading memberships.

use std::sync::Arc;

use tracing::{info, warn};

use crate::api::CopyEngine;
use crate::db::Database;
use crate::error::{LifecycleError, Result};
use crate::models::{AccountDetails, Member, MemberStatus};

use super::Change;

/// A new pending membership and the one it replaced, if any.
#[derive(Debug, Clone)]
pub struct Joined {
    pub member: Member,
    pub replaced: Option<Member>,
}

pub struct MembershipLifecycle {
    db: Database,
    copier: Arc<dyn CopyEngine>,
}

fn invalid_transition(member: &Member, target: MemberStatus) -> LifecycleError {
    LifecycleError::InvalidTransition {
        entity: "member",
        from: member.status.to_string(),
        to: target.to_string(),
    }
}

impl MembershipLifecycle {
    pub fn new(db: Database, copier: Arc<dyn CopyEngine>) -> Self {
        Self { db, copier }
    }

    /// Request to join the group identified by `code` (referral code or API
    /// key).
    ///
    /// With `graceful_switch`, an open membership in another group is retired
    /// in the same transaction and its account deactivated afterwards.
    pub async fn request_join(
        &self,
        user_id: &str,
        code: &str,
        account: &AccountDetails,
        graceful_switch: bool,
    ) -> Result<Change<Joined>> {
        let code = code.trim();
        let group = match self.db.find_group_by_code(code).await? {
            Some(group) => group,
            None => return Err(LifecycleError::GroupNotFound(code.to_string())),
        };

        let user = self.db.get_user(user_id).await?;
        if !user.can_join_groups() {
            return Err(LifecycleError::IbNotApproved(user_id.to_string()));
        }

        account.validate()?;

        let replace = match self.db.find_open_member(user_id).await? {
            Some(existing) if existing.group_id == group.group_id || !graceful_switch => {
                return Err(LifecycleError::AlreadyInGroup {
                    user_id: user_id.to_string(),
                    member_id: existing.member_id,
                });
            }
            other => other,
        };

        let member = Member::pending(user_id, &group.group_id, account);
        self.db.create_membership(&member, replace.as_ref()).await?;

        let member = self.db.get_member(&member.member_id).await?;
        let replaced = match &replace {
            Some(prior) => Some(self.db.get_member(&prior.member_id).await?),
            None => None,
        };

        info!(
            member_id = %member.member_id,
            user_id = %user_id,
            group_id = %group.group_id,
            switched_from = ?replace.as_ref().map(|m| m.group_id.as_str()),
            "Join requested"
        );

        let mut change = Change::applied(Joined {
            member,
            replaced: replaced.clone(),
        });

        if let Some(prior) = replace.filter(|m| m.status.is_approved()) {
            if let Err(e) = self.copier.set_copying(&prior.account_id, false).await {
                warn!(
                    account_id = %prior.account_id,
                    error = %e,
                    "Failed to deactivate previous account after switch"
                );
                change = change.with_failure(
                    "switched membership",
                    "deactivate previous account",
                    &e,
                );
            }
        }

        Ok(change)
    }

    /// pending -> active. Approving an active member is a no-op.
    pub async fn approve(&self, member_id: &str, approver: &str) -> Result<Change<Member>> {
        let member = self.db.get_member(member_id).await?;
        match member.status {
            MemberStatus::Active => return Ok(Change::unchanged(member)),
            MemberStatus::Pending => {}
            _ => return Err(invalid_transition(&member, MemberStatus::Active)),
        }

        let approved = match self.db.approve_membership(&member, approver).await {
            Ok(approved) => approved,
            Err(e) => return self.settle_race(member_id, MemberStatus::Active, e).await,
        };

        info!(
            member_id = %member_id,
            group_id = %approved.group_id,
            approved_by = %approver,
            "Member approved"
        );

        let change = Change::applied(approved);
        Ok(self
            .toggle_copying(change, true, "member approved", "enable copying")
            .await)
    }

    /// pending -> rejected. Rejecting a rejected member is a no-op.
    pub async fn reject(&self, member_id: &str, reason: Option<&str>) -> Result<Change<Member>> {
        let member = self.db.get_member(member_id).await?;
        match member.status {
            MemberStatus::Rejected => return Ok(Change::unchanged(member)),
            MemberStatus::Pending => {}
            _ => return Err(invalid_transition(&member, MemberStatus::Rejected)),
        }

        let rejected = match self.db.reject_membership(&member, reason).await {
            Ok(rejected) => rejected,
            Err(e) => return self.settle_race(member_id, MemberStatus::Rejected, e).await,
        };

        info!(member_id = %member_id, reason = ?reason, "Member rejected");
        Ok(Change::applied(rejected))
    }

    /// Any non-left status -> left. Leaving twice is a no-op.
    pub async fn leave(&self, member_id: &str) -> Result<Change<Member>> {
        let member = self.db.get_member(member_id).await?;
        if member.status == MemberStatus::Left {
            return Ok(Change::unchanged(member));
        }
        if !member.status.can_transition_to(MemberStatus::Left) {
            return Err(invalid_transition(&member, MemberStatus::Left));
        }

        let was_approved = member.status.is_approved();
        let left = match self.db.leave_membership(&member).await {
            Ok(left) => left,
            Err(e) => return self.settle_race(member_id, MemberStatus::Left, e).await,
        };

        info!(member_id = %member_id, group_id = %left.group_id, "Member left group");

        let change = Change::applied(left);
        if !was_approved {
            return Ok(change);
        }
        Ok(self
            .toggle_copying(change, false, "member left", "deactivate account")
            .await)
    }

    /// active -> paused, stopping copy trading on the account.
    pub async fn pause(&self, member_id: &str) -> Result<Change<Member>> {
        self.set_approved_status(member_id, MemberStatus::Paused).await
    }

    /// paused -> active, restarting copy trading on the account.
    pub async fn resume(&self, member_id: &str) -> Result<Change<Member>> {
        self.set_approved_status(member_id, MemberStatus::Active).await
    }

    async fn set_approved_status(
        &self,
        member_id: &str,
        target: MemberStatus,
    ) -> Result<Change<Member>> {
        let member = self.db.get_member(member_id).await?;
        if member.status == target {
            return Ok(Change::unchanged(member));
        }
        if !member.status.is_approved() || !member.status.can_transition_to(target) {
            return Err(invalid_transition(&member, target));
        }

        let updated = match self.db.set_member_status(&member, target).await {
            Ok(updated) => updated,
            Err(e) => return self.settle_race(member_id, target, e).await,
        };

        info!(member_id = %member_id, status = %target, "Member copy status changed");

        let enabled = target == MemberStatus::Active;
        let (completed, failed) = if enabled {
            ("member resumed", "enable copying")
        } else {
            ("member paused", "disable copying")
        };
        Ok(self
            .toggle_copying(Change::applied(updated), enabled, completed, failed)
            .await)
    }

    async fn toggle_copying(
        &self,
        change: Change<Member>,
        enabled: bool,
        completed: &str,
        failed: &str,
    ) -> Change<Member> {
        let account_id = change.value.account_id.clone();
        match self.copier.set_copying(&account_id, enabled).await {
            Ok(()) => change,
            Err(e) => {
                warn!(account_id = %account_id, enabled, error = %e, "Copy engine toggle failed");
                change.with_failure(completed, failed, &e)
            }
        }
    }

    /// A lost conditional update is a no-op if the winner reached the same
    /// status; otherwise the conflict stands.
    async fn settle_race(
        &self,
        member_id: &str,
        target: MemberStatus,
        err: LifecycleError,
    ) -> Result<Change<Member>> {
        if !matches!(err, LifecycleError::ConcurrentModification { .. }) {
            return Err(err);
        }
        let current = self.db.get_member(member_id).await?;
        if current.status == target {
            Ok(Change::unchanged(current))
        } else {
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MemoryCopyEngine;
    use crate::lifecycle::testing;
    use crate::lifecycle::GroupStateMachine;
    use crate::models::{Actor, Group, IbStatus, NewGroup, Role, SettlementCycle, User};
    use rust_decimal_macros::dec;

    struct Fixture {
        db: Database,
        engine: Arc<MemoryCopyEngine>,
        members: MembershipLifecycle,
    }

    async fn fixture() -> Fixture {
        let db = testing::database().await;
        let engine = testing::engine();
        let members = MembershipLifecycle::new(db.clone(), engine.clone());
        Fixture { db, engine, members }
    }

    async fn group(db: &Database, name: &str) -> Group {
        GroupStateMachine::new(db.clone())
            .create_group(
                &NewGroup {
                    name: name.to_string(),
                    company_name: "Desk".to_string(),
                    profit_sharing_percentage: dec!(50),
                    settlement_cycle: SettlementCycle::Weekly,
                },
                &Actor::for_role("adm", Role::Admin),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_join_requires_known_group_and_ib_approval() {
        let f = fixture().await;
        let g = group(&f.db, "Alpha").await;
        f.db.save_user(&User::new("u1", "U1", Role::User)).await.unwrap();

        let err = f
            .members
            .request_join("u1", "REF_MISSING", &testing::account("a1"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::GroupNotFound(_)));

        let err = f
            .members
            .request_join("u1", &g.referral_code, &testing::account("a1"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::IbNotApproved(_)));

        f.db.set_ib_status("u1", IbStatus::Approved).await.unwrap();
        let change = f
            .members
            .request_join("u1", &g.api_key, &testing::account("a1"), false)
            .await
            .unwrap();
        assert_eq!(change.value.member.status, MemberStatus::Pending);
        assert!(f.db.get_user("u1").await.unwrap().group_id.is_none());
    }

    #[tokio::test]
    async fn test_join_rejects_invalid_account() {
        let f = fixture().await;
        let g = group(&f.db, "Alpha").await;
        testing::approved_user(&f.db, "u1").await;

        let mut account = testing::account("a1");
        account.server = String::new();
        let err = f
            .members
            .request_join("u1", &g.referral_code, &account, false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_concurrent_joins_admit_one() {
        let f = fixture().await;
        testing::approved_user(&f.db, "u1").await;
        let members = Arc::new(f.members);

        let mut codes = Vec::new();
        for n in 0..8 {
            codes.push(group(&f.db, &format!("Group {n}")).await.referral_code);
        }

        let handles: Vec<_> = codes
            .into_iter()
            .enumerate()
            .map(|(n, code)| {
                let members = members.clone();
                tokio::spawn(async move {
                    members
                        .request_join("u1", &code, &testing::account(&format!("a{n}")), false)
                        .await
                })
            })
            .collect();

        let mut joined = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => joined += 1,
                Err(e) => assert!(matches!(e, LifecycleError::AlreadyInGroup { .. })),
            }
        }

        assert_eq!(joined, 1);
        let open = f.db.list_members(None, None).await.unwrap();
        assert_eq!(open.iter().filter(|m| m.status.is_open()).count(), 1);
    }

    #[tokio::test]
    async fn test_same_group_twice_even_with_switch() {
        let f = fixture().await;
        let g = group(&f.db, "Alpha").await;
        testing::approved_user(&f.db, "u1").await;

        f.members
            .request_join("u1", &g.referral_code, &testing::account("a1"), false)
            .await
            .unwrap();
        let err = f
            .members
            .request_join("u1", &g.referral_code, &testing::account("a2"), true)
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::AlreadyInGroup { .. }));
    }

    #[tokio::test]
    async fn test_approve_is_idempotent_and_enables_copying() {
        let f = fixture().await;
        let g = group(&f.db, "Alpha").await;
        testing::approved_user(&f.db, "u1").await;

        let joined = f
            .members
            .request_join("u1", &g.referral_code, &testing::account("a1"), false)
            .await
            .unwrap()
            .value
            .member;

        let first = f.members.approve(&joined.member_id, "adm").await.unwrap();
        assert!(first.applied);
        let second = f.members.approve(&joined.member_id, "adm").await.unwrap();
        assert!(!second.applied);

        assert_eq!(f.engine.is_copying("a1"), Some(true));
        assert_eq!(f.db.get_user("u1").await.unwrap().group_id, Some(g.group_id.clone()));

        let group = f.db.get_group(&g.group_id).await.unwrap();
        assert_eq!(group.total_members, 1);
        assert_eq!(group.active_members, 1);
    }

    #[tokio::test]
    async fn test_concurrent_approves_apply_once() {
        let f = fixture().await;
        let g = group(&f.db, "Alpha").await;
        testing::approved_user(&f.db, "u1").await;
        let member_id = f
            .members
            .request_join("u1", &g.referral_code, &testing::account("a1"), false)
            .await
            .unwrap()
            .value
            .member
            .member_id;

        let members = Arc::new(f.members);
        let (a, b) = tokio::join!(
            members.approve(&member_id, "adm-1"),
            members.approve(&member_id, "adm-2")
        );
        let applied = [a.unwrap(), b.unwrap()]
            .iter()
            .filter(|change| change.applied)
            .count();
        assert_eq!(applied, 1);
        assert_eq!(f.db.get_group(&g.group_id).await.unwrap().active_members, 1);
    }

    #[tokio::test]
    async fn test_approve_copy_failure_is_partial() {
        let f = fixture().await;
        let g = group(&f.db, "Alpha").await;
        testing::approved_user(&f.db, "u1").await;
        let member_id = f
            .members
            .request_join("u1", &g.referral_code, &testing::account("a1"), false)
            .await
            .unwrap()
            .value
            .member
            .member_id;

        f.engine.fail_toggles(true);
        let change = f.members.approve(&member_id, "adm").await.unwrap();
        assert!(change.applied);
        let err = change.into_result().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::PartialFailure);

        // The approval itself stands.
        let member = f.db.get_member(&member_id).await.unwrap();
        assert_eq!(member.status, MemberStatus::Active);
    }

    #[tokio::test]
    async fn test_graceful_switch() {
        let f = fixture().await;
        let alpha = group(&f.db, "Alpha").await;
        let beta = group(&f.db, "Beta").await;
        testing::approved_user(&f.db, "u1").await;

        let first = f
            .members
            .request_join("u1", &alpha.referral_code, &testing::account("a1"), false)
            .await
            .unwrap()
            .value
            .member;
        f.members.approve(&first.member_id, "adm").await.unwrap();

        let err = f
            .members
            .request_join("u1", &beta.referral_code, &testing::account("b1"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::AlreadyInGroup { .. }));

        let joined = f
            .members
            .request_join("u1", &beta.referral_code, &testing::account("b1"), true)
            .await
            .unwrap()
            .into_result()
            .unwrap();

        assert_eq!(joined.replaced.unwrap().status, MemberStatus::Left);
        assert_eq!(joined.member.group_id, beta.group_id);
        assert_eq!(f.engine.is_copying("a1"), Some(false));
        assert!(f.db.get_user("u1").await.unwrap().group_id.is_none());
        assert_eq!(f.db.get_group(&alpha.group_id).await.unwrap().total_members, 0);
    }

    #[tokio::test]
    async fn test_leave_and_transitions() {
        let f = fixture().await;
        let g = group(&f.db, "Alpha").await;
        testing::approved_user(&f.db, "u1").await;
        let member_id = f
            .members
            .request_join("u1", &g.referral_code, &testing::account("a1"), false)
            .await
            .unwrap()
            .value
            .member
            .member_id;

        let err = f.members.pause(&member_id).await.unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidTransition { .. }));

        f.members.reject(&member_id, Some("KYC incomplete")).await.unwrap();
        assert!(!f.members.reject(&member_id, None).await.unwrap().applied);
        let err = f.members.approve(&member_id, "adm").await.unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidTransition { .. }));

        let left = f.members.leave(&member_id).await.unwrap();
        assert!(left.applied);
        assert!(left.is_complete());
        // Never approved, so the copy engine was not touched.
        assert_eq!(f.engine.is_copying("a1"), None);
        assert!(!f.members.leave(&member_id).await.unwrap().applied);
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let f = fixture().await;
        let g = group(&f.db, "Alpha").await;
        testing::approved_user(&f.db, "u1").await;
        let member_id = f
            .members
            .request_join("u1", &g.referral_code, &testing::account("a1"), false)
            .await
            .unwrap()
            .value
            .member
            .member_id;
        f.members.approve(&member_id, "adm").await.unwrap();

        let paused = f.members.pause(&member_id).await.unwrap();
        assert_eq!(paused.value.status, MemberStatus::Paused);
        assert_eq!(f.engine.is_copying("a1"), Some(false));
        assert_eq!(f.db.get_group(&g.group_id).await.unwrap().active_members, 0);

        let resumed = f.members.resume(&member_id).await.unwrap();
        assert_eq!(resumed.value.status, MemberStatus::Active);
        assert_eq!(f.engine.is_copying("a1"), Some(true));
        assert!(!f.members.resume(&member_id).await.unwrap().applied);
    }
}
