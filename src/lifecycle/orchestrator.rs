//! Public façade over the lifecycle state machines.
//!
//! Every mutation follows the same order: capability check, store write,
//! copy-engine follow-up, then hub publish. Events go out only for
//! transitions that were applied, and hub delivery can never fail an
//! operation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::api::{CopierClient, CopyEngine};
use crate::config::CoreConfig;
use crate::db::Database;
use crate::error::{LifecycleError, Result};
use crate::hub::{Hub, Subscription};
use crate::models::{
    AccountDetails, Actor, Capability, EventType, Group, IbStatus, LifecycleEvent, Member,
    MemberStatus, NewGroup, Role, Settlement, SettlementStatus, SettlementSubmission, Target,
    TradingStatus, User, SYSTEM_ACTOR_ID,
};

use super::{
    Change, GroupStateMachine, Joined, MembershipLifecycle, SettlementDecision,
    SettlementLifecycle, SettlementQuote, StatusChange, Transition,
};

pub struct LifecycleOrchestrator {
    db: Database,
    hub: Hub,
    members: MembershipLifecycle,
    groups: GroupStateMachine,
    settlements: SettlementLifecycle,
    config: CoreConfig,
}

fn require_any(actor: &Actor, caps: &[Capability]) -> Result<()> {
    if caps.iter().any(|cap| actor.can(*cap)) {
        return Ok(());
    }
    Err(LifecycleError::InsufficientPrivilege(format!(
        "{} ({}) lacks any of {:?}",
        actor.subscriber_id, actor.role, caps
    )))
}

impl LifecycleOrchestrator {
    pub fn new(db: Database, copier: Arc<dyn CopyEngine>, config: CoreConfig) -> Self {
        Self {
            hub: Hub::new(config.channel_capacity),
            members: MembershipLifecycle::new(db.clone(), copier.clone()),
            groups: GroupStateMachine::new(db.clone()),
            settlements: SettlementLifecycle::new(
                db.clone(),
                copier,
                config.auto_pause_on_submit,
            ),
            db,
            config,
        }
    }

    /// Open the configured database and copy-engine client.
    pub async fn connect(config: CoreConfig) -> Result<Self> {
        config.validate()?;
        let db = Database::new(&config.database_url).await?;
        let copier = CopierClient::new(&config.copier_base_url, config.copier_api_key.clone())
            .map_err(|e| LifecycleError::Internal(format!("{:#}", e)))?;
        Ok(Self::new(db, Arc::new(copier), config))
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    fn emit(&self, targets: &[Target], event: &LifecycleEvent) {
        let reached = self.hub.publish_many(targets, event);
        debug!(event = event.event_type.as_str(), reached, "Event published");
    }

    fn emit_member(&self, event_type: EventType, member: &Member, to_group: bool) {
        let mut targets = vec![
            Target::User(member.user_id.clone()),
            Target::Role(Role::Admin),
        ];
        if to_group {
            targets.push(Target::Group(member.group_id.clone()));
        }
        self.emit(&targets, &LifecycleEvent::member(event_type, member));
    }

    fn emit_trading_status(&self, group_id: &str, transition: Transition, actor: &str) {
        self.emit(
            &[Target::Group(group_id.to_string()), Target::Role(Role::Admin)],
            &LifecycleEvent::trading_status(group_id, transition.from, transition.to, actor),
        );
    }

    fn emit_settlement(&self, event_type: EventType, settlement: &Settlement) {
        self.emit(
            &[
                Target::Role(Role::Admin),
                Target::Group(settlement.group_id.clone()),
            ],
            &LifecycleEvent::settlement(event_type, settlement),
        );
    }

    /// Member-scoped operations may be performed by the member themselves or
    /// by someone who manages members.
    async fn authorize_member_action(&self, actor: &Actor, member_id: &str) -> Result<Member> {
        require_any(actor, &[Capability::ManageMembers, Capability::JoinGroups])?;
        let member = self.db.get_member(member_id).await?;
        actor.require_self_or(&member.user_id, Capability::ManageMembers)?;
        Ok(member)
    }

    // ==================== Users ====================

    /// Create or update a user profile.
    pub async fn register_user(&self, actor: &Actor, user: &User) -> Result<User> {
        actor.require(Capability::ManageMembers)?;
        crate::models::require_text("user_id", &user.user_id)?;
        let user = self.db.save_user(user).await?;
        info!(user_id = %user.user_id, role = %user.role, "User registered");
        Ok(user)
    }

    pub async fn get_user(&self, user_id: &str) -> Result<User> {
        self.db.get_user(user_id).await
    }

    pub async fn set_ib_status(
        &self,
        actor: &Actor,
        user_id: &str,
        status: IbStatus,
    ) -> Result<Change<User>> {
        actor.require(Capability::ManageIb)?;

        let user = self.db.get_user(user_id).await?;
        if user.ib_status == status {
            return Ok(Change::unchanged(user));
        }

        let previous = self.db.set_ib_status(user_id, status).await?;
        let user = self.db.get_user(user_id).await?;
        info!(user_id = %user_id, from = %previous, to = %status, "IB status changed");

        self.emit(
            &[Target::User(user_id.to_string()), Target::Role(Role::Admin)],
            &LifecycleEvent::ib_status(user_id, status),
        );
        Ok(Change::applied(user))
    }

    // ==================== Membership ====================

    pub async fn request_join(
        &self,
        actor: &Actor,
        user_id: &str,
        code: &str,
        account: &AccountDetails,
        graceful_switch: bool,
    ) -> Result<Joined> {
        actor.require_self_or(user_id, Capability::ManageMembers)?;
        if actor.subscriber_id == user_id {
            actor.require(Capability::JoinGroups)?;
        }

        let change = self
            .members
            .request_join(user_id, code, account, graceful_switch)
            .await?;

        if let Some(replaced) = &change.value.replaced {
            if self.hub.group_of(user_id).as_deref() == Some(replaced.group_id.as_str()) {
                self.hub.assign_group(user_id, None);
            }
            self.emit_member(EventType::MemberLeft, replaced, true);
        }
        self.emit_member(EventType::MemberJoinRequested, &change.value.member, false);

        change.into_result()
    }

    pub async fn approve_member(&self, actor: &Actor, member_id: &str) -> Result<Member> {
        actor.require(Capability::ManageMembers)?;

        let change = self.members.approve(member_id, &actor.subscriber_id).await?;
        if change.applied {
            let member = &change.value;
            self.hub.assign_group(&member.user_id, Some(&member.group_id));
            self.emit_member(EventType::MemberApproved, member, true);
        }
        change.into_result()
    }

    pub async fn reject_member(
        &self,
        actor: &Actor,
        member_id: &str,
        reason: Option<&str>,
    ) -> Result<Member> {
        actor.require(Capability::ManageMembers)?;

        let change = self.members.reject(member_id, reason).await?;
        if change.applied {
            self.emit_member(EventType::MemberRejected, &change.value, false);
        }
        change.into_result()
    }

    pub async fn leave_group(&self, actor: &Actor, member_id: &str) -> Result<Member> {
        self.authorize_member_action(actor, member_id).await?;

        let change = self.members.leave(member_id).await?;
        if change.applied {
            let member = &change.value;
            self.emit_member(EventType::MemberLeft, member, true);
            if self.hub.group_of(&member.user_id).as_deref() == Some(member.group_id.as_str()) {
                self.hub.assign_group(&member.user_id, None);
            }
        }
        change.into_result()
    }

    pub async fn pause_member(&self, actor: &Actor, member_id: &str) -> Result<Member> {
        self.authorize_member_action(actor, member_id).await?;

        let change = self.members.pause(member_id).await?;
        if change.applied {
            self.emit_member(EventType::MemberPaused, &change.value, false);
        }
        change.into_result()
    }

    pub async fn resume_member(&self, actor: &Actor, member_id: &str) -> Result<Member> {
        self.authorize_member_action(actor, member_id).await?;

        let change = self.members.resume(member_id).await?;
        if change.applied {
            self.emit_member(EventType::MemberResumed, &change.value, false);
        }
        change.into_result()
    }

    pub async fn get_member(&self, member_id: &str) -> Result<Member> {
        self.db.get_member(member_id).await
    }

    pub async fn list_members(
        &self,
        group_id: Option<&str>,
        status: Option<MemberStatus>,
    ) -> Result<Vec<Member>> {
        self.db.list_members(group_id, status).await
    }

    // ==================== Groups ====================

    pub async fn create_group(&self, actor: &Actor, request: &NewGroup) -> Result<Group> {
        actor.require(Capability::ManageGroups)?;

        let group = self.groups.create_group(request, actor).await?;
        self.emit(
            &[Target::Role(Role::Admin), Target::Role(Role::Master)],
            &LifecycleEvent::group(EventType::GroupCreated, &group),
        );
        Ok(group)
    }

    pub async fn set_group_trading_status(
        &self,
        actor: &Actor,
        group_id: &str,
        target: TradingStatus,
    ) -> Result<StatusChange> {
        if target == TradingStatus::Suspended {
            actor.require(Capability::SuspendGroups)?;
        } else {
            require_any(actor, &[Capability::ManageGroups, Capability::SuspendGroups])?;
        }

        let change = self
            .groups
            .set_trading_status(group_id, target, actor)
            .await?;
        if let Some(transition) = change.transition {
            self.emit_trading_status(group_id, transition, &actor.subscriber_id);
        }
        Ok(change)
    }

    pub async fn update_profit_sharing(
        &self,
        actor: &Actor,
        group_id: &str,
        percentage: Decimal,
    ) -> Result<Group> {
        actor.require(Capability::ManageGroups)?;

        let change = self
            .groups
            .update_profit_sharing(group_id, percentage, actor)
            .await?;
        if change.applied {
            self.emit(
                &[Target::Group(group_id.to_string()), Target::Role(Role::Admin)],
                &LifecycleEvent::group(EventType::GroupProfitShareChanged, &change.value),
            );
        }
        change.into_result()
    }

    /// Rotate a group's API key. Joins presenting the old key stop resolving.
    pub async fn regenerate_api_key(&self, actor: &Actor, group_id: &str) -> Result<Group> {
        actor.require(Capability::ManageGroups)?;

        let group = self.groups.regenerate_api_key(group_id, actor).await?;
        self.emit(
            &[Target::Role(Role::Admin)],
            &LifecycleEvent::group(EventType::GroupApiKeyRegenerated, &group),
        );
        Ok(group)
    }

    pub async fn delete_group(&self, actor: &Actor, group_id: &str) -> Result<Group> {
        actor.require(Capability::SuspendGroups)?;

        let change = self.groups.delete_group(group_id).await?;
        if change.applied {
            self.emit(
                &[Target::Role(Role::Admin), Target::Role(Role::Master)],
                &LifecycleEvent::group(EventType::GroupDeleted, &change.value),
            );
        }
        change.into_result()
    }

    pub async fn get_group(&self, group_id: &str) -> Result<Group> {
        self.groups.get_group(group_id).await
    }

    pub async fn list_groups(&self, include_deleted: bool) -> Result<Vec<Group>> {
        self.groups.list_groups(include_deleted).await
    }

    // ==================== Settlements ====================

    pub async fn calculate_settlement(
        &self,
        actor: &Actor,
        group_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<SettlementQuote> {
        require_any(
            actor,
            &[Capability::SubmitSettlements, Capability::ApproveSettlements],
        )?;
        self.settlements.calculate(group_id, start, end).await
    }

    pub async fn submit_settlement(
        &self,
        actor: &Actor,
        submission: &SettlementSubmission,
    ) -> Result<Settlement> {
        actor.require(Capability::SubmitSettlements)?;

        let decision = self
            .settlements
            .submit(submission, &actor.subscriber_id)
            .await?;
        self.publish_decision(EventType::SettlementSubmitted, &decision, &actor.subscriber_id);
        Ok(decision.settlement)
    }

    pub async fn begin_settlement_review(
        &self,
        actor: &Actor,
        settlement_id: &str,
    ) -> Result<Settlement> {
        actor.require(Capability::ApproveSettlements)?;

        let change = self.settlements.begin_review(settlement_id).await?;
        if change.applied {
            self.emit_settlement(EventType::SettlementProcessing, &change.value);
        }
        change.into_result()
    }

    pub async fn approve_settlement(&self, actor: &Actor, settlement_id: &str) -> Result<Settlement> {
        actor.require(Capability::ApproveSettlements)?;

        let decision = self
            .settlements
            .approve(settlement_id, &actor.subscriber_id)
            .await?;
        self.publish_decision(EventType::SettlementApproved, &decision, SYSTEM_ACTOR_ID);
        Ok(decision.settlement)
    }

    pub async fn reject_settlement(
        &self,
        actor: &Actor,
        settlement_id: &str,
        reason: &str,
    ) -> Result<Settlement> {
        actor.require(Capability::ApproveSettlements)?;

        let settlement = self
            .settlements
            .reject(settlement_id, &actor.subscriber_id, reason)
            .await?;
        self.emit_settlement(EventType::SettlementRejected, &settlement);
        Ok(settlement)
    }

    pub async fn annotate_settlement(
        &self,
        actor: &Actor,
        settlement_id: &str,
        remark: &str,
    ) -> Result<Settlement> {
        require_any(
            actor,
            &[Capability::SubmitSettlements, Capability::ApproveSettlements],
        )?;
        let remark = format!("[{}] {}", actor.subscriber_id, remark.trim());
        self.settlements.annotate(settlement_id, &remark).await
    }

    pub async fn get_settlement(&self, settlement_id: &str) -> Result<Settlement> {
        self.settlements.get(settlement_id).await
    }

    pub async fn list_pending_settlements(&self, group_id: Option<&str>) -> Result<Vec<Settlement>> {
        self.settlements.list_pending(group_id).await
    }

    pub async fn list_settlements(
        &self,
        status: Option<SettlementStatus>,
        group_id: Option<&str>,
    ) -> Result<Vec<Settlement>> {
        self.settlements.list(status, group_id).await
    }

    fn publish_decision(&self, event_type: EventType, decision: &SettlementDecision, actor: &str) {
        self.emit_settlement(event_type, &decision.settlement);
        if let Some(transition) = decision.group_transition {
            self.emit_trading_status(&decision.settlement.group_id, transition, actor);
        }
    }

    // ==================== Subscriptions ====================

    /// Open a live channel for the actor, indexing them under their group.
    pub async fn subscribe(&self, actor: &Actor) -> Result<Subscription> {
        match self.db.get_user(&actor.subscriber_id).await {
            Ok(user) => self
                .hub
                .assign_group(&user.user_id, user.group_id.as_deref()),
            Err(LifecycleError::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }
        Ok(self.hub.subscribe(&actor.subscriber_id, actor.role))
    }

    pub fn unsubscribe(&self, channel_id: u64) -> bool {
        self.hub.unsubscribe(channel_id)
    }

    pub fn publish_to_user(&self, user_id: &str, event: &LifecycleEvent) -> usize {
        self.hub.publish_to_user(user_id, event)
    }

    pub fn publish_to_role(&self, role: Role, event: &LifecycleEvent) -> usize {
        self.hub.publish_to_role(role, event)
    }

    pub fn publish_to_group(&self, group_id: &str, event: &LifecycleEvent) -> usize {
        self.hub.publish_to_group(group_id, event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MemoryCopyEngine;
    use crate::error::ErrorKind;
    use crate::lifecycle::testing;
    use crate::models::{SettlementCycle, SettlementPeriod};
    use chrono::Duration;
    use rust_decimal_macros::dec;

    struct Fixture {
        core: LifecycleOrchestrator,
        engine: Arc<MemoryCopyEngine>,
        admin: Actor,
    }

    async fn fixture() -> Fixture {
        let engine = testing::engine();
        let core =
            LifecycleOrchestrator::new(testing::database().await, engine.clone(), testing::config());
        Fixture {
            core,
            engine,
            admin: Actor::for_role("admin-1", Role::Admin),
        }
    }

    async fn user(f: &Fixture, user_id: &str) -> Actor {
        f.core
            .register_user(&f.admin, &User::new(user_id, user_id, Role::User))
            .await
            .unwrap();
        f.core
            .set_ib_status(&f.admin, user_id, IbStatus::Approved)
            .await
            .unwrap();
        Actor::for_role(user_id, Role::User)
    }

    async fn group(f: &Fixture, name: &str, pct: Decimal) -> Group {
        f.core
            .create_group(
                &f.admin,
                &NewGroup {
                    name: name.to_string(),
                    company_name: format!("{name} Ltd"),
                    profit_sharing_percentage: pct,
                    settlement_cycle: SettlementCycle::Weekly,
                },
            )
            .await
            .unwrap()
    }

    fn drain(sub: &Subscription) -> Vec<EventType> {
        std::iter::from_fn(|| sub.try_recv())
            .map(|event| event.event_type)
            .collect()
    }

    #[tokio::test]
    async fn test_join_then_approve_scenario() {
        let f = fixture().await;
        let g = group(&f, "Alpha", dec!(80)).await;
        assert_eq!(g.trading_status, TradingStatus::Paused);
        let u = user(&f, "u1").await;

        let joined = f
            .core
            .request_join(&u, "u1", &g.referral_code, &testing::account("mt5-1"), false)
            .await
            .unwrap();
        assert_eq!(joined.member.status, MemberStatus::Pending);

        let before = f.core.get_group(&g.group_id).await.unwrap().active_members;
        let member = f
            .core
            .approve_member(&f.admin, &joined.member.member_id)
            .await
            .unwrap();
        assert_eq!(member.status, MemberStatus::Active);

        let after = f.core.get_group(&g.group_id).await.unwrap();
        assert_eq!(after.active_members, before + 1);
        assert_eq!(
            f.core.get_user("u1").await.unwrap().group_id,
            Some(g.group_id.clone())
        );
    }

    #[tokio::test]
    async fn test_settlement_approval_resumes_scenario() {
        let f = fixture().await;
        let g = group(&f, "Alpha", dec!(80)).await;
        f.core
            .set_group_trading_status(&f.admin, &g.group_id, TradingStatus::Active)
            .await
            .unwrap();
        f.engine.set_profit(&g.group_id, dec!(15000));

        let master = Actor::for_role("master-1", Role::Master);
        let end = Utc::now();
        let settlement = f
            .core
            .submit_settlement(
                &master,
                &SettlementSubmission {
                    group_id: g.group_id.clone(),
                    period: SettlementPeriod::new(end - Duration::days(7), end).unwrap(),
                    payment_method: "bank_transfer".to_string(),
                    payment_reference: "UTR-77".to_string(),
                    amount_paid: dec!(12000),
                },
            )
            .await
            .unwrap();
        assert!(settlement.auto_pause_triggered);
        assert_eq!(
            f.core.get_group(&g.group_id).await.unwrap().trading_status,
            TradingStatus::Paused
        );

        let approved = f
            .core
            .approve_settlement(&f.admin, &settlement.settlement_id)
            .await
            .unwrap();
        assert_eq!(approved.status, SettlementStatus::Approved);
        assert!(approved.resume_time.is_some());
        assert_eq!(
            f.core.get_group(&g.group_id).await.unwrap().trading_status,
            TradingStatus::Active
        );
    }

    #[tokio::test]
    async fn test_switch_scenario_validates_target_first() {
        let f = fixture().await;
        let a = group(&f, "Alpha", dec!(50)).await;
        let b = group(&f, "Beta", dec!(50)).await;
        let u = user(&f, "u1").await;

        let first = f
            .core
            .request_join(&u, "u1", &a.referral_code, &testing::account("acct-a"), false)
            .await
            .unwrap()
            .member;
        f.core.approve_member(&f.admin, &first.member_id).await.unwrap();

        let err = f
            .core
            .request_join(&u, "u1", "REF_NOPE", &testing::account("acct-b"), true)
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::GroupNotFound(_)));
        let untouched = f.core.get_member(&first.member_id).await.unwrap();
        assert_eq!(untouched.status, MemberStatus::Active);
        assert_eq!(f.engine.is_copying("acct-a"), Some(true));

        let joined = f
            .core
            .request_join(&u, "u1", &b.referral_code, &testing::account("acct-b"), true)
            .await
            .unwrap();
        assert_eq!(joined.member.group_id, b.group_id);
        assert_eq!(
            f.core.get_member(&first.member_id).await.unwrap().status,
            MemberStatus::Left
        );
        assert_eq!(f.engine.is_copying("acct-a"), Some(false));
    }

    #[tokio::test]
    async fn test_switch_with_failed_deactivation_is_partial() {
        let f = fixture().await;
        let a = group(&f, "Alpha", dec!(50)).await;
        let b = group(&f, "Beta", dec!(50)).await;
        let u = user(&f, "u1").await;

        let first = f
            .core
            .request_join(&u, "u1", &a.referral_code, &testing::account("acct-a"), false)
            .await
            .unwrap()
            .member;
        f.core.approve_member(&f.admin, &first.member_id).await.unwrap();

        f.engine.fail_toggles(true);
        let err = f
            .core
            .request_join(&u, "u1", &b.referral_code, &testing::account("acct-b"), true)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PartialFailure);

        // The switch committed; only the account toggle needs reconciling.
        let open = f.core.list_members(Some(&b.group_id), None).await.unwrap();
        assert_eq!(open.len(), 1);
        assert!(f.core.get_user("u1").await.unwrap().group_id.is_none());
    }

    #[tokio::test]
    async fn test_capabilities_checked() {
        let f = fixture().await;
        let g = group(&f, "Alpha", dec!(50)).await;
        let u = user(&f, "u1").await;
        let manager = Actor::for_role("mgr", Role::Manager);

        let err = f
            .core
            .set_group_trading_status(&u, &g.group_id, TradingStatus::Active)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);

        let err = f
            .core
            .set_group_trading_status(&manager, &g.group_id, TradingStatus::Suspended)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);

        f.core
            .set_group_trading_status(&f.admin, &g.group_id, TradingStatus::Suspended)
            .await
            .unwrap();
        let err = f
            .core
            .set_group_trading_status(&manager, &g.group_id, TradingStatus::Active)
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::InsufficientPrivilege(_)));

        // Joining on someone else's behalf needs member management.
        let other = user(&f, "u2").await;
        let err = f
            .core
            .request_join(&other, "u1", &g.referral_code, &testing::account("x"), false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);

        let err = f
            .core
            .approve_settlement(&u, "missing")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
    }

    #[tokio::test]
    async fn test_events_follow_applied_transitions() {
        let f = fixture().await;
        let g = group(&f, "Alpha", dec!(50)).await;
        let u = user(&f, "u1").await;
        let admin_feed = f.core.subscribe(&f.admin).await.unwrap();
        let user_feed = f.core.subscribe(&u).await.unwrap();

        let member_id = f
            .core
            .request_join(&u, "u1", &g.referral_code, &testing::account("a1"), false)
            .await
            .unwrap()
            .member
            .member_id;
        f.core.approve_member(&f.admin, &member_id).await.unwrap();
        // Second approve is a no-op and publishes nothing.
        f.core.approve_member(&f.admin, &member_id).await.unwrap();

        f.core
            .set_group_trading_status(&f.admin, &g.group_id, TradingStatus::Active)
            .await
            .unwrap();
        f.core
            .set_group_trading_status(&f.admin, &g.group_id, TradingStatus::Active)
            .await
            .unwrap();

        assert_eq!(
            drain(&user_feed),
            vec![
                EventType::MemberJoinRequested,
                EventType::MemberApproved,
                EventType::GroupTradingStatusChanged,
            ]
        );
        assert_eq!(
            drain(&admin_feed),
            vec![
                EventType::MemberJoinRequested,
                EventType::MemberApproved,
                EventType::GroupTradingStatusChanged,
            ]
        );

        drop(admin_feed);
        drop(user_feed);
        assert_eq!(f.core.hub().stats().channels, 0);
    }

    #[tokio::test]
    async fn test_failed_write_publishes_nothing() {
        let f = fixture().await;
        let g = group(&f, "Alpha", dec!(50)).await;
        let admin_feed = f.core.subscribe(&f.admin).await.unwrap();
        f.engine.fail_profit(true);

        let end = Utc::now();
        let err = f
            .core
            .submit_settlement(
                &f.admin,
                &SettlementSubmission {
                    group_id: g.group_id.clone(),
                    period: SettlementPeriod::new(end - Duration::days(1), end).unwrap(),
                    payment_method: "upi".to_string(),
                    payment_reference: "r-1".to_string(),
                    amount_paid: dec!(1),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CollaboratorUnavailable);
        assert!(admin_feed.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_delete_group_refused_with_members() {
        let f = fixture().await;
        let g = group(&f, "Alpha", dec!(50)).await;
        let u = user(&f, "u1").await;
        let member = f
            .core
            .request_join(&u, "u1", &g.referral_code, &testing::account("a1"), false)
            .await
            .unwrap()
            .member;

        let err = f.core.delete_group(&f.admin, &g.group_id).await.unwrap_err();
        assert!(matches!(err, LifecycleError::GroupHasMembers { .. }));

        f.core.leave_group(&u, &member.member_id).await.unwrap();
        let deleted = f.core.delete_group(&f.admin, &g.group_id).await.unwrap();
        assert!(deleted.is_deleted());
        assert!(matches!(
            f.core.get_group(&g.group_id).await.unwrap_err(),
            LifecycleError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_annotation_records_author() {
        let f = fixture().await;
        let g = group(&f, "Alpha", dec!(50)).await;
        let end = Utc::now();
        let settlement = f
            .core
            .submit_settlement(
                &f.admin,
                &SettlementSubmission {
                    group_id: g.group_id.clone(),
                    period: SettlementPeriod::new(end - Duration::days(1), end).unwrap(),
                    payment_method: "upi".to_string(),
                    payment_reference: "r-1".to_string(),
                    amount_paid: dec!(1),
                },
            )
            .await
            .unwrap();

        let noted = f
            .core
            .annotate_settlement(&f.admin, &settlement.settlement_id, "checked bank statement")
            .await
            .unwrap();
        assert_eq!(
            noted.remarks.as_deref(),
            Some("[admin-1] checked bank statement")
        );
        tokio_test::assert_ok!(f.core.list_pending_settlements(Some(&g.group_id)).await);
    }

    #[tokio::test]
    async fn test_master_cannot_lift_settlement_pause() {
        let f = fixture().await;
        let master = Actor::for_role("master-1", Role::Master);
        let g = f
            .core
            .create_group(
                &master,
                &NewGroup {
                    name: "Owned".to_string(),
                    company_name: "Owned Ltd".to_string(),
                    profit_sharing_percentage: dec!(80),
                    settlement_cycle: SettlementCycle::Weekly,
                },
            )
            .await
            .unwrap();
        f.core
            .set_group_trading_status(&master, &g.group_id, TradingStatus::Active)
            .await
            .unwrap();

        let rival = Actor::for_role("master-2", Role::Master);
        let err = f
            .core
            .set_group_trading_status(&rival, &g.group_id, TradingStatus::Paused)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);

        f.engine.set_profit(&g.group_id, dec!(1000));
        let end = Utc::now();
        let settlement = f
            .core
            .submit_settlement(
                &master,
                &SettlementSubmission {
                    group_id: g.group_id.clone(),
                    period: SettlementPeriod::new(end - Duration::days(7), end).unwrap(),
                    payment_method: "bank_transfer".to_string(),
                    payment_reference: "UTR-9".to_string(),
                    amount_paid: dec!(800),
                },
            )
            .await
            .unwrap();
        assert!(settlement.auto_pause_triggered);

        let err = f
            .core
            .set_group_trading_status(&master, &g.group_id, TradingStatus::Active)
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::AwaitingSettlement { .. }));
        assert_eq!(
            f.core.get_group(&g.group_id).await.unwrap().trading_status,
            TradingStatus::Paused
        );
        assert_eq!(
            f.core
                .get_settlement(&settlement.settlement_id)
                .await
                .unwrap()
                .status,
            SettlementStatus::Pending
        );

        f.core
            .approve_settlement(&f.admin, &settlement.settlement_id)
            .await
            .unwrap();
        let resumed = f.core.get_group(&g.group_id).await.unwrap();
        assert_eq!(resumed.trading_status, TradingStatus::Active);
        assert!(resumed.settlement_hold.is_none());

        // With the hold released the owner toggles freely again.
        f.core
            .set_group_trading_status(&master, &g.group_id, TradingStatus::Paused)
            .await
            .unwrap();
        f.core
            .set_group_trading_status(&master, &g.group_id, TradingStatus::Active)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_rotated_api_key_retires_old_key() {
        let f = fixture().await;
        let g = group(&f, "Alpha", dec!(50)).await;
        let u = user(&f, "u1").await;
        let admin_feed = f.core.subscribe(&f.admin).await.unwrap();

        let err = f.core.regenerate_api_key(&u, &g.group_id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);

        let rotated = f.core.regenerate_api_key(&f.admin, &g.group_id).await.unwrap();
        assert_ne!(rotated.api_key, g.api_key);
        assert_eq!(drain(&admin_feed), vec![EventType::GroupApiKeyRegenerated]);

        let err = f
            .core
            .request_join(&u, "u1", &g.api_key, &testing::account("a1"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::GroupNotFound(_)));

        let joined = f
            .core
            .request_join(&u, "u1", &rotated.api_key, &testing::account("a1"), false)
            .await
            .unwrap();
        assert_eq!(joined.member.group_id, g.group_id);
    }
}
