//! Group trading state machine and group administration.

use rust_decimal::Decimal;
use tracing::info;

use crate::db::Database;
use crate::error::{LifecycleError, Result};
use crate::models::{
    validate_profit_share, Actor, Capability, Group, GroupStatus, NewGroup, Role, TradingStatus,
};

use super::Change;

/// An applied trading-status move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: TradingStatus,
    pub to: TradingStatus,
}

/// Decide whether `actor` may move a group from `current` to `target`.
///
/// `Ok(None)` means the group is already there. Moving between active and
/// paused needs [`Capability::ManageGroups`]; entering or leaving suspended
/// needs [`Capability::SuspendGroups`].
pub fn plan_transition(
    current: TradingStatus,
    target: TradingStatus,
    actor: &Actor,
) -> Result<Option<Transition>> {
    if current == target {
        return Ok(None);
    }

    if current == TradingStatus::Suspended || target == TradingStatus::Suspended {
        actor.require(Capability::SuspendGroups)?;
    } else {
        actor.require(Capability::ManageGroups)?;
    }

    Ok(Some(Transition {
        from: current,
        to: target,
    }))
}

/// Masters administer only the groups they created.
fn require_owner(actor: &Actor, group: &Group) -> Result<()> {
    if actor.role == Role::Master && group.created_by != actor.subscriber_id {
        return Err(LifecycleError::InsufficientPrivilege(format!(
            "{} did not create group {}",
            actor.subscriber_id, group.group_id
        )));
    }
    Ok(())
}

fn new_api_key() -> String {
    format!("cpk_{}", uuid::Uuid::new_v4().simple())
}

/// Outcome of a trading-status request.
#[derive(Debug, Clone)]
pub struct StatusChange {
    pub group: Group,
    pub transition: Option<Transition>,
}

pub struct GroupStateMachine {
    db: Database,
}

impl GroupStateMachine {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    async fn live_group(&self, group_id: &str) -> Result<Group> {
        let group = self.db.get_group(group_id).await?;
        if group.is_deleted() {
            return Err(LifecycleError::not_found("group", group_id));
        }
        Ok(group)
    }

    /// Move a group's trading status.
    ///
    /// Resuming a group that an undecided settlement auto-paused is reserved
    /// for actors holding [`Capability::SuspendGroups`].
    pub async fn set_trading_status(
        &self,
        group_id: &str,
        target: TradingStatus,
        actor: &Actor,
    ) -> Result<StatusChange> {
        let group = self.live_group(group_id).await?;
        require_owner(actor, &group)?;

        let Some(transition) = plan_transition(group.trading_status, target, actor)? else {
            return Ok(StatusChange {
                group,
                transition: None,
            });
        };

        let group = self
            .db
            .update_trading_status(
                group_id,
                transition.from,
                transition.to,
                transition.to == TradingStatus::Active && !actor.can(Capability::SuspendGroups),
            )
            .await?;

        info!(
            group_id = %group_id,
            from = %transition.from,
            to = %transition.to,
            actor = %actor.subscriber_id,
            "Group trading status changed"
        );

        Ok(StatusChange {
            group,
            transition: Some(transition),
        })
    }

    /// Create a group. New groups start paused.
    pub async fn create_group(&self, request: &NewGroup, actor: &Actor) -> Result<Group> {
        request.validate()?;

        let now = chrono::Utc::now();
        let referral = uuid::Uuid::new_v4().simple().to_string();
        let group = Group {
            group_id: uuid::Uuid::new_v4().to_string(),
            name: request.name.trim().to_string(),
            company_name: request.company_name.trim().to_string(),
            referral_code: format!("REF_{}", referral[..8].to_ascii_uppercase()),
            api_key: new_api_key(),
            trading_status: TradingStatus::Paused,
            status: GroupStatus::Active,
            profit_sharing_percentage: request.profit_sharing_percentage,
            settlement_cycle: request.settlement_cycle,
            settlement_hold: None,
            total_members: 0,
            active_members: 0,
            created_by: actor.subscriber_id.clone(),
            created_at: now,
            updated_at: now,
        };

        self.db.insert_group(&group).await?;

        info!(
            group_id = %group.group_id,
            referral_code = %group.referral_code,
            created_by = %group.created_by,
            "Group created"
        );
        Ok(group)
    }

    /// Change the live percentage. Existing settlements keep their snapshot.
    pub async fn update_profit_sharing(
        &self,
        group_id: &str,
        percentage: Decimal,
        actor: &Actor,
    ) -> Result<Change<Group>> {
        validate_profit_share(percentage)?;

        let group = self.live_group(group_id).await?;
        require_owner(actor, &group)?;
        if group.profit_sharing_percentage == percentage {
            return Ok(Change::unchanged(group));
        }

        let group = self.db.update_profit_share(group_id, percentage).await?;
        info!(group_id = %group_id, percentage = %percentage, "Profit share updated");
        Ok(Change::applied(group))
    }

    /// Issue a fresh API key; the previous key stops resolving immediately.
    pub async fn regenerate_api_key(&self, group_id: &str, actor: &Actor) -> Result<Group> {
        actor.require(Capability::ManageGroups)?;
        let group = self.live_group(group_id).await?;
        require_owner(actor, &group)?;

        let group = self
            .db
            .rotate_api_key(group_id, &group.api_key, &new_api_key())
            .await?;
        info!(group_id = %group_id, actor = %actor.subscriber_id, "Group API key regenerated");
        Ok(group)
    }

    /// Soft delete. Refused while the group has open memberships.
    pub async fn delete_group(&self, group_id: &str) -> Result<Change<Group>> {
        let deleted = self.db.soft_delete_group(group_id).await?;
        let group = self.db.get_group(group_id).await?;

        if deleted {
            info!(group_id = %group_id, "Group deleted");
            Ok(Change::applied(group))
        } else {
            Ok(Change::unchanged(group))
        }
    }

    pub async fn get_group(&self, group_id: &str) -> Result<Group> {
        self.live_group(group_id).await
    }

    pub async fn list_groups(&self, include_deleted: bool) -> Result<Vec<Group>> {
        self.db.list_groups(include_deleted).await
    }
}
