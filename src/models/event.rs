//! Lifecycle notification events delivered through the hub.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{Group, IbStatus, Member, Role, Settlement, TradingStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    MemberJoinRequested,
    MemberApproved,
    MemberRejected,
    MemberLeft,
    MemberPaused,
    MemberResumed,
    IbStatusChanged,
    GroupCreated,
    GroupTradingStatusChanged,
    GroupProfitShareChanged,
    GroupApiKeyRegenerated,
    GroupDeleted,
    SettlementSubmitted,
    SettlementProcessing,
    SettlementApproved,
    SettlementRejected,
    KeepAlive,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::MemberJoinRequested => "member_join_requested",
            EventType::MemberApproved => "member_approved",
            EventType::MemberRejected => "member_rejected",
            EventType::MemberLeft => "member_left",
            EventType::MemberPaused => "member_paused",
            EventType::MemberResumed => "member_resumed",
            EventType::IbStatusChanged => "ib_status_changed",
            EventType::GroupCreated => "group_created",
            EventType::GroupTradingStatusChanged => "group_trading_status_changed",
            EventType::GroupProfitShareChanged => "group_profit_share_changed",
            EventType::GroupApiKeyRegenerated => "group_api_key_regenerated",
            EventType::GroupDeleted => "group_deleted",
            EventType::SettlementSubmitted => "settlement_submitted",
            EventType::SettlementProcessing => "settlement_processing",
            EventType::SettlementApproved => "settlement_approved",
            EventType::SettlementRejected => "settlement_rejected",
            EventType::KeepAlive => "keep_alive",
        }
    }
}

/// Who an event is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Target {
    User(String),
    Role(Role),
    Group(String),
}

/// An ephemeral notification. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub event_type: EventType,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl LifecycleEvent {
    pub fn new(event_type: EventType, payload: Value) -> Self {
        Self {
            event_type,
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn keep_alive() -> Self {
        Self::new(EventType::KeepAlive, Value::Null)
    }

    pub fn member(event_type: EventType, member: &Member) -> Self {
        Self::new(
            event_type,
            json!({
                "member_id": member.member_id,
                "user_id": member.user_id,
                "group_id": member.group_id,
                "status": member.status,
                "rejection_reason": member.rejection_reason,
            }),
        )
    }

    pub fn ib_status(user_id: &str, status: IbStatus) -> Self {
        Self::new(
            EventType::IbStatusChanged,
            json!({ "user_id": user_id, "ib_status": status }),
        )
    }

    pub fn group(event_type: EventType, group: &Group) -> Self {
        Self::new(
            event_type,
            json!({
                "group_id": group.group_id,
                "name": group.name,
                "trading_status": group.trading_status,
                "profit_sharing_percentage": group.profit_sharing_percentage,
                "total_members": group.total_members,
                "active_members": group.active_members,
            }),
        )
    }

    pub fn trading_status(
        group_id: &str,
        from: TradingStatus,
        to: TradingStatus,
        actor: &str,
    ) -> Self {
        Self::new(
            EventType::GroupTradingStatusChanged,
            json!({
                "group_id": group_id,
                "from": from,
                "to": to,
                "changed_by": actor,
            }),
        )
    }

    pub fn settlement(event_type: EventType, settlement: &Settlement) -> Self {
        Self::new(
            event_type,
            json!({
                "settlement_id": settlement.settlement_id,
                "group_id": settlement.group_id,
                "status": settlement.status,
                "amount_due": settlement.amount_due,
                "amount_paid": settlement.amount_paid,
                "auto_pause_triggered": settlement.auto_pause_triggered,
                "resume_time": settlement.resume_time,
            }),
        )
    }
}
