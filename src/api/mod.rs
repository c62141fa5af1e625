//! Copy-engine collaborator: the trait the lifecycle depends on and its
//! HTTP and in-process implementations.

mod copier_client;
mod memory;
mod types;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::Result;
use crate::models::SettlementPeriod;

pub use copier_client::CopierClient;
pub use memory::MemoryCopyEngine;
pub use types::*;

/// External system that mirrors master trades onto member accounts.
#[async_trait]
pub trait CopyEngine: Send + Sync {
    /// Total profit of copied trades for the group within the period.
    async fn gross_profit(&self, group_id: &str, period: &SettlementPeriod) -> Result<Decimal>;

    /// Start or stop copying onto a member's trading account.
    async fn set_copying(&self, account_id: &str, enabled: bool) -> Result<()>;
}
