//! In-process copy engine.
//!
//! Serves configured per-group profits and remembers which accounts are
//! copying. Used by the `demo` command and by tests; failures can be switched
//! on to exercise partial-failure paths.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;

use crate::error::{LifecycleError, Result};
use crate::models::SettlementPeriod;

use super::CopyEngine;

#[derive(Default)]
pub struct MemoryCopyEngine {
    profits: DashMap<String, Decimal>,
    copying: DashMap<String, bool>,
    fail_toggles: AtomicBool,
    fail_profit: AtomicBool,
}

impl MemoryCopyEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Profit reported for `group_id` regardless of period.
    pub fn set_profit(&self, group_id: &str, profit: Decimal) {
        self.profits.insert(group_id.to_string(), profit);
    }

    pub fn fail_toggles(&self, fail: bool) {
        self.fail_toggles.store(fail, Ordering::SeqCst);
    }

    pub fn fail_profit(&self, fail: bool) {
        self.fail_profit.store(fail, Ordering::SeqCst);
    }

    /// Last copying state set for the account, if any.
    pub fn is_copying(&self, account_id: &str) -> Option<bool> {
        self.copying.get(account_id).map(|entry| *entry)
    }
}

#[async_trait]
impl CopyEngine for MemoryCopyEngine {
    async fn gross_profit(&self, group_id: &str, _period: &SettlementPeriod) -> Result<Decimal> {
        if self.fail_profit.load(Ordering::SeqCst) {
            return Err(LifecycleError::CollaboratorUnavailable {
                collaborator: "copy engine",
                message: "profit query failed".to_string(),
            });
        }
        Ok(self
            .profits
            .get(group_id)
            .map(|entry| *entry)
            .unwrap_or(Decimal::ZERO))
    }

    async fn set_copying(&self, account_id: &str, enabled: bool) -> Result<()> {
        if self.fail_toggles.load(Ordering::SeqCst) {
            return Err(LifecycleError::CollaboratorUnavailable {
                collaborator: "copy engine",
                message: format!("toggle for {} failed", account_id),
            });
        }
        self.copying.insert(account_id.to_string(), enabled);
        Ok(())
    }
}
