//! Lifecycle state machines and the orchestrator that fronts them.
//!
//! Each state machine writes to the document store and calls the copy
//! engine; the orchestrator checks capabilities first and publishes hub
//! events only for transitions that were actually applied.

mod group_status;
mod membership;
mod orchestrator;
mod settlement;

use crate::error::{LifecycleError, Result};

pub use group_status::{plan_transition, GroupStateMachine, StatusChange, Transition};
pub use membership::{Joined, MembershipLifecycle};
pub use orchestrator::LifecycleOrchestrator;
pub use settlement::{SettlementDecision, SettlementLifecycle, SettlementQuote};

/// Result of a mutation that may have been a no-op.
#[derive(Debug, Clone)]
pub struct Change<T> {
    pub value: T,
    /// False when the entity was already in the requested state
    pub applied: bool,
    /// Follow-up step that failed after the write committed
    incomplete: Option<(String, String, String)>,
}

impl<T> Change<T> {
    pub fn applied(value: T) -> Self {
        Self {
            value,
            applied: true,
            incomplete: None,
        }
    }

    pub fn unchanged(value: T) -> Self {
        Self {
            value,
            applied: false,
            incomplete: None,
        }
    }

    /// Record that `failed` did not happen although `completed` did.
    pub(crate) fn with_failure(
        mut self,
        completed: &str,
        failed: &str,
        cause: &LifecycleError,
    ) -> Self {
        self.incomplete = Some((completed.to_string(), failed.to_string(), cause.to_string()));
        self
    }

    pub fn is_complete(&self) -> bool {
        self.incomplete.is_none()
    }

    /// The value, or `PartialFailure` if a follow-up step failed.
    pub fn into_result(self) -> Result<T> {
        match self.incomplete {
            None => Ok(self.value),
            Some((completed, failed, reason)) => Err(LifecycleError::PartialFailure {
                completed,
                failed,
                reason,
            }),
        }
    }
}
