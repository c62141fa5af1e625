//! Wire types for the copy-engine HTTP API.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Response from `GET /groups/{group_id}/profit`.
#[derive(Debug, Clone, Deserialize)]
pub struct ProfitResponse {
    pub total_profit: Decimal,
    #[serde(default)]
    pub trade_count: Option<u64>,
}

/// Body of `PUT /control/toggle/{account_id}`.
#[derive(Debug, Clone, Serialize)]
pub struct ToggleRequest {
    pub enabled: bool,
}

/// Response from the toggle endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ToggleResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
}
