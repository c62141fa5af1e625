//! Runtime configuration.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LifecycleError, Result};
use crate::hub::DEFAULT_CHANNEL_CAPACITY;

/// Configuration for the lifecycle core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// SQLite connection string
    pub database_url: String,

    /// Base URL of the copy engine's HTTP API
    pub copier_base_url: String,

    /// Bearer key for the copy engine, if it requires one
    pub copier_api_key: Option<String>,

    /// Queue bound per live subscriber channel
    pub channel_capacity: usize,

    /// Idle seconds before a keep-alive frame is sent
    pub keepalive_secs: u64,

    /// Pause an active group's trading when a settlement is submitted
    pub auto_pause_on_submit: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:./copyhub.db?mode=rwc".to_string(),
            copier_base_url: "http://localhost:8080".to_string(),
            copier_api_key: None,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            keepalive_secs: 30,
            auto_pause_on_submit: true,
        }
    }
}

impl CoreConfig {
    /// Defaults overridden by `COPYHUB_*` variables, reading `.env` first.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::default().with_overrides(|key| env::var(key).ok())
    }

    fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("COPYHUB_DATABASE_URL") {
            self.database_url = url;
        }
        if let Some(url) = lookup("COPYHUB_COPIER_URL") {
            self.copier_base_url = url;
        }
        if let Some(key) = lookup("COPYHUB_COPIER_API_KEY") {
            self.copier_api_key = Some(key).filter(|k| !k.is_empty());
        }
        if let Some(raw) = lookup("COPYHUB_CHANNEL_CAPACITY") {
            self.channel_capacity = parse_var("COPYHUB_CHANNEL_CAPACITY", &raw)?;
        }
        if let Some(raw) = lookup("COPYHUB_KEEPALIVE_SECS") {
            self.keepalive_secs = parse_var("COPYHUB_KEEPALIVE_SECS", &raw)?;
        }
        if let Some(raw) = lookup("COPYHUB_AUTO_PAUSE_ON_SUBMIT") {
            self.auto_pause_on_submit = parse_var("COPYHUB_AUTO_PAUSE_ON_SUBMIT", &raw)?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.channel_capacity == 0 {
            return Err(LifecycleError::Validation(
                "channel_capacity must be at least 1".to_string(),
            ));
        }
        if self.keepalive_secs == 0 {
            return Err(LifecycleError::Validation(
                "keepalive_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }
}

fn parse_var<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| LifecycleError::Validation(format!("invalid value '{}' for {}", raw, key)))
}
