//! Lifecycle core for copy-trading groups.
//!
//! Tracks who belongs to which group, whether each group is currently
//! trading, and the profit-sharing settlements groups owe, and pushes every
//! applied transition to live subscribers through the notification hub.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod hub;
pub mod lifecycle;
pub mod models;

pub use config::CoreConfig;
pub use error::{ErrorKind, LifecycleError, Result};
pub use lifecycle::LifecycleOrchestrator;
