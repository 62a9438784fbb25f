//! Boundaries to the outside world: metric collection, routing control and
//! notification delivery.

use serde::Serialize;
use tether_common::models::{Member, Metrics};

use crate::error::{CollectError, ControlError, NotifyError};

/// Gathers one health sample for a member.
#[async_trait::async_trait]
pub trait Collector: Send + Sync {
    async fn collect(&self, member: &Member) -> Result<Metrics, CollectError>;

    /// Check the member can be collected from at all (interface present,
    /// diagnostics endpoint reachable).
    async fn validate(&self, member: &Member) -> Result<(), CollectError>;
}

/// Applies routing decisions.
#[async_trait::async_trait]
pub trait Controller: Send + Sync {
    /// Move the active uplink from `from` to `to`.
    async fn switch(&self, from: &str, to: &str) -> Result<(), ControlError>;

    async fn current_member(&self) -> Result<Option<String>, ControlError>;

    /// Set a member's routing metric. Lower metrics are preferred.
    async fn apply_metric(&self, member: &str, metric: u32) -> Result<(), ControlError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Emergency,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Emergency => "emergency",
        }
    }
}

/// Delivers human-facing notifications.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn send_notification(
        &self,
        title: &str,
        message: &str,
        priority: Priority,
        retry: bool,
    ) -> Result<(), NotifyError>;

    fn is_rate_limited(&self) -> bool;
}

/// A notification queued by the engine after a state transition.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub title: String,
    pub message: String,
    pub priority: Priority,
    pub decision_id: String,
}
