//! Asynchronous notification delivery.
//!
//! The decision task queues [`Notification`]s without waiting; the
//! dispatcher drains the queue, confirms outbound connectivity and retries
//! failed deliveries with exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::NotificationConfig;
use crate::error::NotifyError;
use crate::interfaces::{Notification, Notifier};
use crate::util::check_tcp_reachable;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

pub struct NotificationDispatcher {
    notifier: Arc<dyn Notifier>,
    cfg: NotificationConfig,
    reach_target: Option<String>,
}

impl NotificationDispatcher {
    pub fn new(notifier: Arc<dyn Notifier>, cfg: NotificationConfig) -> Self {
        Self {
            reach_target: Some(cfg.connectivity_target.clone()),
            notifier,
            cfg,
        }
    }

    /// Skip the connectivity check, e.g. in simulation.
    pub fn without_connectivity_check(mut self) -> Self {
        self.reach_target = None;
        self
    }

    /// Run until every sender is dropped and the queue is drained.
    pub fn spawn(self, mut rx: mpsc::Receiver<Notification>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(n) = rx.recv().await {
                if let Err(e) = self.deliver(&n).await {
                    warn!(
                        decision = %n.decision_id,
                        title = %n.title,
                        error = %e,
                        "notification not delivered"
                    );
                }
            }
            debug!("notification dispatcher stopped");
        })
    }

    async fn online(&self) -> bool {
        match &self.reach_target {
            Some(target) => check_tcp_reachable(target, self.cfg.reach_timeout).await,
            None => true,
        }
    }

    pub async fn deliver(&self, n: &Notification) -> Result<(), NotifyError> {
        if !self.cfg.enabled {
            return Ok(());
        }
        if self.notifier.is_rate_limited() {
            return Err(NotifyError::RateLimited);
        }

        let attempts = self.cfg.retry_attempts.max(1);
        let mut backoff = INITIAL_BACKOFF;
        let mut last = NotifyError::Offline;
        for attempt in 1..=attempts {
            if self.online().await {
                let retry = attempt < attempts;
                match self
                    .notifier
                    .send_notification(&n.title, &n.message, n.priority, retry)
                    .await
                {
                    Ok(()) => {
                        info!(
                            title = %n.title,
                            priority = n.priority.as_str(),
                            attempt,
                            "notification sent"
                        );
                        return Ok(());
                    }
                    Err(NotifyError::RateLimited) => return Err(NotifyError::RateLimited),
                    Err(e) => {
                        debug!(attempt, error = %e, "notification attempt failed");
                        last = e;
                    }
                }
            } else {
                debug!(attempt, "no outbound connectivity, delaying notification");
                last = NotifyError::Offline;
            }
            if attempt < attempts {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
        Err(last)
    }
}
