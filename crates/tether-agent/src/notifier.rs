//! Log-only notifier with an hourly budget.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tether_engine::error::NotifyError;
use tether_engine::interfaces::{Notifier, Priority};

const WINDOW: Duration = Duration::from_secs(3600);

pub struct LogNotifier {
    per_hour: u32,
    sent: Mutex<VecDeque<Instant>>,
}

impl LogNotifier {
    pub fn new(per_hour: u32) -> Self {
        Self {
            per_hour,
            sent: Mutex::new(VecDeque::new()),
        }
    }

    fn recent(&self, now: Instant) -> usize {
        let mut sent = self.sent.lock().unwrap_or_else(|e| e.into_inner());
        while sent
            .front()
            .is_some_and(|t| now.duration_since(*t) >= WINDOW)
        {
            sent.pop_front();
        }
        sent.len()
    }
}

#[async_trait::async_trait]
impl Notifier for LogNotifier {
    async fn send_notification(
        &self,
        title: &str,
        message: &str,
        priority: Priority,
        _retry: bool,
    ) -> Result<(), NotifyError> {
        let now = Instant::now();
        if self.recent(now) >= self.per_hour as usize {
            return Err(NotifyError::RateLimited);
        }
        match priority {
            Priority::Emergency | Priority::High => {
                tracing::warn!(priority = priority.as_str(), title, "{message}")
            }
            Priority::Normal | Priority::Low => {
                tracing::info!(priority = priority.as_str(), title, "{message}")
            }
        }
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(now);
        Ok(())
    }

    fn is_rate_limited(&self) -> bool {
        self.recent(Instant::now()) >= self.per_hour as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn budget_is_enforced() {
        let n = LogNotifier::new(2);
        n.send_notification("a", "m", Priority::High, false).await.unwrap();
        n.send_notification("b", "m", Priority::Normal, false).await.unwrap();
        assert!(n.is_rate_limited());
        assert!(matches!(
            n.send_notification("c", "m", Priority::Emergency, false).await,
            Err(NotifyError::RateLimited)
        ));
    }
}
