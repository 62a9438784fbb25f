//! Bounded per-member sample history.
//!
//! Holds the last `max_samples_per_member` scored samples of every member for
//! trend and percentile queries. Samples must arrive in non-decreasing
//! timestamp order per member.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use tether_common::models::{Metrics, Score};

use crate::config::TelemetryConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub metrics: Metrics,
    pub score: Score,
}

#[derive(Debug)]
pub struct TelemetryStore {
    max_samples: usize,
    retention: chrono::Duration,
    members: HashMap<String, VecDeque<Sample>>,
}

impl TelemetryStore {
    pub fn new(cfg: &TelemetryConfig) -> Self {
        Self {
            max_samples: cfg.max_samples_per_member.max(1),
            retention: chrono::Duration::from_std(cfg.retention)
                .unwrap_or_else(|_| chrono::Duration::hours(24)),
            members: HashMap::new(),
        }
    }

    /// Whether a sample stamped `at` would keep `member`'s history ordered.
    pub fn accepts(&self, member: &str, at: DateTime<Utc>) -> bool {
        self.last_timestamp(member).is_none_or(|last| at >= last)
    }

    pub fn last_timestamp(&self, member: &str) -> Option<DateTime<Utc>> {
        self.members
            .get(member)
            .and_then(|q| q.back())
            .map(|s| s.metrics.timestamp)
    }

    /// Append a scored sample. Returns `false` and drops the sample when it
    /// is older than the member's newest one.
    pub fn push(&mut self, member: &str, metrics: Metrics, score: Score) -> bool {
        if !self.accepts(member, metrics.timestamp) {
            return false;
        }
        let queue = self.members.entry(member.to_string()).or_default();
        queue.push_back(Sample { metrics, score });
        while queue.len() > self.max_samples {
            queue.pop_front();
        }
        true
    }

    pub fn latest(&self, member: &str) -> Option<&Sample> {
        self.members.get(member).and_then(|q| q.back())
    }

    pub fn len(&self, member: &str) -> usize {
        self.members.get(member).map_or(0, |q| q.len())
    }

    /// Samples with `timestamp >= since`, oldest first.
    pub fn since(&self, member: &str, since: DateTime<Utc>) -> Vec<&Sample> {
        self.members
            .get(member)
            .map(|q| q.iter().filter(|s| s.metrics.timestamp >= since).collect())
            .unwrap_or_default()
    }

    /// Drop samples older than the retention window.
    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.retention;
        let mut removed = 0;
        for queue in self.members.values_mut() {
            while queue.front().is_some_and(|s| s.metrics.timestamp < cutoff) {
                queue.pop_front();
                removed += 1;
            }
        }
        removed
    }

    /// Forget obstruction history for a member, leaving transport metrics.
    pub fn clear_obstruction(&mut self, member: &str) -> usize {
        let Some(queue) = self.members.get_mut(member) else {
            return 0;
        };
        let mut cleared = 0;
        for s in queue.iter_mut() {
            let m = &mut s.metrics;
            if m.obstruction_pct.is_some() || m.obstruction_time_pct.is_some() {
                cleared += 1;
            }
            m.obstruction_pct = None;
            m.obstruction_time_pct = None;
            m.obstruction_valid_s = None;
            m.obstruction_avg_prolonged_s = None;
            m.obstruction_patches_valid = None;
        }
        cleared
    }

    /// Least-squares slope of `field` per minute over samples since `since`.
    pub fn slope_per_min(
        &self,
        member: &str,
        since: DateTime<Utc>,
        field: impl Fn(&Metrics) -> Option<f64>,
    ) -> Option<f64> {
        let points: Vec<(DateTime<Utc>, f64)> = self
            .since(member, since)
            .into_iter()
            .filter_map(|s| field(&s.metrics).map(|v| (s.metrics.timestamp, v)))
            .collect();
        slope_per_min(&points)
    }

    /// Mean of `field` over samples since `since`, excluding the newest.
    pub fn mean_before_latest(
        &self,
        member: &str,
        since: DateTime<Utc>,
        field: impl Fn(&Metrics) -> Option<f64>,
    ) -> Option<f64> {
        let samples = self.since(member, since);
        let (_, earlier) = samples.split_last()?;
        let values: Vec<f64> = earlier.iter().filter_map(|s| field(&s.metrics)).collect();
        if values.is_empty() {
            return None;
        }
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }

    /// Nearest-rank percentile of `field` across the member's buffer.
    pub fn percentile(
        &self,
        member: &str,
        p: f64,
        field: impl Fn(&Metrics) -> Option<f64>,
    ) -> Option<f64> {
        let mut values: Vec<f64> = self
            .members
            .get(member)?
            .iter()
            .filter_map(|s| field(&s.metrics))
            .filter(|v| v.is_finite())
            .collect();
        if values.is_empty() {
            return None;
        }
        values.sort_by(|a, b| a.total_cmp(b));
        let rank = ((p.clamp(0.0, 100.0) / 100.0) * values.len() as f64).ceil() as usize;
        Some(values[rank.saturating_sub(1).min(values.len() - 1)])
    }
}

/// Simple linear regression slope with x in minutes since the first point.
pub fn slope_per_min(points: &[(DateTime<Utc>, f64)]) -> Option<f64> {
    if points.len() < 2 {
        return None;
    }
    let t0 = points[0].0;
    let n = points.len() as f64;
    let (mut sx, mut sy, mut sxy, mut sxx) = (0.0, 0.0, 0.0, 0.0);
    for (t, y) in points {
        let x = (*t - t0).num_milliseconds() as f64 / 60_000.0;
        sx += x;
        sy += y;
        sxy += x * y;
        sxx += x * x;
    }
    let denom = n * sxx - sx * sx;
    if denom.abs() < f64::EPSILON {
        return None;
    }
    Some((n * sxy - sx * sy) / denom)
}
