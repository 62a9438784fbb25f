//! Decision audit log.
//!
//! Keeps the most recent decisions in memory for the query surface and,
//! optionally, appends every decision as one JSON line to a file.

use std::collections::{BTreeMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tether_common::models::{Decision, DecisionType};
use tracing::{debug, info, warn};

use crate::error::StateError;

/// Aggregates over the retained decisions.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DecisionStats {
    pub total: u64,
    pub by_type: BTreeMap<String, u64>,
    pub by_reason: BTreeMap<String, u64>,
    pub success_rate: f64,
    pub failed: u64,
    pub predictive: u64,
}

pub struct DecisionLog {
    capacity: usize,
    entries: Mutex<VecDeque<Decision>>,
    /// Lifetime counts, not bounded by `capacity`.
    totals: Mutex<BTreeMap<DecisionType, u64>>,
    sink: Option<(PathBuf, Mutex<File>)>,
}

impl DecisionLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
            totals: Mutex::new(BTreeMap::new()),
            sink: None,
        }
    }

    /// Also append every decision to `path` as JSON lines.
    pub fn with_file(capacity: usize, path: &Path) -> Result<Self, StateError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StateError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| StateError::Io {
                path: path.to_path_buf(),
                source: e,
            })?;
        Ok(Self {
            sink: Some((path.to_path_buf(), Mutex::new(file))),
            ..Self::new(capacity)
        })
    }

    pub fn log_decision(&self, decision: Decision) {
        if !decision.success {
            warn!(
                id = %decision.id,
                member = %decision.member,
                kind = decision.decision_type.as_str(),
                reason = %decision.trigger_reason,
                error = decision.error.as_deref().unwrap_or(""),
                "decision failed"
            );
        } else if decision.decision_type == DecisionType::Evaluation {
            debug!(
                member = %decision.member,
                reason = %decision.trigger_reason,
                "evaluation"
            );
        } else {
            info!(
                id = %decision.id,
                member = %decision.member,
                kind = decision.decision_type.as_str(),
                action = decision.action.as_str(),
                from_metric = ?decision.from_metric,
                to_metric = ?decision.to_metric,
                reason = %decision.trigger_reason,
                predictive = decision.predictive,
                "decision"
            );
        }

        if let Some((path, file)) = &self.sink {
            match serde_json::to_string(&decision) {
                Ok(line) => {
                    let mut f = file.lock().unwrap_or_else(|e| e.into_inner());
                    if let Err(e) = writeln!(f, "{line}") {
                        warn!(path = %path.display(), error = %e, "failed to append decision");
                    }
                }
                Err(e) => warn!(error = %e, "failed to encode decision"),
            }
        }

        *self
            .totals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(decision.decision_type)
            .or_insert(0) += 1;

        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.push_back(decision);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    /// Decisions at or after `since`, newest first, at most `limit`.
    pub fn decisions(&self, since: Option<DateTime<Utc>>, limit: usize) -> Vec<Decision> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .rev()
            .filter(|d| since.is_none_or(|s| d.timestamp >= s))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn stats(&self, since: Option<DateTime<Utc>>) -> DecisionStats {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut stats = DecisionStats::default();
        let mut succeeded = 0u64;
        for d in entries
            .iter()
            .filter(|d| since.is_none_or(|s| d.timestamp >= s))
        {
            stats.total += 1;
            *stats
                .by_type
                .entry(d.decision_type.as_str().to_string())
                .or_insert(0) += 1;
            *stats.by_reason.entry(d.trigger_reason.clone()).or_insert(0) += 1;
            if d.success {
                succeeded += 1;
            } else {
                stats.failed += 1;
            }
            if d.predictive {
                stats.predictive += 1;
            }
        }
        stats.success_rate = if stats.total == 0 {
            1.0
        } else {
            succeeded as f64 / stats.total as f64
        };
        stats
    }

    /// Lifetime decision counts by type.
    pub fn totals(&self) -> BTreeMap<DecisionType, u64> {
        self.totals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
