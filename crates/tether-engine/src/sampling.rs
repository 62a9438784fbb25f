//! # Adaptive sampling
//!
//! A member's configured poll interval is its base cadence. Once the engine
//! has an opinion about the link, pollers stretch the cadence of healthy
//! members (less traffic on metered plans) and tighten it for struggling or
//! failed ones so recovery is noticed sooner.
//!
//! | Condition  | When                                   | Factor |
//! |------------|----------------------------------------|--------|
//! | `stable`   | up, final score > 80                   | 2.0    |
//! | `degraded` | up, final score in (60, 80]            | 0.8    |
//! | `unstable` | recovering, or final score in [40, 60] | 0.5    |
//! | `failing`  | down, or final score < 40              | 0.3    |
//! | `unknown`  | no score yet                           | 1.0    |
//!
//! The result stays within `[min_interval, max_interval]`, widened to
//! include the base interval itself.

use std::time::Duration;

use serde::Serialize;
use tether_common::models::LinkState;

use crate::config::SamplingConfig;
use crate::decision::{EngineStatus, MemberStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkCondition {
    Unknown,
    Stable,
    Degraded,
    Unstable,
    Failing,
}

impl LinkCondition {
    pub fn classify(status: &MemberStatus) -> Self {
        match status.state {
            LinkState::Down => return Self::Failing,
            LinkState::Recovering => return Self::Unstable,
            LinkState::Up => {}
        }
        let Some(score) = status.score else {
            return Self::Unknown;
        };
        let s = score.final_score;
        if s > 80.0 {
            Self::Stable
        } else if s > 60.0 {
            Self::Degraded
        } else if s < 40.0 {
            Self::Failing
        } else {
            Self::Unstable
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Stable => "stable",
            Self::Degraded => "degraded",
            Self::Unstable => "unstable",
            Self::Failing => "failing",
        }
    }

    fn factor(self) -> f64 {
        match self {
            Self::Unknown => 1.0,
            Self::Stable => 2.0,
            Self::Degraded => 0.8,
            Self::Unstable => 0.5,
            Self::Failing => 0.3,
        }
    }
}

/// Poll interval for a member in `condition` whose configured cadence is
/// `base`.
pub fn adaptive_interval(base: Duration, condition: LinkCondition, cfg: &SamplingConfig) -> Duration {
    if !cfg.adaptive {
        return base;
    }
    let floor = cfg.min_interval.min(base);
    let ceiling = cfg.max_interval.max(base);
    base.mul_f64(condition.factor()).max(floor).min(ceiling)
}

/// Condition and interval for `member` as of the published engine status.
pub fn member_cadence(
    status: &EngineStatus,
    member: &str,
    base: Duration,
    cfg: &SamplingConfig,
) -> (LinkCondition, Duration) {
    let condition = status
        .members
        .iter()
        .find(|m| m.name == member)
        .map_or(LinkCondition::Unknown, LinkCondition::classify);
    (condition, adaptive_interval(base, condition, cfg))
}
