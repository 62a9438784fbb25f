//! Quality-bad predicate and obstruction refinement.

use tether_common::models::Metrics;

use crate::config::{DecisionConfig, DecisionMode, ObstructionConfig, ThresholdFactors};

/// Hard thresholds in effect for one evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub latency_ms: f64,
    pub loss_pct: f64,
    pub obstruction_pct: f64,
}

impl Thresholds {
    pub fn from_config(cfg: &DecisionConfig) -> Self {
        Self {
            latency_ms: cfg.latency_threshold_ms,
            loss_pct: cfg.loss_threshold_pct,
            obstruction_pct: cfg.obstruction_threshold_pct,
        }
    }

    pub fn scaled(&self, f: &ThresholdFactors) -> Self {
        Self {
            latency_ms: self.latency_ms * f.latency,
            loss_pct: self.loss_pct * f.loss,
            obstruction_pct: self.obstruction_pct * f.obstruction,
        }
    }
}

/// How the location context changed the thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThresholdAdjustment {
    #[default]
    Baseline,
    /// Inside a known problematic area.
    Relaxed,
    /// Inside a healthy, well-sampled area.
    Tightened,
}

impl ThresholdAdjustment {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThresholdAdjustment::Baseline => "baseline",
            ThresholdAdjustment::Relaxed => "relaxed",
            ThresholdAdjustment::Tightened => "tightened",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Factor {
    Latency,
    Loss,
    Obstruction,
    Snr,
    Gps,
}

impl Factor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Factor::Latency => "high_latency",
            Factor::Loss => "high_loss",
            Factor::Obstruction => "obstruction",
            Factor::Snr => "low_snr",
            Factor::Gps => "gps_invalid",
        }
    }
}

/// Outcome of the obstruction refinement for one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObstructionVerdict {
    /// The sample carries no obstruction data.
    Absent,
    Clear,
    /// Breach confirmed by history, duration or emergency level, or history
    /// too short to judge.
    Degraded { emergency: bool },
    /// Raw breach not backed by history.
    Dismissed,
    /// Raw breach measured over too few patches.
    LowConfidence,
}

/// Escalate a raw obstruction breach only when something beyond the
/// instantaneous value backs it up.
pub fn refine_obstruction(
    metrics: &Metrics,
    threshold_pct: f64,
    decision: &DecisionConfig,
    cfg: &ObstructionConfig,
) -> ObstructionVerdict {
    let Some(current) = metrics.obstruction_pct else {
        return ObstructionVerdict::Absent;
    };
    if current.is_finite() && current <= threshold_pct {
        return ObstructionVerdict::Clear;
    }
    if !current.is_finite() || current > threshold_pct * decision.emergency_multiplier {
        return ObstructionVerdict::Degraded { emergency: true };
    }
    if metrics
        .obstruction_patches_valid
        .is_some_and(|p| p < cfg.min_patches)
    {
        return ObstructionVerdict::LowConfidence;
    }

    let history = metrics
        .obstruction_time_pct
        .filter(|_| metrics.obstruction_valid_s.unwrap_or(0) >= cfg.min_valid_s);
    let Some(time_pct) = history else {
        return ObstructionVerdict::Degraded { emergency: false };
    };

    let prolonged = metrics
        .obstruction_avg_prolonged_s
        .is_some_and(|s| s > cfg.prolonged_duration_threshold_s);
    if time_pct > cfg.historical_time_pct_threshold || prolonged {
        ObstructionVerdict::Degraded { emergency: false }
    } else {
        ObstructionVerdict::Dismissed
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    pub bad: bool,
    pub degraded: Vec<Factor>,
    pub emergency: Option<Factor>,
    pub obstruction: ObstructionVerdict,
    pub reason: String,
}

fn exceeds(value: f64, threshold: f64) -> bool {
    !(value <= threshold)
}

/// Evaluate the quality-bad predicate for one sample.
pub fn assess(
    metrics: &Metrics,
    thresholds: &Thresholds,
    decision: &DecisionConfig,
    obstruction: &ObstructionConfig,
    strong_alternate: bool,
) -> Assessment {
    let mult = decision.emergency_multiplier;
    let verdict = refine_obstruction(metrics, thresholds.obstruction_pct, decision, obstruction);

    let mut degraded = Vec::new();
    if exceeds(metrics.latency_ms, thresholds.latency_ms) {
        degraded.push(Factor::Latency);
    }
    if exceeds(metrics.loss_pct, thresholds.loss_pct) {
        degraded.push(Factor::Loss);
    }
    if matches!(verdict, ObstructionVerdict::Degraded { .. }) {
        degraded.push(Factor::Obstruction);
    }

    let emergency = if exceeds(metrics.latency_ms, thresholds.latency_ms * mult) {
        Some(Factor::Latency)
    } else if exceeds(metrics.loss_pct, thresholds.loss_pct * mult) {
        Some(Factor::Loss)
    } else if verdict == (ObstructionVerdict::Degraded { emergency: true }) {
        Some(Factor::Obstruction)
    } else {
        None
    };

    let bad = match decision.mode {
        DecisionMode::Basic => !degraded.is_empty(),
        DecisionMode::Enhanced => {
            if metrics.snr_above_noise_floor == Some(false)
                || metrics.snr_persistently_low == Some(true)
            {
                degraded.push(Factor::Snr);
            }
            if metrics.gps_valid == Some(false)
                || metrics
                    .gps_satellites
                    .is_some_and(|s| s < decision.min_gps_satellites)
            {
                degraded.push(Factor::Gps);
            }
            degraded.len() >= 2
                || (degraded.len() == 1 && strong_alternate)
                || emergency.is_some()
        }
    };

    let reason = if !bad {
        if degraded.is_empty() {
            "quality_good".to_string()
        } else {
            // Degraded but not enough to act on.
            format!("tolerated_{}", degraded[0].as_str())
        }
    } else if let Some(f) = emergency {
        format!("emergency_{}", f.as_str())
    } else {
        degraded
            .iter()
            .map(|f| f.as_str())
            .collect::<Vec<_>>()
            .join("+")
    };

    Assessment {
        bad,
        degraded,
        emergency,
        obstruction: verdict,
        reason,
    }
}
