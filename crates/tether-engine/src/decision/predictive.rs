//! Trend-based early failover triggers.
//!
//! Looks at the recent history of a member that is still within its hard
//! thresholds and reports a trigger when the trend says it will not stay
//! there.

use chrono::Duration;
use tether_common::models::{MemberClass, Metrics};

use crate::config::PredictiveConfig;
use crate::telemetry::TelemetryStore;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PredictiveTrigger {
    /// Latency slope in ms per minute.
    LatencyTrend(f64),
    /// Obstruction slope in percentage points per minute.
    ObstructionTrend(f64),
    LossSpike { current: f64, mean: f64 },
    SnrDegrading,
}

impl PredictiveTrigger {
    pub fn reason(&self) -> &'static str {
        match self {
            PredictiveTrigger::LatencyTrend(_) => "predictive_latency_trend",
            PredictiveTrigger::ObstructionTrend(_) => "predictive_obstruction_trend",
            PredictiveTrigger::LossSpike { .. } => "predictive_loss_spike",
            PredictiveTrigger::SnrDegrading => "predictive_snr_degrading",
        }
    }

    /// The measured value behind the trigger, for the decision's factors.
    pub fn value(&self) -> f64 {
        match self {
            PredictiveTrigger::LatencyTrend(v) | PredictiveTrigger::ObstructionTrend(v) => *v,
            PredictiveTrigger::LossSpike { current, .. } => *current,
            PredictiveTrigger::SnrDegrading => 1.0,
        }
    }
}

/// Check `member`'s recent history. `latest` must already be in `store`.
pub fn evaluate(
    store: &TelemetryStore,
    member: &str,
    class: MemberClass,
    latest: &Metrics,
    cfg: &PredictiveConfig,
) -> Option<PredictiveTrigger> {
    if !cfg.enabled {
        return None;
    }
    if class == MemberClass::Satellite && latest.snr_persistently_low == Some(true) {
        return Some(PredictiveTrigger::SnrDegrading);
    }

    let lookback = Duration::from_std(cfg.lookback).unwrap_or_else(|_| Duration::minutes(5));
    let since = latest.timestamp - lookback;
    if store.since(member, since).len() < cfg.min_samples {
        return None;
    }

    let latency_slope = store.slope_per_min(member, since, |m| Some(m.latency_ms));
    if let Some(slope) = latency_slope.filter(|s| *s > cfg.latency_trend_ms_per_min) {
        return Some(PredictiveTrigger::LatencyTrend(slope));
    }

    if let Some(mean) = store.mean_before_latest(member, since, |m| Some(m.loss_pct)) {
        let current = latest.loss_pct;
        if current > cfg.loss_spike_min_pct && current > cfg.loss_spike_factor * mean {
            return Some(PredictiveTrigger::LossSpike { current, mean });
        }
    }

    if class == MemberClass::Satellite {
        let slope = store.slope_per_min(member, since, |m| m.obstruction_pct);
        if let Some(slope) = slope.filter(|s| *s > cfg.obstruction_trend_pct_per_min) {
            return Some(PredictiveTrigger::ObstructionTrend(slope));
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TelemetryConfig;
    use chrono::{DateTime, Utc};
    use tether_common::models::Score;

    fn store() -> TelemetryStore {
        TelemetryStore::new(&TelemetryConfig::default())
    }

    fn push(
        s: &mut TelemetryStore,
        base: DateTime<Utc>,
        secs: i64,
        latency: f64,
        loss: f64,
    ) -> Metrics {
        let m = Metrics::new(base + Duration::seconds(secs), latency, loss, 2.0);
        s.push("m", m.clone(), Score::default());
        m
    }

    #[test]
    fn rising_latency_triggers() {
        let mut s = store();
        let base = Utc::now();
        let mut last = None;
        for i in 0..6 {
            last = Some(push(&mut s, base, i * 30, 40.0 + 15.0 * i as f64, 0.0));
        }
        let cfg = PredictiveConfig::default();
        let trigger = evaluate(&s, "m", MemberClass::Cellular, &last.unwrap(), &cfg);
        match trigger {
            Some(PredictiveTrigger::LatencyTrend(slope)) => assert!((slope - 30.0).abs() < 1e-6),
            other => panic!("expected latency trend, got {other:?}"),
        }
    }

    #[test]
    fn flat_history_does_not_trigger() {
        let mut s = store();
        let base = Utc::now();
        let mut last = None;
        for i in 0..10 {
            last = Some(push(&mut s, base, i * 10, 40.0, 0.5));
        }
        let cfg = PredictiveConfig::default();
        assert!(evaluate(&s, "m", MemberClass::Wired, &last.unwrap(), &cfg).is_none());
    }

    #[test]
    fn loss_spike_triggers() {
        let mut s = store();
        let base = Utc::now();
        for i in 0..5 {
            push(&mut s, base, i * 10, 40.0, 0.5);
        }
        let last = push(&mut s, base, 50, 40.0, 3.0);
        let trigger = evaluate(&s, "m", MemberClass::Cellular, &last, &PredictiveConfig::default());
        assert_eq!(trigger.map(|t| t.reason()), Some("predictive_loss_spike"));
    }

    #[test]
    fn too_few_samples_is_silent() {
        let mut s = store();
        let base = Utc::now();
        push(&mut s, base, 0, 40.0, 0.0);
        let last = push(&mut s, base, 60, 400.0, 0.0);
        let cfg = PredictiveConfig::default();
        assert!(evaluate(&s, "m", MemberClass::Cellular, &last, &cfg).is_none());
    }

    #[test]
    fn satellite_snr_triggers_immediately() {
        let s = store();
        let mut m = Metrics::new(Utc::now(), 40.0, 0.0, 2.0);
        m.snr_persistently_low = Some(true);
        assert_eq!(
            evaluate(&s, "m", MemberClass::Satellite, &m, &PredictiveConfig::default()),
            Some(PredictiveTrigger::SnrDegrading)
        );
    }
}
