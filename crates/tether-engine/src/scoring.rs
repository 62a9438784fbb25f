//! # Quality Scoring
//!
//! Maps one [`Metrics`] sample to a 0–100 health score.
//!
//! Each sub-metric becomes a component by linear interpolation between its
//! "excellent" and "poor" benchmarks. Components are combined as a weighted
//! sum; components the sample does not carry are left out and the remaining
//! weights renormalized.
//!
//! The instant score is a pure function. [`ScoreTracker`] adds the per-member
//! smoothing: `final = 0.3·instant + 0.5·ewma + 0.2·window_mean`.

use std::collections::VecDeque;

use tether_common::models::{MemberClass, Metrics, Score};

use crate::config::{Benchmark, ScoringConfig};
use crate::ewma::Ewma;

const INSTANT_WEIGHT: f64 = 0.3;
const EWMA_WEIGHT: f64 = 0.5;
const WINDOW_WEIGHT: f64 = 0.2;

/// Cellular RSRP mapping band, dBm.
const RSRP_FLOOR_DBM: f64 = -120.0;
const RSRP_CEIL_DBM: f64 = -80.0;
/// WiFi RSSI mapping band, dBm.
const WIFI_FLOOR_DBM: f64 = -90.0;
const WIFI_CEIL_DBM: f64 = -50.0;

const VPN_SIGNAL: f64 = 50.0;
const SNR_PERSISTENTLY_LOW_SIGNAL: f64 = 40.0;

/// Per-component scores for one sample. `None` means the sample did not
/// carry that measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Components {
    pub latency: f64,
    pub loss: f64,
    pub jitter: f64,
    pub obstruction: Option<f64>,
    pub signal: Option<f64>,
}

fn bounded(v: f64) -> f64 {
    if v.is_finite() { v.clamp(0.0, 100.0) } else { 0.0 }
}

/// 100 at or below `excellent`, 0 at or above `poor`, linear in between.
pub fn linear_score(value: f64, band: Benchmark) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    if value <= band.excellent {
        return 100.0;
    }
    if value >= band.poor {
        return 0.0;
    }
    bounded(100.0 * (band.poor - value) / (band.poor - band.excellent))
}

/// Map `value` from `[floor, ceil]` onto `[0, 100]`, higher is better.
fn rising_band(value: f64, floor: f64, ceil: f64) -> f64 {
    bounded(100.0 * (value - floor) / (ceil - floor))
}

/// Class-dependent signal component.
pub fn signal_component(metrics: &Metrics, class: MemberClass) -> Option<f64> {
    match class {
        MemberClass::Cellular => match (metrics.signal_pct, metrics.rsrp_dbm) {
            (Some(pct), _) => Some(bounded(pct)),
            (None, Some(rsrp)) => Some(rising_band(rsrp, RSRP_FLOOR_DBM, RSRP_CEIL_DBM)),
            (None, None) => None,
        },
        MemberClass::Wifi => metrics
            .wifi_signal_dbm
            .map(|dbm| rising_band(dbm, WIFI_FLOOR_DBM, WIFI_CEIL_DBM)),
        MemberClass::Vpn => Some(VPN_SIGNAL),
        MemberClass::Wired => Some(100.0),
        MemberClass::Satellite => {
            if metrics.snr_above_noise_floor == Some(false) {
                Some(0.0)
            } else if metrics.snr_persistently_low == Some(true) {
                Some(SNR_PERSISTENTLY_LOW_SIGNAL)
            } else {
                Some(100.0)
            }
        }
    }
}

pub fn components(metrics: &Metrics, class: MemberClass, cfg: &ScoringConfig) -> Components {
    Components {
        latency: linear_score(metrics.latency_ms, cfg.latency),
        loss: linear_score(metrics.loss_pct, cfg.loss),
        jitter: linear_score(metrics.jitter_ms, cfg.jitter),
        obstruction: metrics
            .obstruction_pct
            .map(|o| linear_score(o, cfg.obstruction)),
        signal: signal_component(metrics, class),
    }
}

impl Components {
    /// Weighted combination over the components present.
    pub fn combine(&self, cfg: &ScoringConfig) -> f64 {
        let w = &cfg.weights;
        let parts = [
            (Some(self.latency), w.latency),
            (Some(self.loss), w.loss),
            (Some(self.jitter), w.jitter),
            (self.obstruction, w.obstruction),
            (self.signal, w.signal),
        ];
        let (sum, total) = parts
            .iter()
            .filter_map(|(c, weight)| c.map(|c| (c * weight, *weight)))
            .fold((0.0, 0.0), |(s, t), (cw, w)| (s + cw, t + w));

        let raw = if total > 0.0 {
            sum / total
        } else {
            // Only zero-weight components present: fall back to a plain mean.
            let present: Vec<f64> = parts.iter().filter_map(|(c, _)| *c).collect();
            present.iter().sum::<f64>() / present.len() as f64
        };
        clamp_score(raw, cfg)
    }

    /// Components as named quality factors for the decision log.
    pub fn as_factors(&self) -> Vec<(&'static str, f64)> {
        let mut out = vec![
            ("latency_score", self.latency),
            ("loss_score", self.loss),
            ("jitter_score", self.jitter),
        ];
        if let Some(o) = self.obstruction {
            out.push(("obstruction_score", o));
        }
        if let Some(s) = self.signal {
            out.push(("signal_score", s));
        }
        out
    }
}

fn clamp_score(v: f64, cfg: &ScoringConfig) -> f64 {
    if v.is_finite() {
        v.clamp(cfg.min_score, cfg.max_score)
    } else {
        cfg.min_score
    }
}

/// Pure instant score for one sample.
pub fn instant_score(metrics: &Metrics, class: MemberClass, cfg: &ScoringConfig) -> f64 {
    components(metrics, class, cfg).combine(cfg)
}

/// Per-member smoothing state: EWMA plus a short window of instant scores.
#[derive(Debug, Clone)]
pub struct ScoreTracker {
    ewma: Ewma,
    window: VecDeque<f64>,
    window_size: usize,
    last: Option<Score>,
}

impl ScoreTracker {
    pub fn new(cfg: &ScoringConfig) -> Self {
        Self {
            ewma: Ewma::new(cfg.ewma_alpha),
            window: VecDeque::with_capacity(cfg.window_size),
            window_size: cfg.window_size.max(1),
            last: None,
        }
    }

    /// Resume from a persisted EWMA value.
    pub fn resume(cfg: &ScoringConfig, ewma: f64) -> Self {
        Self {
            ewma: Ewma::seeded(cfg.ewma_alpha, ewma),
            ..Self::new(cfg)
        }
    }

    /// Fold one instant score in and return the resulting [`Score`].
    pub fn update(&mut self, instant: f64, cfg: &ScoringConfig) -> Score {
        let instant = clamp_score(instant, cfg);
        let ewma = self.ewma.update(instant);

        self.window.push_back(instant);
        while self.window.len() > self.window_size {
            self.window.pop_front();
        }
        let window_mean = self.window.iter().sum::<f64>() / self.window.len() as f64;

        let final_score = clamp_score(
            INSTANT_WEIGHT * instant + EWMA_WEIGHT * ewma + WINDOW_WEIGHT * window_mean,
            cfg,
        );
        let score = Score {
            instant,
            ewma: clamp_score(ewma, cfg),
            final_score,
        };
        self.last = Some(score);
        score
    }

    pub fn last(&self) -> Option<Score> {
        self.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use proptest::prelude::*;

    fn sample(latency: f64, loss: f64, jitter: f64) -> Metrics {
        Metrics::new(Utc::now(), latency, loss, jitter)
    }

    #[test]
    fn linear_band_edges() {
        let band = Benchmark {
            excellent: 50.0,
            poor: 500.0,
        };
        assert_eq!(linear_score(20.0, band), 100.0);
        assert_eq!(linear_score(50.0, band), 100.0);
        assert_eq!(linear_score(600.0, band), 0.0);
        assert!((linear_score(275.0, band) - 50.0).abs() < 1e-9);
        assert_eq!(linear_score(f64::NAN, band), 0.0);
    }

    #[test]
    fn perfect_wired_sample_scores_100() {
        let cfg = ScoringConfig::default();
        let s = instant_score(&sample(20.0, 0.0, 1.0), MemberClass::Wired, &cfg);
        assert!((s - 100.0).abs() < 1e-9);
    }

    #[test]
    fn latency_past_poor_zeroes_component() {
        let cfg = ScoringConfig::default();
        let c = components(&sample(600.0, 0.0, 1.0), MemberClass::Wired, &cfg);
        assert_eq!(c.latency, 0.0);
        let s = c.combine(&cfg);
        // Obstruction absent: latency weight renormalized to 0.25 / 0.85.
        let expected = 100.0 * (1.0 - 0.25 / 0.85);
        assert!((s - expected).abs() < 1e-9, "got {s}");
    }

    #[test]
    fn signal_is_class_dependent() {
        let mut m = sample(20.0, 0.0, 1.0);
        assert_eq!(signal_component(&m, MemberClass::Vpn), Some(50.0));
        assert_eq!(signal_component(&m, MemberClass::Wired), Some(100.0));
        assert_eq!(signal_component(&m, MemberClass::Cellular), None);
        assert_eq!(signal_component(&m, MemberClass::Wifi), None);

        m.rsrp_dbm = Some(-100.0);
        assert_eq!(signal_component(&m, MemberClass::Cellular), Some(50.0));
        m.signal_pct = Some(72.0);
        assert_eq!(signal_component(&m, MemberClass::Cellular), Some(72.0));

        m.wifi_signal_dbm = Some(-70.0);
        assert_eq!(signal_component(&m, MemberClass::Wifi), Some(50.0));

        assert_eq!(signal_component(&m, MemberClass::Satellite), Some(100.0));
        m.snr_persistently_low = Some(true);
        assert_eq!(signal_component(&m, MemberClass::Satellite), Some(40.0));
        m.snr_above_noise_floor = Some(false);
        assert_eq!(signal_component(&m, MemberClass::Satellite), Some(0.0));
    }

    #[test]
    fn tracker_blends_instant_ewma_and_window() {
        let cfg = ScoringConfig::default();
        let mut t = ScoreTracker::new(&cfg);
        let first = t.update(100.0, &cfg);
        assert!((first.final_score - 100.0).abs() < 1e-9);

        let second = t.update(0.0, &cfg);
        // ewma = 90, window mean = 50
        assert!((second.ewma - 90.0).abs() < 1e-9);
        let expected = 0.3 * 0.0 + 0.5 * 90.0 + 0.2 * 50.0;
        assert!((second.final_score - expected).abs() < 1e-9);
        assert_eq!(t.last(), Some(second));
    }

    #[test]
    fn tracker_window_is_bounded() {
        let cfg = ScoringConfig {
            window_size: 2,
            ..ScoringConfig::default()
        };
        let mut t = ScoreTracker::new(&cfg);
        t.update(0.0, &cfg);
        t.update(0.0, &cfg);
        t.update(100.0, &cfg);
        t.update(100.0, &cfg);
        assert_eq!(t.window.len(), 2);
        assert!(t.window.iter().all(|v| *v == 100.0));
    }

    proptest! {
        #[test]
        fn final_score_is_always_bounded(
            latency in any::<f64>(),
            loss in any::<f64>(),
            jitter in any::<f64>(),
            obstruction in proptest::option::of(any::<f64>()),
            rsrp in proptest::option::of(any::<f64>()),
            class_idx in 0usize..5,
            history in proptest::collection::vec(0.0f64..100.0, 0..20),
        ) {
            let classes = [
                MemberClass::Satellite,
                MemberClass::Cellular,
                MemberClass::Wifi,
                MemberClass::Wired,
                MemberClass::Vpn,
            ];
            let cfg = ScoringConfig::default();
            let mut m = sample(latency, loss, jitter);
            m.obstruction_pct = obstruction;
            m.rsrp_dbm = rsrp;
            m.wifi_signal_dbm = rsrp;

            let mut tracker = ScoreTracker::new(&cfg);
            for h in history {
                tracker.update(h, &cfg);
            }
            let instant = instant_score(&m, classes[class_idx], &cfg);
            let score = tracker.update(instant, &cfg);
            for v in [score.instant, score.ewma, score.final_score] {
                prop_assert!(v >= cfg.min_score && v <= cfg.max_score, "out of range: {v}");
            }
        }
    }
}
