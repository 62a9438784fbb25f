//! TOML configuration.
//!
//! Every tunable threshold lives here with its default. Raw TOML is parsed
//! into the `*Input` tree (every field optional) and then resolved into a
//! validated [`TetherConfig`].

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use tether_common::models::{GpsSourceKind, Member, MemberClass};
use tracing::warn;

use crate::error::ConfigError;

pub const CONFIG_VERSION: u32 = 1;

// ── Raw input ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TetherConfigInput {
    pub version: u32,
    pub members: Vec<MemberConfigInput>,
    pub scoring: ScoringConfigInput,
    pub decision: DecisionConfigInput,
    pub obstruction: ObstructionConfigInput,
    pub predictive: PredictiveConfigInput,
    pub gps: GpsConfigInput,
    pub movement: MovementConfigInput,
    pub clustering: ClusteringConfigInput,
    pub telemetry: TelemetryConfigInput,
    pub notifications: NotificationConfigInput,
    pub sampling: SamplingConfigInput,
    pub state: StateConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MemberConfigInput {
    pub name: String,
    pub class: Option<String>,
    pub interface: Option<String>,
    pub metric: Option<u32>,
    pub weight: Option<u32>,
    pub eligible: Option<bool>,
    pub poll_interval_s: Option<f64>,
    pub ping_target: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ScoringConfigInput {
    pub weight_latency: Option<f64>,
    pub weight_loss: Option<f64>,
    pub weight_jitter: Option<f64>,
    pub weight_obstruction: Option<f64>,
    pub weight_signal: Option<f64>,
    pub latency_excellent_ms: Option<f64>,
    pub latency_poor_ms: Option<f64>,
    pub loss_excellent_pct: Option<f64>,
    pub loss_poor_pct: Option<f64>,
    pub jitter_excellent_ms: Option<f64>,
    pub jitter_poor_ms: Option<f64>,
    pub obstruction_excellent_pct: Option<f64>,
    pub obstruction_poor_pct: Option<f64>,
    pub ewma_alpha: Option<f64>,
    pub window_size: Option<usize>,
    pub min_score: Option<f64>,
    pub max_score: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DecisionConfigInput {
    pub mode: Option<String>,
    pub latency_threshold_ms: Option<f64>,
    pub loss_threshold_pct: Option<f64>,
    pub obstruction_threshold_pct: Option<f64>,
    pub stability_checks_required: Option<u32>,
    pub emergency_multiplier: Option<f64>,
    pub strong_alternate_score: Option<f64>,
    pub hard_failover_score: Option<f64>,
    pub metric_penalty: Option<u32>,
    pub min_gps_satellites: Option<u32>,
    pub control_timeout_s: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ObstructionConfigInput {
    pub historical_time_pct_threshold: Option<f64>,
    pub prolonged_duration_threshold_s: Option<f64>,
    pub min_valid_s: Option<u64>,
    pub min_patches: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PredictiveConfigInput {
    pub enabled: Option<bool>,
    pub latency_trend_ms_per_min: Option<f64>,
    pub obstruction_trend_pct_per_min: Option<f64>,
    pub loss_spike_min_pct: Option<f64>,
    pub loss_spike_factor: Option<f64>,
    pub lookback_s: Option<u64>,
    pub min_samples: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GpsConfigInput {
    pub enabled: Option<bool>,
    pub sources: Option<Vec<String>>,
    pub accuracy_threshold_m: Option<f64>,
    pub staleness_threshold_s: Option<u64>,
    pub interval_s: Option<u64>,
    pub retry_attempts: Option<u32>,
    pub retry_delay_s: Option<f64>,
    pub command_timeout_s: Option<f64>,
    pub gpsctl_path: Option<String>,
    pub gsmctl_path: Option<String>,
    pub grpcurl_path: Option<String>,
    pub satellite_endpoint: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MovementConfigInput {
    pub movement_threshold_m: Option<f64>,
    pub stationary_threshold_m: Option<f64>,
    pub history_size: Option<usize>,
    pub acceleration_threshold_mps2: Option<f64>,
    pub time_window_s: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClusteringConfigInput {
    pub enabled: Option<bool>,
    pub min_radius_m: Option<f64>,
    pub max_radius_m: Option<f64>,
    pub min_samples: Option<u64>,
    pub problematic_threshold: Option<f64>,
    pub merge_distance_m: Option<f64>,
    pub max_clusters: Option<usize>,
    pub expiry_days: Option<u32>,
    pub ewma_alpha: Option<f64>,
    pub maintenance_interval_s: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TelemetryConfigInput {
    pub max_samples_per_member: Option<usize>,
    pub retention_h: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NotificationConfigInput {
    pub enabled: Option<bool>,
    pub rate_limit_per_hour: Option<u32>,
    pub connectivity_target: Option<String>,
    pub reach_timeout_s: Option<u64>,
    pub retry_attempts: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SamplingConfigInput {
    pub satellite_s: Option<f64>,
    pub cellular_s: Option<f64>,
    pub wifi_s: Option<f64>,
    pub wired_s: Option<f64>,
    pub vpn_s: Option<f64>,
    pub collect_timeout_s: Option<f64>,
    pub adaptive: Option<bool>,
    pub min_interval_s: Option<f64>,
    pub max_interval_s: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StateConfigInput {
    pub path: Option<String>,
    pub persist_interval_s: Option<u64>,
    pub decision_log_path: Option<String>,
    pub decision_history: Option<usize>,
}

// ── Resolved configuration ──────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct MemberConfig {
    pub member: Member,
    /// Overrides the class cadence from `[sampling]`.
    pub poll_interval: Option<Duration>,
    pub ping_target: String,
}

/// Linear scoring band: values at or better than `excellent` score 100, at
/// or worse than `poor` score 0.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Benchmark {
    pub excellent: f64,
    pub poor: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreWeights {
    pub latency: f64,
    pub loss: f64,
    pub jitter: f64,
    pub obstruction: f64,
    pub signal: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            latency: 0.25,
            loss: 0.30,
            jitter: 0.15,
            obstruction: 0.15,
            signal: 0.15,
        }
    }
}

impl ScoreWeights {
    pub fn total(&self) -> f64 {
        self.latency + self.loss + self.jitter + self.obstruction + self.signal
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoringConfig {
    pub weights: ScoreWeights,
    pub latency: Benchmark,
    pub loss: Benchmark,
    pub jitter: Benchmark,
    pub obstruction: Benchmark,
    pub ewma_alpha: f64,
    /// Number of instant scores averaged into the window component.
    pub window_size: usize,
    pub min_score: f64,
    pub max_score: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            weights: ScoreWeights::default(),
            latency: Benchmark {
                excellent: 50.0,
                poor: 500.0,
            },
            loss: Benchmark {
                excellent: 0.0,
                poor: 10.0,
            },
            jitter: Benchmark {
                excellent: 5.0,
                poor: 100.0,
            },
            obstruction: Benchmark {
                excellent: 0.0,
                poor: 20.0,
            },
            ewma_alpha: 0.1,
            window_size: 10,
            min_score: 0.0,
            max_score: 100.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecisionMode {
    /// Any hard threshold breach is bad.
    Basic,
    /// Multi-factor counting with strong-alternate and emergency escapes.
    #[default]
    Enhanced,
}

impl std::str::FromStr for DecisionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "basic" => Ok(DecisionMode::Basic),
            "enhanced" => Ok(DecisionMode::Enhanced),
            other => Err(format!("unknown decision mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecisionConfig {
    pub mode: DecisionMode,
    pub latency_threshold_ms: f64,
    pub loss_threshold_pct: f64,
    pub obstruction_threshold_pct: f64,
    pub stability_checks_required: u32,
    pub emergency_multiplier: f64,
    /// Final score an alternate member must reach to count as strong.
    pub strong_alternate_score: f64,
    /// Final score below which a failover is classified as hard.
    pub hard_failover_score: f64,
    /// Added to a member's base metric while it is failed over.
    pub metric_penalty: u32,
    pub min_gps_satellites: u32,
    /// Upper bound on every routing controller call.
    pub control_timeout: Duration,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            mode: DecisionMode::Enhanced,
            latency_threshold_ms: 150.0,
            loss_threshold_pct: 5.0,
            obstruction_threshold_pct: 5.0,
            stability_checks_required: 3,
            emergency_multiplier: 3.0,
            strong_alternate_score: 80.0,
            hard_failover_score: 30.0,
            metric_penalty: 10,
            min_gps_satellites: 4,
            control_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObstructionConfig {
    pub historical_time_pct_threshold: f64,
    pub prolonged_duration_threshold_s: f64,
    /// Seconds of valid obstruction data required before history is trusted.
    pub min_valid_s: u64,
    /// Measurement patches below this floor mark the data as low confidence.
    pub min_patches: u32,
}

impl Default for ObstructionConfig {
    fn default() -> Self {
        Self {
            historical_time_pct_threshold: 1.0,
            prolonged_duration_threshold_s: 30.0,
            min_valid_s: 3600,
            min_patches: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PredictiveConfig {
    pub enabled: bool,
    pub latency_trend_ms_per_min: f64,
    pub obstruction_trend_pct_per_min: f64,
    pub loss_spike_min_pct: f64,
    pub loss_spike_factor: f64,
    pub lookback: Duration,
    pub min_samples: usize,
}

impl Default for PredictiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            latency_trend_ms_per_min: 20.0,
            obstruction_trend_pct_per_min: 1.0,
            loss_spike_min_pct: 2.0,
            loss_spike_factor: 2.0,
            lookback: Duration::from_secs(300),
            min_samples: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GpsConfig {
    pub enabled: bool,
    /// Sources in priority order.
    pub sources: Vec<GpsSourceKind>,
    pub accuracy_threshold_m: f64,
    pub staleness_threshold: Duration,
    pub interval: Duration,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    pub command_timeout: Duration,
    pub gpsctl_path: String,
    pub gsmctl_path: String,
    pub grpcurl_path: String,
    pub satellite_endpoint: String,
}

impl Default for GpsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sources: vec![
                GpsSourceKind::Primary,
                GpsSourceKind::Satellite,
                GpsSourceKind::Cellular,
            ],
            accuracy_threshold_m: 50.0,
            staleness_threshold: Duration::from_secs(300),
            interval: Duration::from_secs(60),
            retry_attempts: 3,
            retry_delay: Duration::from_secs(5),
            command_timeout: Duration::from_secs(10),
            gpsctl_path: "gpsctl".into(),
            gsmctl_path: "gsmctl".into(),
            grpcurl_path: "grpcurl".into(),
            satellite_endpoint: "192.168.100.1:9200".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MovementConfig {
    pub movement_threshold_m: f64,
    pub stationary_threshold_m: f64,
    pub history_size: usize,
    pub acceleration_threshold_mps2: f64,
    /// Window used by the movement summary query.
    pub time_window: Duration,
}

impl Default for MovementConfig {
    fn default() -> Self {
        Self {
            movement_threshold_m: 500.0,
            stationary_threshold_m: 50.0,
            history_size: 100,
            acceleration_threshold_mps2: 2.0,
            time_window: Duration::from_secs(300),
        }
    }
}

/// Multipliers applied to the decision thresholds at a clustered location.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdFactors {
    pub latency: f64,
    pub loss: f64,
    pub obstruction: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClusteringConfig {
    pub enabled: bool,
    pub min_radius_m: f64,
    pub max_radius_m: f64,
    pub min_samples: u64,
    pub problematic_threshold: f64,
    pub merge_distance_m: f64,
    pub max_clusters: usize,
    pub expiry_days: u32,
    pub ewma_alpha: f64,
    pub maintenance_interval: Duration,
    pub relaxed: ThresholdFactors,
    pub tightened: ThresholdFactors,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_radius_m: 100.0,
            max_radius_m: 1000.0,
            min_samples: 5,
            problematic_threshold: 80.0,
            merge_distance_m: 200.0,
            max_clusters: 50,
            expiry_days: 30,
            ewma_alpha: 0.1,
            maintenance_interval: Duration::from_secs(3600),
            relaxed: ThresholdFactors {
                latency: 1.5,
                loss: 2.0,
                obstruction: 2.0,
            },
            tightened: ThresholdFactors {
                latency: 0.8,
                loss: 0.5,
                obstruction: 0.7,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryConfig {
    pub max_samples_per_member: usize,
    pub retention: Duration,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            max_samples_per_member: 1000,
            retention: Duration::from_secs(24 * 3600),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NotificationConfig {
    pub enabled: bool,
    pub rate_limit_per_hour: u32,
    /// `host:port` dialled to confirm outbound connectivity before sending.
    pub connectivity_target: String,
    pub reach_timeout: Duration,
    pub retry_attempts: u32,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rate_limit_per_hour: 20,
            connectivity_target: "1.1.1.1:443".into(),
            reach_timeout: Duration::from_secs(5),
            retry_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SamplingConfig {
    pub satellite: Duration,
    pub cellular: Duration,
    pub wifi: Duration,
    pub wired: Duration,
    pub vpn: Duration,
    pub collect_timeout: Duration,
    /// Stretch the cadence of healthy members and tighten it for failing ones.
    pub adaptive: bool,
    pub min_interval: Duration,
    pub max_interval: Duration,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            satellite: Duration::from_secs(1),
            cellular: Duration::from_secs(60),
            wifi: Duration::from_secs(5),
            wired: Duration::from_secs(5),
            vpn: Duration::from_secs(10),
            collect_timeout: Duration::from_secs(10),
            adaptive: true,
            min_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(300),
        }
    }
}

impl SamplingConfig {
    pub fn interval_for(&self, class: MemberClass) -> Duration {
        match class {
            MemberClass::Satellite => self.satellite,
            MemberClass::Cellular => self.cellular,
            MemberClass::Wifi => self.wifi,
            MemberClass::Wired => self.wired,
            MemberClass::Vpn => self.vpn,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StateConfig {
    pub path: Option<PathBuf>,
    pub persist_interval: Duration,
    /// Append-only JSON lines audit file for decisions.
    pub decision_log_path: Option<PathBuf>,
    pub decision_history: usize,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: None,
            persist_interval: Duration::from_secs(60),
            decision_log_path: None,
            decision_history: 1000,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TetherConfig {
    pub version: u32,
    pub members: Vec<MemberConfig>,
    pub scoring: ScoringConfig,
    pub decision: DecisionConfig,
    pub obstruction: ObstructionConfig,
    pub predictive: PredictiveConfig,
    pub gps: GpsConfig,
    pub movement: MovementConfig,
    pub clustering: ClusteringConfig,
    pub telemetry: TelemetryConfig,
    pub notifications: NotificationConfig,
    pub sampling: SamplingConfig,
    pub state: StateConfig,
}

// ── Resolution ──────────────────────────────────────────────────────

/// Positive finite seconds as a duration; anything else is unset.
fn opt_secs_f64(field: &str, value: Option<f64>) -> Result<Option<Duration>, ConfigError> {
    match value {
        Some(v) if v.is_finite() && v > 0.0 => Duration::try_from_secs_f64(v)
            .map(Some)
            .map_err(|e| ConfigError::Invalid(format!("{field} = {v}: {e}"))),
        _ => Ok(None),
    }
}

fn secs_f64(field: &str, value: Option<f64>, default: Duration) -> Result<Duration, ConfigError> {
    Ok(opt_secs_f64(field, value)?.unwrap_or(default))
}

fn secs(value: Option<u64>, default: Duration) -> Duration {
    match value {
        Some(v) if v > 0 => Duration::from_secs(v),
        _ => default,
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn benchmark(
    name: &str,
    excellent: Option<f64>,
    poor: Option<f64>,
    default: Benchmark,
) -> Result<Benchmark, ConfigError> {
    let b = Benchmark {
        excellent: excellent.unwrap_or(default.excellent),
        poor: poor.unwrap_or(default.poor),
    };
    if !(b.excellent < b.poor) {
        return Err(ConfigError::Invalid(format!(
            "scoring.{name}: excellent ({}) must be below poor ({})",
            b.excellent, b.poor
        )));
    }
    Ok(b)
}

impl MemberConfigInput {
    fn resolve(self) -> Result<MemberConfig, ConfigError> {
        let class = self
            .class
            .as_deref()
            .ok_or_else(|| ConfigError::Invalid(format!("member {}: missing class", self.name)))?
            .parse::<MemberClass>()
            .map_err(|e| ConfigError::Invalid(format!("member {}: {e}", self.name)))?;
        Ok(MemberConfig {
            member: Member {
                name: self.name.trim().to_string(),
                class,
                interface: non_empty(self.interface),
                metric: self.metric.unwrap_or(1),
                weight: self.weight.unwrap_or(100),
                eligible: self.eligible.unwrap_or(true),
            },
            poll_interval: opt_secs_f64(
                &format!("member {}: poll_interval_s", self.name.trim()),
                self.poll_interval_s,
            )?,
            ping_target: non_empty(self.ping_target).unwrap_or_else(|| "1.1.1.1".into()),
        })
    }
}

impl ScoringConfigInput {
    fn resolve(self) -> Result<ScoringConfig, ConfigError> {
        let d = ScoringConfig::default();
        let weights = ScoreWeights {
            latency: self.weight_latency.unwrap_or(d.weights.latency),
            loss: self.weight_loss.unwrap_or(d.weights.loss),
            jitter: self.weight_jitter.unwrap_or(d.weights.jitter),
            obstruction: self.weight_obstruction.unwrap_or(d.weights.obstruction),
            signal: self.weight_signal.unwrap_or(d.weights.signal),
        };
        let all = [
            weights.latency,
            weights.loss,
            weights.jitter,
            weights.obstruction,
            weights.signal,
        ];
        if all.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(ConfigError::Invalid(
                "scoring weights must be finite and non-negative".into(),
            ));
        }
        if (weights.total() - 1.0).abs() > 1e-6 {
            return Err(ConfigError::Invalid(format!(
                "scoring weights must total 1.0, got {:.4}",
                weights.total()
            )));
        }

        let mut ewma_alpha = self.ewma_alpha.unwrap_or(d.ewma_alpha);
        if !(ewma_alpha > 0.0 && ewma_alpha <= 1.0) {
            warn!(
                configured = ewma_alpha,
                fallback = d.ewma_alpha,
                "scoring.ewma_alpha outside (0, 1], using default"
            );
            ewma_alpha = d.ewma_alpha;
        }

        let min_score = self.min_score.unwrap_or(d.min_score);
        let max_score = self.max_score.unwrap_or(d.max_score);
        if !(min_score >= 0.0 && min_score < max_score && max_score <= 100.0) {
            return Err(ConfigError::Invalid(format!(
                "scoring bounds must satisfy 0 <= min_score < max_score <= 100, got {min_score}..{max_score}"
            )));
        }

        Ok(ScoringConfig {
            weights,
            latency: benchmark(
                "latency",
                self.latency_excellent_ms,
                self.latency_poor_ms,
                d.latency,
            )?,
            loss: benchmark("loss", self.loss_excellent_pct, self.loss_poor_pct, d.loss)?,
            jitter: benchmark(
                "jitter",
                self.jitter_excellent_ms,
                self.jitter_poor_ms,
                d.jitter,
            )?,
            obstruction: benchmark(
                "obstruction",
                self.obstruction_excellent_pct,
                self.obstruction_poor_pct,
                d.obstruction,
            )?,
            ewma_alpha,
            window_size: self.window_size.unwrap_or(d.window_size).max(1),
            min_score,
            max_score,
        })
    }
}

impl DecisionConfigInput {
    fn resolve(self) -> Result<DecisionConfig, ConfigError> {
        let d = DecisionConfig::default();
        let mode = match self.mode.as_deref() {
            Some(m) => m.parse().map_err(ConfigError::Invalid)?,
            None => d.mode,
        };

        let stability_checks_required = match self.stability_checks_required {
            Some(0) => {
                warn!(
                    fallback = d.stability_checks_required,
                    "decision.stability_checks_required = 0 would disable hysteresis, using default"
                );
                d.stability_checks_required
            }
            Some(n) => n,
            None => d.stability_checks_required,
        };

        let mut emergency_multiplier = self.emergency_multiplier.unwrap_or(d.emergency_multiplier);
        if !(emergency_multiplier > 1.0) {
            warn!(
                configured = emergency_multiplier,
                fallback = d.emergency_multiplier,
                "decision.emergency_multiplier must exceed 1.0, using default"
            );
            emergency_multiplier = d.emergency_multiplier;
        }

        let thresholds = [
            self.latency_threshold_ms.unwrap_or(d.latency_threshold_ms),
            self.loss_threshold_pct.unwrap_or(d.loss_threshold_pct),
            self.obstruction_threshold_pct
                .unwrap_or(d.obstruction_threshold_pct),
        ];
        if thresholds.iter().any(|t| !(t.is_finite() && *t > 0.0)) {
            return Err(ConfigError::Invalid(
                "decision thresholds must be positive".into(),
            ));
        }

        Ok(DecisionConfig {
            mode,
            latency_threshold_ms: thresholds[0],
            loss_threshold_pct: thresholds[1],
            obstruction_threshold_pct: thresholds[2],
            stability_checks_required,
            emergency_multiplier,
            strong_alternate_score: self
                .strong_alternate_score
                .unwrap_or(d.strong_alternate_score),
            hard_failover_score: self.hard_failover_score.unwrap_or(d.hard_failover_score),
            metric_penalty: self.metric_penalty.unwrap_or(d.metric_penalty).max(1),
            min_gps_satellites: self.min_gps_satellites.unwrap_or(d.min_gps_satellites),
            control_timeout: secs_f64(
                "decision.control_timeout_s",
                self.control_timeout_s,
                d.control_timeout,
            )?,
        })
    }
}

impl GpsConfigInput {
    fn resolve(self) -> Result<GpsConfig, ConfigError> {
        let d = GpsConfig::default();
        let sources = match self.sources {
            Some(list) => {
                let mut seen = HashSet::new();
                let mut out = Vec::new();
                for raw in list {
                    let kind: GpsSourceKind = raw.trim().parse().map_err(ConfigError::Invalid)?;
                    if seen.insert(kind) {
                        out.push(kind);
                    }
                }
                out
            }
            None => d.sources,
        };
        let retry_attempts = match self.retry_attempts {
            Some(0) => {
                warn!("gps.retry_attempts = 0 would never collect, using 1");
                1
            }
            Some(n) => n,
            None => d.retry_attempts,
        };
        Ok(GpsConfig {
            enabled: self.enabled.unwrap_or(d.enabled),
            sources,
            accuracy_threshold_m: self.accuracy_threshold_m.unwrap_or(d.accuracy_threshold_m),
            staleness_threshold: secs(self.staleness_threshold_s, d.staleness_threshold),
            interval: secs(self.interval_s, d.interval),
            retry_attempts,
            retry_delay: match self.retry_delay_s {
                Some(v) if v.is_finite() && v >= 0.0 => Duration::try_from_secs_f64(v)
                    .map_err(|e| ConfigError::Invalid(format!("gps.retry_delay_s = {v}: {e}")))?,
                _ => d.retry_delay,
            },
            command_timeout: secs_f64(
                "gps.command_timeout_s",
                self.command_timeout_s,
                d.command_timeout,
            )?,
            gpsctl_path: non_empty(self.gpsctl_path).unwrap_or(d.gpsctl_path),
            gsmctl_path: non_empty(self.gsmctl_path).unwrap_or(d.gsmctl_path),
            grpcurl_path: non_empty(self.grpcurl_path).unwrap_or(d.grpcurl_path),
            satellite_endpoint: non_empty(self.satellite_endpoint)
                .unwrap_or(d.satellite_endpoint),
        })
    }
}

impl ClusteringConfigInput {
    fn resolve(self) -> Result<ClusteringConfig, ConfigError> {
        let d = ClusteringConfig::default();
        let min_radius_m = self.min_radius_m.unwrap_or(d.min_radius_m);
        let max_radius_m = self.max_radius_m.unwrap_or(d.max_radius_m);
        if !(min_radius_m > 0.0 && min_radius_m <= max_radius_m) {
            return Err(ConfigError::Invalid(format!(
                "clustering radius bounds invalid: {min_radius_m}..{max_radius_m}"
            )));
        }
        let mut ewma_alpha = self.ewma_alpha.unwrap_or(d.ewma_alpha);
        if !(ewma_alpha > 0.0 && ewma_alpha <= 1.0) {
            warn!(
                configured = ewma_alpha,
                fallback = d.ewma_alpha,
                "clustering.ewma_alpha outside (0, 1], using default"
            );
            ewma_alpha = d.ewma_alpha;
        }
        Ok(ClusteringConfig {
            enabled: self.enabled.unwrap_or(d.enabled),
            min_radius_m,
            max_radius_m,
            min_samples: self.min_samples.unwrap_or(d.min_samples).max(1),
            problematic_threshold: self
                .problematic_threshold
                .unwrap_or(d.problematic_threshold),
            merge_distance_m: self.merge_distance_m.unwrap_or(d.merge_distance_m),
            max_clusters: self.max_clusters.unwrap_or(d.max_clusters).max(1),
            expiry_days: self.expiry_days.unwrap_or(d.expiry_days).max(1),
            ewma_alpha,
            maintenance_interval: secs(self.maintenance_interval_s, d.maintenance_interval),
            relaxed: d.relaxed,
            tightened: d.tightened,
        })
    }
}

impl TetherConfigInput {
    pub fn resolve(self) -> Result<TetherConfig, ConfigError> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(ConfigError::Invalid(format!(
                "unsupported config version {version}"
            )));
        }

        let mut used = HashSet::new();
        let mut members = Vec::new();
        for input in self.members {
            if input.name.trim().is_empty() {
                warn!("skipping member with empty name");
                continue;
            }
            let member = input.resolve()?;
            if !used.insert(member.member.name.clone()) {
                warn!(member = %member.member.name, "duplicate member name, keeping first");
                continue;
            }
            members.push(member);
        }

        let obstruction = {
            let d = ObstructionConfig::default();
            let o = self.obstruction;
            ObstructionConfig {
                historical_time_pct_threshold: o
                    .historical_time_pct_threshold
                    .unwrap_or(d.historical_time_pct_threshold),
                prolonged_duration_threshold_s: o
                    .prolonged_duration_threshold_s
                    .unwrap_or(d.prolonged_duration_threshold_s),
                min_valid_s: o.min_valid_s.unwrap_or(d.min_valid_s),
                min_patches: o.min_patches.unwrap_or(d.min_patches),
            }
        };

        let predictive = {
            let d = PredictiveConfig::default();
            let p = self.predictive;
            PredictiveConfig {
                enabled: p.enabled.unwrap_or(d.enabled),
                latency_trend_ms_per_min: p
                    .latency_trend_ms_per_min
                    .unwrap_or(d.latency_trend_ms_per_min),
                obstruction_trend_pct_per_min: p
                    .obstruction_trend_pct_per_min
                    .unwrap_or(d.obstruction_trend_pct_per_min),
                loss_spike_min_pct: p.loss_spike_min_pct.unwrap_or(d.loss_spike_min_pct),
                loss_spike_factor: p.loss_spike_factor.unwrap_or(d.loss_spike_factor),
                lookback: secs(p.lookback_s, d.lookback),
                min_samples: p.min_samples.unwrap_or(d.min_samples).max(2),
            }
        };

        let movement = {
            let d = MovementConfig::default();
            let m = self.movement;
            let moving = m.movement_threshold_m.unwrap_or(d.movement_threshold_m);
            let stationary = m.stationary_threshold_m.unwrap_or(d.stationary_threshold_m);
            if !(stationary >= 0.0 && stationary <= moving && moving.is_finite()) {
                return Err(ConfigError::Invalid(format!(
                    "movement thresholds must satisfy 0 <= stationary_threshold_m <= movement_threshold_m, got {stationary}..{moving}"
                )));
            }
            MovementConfig {
                movement_threshold_m: moving,
                stationary_threshold_m: stationary,
                history_size: m.history_size.unwrap_or(d.history_size).max(1),
                acceleration_threshold_mps2: m
                    .acceleration_threshold_mps2
                    .unwrap_or(d.acceleration_threshold_mps2),
                time_window: secs(m.time_window_s, d.time_window),
            }
        };

        let telemetry = {
            let d = TelemetryConfig::default();
            TelemetryConfig {
                max_samples_per_member: self
                    .telemetry
                    .max_samples_per_member
                    .unwrap_or(d.max_samples_per_member)
                    .max(16),
                retention: self
                    .telemetry
                    .retention_h
                    .filter(|h| *h > 0)
                    .map(|h| Duration::from_secs(h * 3600))
                    .unwrap_or(d.retention),
            }
        };

        let notifications = {
            let d = NotificationConfig::default();
            let n = self.notifications;
            NotificationConfig {
                enabled: n.enabled.unwrap_or(d.enabled),
                rate_limit_per_hour: n.rate_limit_per_hour.unwrap_or(d.rate_limit_per_hour),
                connectivity_target: non_empty(n.connectivity_target)
                    .unwrap_or(d.connectivity_target),
                reach_timeout: secs(n.reach_timeout_s, d.reach_timeout),
                retry_attempts: n.retry_attempts.unwrap_or(d.retry_attempts).max(1),
            }
        };

        let sampling = {
            let d = SamplingConfig::default();
            let s = self.sampling;
            let min_interval =
                secs_f64("sampling.min_interval_s", s.min_interval_s, d.min_interval)?;
            let max_interval =
                secs_f64("sampling.max_interval_s", s.max_interval_s, d.max_interval)?;
            if min_interval > max_interval {
                return Err(ConfigError::Invalid(format!(
                    "sampling.min_interval_s ({min_interval:?}) exceeds max_interval_s ({max_interval:?})"
                )));
            }
            SamplingConfig {
                satellite: secs_f64("sampling.satellite_s", s.satellite_s, d.satellite)?,
                cellular: secs_f64("sampling.cellular_s", s.cellular_s, d.cellular)?,
                wifi: secs_f64("sampling.wifi_s", s.wifi_s, d.wifi)?,
                wired: secs_f64("sampling.wired_s", s.wired_s, d.wired)?,
                vpn: secs_f64("sampling.vpn_s", s.vpn_s, d.vpn)?,
                collect_timeout: secs_f64(
                    "sampling.collect_timeout_s",
                    s.collect_timeout_s,
                    d.collect_timeout,
                )?,
                adaptive: s.adaptive.unwrap_or(d.adaptive),
                min_interval,
                max_interval,
            }
        };

        let state = {
            let d = StateConfig::default();
            StateConfig {
                path: non_empty(self.state.path).map(PathBuf::from),
                persist_interval: secs(self.state.persist_interval_s, d.persist_interval),
                decision_log_path: non_empty(self.state.decision_log_path).map(PathBuf::from),
                decision_history: self
                    .state
                    .decision_history
                    .unwrap_or(d.decision_history)
                    .max(1),
            }
        };

        Ok(TetherConfig {
            version,
            members,
            scoring: self.scoring.resolve()?,
            decision: self.decision.resolve()?,
            obstruction,
            predictive,
            gps: self.gps.resolve()?,
            movement,
            clustering: self.clustering.resolve()?,
            telemetry,
            notifications,
            sampling,
            state,
        })
    }
}

impl TetherConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(TetherConfig {
                version: CONFIG_VERSION,
                ..TetherConfig::default()
            });
        }
        let parsed: TetherConfigInput =
            toml::from_str(input).map_err(|e| ConfigError::Parse(e.to_string()))?;
        parsed.resolve()
    }

    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Poll cadence for a member: its own override, else the class default.
    pub fn poll_interval(&self, member: &MemberConfig) -> Duration {
        member
            .poll_interval
            .unwrap_or_else(|| self.sampling.interval_for(member.member.class))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_toml_config_basic() {
        let toml = r#"
            version = 1

            [[members]]
            name = "starlink"
            class = "satellite"
            interface = "wan"
            metric = 1

            [[members]]
            name = "lte"
            class = "cellular"
            interface = "mob1s1a1"
            metric = 2
            poll_interval_s = 30

            [decision]
            mode = "basic"
            stability_checks_required = 5

            [gps]
            sources = ["satellite", "primary"]
            accuracy_threshold_m = 25
        "#;

        let cfg = TetherConfig::from_toml_str(toml).unwrap();
        assert_eq!(cfg.version, CONFIG_VERSION);
        assert_eq!(cfg.members.len(), 2);
        assert_eq!(cfg.members[0].member.class, MemberClass::Satellite);
        assert_eq!(cfg.members[0].member.interface.as_deref(), Some("wan"));
        assert_eq!(cfg.members[1].member.metric, 2);
        assert_eq!(cfg.poll_interval(&cfg.members[0]), Duration::from_secs(1));
        assert_eq!(cfg.poll_interval(&cfg.members[1]), Duration::from_secs(30));
        assert_eq!(cfg.decision.mode, DecisionMode::Basic);
        assert_eq!(cfg.decision.stability_checks_required, 5);
        assert_eq!(
            cfg.gps.sources,
            vec![GpsSourceKind::Satellite, GpsSourceKind::Primary]
        );
        assert_eq!(cfg.gps.accuracy_threshold_m, 25.0);
        assert_eq!(cfg.gps.retry_attempts, 3);
    }

    #[test]
    fn empty_input_uses_defaults() {
        let cfg = TetherConfig::from_toml_str("").unwrap();
        assert!(cfg.members.is_empty());
        assert_eq!(cfg.movement.movement_threshold_m, 500.0);
        assert_eq!(cfg.clustering.max_clusters, 50);
        assert_eq!(cfg.scoring.latency.poor, 500.0);
    }

    #[test]
    fn zero_stability_count_falls_back_to_default() {
        let cfg = TetherConfig::from_toml_str(
            r#"
            [decision]
            stability_checks_required = 0
            "#,
        )
        .unwrap();
        assert_eq!(
            cfg.decision.stability_checks_required,
            DecisionConfig::default().stability_checks_required
        );
    }

    #[test]
    fn weights_must_total_one() {
        let err = TetherConfig::from_toml_str(
            r#"
            [scoring]
            weight_latency = 0.9
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn duplicate_members_keep_first() {
        let cfg = TetherConfig::from_toml_str(
            r#"
            [[members]]
            name = "a"
            class = "wired"
            metric = 1
            [[members]]
            name = "a"
            class = "wifi"
            metric = 7
            "#,
        )
        .unwrap();
        assert_eq!(cfg.members.len(), 1);
        assert_eq!(cfg.members[0].member.class, MemberClass::Wired);
    }

    #[test]
    fn unknown_class_is_rejected() {
        let err = TetherConfig::from_toml_str(
            r#"
            [[members]]
            name = "x"
            class = "dialup"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("dialup"));
    }

    #[test]
    fn oversized_interval_is_rejected() {
        let err = TetherConfig::from_toml_str(
            r#"
            [[members]]
            name = "wan"
            class = "wired"
            poll_interval_s = 1e20
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert!(err.to_string().contains("poll_interval_s"));

        let err = TetherConfig::from_toml_str(
            r#"
            [decision]
            control_timeout_s = 1e30
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("control_timeout_s"));
    }

    #[test]
    fn movement_thresholds_must_be_ordered() {
        let err = TetherConfig::from_toml_str(
            r#"
            [movement]
            movement_threshold_m = 40
            stationary_threshold_m = 50
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = TetherConfig::from_toml_str(
            r#"
            [movement]
            stationary_threshold_m = -1
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn sampling_bounds_and_control_timeout() {
        let cfg = TetherConfig::from_toml_str(
            r#"
            [decision]
            control_timeout_s = 2.5

            [sampling]
            adaptive = false
            min_interval_s = 2
            max_interval_s = 120
            "#,
        )
        .unwrap();
        assert_eq!(cfg.decision.control_timeout, Duration::from_millis(2500));
        assert!(!cfg.sampling.adaptive);
        assert_eq!(cfg.sampling.min_interval, Duration::from_secs(2));
        assert_eq!(cfg.sampling.max_interval, Duration::from_secs(120));

        let err = TetherConfig::from_toml_str(
            r#"
            [sampling]
            min_interval_s = 600
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("min_interval_s"));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let err = TetherConfig::from_toml_str("[[members]\nname=").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
