//! Data models for the Tether failover engine.
//!
//! These types flow between the collectors, the decision engine, the GPS
//! context and the decision log, and are what gets persisted across restarts
//! and served to the status API.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Member ──────────────────────────────────────────────────────────

/// Link technology of an uplink member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberClass {
    Satellite,
    Cellular,
    Wifi,
    Wired,
    Vpn,
}

impl MemberClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberClass::Satellite => "satellite",
            MemberClass::Cellular => "cellular",
            MemberClass::Wifi => "wifi",
            MemberClass::Wired => "wired",
            MemberClass::Vpn => "vpn",
        }
    }
}

impl std::fmt::Display for MemberClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MemberClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "satellite" | "starlink" => Ok(MemberClass::Satellite),
            "cellular" | "lte" | "5g" => Ok(MemberClass::Cellular),
            "wifi" => Ok(MemberClass::Wifi),
            "wired" | "lan" | "ethernet" => Ok(MemberClass::Wired),
            "vpn" | "tunnel" => Ok(MemberClass::Vpn),
            other => Err(format!("unknown member class: {other}")),
        }
    }
}

/// One candidate uplink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub name: String,
    pub class: MemberClass,
    pub interface: Option<String>,
    /// Routing metric currently applied. Lower is preferred.
    pub metric: u32,
    pub weight: u32,
    pub eligible: bool,
}

// ── Metrics & Score ─────────────────────────────────────────────────

/// One health sample for a member. Class-specific fields are `None` when the
/// link's diagnostics do not report them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub timestamp: DateTime<Utc>,
    pub latency_ms: f64,
    pub loss_pct: f64,
    pub jitter_ms: f64,

    /// Fraction of sky view currently obstructed, in percent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub obstruction_pct: Option<f64>,
    /// Historical share of time spent obstructed, in percent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub obstruction_time_pct: Option<f64>,
    /// Seconds of valid obstruction measurements backing the history.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub obstruction_valid_s: Option<u64>,
    /// Mean duration of prolonged obstruction events, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub obstruction_avg_prolonged_s: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub obstruction_patches_valid: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rsrp_dbm: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rsrq_db: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sinr_db: Option<f64>,
    /// Modem-reported signal quality, 0–100.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_pct: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wifi_signal_dbm: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wifi_noise_dbm: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime_s: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snr_above_noise_floor: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snr_persistently_low: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gps_valid: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gps_satellites: Option<u32>,
}

impl Metrics {
    /// A sample carrying only the transport-level fields.
    pub fn new(timestamp: DateTime<Utc>, latency_ms: f64, loss_pct: f64, jitter_ms: f64) -> Self {
        Self {
            timestamp,
            latency_ms,
            loss_pct,
            jitter_ms,
            ..Self::default()
        }
    }
}

/// Health score for one member at one cycle. Every field is in `[0, 100]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub instant: f64,
    pub ewma: f64,
    #[serde(rename = "final")]
    pub final_score: f64,
}

// ── Link state ──────────────────────────────────────────────────────

/// Failover state of a member in the decision engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    #[default]
    Up,
    Down,
    Recovering,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Up => "up",
            LinkState::Down => "down",
            LinkState::Recovering => "recovering",
        }
    }
}

// ── GPS ─────────────────────────────────────────────────────────────

/// Where a GPS fix came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpsSourceKind {
    /// Router-integrated GNSS receiver.
    Primary,
    /// GNSS reported by the satellite terminal.
    Satellite,
    /// GNSS engine of the cellular modem.
    Cellular,
    Simulated,
}

impl GpsSourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GpsSourceKind::Primary => "primary",
            GpsSourceKind::Satellite => "satellite",
            GpsSourceKind::Cellular => "cellular",
            GpsSourceKind::Simulated => "simulated",
        }
    }
}

impl std::str::FromStr for GpsSourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "primary" | "gnss" => Ok(GpsSourceKind::Primary),
            "satellite" | "starlink" => Ok(GpsSourceKind::Satellite),
            "cellular" | "modem" => Ok(GpsSourceKind::Cellular),
            "simulated" => Ok(GpsSourceKind::Simulated),
            other => Err(format!("unknown GPS source: {other}")),
        }
    }
}

/// A single position fix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpsData {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    /// Horizontal accuracy in metres.
    pub accuracy: f64,
    pub satellites: u32,
    pub source: GpsSourceKind,
    pub valid: bool,
    pub timestamp: DateTime<Utc>,
}

// ── Movement ────────────────────────────────────────────────────────

/// Movement regime, ordered from calmest to most agitated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementType {
    Stationary,
    Slow,
    Normal,
    Fast,
    Rapid,
}

impl MovementType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MovementType::Stationary => "stationary",
            MovementType::Slow => "slow",
            MovementType::Normal => "normal",
            MovementType::Fast => "fast",
            MovementType::Rapid => "rapid",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementAction {
    #[default]
    None,
    ObstructionMapReset,
}

impl MovementAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            MovementAction::None => "none",
            MovementAction::ObstructionMapReset => "obstruction_map_reset",
        }
    }
}

/// Displacement between two consecutive valid fixes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovementEvent {
    pub timestamp: DateTime<Utc>,
    pub from: GpsData,
    pub to: GpsData,
    pub distance_m: f64,
    pub duration_s: f64,
    pub velocity_mps: f64,
    pub acceleration_mps2: f64,
    pub movement_type: MovementType,
    pub action_triggered: MovementAction,
}

// ── Location clusters ───────────────────────────────────────────────

/// A spatial grouping of performance samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationCluster {
    pub id: String,
    pub center_latitude: f64,
    pub center_longitude: f64,
    pub radius_m: f64,
    pub sample_count: u64,
    pub avg_latency_ms: f64,
    pub avg_loss_pct: f64,
    pub avg_obstruction_pct: f64,
    pub problematic: bool,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

// ── Decisions ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionType {
    Evaluation,
    SoftFailover,
    HardFailover,
    Restore,
    Maintenance,
}

impl DecisionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionType::Evaluation => "evaluation",
            DecisionType::SoftFailover => "soft_failover",
            DecisionType::HardFailover => "hard_failover",
            DecisionType::Restore => "restore",
            DecisionType::Maintenance => "maintenance",
        }
    }

    /// Whether this decision changed a member's routing state.
    pub fn is_transition(&self) -> bool {
        matches!(
            self,
            DecisionType::SoftFailover | DecisionType::HardFailover | DecisionType::Restore
        )
    }
}

impl std::fmt::Display for DecisionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    #[default]
    None,
    MetricIncrease,
    MetricRestore,
    BaselineReset,
}

impl DecisionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionAction::None => "none",
            DecisionAction::MetricIncrease => "metric_increase",
            DecisionAction::MetricRestore => "metric_restore",
            DecisionAction::BaselineReset => "baseline_reset",
        }
    }
}

/// Immutable audit record of one evaluation cycle for one member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub decision_type: DecisionType,
    pub member: String,
    pub action: DecisionAction,
    pub from_metric: Option<u32>,
    pub to_metric: Option<u32>,
    pub trigger_reason: String,
    #[serde(default)]
    pub quality_factors: BTreeMap<String, f64>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<GpsData>,
    pub predictive: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_class_round_trips_through_str() {
        for class in [
            MemberClass::Satellite,
            MemberClass::Cellular,
            MemberClass::Wifi,
            MemberClass::Wired,
            MemberClass::Vpn,
        ] {
            assert_eq!(class.as_str().parse::<MemberClass>().unwrap(), class);
        }
        assert_eq!("starlink".parse::<MemberClass>().unwrap(), MemberClass::Satellite);
        assert!("carrier-pigeon".parse::<MemberClass>().is_err());
    }

    #[test]
    fn movement_types_are_ordered_by_agitation() {
        assert!(MovementType::Stationary < MovementType::Slow);
        assert!(MovementType::Slow < MovementType::Normal);
        assert!(MovementType::Normal < MovementType::Fast);
        assert!(MovementType::Fast < MovementType::Rapid);
    }

    #[test]
    fn decision_serializes_type_field() {
        let decision = Decision {
            id: "dec_1".into(),
            timestamp: Utc::now(),
            decision_type: DecisionType::SoftFailover,
            member: "sat0".into(),
            action: DecisionAction::MetricIncrease,
            from_metric: Some(1),
            to_metric: Some(11),
            trigger_reason: "latency".into(),
            quality_factors: BTreeMap::new(),
            success: true,
            error: None,
            location: None,
            predictive: false,
        };
        let json = serde_json::to_value(&decision).unwrap();
        assert_eq!(json["type"], "soft_failover");
        assert_eq!(json["action"], "metric_increase");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn score_serializes_final_field() {
        let score = Score {
            instant: 90.0,
            ewma: 80.0,
            final_score: 85.0,
        };
        let json = serde_json::to_value(score).unwrap();
        assert_eq!(json["final"], 85.0);
    }

    #[test]
    fn sparse_metrics_deserialize() {
        let m: Metrics = serde_json::from_str(
            r#"{"timestamp":"2026-01-01T00:00:00Z","latency_ms":40.0,"loss_pct":0.5,"jitter_ms":3.0}"#,
        )
        .unwrap();
        assert_eq!(m.latency_ms, 40.0);
        assert!(m.obstruction_pct.is_none());
    }
}
