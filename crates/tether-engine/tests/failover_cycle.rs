//! # Integration tests: sample → score → decision → control plane
//!
//! Drives a [`DecisionEngine`] directly with hand-built samples against an
//! in-memory controller. No timers, no network.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use tether_common::models::{
    DecisionAction, DecisionType, GpsData, GpsSourceKind, LinkState, Member, MemberClass,
    Metrics, MovementAction,
};
use tether_engine::config::{DecisionConfig, GpsConfig, MemberConfig, TetherConfig};
use tether_engine::context::LocationContext;
use tether_engine::decision::{DecisionEngine, DecisionLog};
use tether_engine::error::{CollectError, ControlError, GpsError};
use tether_engine::gps::{GpsCollector, GpsSource, SimulatedGps};
use tether_engine::interfaces::Controller;

// ─── Helpers ────────────────────────────────────────────────────────────────

#[derive(Default)]
struct MemoryController {
    applied: Mutex<Vec<(String, u32)>>,
    fail: Mutex<bool>,
}

#[async_trait::async_trait]
impl Controller for MemoryController {
    async fn switch(&self, _from: &str, _to: &str) -> Result<(), ControlError> {
        Ok(())
    }

    async fn current_member(&self) -> Result<Option<String>, ControlError> {
        Ok(None)
    }

    async fn apply_metric(&self, member: &str, metric: u32) -> Result<(), ControlError> {
        if *self.fail.lock().unwrap() {
            return Err(ControlError::ApplyMetric {
                member: member.into(),
                metric,
                reason: "netlink busy".into(),
            });
        }
        self.applied.lock().unwrap().push((member.into(), metric));
        Ok(())
    }
}

fn member(name: &str, class: MemberClass, metric: u32) -> MemberConfig {
    MemberConfig {
        member: Member {
            name: name.into(),
            class,
            interface: Some(format!("{name}0")),
            metric,
            weight: 100,
            eligible: true,
        },
        poll_interval: None,
        ping_target: "1.1.1.1".into(),
    }
}

fn config(members: Vec<MemberConfig>) -> TetherConfig {
    TetherConfig {
        members,
        ..TetherConfig::default()
    }
}

fn engine(cfg: &TetherConfig, ctl: Arc<MemoryController>) -> DecisionEngine {
    DecisionEngine::new(cfg, ctl, Arc::new(DecisionLog::new(500)))
}

fn at(t0: DateTime<Utc>, secs: i64) -> DateTime<Utc> {
    t0 + Duration::seconds(secs)
}

fn fix(latitude: f64, longitude: f64, timestamp: DateTime<Utc>) -> GpsData {
    GpsData {
        latitude,
        longitude,
        altitude: 10.0,
        accuracy: 5.0,
        satellites: 9,
        source: GpsSourceKind::Primary,
        valid: true,
        timestamp,
    }
}

// ─── Scoring and thresholds ────────────────────────────────────────────────

#[tokio::test]
async fn excellent_sample_scores_full_and_stays_up() {
    let cfg = config(vec![member("wan", MemberClass::Wired, 1)]);
    let ctl = Arc::new(MemoryController::default());
    let mut e = engine(&cfg, ctl.clone());

    let d = e
        .evaluate("wan", Ok(Metrics::new(Utc::now(), 20.0, 0.0, 1.0)))
        .await
        .unwrap();

    assert_eq!(d.decision_type, DecisionType::Evaluation);
    assert_eq!(d.trigger_reason, "quality_good");
    assert!((d.quality_factors["score_final"] - 100.0).abs() < 1e-9);
    assert_eq!(e.member_state("wan"), Some((LinkState::Up, 0)));
    assert!(ctl.applied.lock().unwrap().is_empty());
}

#[tokio::test]
async fn emergency_latency_soft_fails_over() {
    let cfg = config(vec![member("wan", MemberClass::Wired, 1)]);
    let ctl = Arc::new(MemoryController::default());
    let mut e = engine(&cfg, ctl.clone());

    let d = e
        .evaluate("wan", Ok(Metrics::new(Utc::now(), 600.0, 0.0, 1.0)))
        .await
        .unwrap();

    assert_eq!(d.decision_type, DecisionType::SoftFailover);
    assert_eq!(d.action, DecisionAction::MetricIncrease);
    assert_eq!(d.from_metric, Some(1));
    assert_eq!(d.to_metric, Some(11));
    assert_eq!(d.quality_factors["latency_score"], 0.0);
    assert_eq!(d.trigger_reason, "emergency_high_latency");
    assert_eq!(ctl.applied.lock().unwrap().as_slice(), &[("wan".to_string(), 11)]);
    assert_eq!(e.member_state("wan").map(|s| s.0), Some(LinkState::Down));
}

// ─── Hysteresis ────────────────────────────────────────────────────────────

#[tokio::test]
async fn restore_waits_for_stability_count() {
    let mut cfg = config(vec![member("wan", MemberClass::Wired, 1)]);
    cfg.decision = DecisionConfig {
        stability_checks_required: 5,
        ..DecisionConfig::default()
    };
    let ctl = Arc::new(MemoryController::default());
    let mut e = engine(&cfg, ctl.clone());
    let t0 = Utc::now();

    e.evaluate("wan", Ok(Metrics::new(at(t0, 0), 600.0, 0.0, 1.0)))
        .await
        .unwrap();

    for i in 1..=4 {
        let d = e
            .evaluate("wan", Ok(Metrics::new(at(t0, i), 20.0, 0.0, 1.0)))
            .await
            .unwrap();
        assert_eq!(d.trigger_reason, "recovering", "cycle {i}");
        assert_eq!(e.member_state("wan"), Some((LinkState::Recovering, i as u32)));
    }

    let d = e
        .evaluate("wan", Ok(Metrics::new(at(t0, 5), 20.0, 0.0, 1.0)))
        .await
        .unwrap();
    assert_eq!(d.decision_type, DecisionType::Restore);
    assert_eq!(d.action, DecisionAction::MetricRestore);
    assert_eq!(d.to_metric, Some(1));
    assert_eq!(e.member_state("wan"), Some((LinkState::Up, 0)));
    assert_eq!(
        ctl.applied.lock().unwrap().last(),
        Some(&("wan".to_string(), 1))
    );
}

#[tokio::test]
async fn bad_sample_during_recovery_resets_stability() {
    let cfg = config(vec![member("wan", MemberClass::Wired, 1)]);
    let mut e = engine(&cfg, Arc::new(MemoryController::default()));
    let t0 = Utc::now();

    e.evaluate("wan", Ok(Metrics::new(at(t0, 0), 600.0, 0.0, 1.0)))
        .await
        .unwrap();
    e.evaluate("wan", Ok(Metrics::new(at(t0, 1), 20.0, 0.0, 1.0)))
        .await
        .unwrap();
    e.evaluate("wan", Ok(Metrics::new(at(t0, 2), 20.0, 0.0, 1.0)))
        .await
        .unwrap();
    assert_eq!(e.member_state("wan"), Some((LinkState::Recovering, 2)));

    let d = e
        .evaluate("wan", Ok(Metrics::new(at(t0, 3), 600.0, 0.0, 1.0)))
        .await
        .unwrap();
    assert_eq!(d.decision_type, DecisionType::SoftFailover);
    assert_eq!(e.member_state("wan"), Some((LinkState::Down, 0)));
}

// ─── Failure paths ─────────────────────────────────────────────────────────

#[tokio::test]
async fn control_plane_failure_is_logged_and_retried() {
    let cfg = config(vec![member("wan", MemberClass::Wired, 1)]);
    let ctl = Arc::new(MemoryController::default());
    *ctl.fail.lock().unwrap() = true;
    let mut e = engine(&cfg, ctl.clone());
    let t0 = Utc::now();

    let d = e
        .evaluate("wan", Ok(Metrics::new(at(t0, 0), 600.0, 0.0, 1.0)))
        .await
        .unwrap();
    assert!(!d.success);
    assert!(d.error.as_deref().unwrap_or("").contains("netlink busy"));
    assert_eq!(e.member_state("wan"), Some((LinkState::Up, 0)));

    let stats = e.log().stats(None);
    assert_eq!(stats.failed, 1);

    *ctl.fail.lock().unwrap() = false;
    let d = e
        .evaluate("wan", Ok(Metrics::new(at(t0, 1), 600.0, 0.0, 1.0)))
        .await
        .unwrap();
    assert!(d.success);
    assert_eq!(d.decision_type, DecisionType::SoftFailover);
}

#[tokio::test]
async fn collection_failure_records_a_failed_evaluation() {
    let cfg = config(vec![member("wan", MemberClass::Wired, 1)]);
    let mut e = engine(&cfg, Arc::new(MemoryController::default()));

    let d = e
        .evaluate(
            "wan",
            Err(CollectError::Timeout {
                member: "wan".into(),
                after: std::time::Duration::from_secs(10),
            }),
        )
        .await
        .unwrap();

    assert_eq!(d.decision_type, DecisionType::Evaluation);
    assert_eq!(d.trigger_reason, "collection_failed");
    assert!(!d.success);
    assert_eq!(e.member_state("wan"), Some((LinkState::Up, 0)));
    assert_eq!(e.telemetry().len("wan"), 0);
}

// ─── Determinism ───────────────────────────────────────────────────────────

#[tokio::test]
async fn identical_inputs_produce_identical_decisions() {
    let cfg = config(vec![
        member("sat", MemberClass::Satellite, 1),
        member("lte", MemberClass::Cellular, 2),
    ]);
    let t0 = Utc::now();
    let script: Vec<(&str, f64, f64)> = vec![
        ("lte", 40.0, 0.0),
        ("sat", 35.0, 0.0),
        ("sat", 180.0, 1.0),
        ("sat", 700.0, 12.0),
        ("lte", 45.0, 0.5),
        ("sat", 40.0, 0.0),
        ("sat", 38.0, 0.0),
        ("sat", 36.0, 0.0),
    ];

    let mut runs = Vec::new();
    for _ in 0..2 {
        let mut e = engine(&cfg, Arc::new(MemoryController::default()));
        let mut out = Vec::new();
        for (i, (name, latency, loss)) in script.iter().enumerate() {
            let mut m = Metrics::new(at(t0, i as i64), *latency, *loss, 3.0);
            if *name == "sat" {
                m.obstruction_pct = Some(0.5);
            }
            let d = e.evaluate(name, Ok(m)).await.unwrap();
            out.push((d.decision_type, d.trigger_reason, d.quality_factors, d.to_metric));
        }
        runs.push(out);
    }
    assert_eq!(runs[0], runs[1]);
}

// ─── Location awareness ────────────────────────────────────────────────────

#[tokio::test]
async fn obstructed_location_relaxes_thresholds() {
    let cfg = config(vec![member("sat", MemberClass::Satellite, 1)]);
    let ctx = Arc::new(LocationContext::new(
        cfg.movement.clone(),
        cfg.clustering.clone(),
    ));
    let t0 = Utc::now();
    ctx.ingest_fix(fix(45.0, 9.0, t0)).unwrap();

    let mut e = engine(&cfg, Arc::new(MemoryController::default())).with_location(ctx.clone());
    for i in 0..5 {
        let mut m = Metrics::new(at(t0, i), 40.0, 0.0, 3.0);
        m.obstruction_pct = Some(20.0);
        let d = e.evaluate("sat", Ok(m)).await.unwrap();
        assert_eq!(d.quality_factors["threshold_adjustment"], 0.0, "sample {i}");
    }

    let stats = ctx.cluster_stats();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.problematic, 1);
    assert!(ctx.in_problematic_area().is_some());

    let d = e
        .evaluate("sat", Ok(Metrics::new(at(t0, 5), 40.0, 0.0, 3.0)))
        .await
        .unwrap();
    assert_eq!(d.quality_factors["threshold_adjustment"], 1.0);
    assert!(d.quality_factors["threshold_latency_ms"] > cfg.decision.latency_threshold_ms);
    assert!(d.quality_factors["threshold_obstruction_pct"] > cfg.decision.obstruction_threshold_pct);
}

#[tokio::test]
async fn stale_fix_stops_location_conditioning() {
    let cfg = config(vec![member("sat", MemberClass::Satellite, 1)]);
    let ctx = Arc::new(
        LocationContext::new(cfg.movement.clone(), cfg.clustering.clone())
            .with_staleness(cfg.gps.staleness_threshold),
    );
    let t0 = Utc::now();
    ctx.ingest_fix(fix(45.0, 9.0, t0)).unwrap();

    let mut e = engine(&cfg, Arc::new(MemoryController::default())).with_location(ctx.clone());
    for i in 0..5 {
        let mut m = Metrics::new(at(t0, i), 40.0, 0.0, 3.0);
        m.obstruction_pct = Some(20.0);
        e.evaluate("sat", Ok(m)).await.unwrap();
    }
    assert_eq!(ctx.cluster_stats().problematic, 1);

    // no fix for a day while the vehicle kept driving
    let later = at(t0, 86_400);
    let d = e
        .evaluate("sat", Ok(Metrics::new(later, 40.0, 0.0, 3.0)))
        .await
        .unwrap();
    assert_eq!(d.quality_factors["threshold_adjustment"], 0.0);
    assert_eq!(d.quality_factors["threshold_latency_ms"], cfg.decision.latency_threshold_ms);
    assert_eq!(ctx.cluster_stats().total_samples, 5);
}

#[tokio::test]
async fn large_move_resets_satellite_obstruction_history() {
    let cfg = config(vec![
        member("sat", MemberClass::Satellite, 1),
        member("lte", MemberClass::Cellular, 2),
    ]);
    let ctx = Arc::new(LocationContext::new(
        cfg.movement.clone(),
        cfg.clustering.clone(),
    ));
    let mut e = engine(&cfg, Arc::new(MemoryController::default())).with_location(ctx.clone());
    let t0 = Utc::now();

    let mut m = Metrics::new(t0, 40.0, 0.0, 3.0);
    m.obstruction_pct = Some(3.0);
    e.evaluate("sat", Ok(m)).await.unwrap();

    assert!(ctx.ingest_fix(fix(45.0, 9.0, t0)).unwrap().is_none());
    // ~600 m north, 60 s later
    let event = ctx
        .ingest_fix(fix(45.0054, 9.0, at(t0, 60)))
        .unwrap()
        .expect("movement event");
    assert!(event.distance_m > 500.0);
    assert_eq!(event.action_triggered, MovementAction::ObstructionMapReset);

    let resets = e.apply_movement_reset(&event);
    assert_eq!(resets.len(), 1);
    let d = &resets[0];
    assert_eq!(d.member, "sat");
    assert_eq!(d.decision_type, DecisionType::Maintenance);
    assert_eq!(d.action, DecisionAction::BaselineReset);
    assert_eq!(d.trigger_reason, "movement_obstruction_reset");
    assert_eq!(d.quality_factors["cleared_samples"], 1.0);
}

#[tokio::test(start_paused = true)]
async fn gps_outage_keeps_last_known_fix() {
    let ctx = LocationContext::new(Default::default(), Default::default());
    let t0 = Utc::now();
    ctx.ingest_fix(fix(45.0, 9.0, t0)).unwrap();

    let sim = Arc::new(SimulatedGps::stationary(46.0, 10.0));
    sim.set_available(false);
    let gps = GpsCollector::new(
        vec![GpsSource::Simulated(sim.clone())],
        GpsConfig {
            sources: vec![GpsSourceKind::Simulated],
            ..GpsConfig::default()
        },
    );

    let err = ctx.refresh(&gps).await.unwrap_err();
    assert!(matches!(err, GpsError::NoSourcesAvailable));
    let last = ctx.last_fix().unwrap();
    assert_eq!((last.latitude, last.longitude), (45.0, 9.0));
}
