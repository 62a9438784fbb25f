//! # Decision Engine
//!
//! The per-member failover state machine.
//!
//! Every ingested sample (or failed collection) produces exactly one
//! [`Decision`]. A bad sample on a member that is not down raises its
//! routing metric and marks it down; good samples on a down member count
//! towards `stability_checks_required` before the base metric is restored.
//!
//! ```text
//!        bad                         good × N
//!   Up ───────► Down ──good──► Recovering ───────► Up
//!    ▲            ▲                │
//!    └─ good      └───── bad ──────┘
//! ```
//!
//! Control-plane failures never advance the state, so the same transition is
//! attempted again on the next cycle. Every controller call is bounded by
//! `decision.control_timeout`; an elapsed call is dropped (cancelling it) and
//! counts as a control-plane failure.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tether_common::ids::decision_id;
use tether_common::models::{
    Decision, DecisionAction, DecisionType, GpsData, LinkState, Member, MemberClass, Metrics,
    MovementEvent, Score,
};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::log::DecisionLog;
use super::predictive::{self, PredictiveTrigger};
use super::quality::{Assessment, ThresholdAdjustment, Thresholds, assess};
use crate::config::{
    DecisionConfig, ObstructionConfig, PredictiveConfig, ScoringConfig, TetherConfig,
};
use crate::context::LocationContext;
use crate::error::{CollectError, ControlError};
use crate::interfaces::{Controller, Notification, Priority};
use crate::scoring::{ScoreTracker, components};
use crate::state::PersistedMember;
use crate::telemetry::TelemetryStore;

#[derive(Debug)]
struct MemberRecord {
    member: Member,
    state: LinkState,
    stability_count: u32,
    tracker: ScoreTracker,
    applied_metric: u32,
}

/// Point-in-time view of one member for status queries and metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemberStatus {
    pub name: String,
    pub class: MemberClass,
    pub interface: Option<String>,
    pub state: LinkState,
    pub stability_count: u32,
    pub eligible: bool,
    pub active: bool,
    pub base_metric: u32,
    pub applied_metric: u32,
    pub score: Option<Score>,
    pub samples: usize,
    pub latency_p95_ms: Option<f64>,
    pub last_sample: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EngineStatus {
    pub updated_at: Option<DateTime<Utc>>,
    pub active: Option<String>,
    pub members: Vec<MemberStatus>,
}

pub struct DecisionEngine {
    scoring: ScoringConfig,
    decision: DecisionConfig,
    obstruction: ObstructionConfig,
    predictive: PredictiveConfig,
    members: BTreeMap<String, MemberRecord>,
    telemetry: TelemetryStore,
    controller: Arc<dyn Controller>,
    log: Arc<DecisionLog>,
    location: Option<Arc<LocationContext>>,
    notifications: Option<mpsc::Sender<Notification>>,
    active: Option<String>,
}

impl DecisionEngine {
    pub fn new(cfg: &TetherConfig, controller: Arc<dyn Controller>, log: Arc<DecisionLog>) -> Self {
        let members = cfg
            .members
            .iter()
            .map(|mc| {
                let record = MemberRecord {
                    member: mc.member.clone(),
                    state: LinkState::Up,
                    stability_count: 0,
                    tracker: ScoreTracker::new(&cfg.scoring),
                    applied_metric: mc.member.metric,
                };
                (mc.member.name.clone(), record)
            })
            .collect();
        Self {
            scoring: cfg.scoring.clone(),
            decision: cfg.decision.clone(),
            obstruction: cfg.obstruction.clone(),
            predictive: cfg.predictive.clone(),
            members,
            telemetry: TelemetryStore::new(&cfg.telemetry),
            controller,
            log,
            location: None,
            notifications: None,
            active: None,
        }
    }

    pub fn with_location(mut self, location: Arc<LocationContext>) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_notifications(mut self, tx: mpsc::Sender<Notification>) -> Self {
        self.notifications = Some(tx);
        self
    }

    pub fn log(&self) -> &Arc<DecisionLog> {
        &self.log
    }

    pub fn telemetry(&self) -> &TelemetryStore {
        &self.telemetry
    }

    pub fn member_state(&self, name: &str) -> Option<(LinkState, u32)> {
        self.members
            .get(name)
            .map(|r| (r.state, r.stability_count))
    }

    /// Ask the controller which member currently carries traffic.
    pub async fn sync_active(&mut self) {
        match self.query_active().await {
            Ok(current) => self.active = current,
            Err(e) => warn!(error = %e, "failed to query active member"),
        }
    }

    /// Run one evaluation cycle for `name`.
    pub async fn evaluate(
        &mut self,
        name: &str,
        outcome: Result<Metrics, CollectError>,
    ) -> Result<Decision, ControlError> {
        let Some(record) = self.members.get(name) else {
            return Err(ControlError::UnknownMember(name.to_string()));
        };
        let class = record.member.class;
        let location = self.location.as_ref().and_then(|l| l.last_fix());

        let metrics = match outcome {
            Ok(m) => m,
            Err(e) => {
                let mut d = new_decision(name, Utc::now(), DecisionType::Evaluation, "collection_failed");
                d.success = false;
                d.error = Some(e.to_string());
                d.location = location;
                return Ok(self.record(d));
            }
        };

        if !self.telemetry.accepts(name, metrics.timestamp) {
            let mut d = new_decision(name, metrics.timestamp, DecisionType::Evaluation, "sample_rejected");
            d.success = false;
            d.error = Some(format!(
                "sample at {} is older than the newest sample",
                metrics.timestamp.to_rfc3339()
            ));
            d.location = location;
            return Ok(self.record(d));
        }

        // ── Score ──
        let parts = components(&metrics, class, &self.scoring);
        let instant = parts.combine(&self.scoring);
        let score = match self.members.get_mut(name) {
            Some(r) => r.tracker.update(instant, &self.scoring),
            None => return Err(ControlError::UnknownMember(name.to_string())),
        };
        self.telemetry.push(name, metrics.clone(), score);

        // ── Context ──
        let base = Thresholds::from_config(&self.decision);
        let (thresholds, adjustment) = match &self.location {
            Some(ctx) => {
                let adjusted = ctx.thresholds(base, metrics.timestamp);
                ctx.record_performance(&metrics, class);
                adjusted
            }
            None => (base, ThresholdAdjustment::Baseline),
        };
        let strong_alternate = self.strong_alternate(name);
        let assessment = assess(
            &metrics,
            &thresholds,
            &self.decision,
            &self.obstruction,
            strong_alternate,
        );

        let (state, stability, applied, base_metric) = match self.members.get(name) {
            Some(r) => (r.state, r.stability_count, r.applied_metric, r.member.metric),
            None => return Err(ControlError::UnknownMember(name.to_string())),
        };

        let trigger = if !assessment.bad && state == LinkState::Up && strong_alternate {
            predictive::evaluate(&self.telemetry, name, class, &metrics, &self.predictive)
        } else {
            None
        };

        let mut factors = quality_factors(&metrics, &parts.as_factors(), &thresholds, adjustment, score);
        if let Some(t) = &trigger {
            factors.insert("predictive_value".into(), t.value());
        }

        let bad = assessment.bad || trigger.is_some();
        let mut d = if bad && state != LinkState::Down {
            self.fail_over(name, &metrics, score, &assessment, trigger, applied, base_metric)
                .await
        } else if bad {
            self.set_state(name, LinkState::Down, 0, None);
            new_decision(name, metrics.timestamp, DecisionType::Evaluation, "still_bad")
        } else if state != LinkState::Up {
            self.recover(name, &metrics, stability + 1, applied, base_metric)
                .await
        } else {
            self.set_state(name, LinkState::Up, 0, None);
            new_decision(name, metrics.timestamp, DecisionType::Evaluation, &assessment.reason)
        };

        if let Some((_, count)) = self.member_state(name) {
            factors.insert("stability_count".into(), f64::from(count));
        }
        d.quality_factors.extend(factors);
        d.location = location;
        Ok(self.record(d))
    }

    #[allow(clippy::too_many_arguments)]
    async fn fail_over(
        &mut self,
        name: &str,
        metrics: &Metrics,
        score: Score,
        assessment: &Assessment,
        trigger: Option<PredictiveTrigger>,
        applied: u32,
        base_metric: u32,
    ) -> Decision {
        let hard = trigger.is_none() && score.final_score < self.decision.hard_failover_score;
        let kind = if hard {
            DecisionType::HardFailover
        } else {
            DecisionType::SoftFailover
        };
        let reason = trigger.map_or(assessment.reason.as_str(), |t| t.reason());
        let target = base_metric.saturating_add(self.decision.metric_penalty);

        let mut d = new_decision(name, metrics.timestamp, kind, reason);
        d.action = DecisionAction::MetricIncrease;
        d.from_metric = Some(applied);
        d.to_metric = Some(target);
        d.predictive = trigger.is_some();

        let mut result = self.push_metric(name, target).await;
        if result.is_ok() {
            self.set_state(name, self.state_of(name), 0, Some(target));
        }
        if result.is_ok() && hard {
            result = self.switch_away(name).await;
        }

        match result {
            Ok(()) => {
                self.set_state(name, LinkState::Down, 0, Some(target));
                info!(
                    member = name,
                    kind = kind.as_str(),
                    reason,
                    score = score.final_score,
                    "member failed over"
                );
            }
            Err(e) => {
                d.success = false;
                d.error = Some(e.to_string());
            }
        }
        d
    }

    async fn switch_away(&mut self, name: &str) -> Result<(), ControlError> {
        if self.active.is_none() {
            self.sync_active().await;
        }
        if self.active.as_deref() != Some(name) {
            return Ok(());
        }
        let Some(alternate) = self.best_alternate(name) else {
            warn!(member = name, "hard failover with no alternate available");
            return Ok(());
        };
        self.push_switch(name, &alternate).await?;
        info!(from = name, to = %alternate, "active member switched");
        self.active = Some(alternate);
        Ok(())
    }

    async fn recover(
        &mut self,
        name: &str,
        metrics: &Metrics,
        stability: u32,
        applied: u32,
        base_metric: u32,
    ) -> Decision {
        let required = self.decision.stability_checks_required;
        if stability < required {
            self.set_state(name, LinkState::Recovering, stability, None);
            debug!(member = name, stability, required, "member recovering");
            return new_decision(name, metrics.timestamp, DecisionType::Evaluation, "recovering");
        }

        let mut d = new_decision(name, metrics.timestamp, DecisionType::Restore, "stability_confirmed");
        d.action = DecisionAction::MetricRestore;
        d.from_metric = Some(applied);
        d.to_metric = Some(base_metric);
        match self.push_metric(name, base_metric).await {
            Ok(()) => {
                self.set_state(name, LinkState::Up, 0, Some(base_metric));
                info!(member = name, stability, "member restored");
            }
            Err(e) => {
                self.set_state(name, LinkState::Recovering, stability, None);
                d.success = false;
                d.error = Some(e.to_string());
            }
        }
        d
    }

    /// Clear the obstruction history of satellite members after the
    /// terminal has moved far enough that its sky view changed.
    pub fn apply_movement_reset(&mut self, event: &MovementEvent) -> Vec<Decision> {
        let satellites: Vec<String> = self
            .members
            .values()
            .filter(|r| r.member.class == MemberClass::Satellite)
            .map(|r| r.member.name.clone())
            .collect();

        let mut out = Vec::with_capacity(satellites.len());
        for name in satellites {
            let cleared = self.telemetry.clear_obstruction(&name);
            let mut d = new_decision(
                &name,
                event.timestamp,
                DecisionType::Maintenance,
                "movement_obstruction_reset",
            );
            d.action = DecisionAction::BaselineReset;
            d.location = Some(event.to.clone());
            d.quality_factors
                .insert("distance_m".into(), event.distance_m);
            d.quality_factors
                .insert("velocity_mps".into(), event.velocity_mps);
            d.quality_factors
                .insert("cleared_samples".into(), cleared as f64);
            out.push(self.record(d));
        }
        out
    }

    /// Drop telemetry older than the retention window.
    pub fn prune_telemetry(&mut self, now: DateTime<Utc>) -> usize {
        self.telemetry.prune(now)
    }

    pub fn status(&self) -> EngineStatus {
        let members = self
            .members
            .values()
            .map(|r| {
                let name = &r.member.name;
                MemberStatus {
                    name: name.clone(),
                    class: r.member.class,
                    interface: r.member.interface.clone(),
                    state: r.state,
                    stability_count: r.stability_count,
                    eligible: r.member.eligible,
                    active: self.active.as_deref() == Some(name.as_str()),
                    base_metric: r.member.metric,
                    applied_metric: r.applied_metric,
                    score: r.tracker.last(),
                    samples: self.telemetry.len(name),
                    latency_p95_ms: self.telemetry.percentile(name, 95.0, |m| Some(m.latency_ms)),
                    last_sample: self.telemetry.last_timestamp(name),
                }
            })
            .collect();
        EngineStatus {
            updated_at: Some(Utc::now()),
            active: self.active.clone(),
            members,
        }
    }

    pub fn export_members(&self) -> BTreeMap<String, PersistedMember> {
        self.members
            .iter()
            .map(|(name, r)| {
                (
                    name.clone(),
                    PersistedMember {
                        state: r.state,
                        stability_count: r.stability_count,
                        applied_metric: r.applied_metric,
                        ewma: r.tracker.last().map(|s| s.ewma),
                    },
                )
            })
            .collect()
    }

    /// Resume per-member state. Members no longer configured are ignored.
    pub fn restore_members(&mut self, persisted: &BTreeMap<String, PersistedMember>) {
        for (name, p) in persisted {
            let Some(r) = self.members.get_mut(name) else {
                debug!(member = %name, "persisted member no longer configured");
                continue;
            };
            r.state = p.state;
            r.stability_count = p.stability_count;
            r.applied_metric = p.applied_metric;
            if let Some(ewma) = p.ewma {
                r.tracker = ScoreTracker::resume(&self.scoring, ewma);
            }
            info!(
                member = %name,
                state = p.state.as_str(),
                metric = p.applied_metric,
                "member state restored"
            );
        }
    }

    /// Push every member's applied metric to the controller, e.g. after a
    /// restart restored failed-over state.
    pub async fn reconcile_metrics(&self) {
        for (name, r) in &self.members {
            if r.applied_metric == r.member.metric {
                continue;
            }
            if let Err(e) = self.push_metric(name, r.applied_metric).await {
                warn!(member = %name, error = %e, "failed to reapply metric");
            }
        }
    }

    // ── Control plane ──

    async fn push_metric(&self, name: &str, metric: u32) -> Result<(), ControlError> {
        let limit = self.decision.control_timeout;
        timeout(limit, self.controller.apply_metric(name, metric))
            .await
            .unwrap_or_else(|_| {
                Err(ControlError::Timeout {
                    operation: "apply_metric",
                    after: limit,
                })
            })
    }

    async fn push_switch(&self, from: &str, to: &str) -> Result<(), ControlError> {
        let limit = self.decision.control_timeout;
        timeout(limit, self.controller.switch(from, to))
            .await
            .unwrap_or_else(|_| {
                Err(ControlError::Timeout {
                    operation: "switch",
                    after: limit,
                })
            })
    }

    async fn query_active(&self) -> Result<Option<String>, ControlError> {
        let limit = self.decision.control_timeout;
        timeout(limit, self.controller.current_member())
            .await
            .unwrap_or_else(|_| {
                Err(ControlError::Timeout {
                    operation: "current_member",
                    after: limit,
                })
            })
    }

    // ── Helpers ──

    fn state_of(&self, name: &str) -> LinkState {
        self.members.get(name).map_or(LinkState::Up, |r| r.state)
    }

    fn set_state(&mut self, name: &str, state: LinkState, stability: u32, metric: Option<u32>) {
        if let Some(r) = self.members.get_mut(name) {
            if r.state != state {
                debug!(member = name, from = r.state.as_str(), to = state.as_str(), "state change");
            }
            r.state = state;
            r.stability_count = stability;
            if let Some(m) = metric {
                r.applied_metric = m;
            }
        }
    }

    fn final_score(&self, r: &MemberRecord) -> f64 {
        r.tracker.last().map_or(0.0, |s| s.final_score)
    }

    fn strong_alternate(&self, name: &str) -> bool {
        self.members.values().any(|r| {
            r.member.name != name
                && r.member.eligible
                && r.state == LinkState::Up
                && self.final_score(r) >= self.decision.strong_alternate_score
        })
    }

    /// Best other eligible member: up before recovering, then by score.
    fn best_alternate(&self, name: &str) -> Option<String> {
        self.members
            .values()
            .filter(|r| r.member.name != name && r.member.eligible && r.state != LinkState::Down)
            .max_by(|a, b| {
                (a.state == LinkState::Up)
                    .cmp(&(b.state == LinkState::Up))
                    .then(self.final_score(a).total_cmp(&self.final_score(b)))
                    .then(b.member.metric.cmp(&a.member.metric))
            })
            .map(|r| r.member.name.clone())
    }

    fn record(&self, decision: Decision) -> Decision {
        if decision.success && decision.decision_type.is_transition() {
            self.notify(&decision);
        }
        self.log.log_decision(decision.clone());
        decision
    }

    fn notify(&self, d: &Decision) {
        let Some(tx) = &self.notifications else {
            return;
        };
        let (title, priority) = match d.decision_type {
            DecisionType::HardFailover => (format!("Hard failover: {}", d.member), Priority::Emergency),
            DecisionType::SoftFailover => (format!("Failover: {}", d.member), Priority::High),
            _ => (format!("Restored: {}", d.member), Priority::Normal),
        };
        let score = d
            .quality_factors
            .get("score_final")
            .map(|s| format!(", score {s:.1}"))
            .unwrap_or_default();
        let message = format!(
            "{} {} ({}{score}), metric {} -> {}",
            d.member,
            d.decision_type,
            d.trigger_reason,
            d.from_metric.map_or("-".to_string(), |m| m.to_string()),
            d.to_metric.map_or("-".to_string(), |m| m.to_string()),
        );
        let notification = Notification {
            title,
            message,
            priority,
            decision_id: d.id.clone(),
        };
        if let Err(e) = tx.try_send(notification) {
            warn!(error = %e, "notification queue unavailable, dropping");
        }
    }
}

fn new_decision(member: &str, at: DateTime<Utc>, kind: DecisionType, reason: &str) -> Decision {
    Decision {
        id: decision_id(),
        timestamp: at,
        decision_type: kind,
        member: member.to_string(),
        action: DecisionAction::None,
        from_metric: None,
        to_metric: None,
        trigger_reason: reason.to_string(),
        quality_factors: BTreeMap::new(),
        success: true,
        error: None,
        location: None::<GpsData>,
        predictive: false,
    }
}

fn quality_factors(
    m: &Metrics,
    components: &[(&'static str, f64)],
    t: &Thresholds,
    adjustment: ThresholdAdjustment,
    score: Score,
) -> BTreeMap<String, f64> {
    let mut f: BTreeMap<String, f64> = components
        .iter()
        .map(|(k, v)| (k.to_string(), *v))
        .collect();
    f.insert("latency_ms".into(), m.latency_ms);
    f.insert("loss_pct".into(), m.loss_pct);
    f.insert("jitter_ms".into(), m.jitter_ms);
    if let Some(o) = m.obstruction_pct {
        f.insert("obstruction_pct".into(), o);
    }
    f.insert("threshold_latency_ms".into(), t.latency_ms);
    f.insert("threshold_loss_pct".into(), t.loss_pct);
    f.insert("threshold_obstruction_pct".into(), t.obstruction_pct);
    let adj = match adjustment {
        ThresholdAdjustment::Baseline => 0.0,
        ThresholdAdjustment::Relaxed => 1.0,
        ThresholdAdjustment::Tightened => -1.0,
    };
    f.insert("threshold_adjustment".into(), adj);
    f.insert("score_instant".into(), score.instant);
    f.insert("score_ewma".into(), score.ewma);
    f.insert("score_final".into(), score.final_score);
    f
}
