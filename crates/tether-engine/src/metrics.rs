//! # Prometheus Metrics
//!
//! Renders engine state in Prometheus text exposition format.

use std::collections::BTreeMap;
use std::fmt::Write;

use tether_common::models::{DecisionType, LinkState};

use crate::cluster::ClusterStats;
use crate::decision::EngineStatus;
use crate::movement::MovementSummary;

fn header(out: &mut String, name: &str, help: &str, kind: &str) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
}

fn state_code(state: LinkState) -> u8 {
    match state {
        LinkState::Up => 0,
        LinkState::Recovering => 1,
        LinkState::Down => 2,
    }
}

/// Render member, decision, cluster and movement metrics.
pub fn render_prometheus(
    status: &EngineStatus,
    decisions: &BTreeMap<DecisionType, u64>,
    clusters: Option<&ClusterStats>,
    movement: Option<&MovementSummary>,
) -> String {
    let mut out = String::with_capacity(2048);

    // ── Per-member gauges ───────────────────────────────────────

    header(
        &mut out,
        "tether_member_score",
        "Member health score (0-100) by kind.",
        "gauge",
    );
    for m in &status.members {
        if let Some(s) = m.score {
            for (kind, v) in [
                ("instant", s.instant),
                ("ewma", s.ewma),
                ("final", s.final_score),
            ] {
                let _ = writeln!(
                    out,
                    "tether_member_score{{member=\"{}\",class=\"{}\",kind=\"{kind}\"}} {v:.3}",
                    m.name, m.class
                );
            }
        }
    }

    header(
        &mut out,
        "tether_member_state",
        "Failover state encoded as integer (0=up, 1=recovering, 2=down).",
        "gauge",
    );
    for m in &status.members {
        let _ = writeln!(
            out,
            "tether_member_state{{member=\"{}\",state=\"{}\"}} {}",
            m.name,
            m.state.as_str(),
            state_code(m.state)
        );
    }

    header(
        &mut out,
        "tether_member_stability_count",
        "Consecutive good cycles counted towards restore.",
        "gauge",
    );
    for m in &status.members {
        let _ = writeln!(
            out,
            "tether_member_stability_count{{member=\"{}\"}} {}",
            m.name, m.stability_count
        );
    }

    header(
        &mut out,
        "tether_member_metric",
        "Routing metric currently applied to the member.",
        "gauge",
    );
    for m in &status.members {
        let _ = writeln!(
            out,
            "tether_member_metric{{member=\"{}\"}} {}",
            m.name, m.applied_metric
        );
    }

    header(
        &mut out,
        "tether_member_active",
        "Whether the member currently carries traffic (1) or not (0).",
        "gauge",
    );
    for m in &status.members {
        let _ = writeln!(
            out,
            "tether_member_active{{member=\"{}\"}} {}",
            m.name,
            u8::from(m.active)
        );
    }

    header(
        &mut out,
        "tether_member_latency_p95_ms",
        "95th percentile latency over retained samples.",
        "gauge",
    );
    for m in &status.members {
        if let Some(p95) = m.latency_p95_ms {
            let _ = writeln!(
                out,
                "tether_member_latency_p95_ms{{member=\"{}\"}} {p95:.3}",
                m.name
            );
        }
    }

    // ── Decisions ───────────────────────────────────────────────

    header(
        &mut out,
        "tether_decisions_total",
        "Decisions recorded since start, by type.",
        "counter",
    );
    for kind in [
        DecisionType::Evaluation,
        DecisionType::SoftFailover,
        DecisionType::HardFailover,
        DecisionType::Restore,
        DecisionType::Maintenance,
    ] {
        let n = decisions.get(&kind).copied().unwrap_or(0);
        let _ = writeln!(out, "tether_decisions_total{{type=\"{kind}\"}} {n}");
    }

    // ── Location ────────────────────────────────────────────────

    if let Some(c) = clusters {
        header(
            &mut out,
            "tether_location_clusters",
            "Location clusters by health.",
            "gauge",
        );
        for (health, n) in [
            ("problematic", c.problematic),
            ("healthy", c.healthy),
            ("unclassified", c.unclassified),
        ] {
            let _ = writeln!(out, "tether_location_clusters{{health=\"{health}\"}} {n}");
        }
        header(
            &mut out,
            "tether_location_cluster_samples",
            "Performance samples folded into clusters.",
            "gauge",
        );
        let _ = writeln!(out, "tether_location_cluster_samples {}", c.total_samples);
    }

    if let Some(mv) = movement {
        header(
            &mut out,
            "tether_moving",
            "Whether the gateway is currently moving (1) or stationary (0).",
            "gauge",
        );
        let _ = writeln!(out, "tether_moving {}", u8::from(mv.moving));
        header(
            &mut out,
            "tether_movement_distance_m",
            "Distance covered within the movement window.",
            "gauge",
        );
        let _ = writeln!(out, "tether_movement_distance_m {:.1}", mv.total_distance_m);
        header(
            &mut out,
            "tether_movement_max_velocity_mps",
            "Peak velocity within the movement window.",
            "gauge",
        );
        let _ = writeln!(
            out,
            "tether_movement_max_velocity_mps {:.2}",
            mv.max_velocity_mps
        );
    }

    out
}
