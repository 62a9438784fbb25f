//! Status portal: local HTTP server for operators and scrapers.
//!
//! - `GET /metrics`: Prometheus exposition of member and decision state
//! - `GET /api/status`: engine status, location context, decision stats
//! - `GET /api/decisions?since=&limit=`: recent decisions, newest first
//! - `GET /api/clusters`: learned location clusters
//! - `GET /api/movements?limit=`: recent movement events

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tether_engine::metrics::render_prometheus;
use tether_engine::runtime::Shared;

pub struct PortalState {
    pub shared: Shared,
    pub simulate: bool,
    pub gps_enabled: bool,
    pub clustering_enabled: bool,
}

pub fn router(state: Arc<PortalState>) -> Router {
    Router::new()
        .route("/metrics", get(api_metrics))
        .route("/api/status", get(api_status))
        .route("/api/decisions", get(api_decisions))
        .route("/api/clusters", get(api_clusters))
        .route("/api/movements", get(api_movements))
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state)
}

/// Serve the portal until the listener fails.
pub async fn run(state: Arc<PortalState>, addr: SocketAddr) -> anyhow::Result<()> {
    let app = router(state);
    tracing::info!("status portal on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

// ── GET /metrics ────────────────────────────────────────────────────

async fn api_metrics(State(state): State<Arc<PortalState>>) -> impl IntoResponse {
    let status = state.shared.status.borrow().clone();
    let totals = state.shared.log.totals();
    let location = &state.shared.location;
    let clusters = state.clustering_enabled.then(|| location.cluster_stats());
    let movement = state
        .gps_enabled
        .then(|| location.movement_summary(Utc::now()));
    let body = render_prometheus(&status, &totals, clusters.as_ref(), movement.as_ref());
    (
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        body,
    )
}

// ── GET /api/status ─────────────────────────────────────────────────

async fn api_status(State(state): State<Arc<PortalState>>) -> Json<serde_json::Value> {
    let status = state.shared.status.borrow().clone();
    let location = &state.shared.location;
    let now = Utc::now();

    Json(serde_json::json!({
        "simulate": state.simulate,
        "engine": status,
        "location": {
            "last_fix": location.last_fix(),
            "moving": location.is_moving(),
            "movement": state.gps_enabled.then(|| location.movement_summary(now)),
            "clusters": state.clustering_enabled.then(|| location.cluster_stats()),
            "problematic_area": location.in_problematic_area(),
        },
        "decisions": state.shared.log.stats(None),
    }))
}

// ── GET /api/decisions ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct DecisionQuery {
    since: Option<DateTime<Utc>>,
    limit: Option<usize>,
}

async fn api_decisions(
    State(state): State<Arc<PortalState>>,
    Query(q): Query<DecisionQuery>,
) -> impl IntoResponse {
    let limit = q.limit.unwrap_or(100).min(1000);
    Json(state.shared.log.decisions(q.since, limit))
}

// ── GET /api/clusters ───────────────────────────────────────────────

async fn api_clusters(State(state): State<Arc<PortalState>>) -> impl IntoResponse {
    Json(state.shared.location.clusters())
}

// ── GET /api/movements ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

async fn api_movements(
    State(state): State<Arc<PortalState>>,
    Query(q): Query<LimitQuery>,
) -> impl IntoResponse {
    Json(state.shared.location.recent_movements(q.limit.unwrap_or(20)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use std::collections::BTreeMap;
    use tether_common::ids::decision_id;
    use tether_common::models::{Decision, DecisionAction, DecisionType};
    use tether_engine::context::LocationContext;
    use tether_engine::decision::{DecisionLog, EngineStatus};
    use tokio::sync::watch;
    use tower::ServiceExt;

    fn decision(reason: &str, at: DateTime<Utc>) -> Decision {
        Decision {
            id: decision_id(),
            timestamp: at,
            decision_type: DecisionType::SoftFailover,
            member: "sat".into(),
            action: DecisionAction::MetricIncrease,
            from_metric: Some(1),
            to_metric: Some(11),
            trigger_reason: reason.into(),
            quality_factors: BTreeMap::new(),
            success: true,
            error: None,
            location: None,
            predictive: false,
        }
    }

    fn app() -> (Router, Arc<DecisionLog>) {
        let log = Arc::new(DecisionLog::new(10));
        let (_tx, rx) = watch::channel(EngineStatus::default());
        let state = Arc::new(PortalState {
            shared: Shared {
                log: log.clone(),
                location: Arc::new(LocationContext::new(Default::default(), Default::default())),
                status: rx,
            },
            simulate: true,
            gps_enabled: true,
            clustering_enabled: true,
        });
        (router(state), log)
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, String) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8_lossy(&bytes).into_owned())
    }

    #[tokio::test]
    async fn metrics_endpoint_renders_prometheus() {
        let (app, log) = app();
        log.log_decision(decision("high_latency", Utc::now()));
        let (status, body) = get(app, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("tether_decisions_total{type=\"soft_failover\"} 1"));
        assert!(body.contains("tether_location_clusters{health=\"problematic\"} 0"));
        assert!(body.contains("tether_moving 0"));
    }

    #[tokio::test]
    async fn decisions_endpoint_honours_limit() {
        let (app, log) = app();
        let t0 = Utc::now();
        log.log_decision(decision("first", t0));
        log.log_decision(decision("second", t0 + chrono::Duration::seconds(1)));
        let (status, body) = get(app, "/api/decisions?limit=1").await;
        assert_eq!(status, StatusCode::OK);
        let v: serde_json::Value = serde_json::from_str(&body).unwrap();
        let list = v.as_array().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0]["trigger_reason"], "second");
    }

    #[tokio::test]
    async fn status_endpoint_reports_location() {
        let (app, _) = app();
        let (status, body) = get(app, "/api/status").await;
        assert_eq!(status, StatusCode::OK);
        let v: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(v["simulate"], true);
        assert!(v["location"]["last_fix"].is_null());
        assert_eq!(v["location"]["clusters"]["total"], 0);
        assert_eq!(v["decisions"]["total"], 0);
    }
}
