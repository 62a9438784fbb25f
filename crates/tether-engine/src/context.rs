//! Shared location state.
//!
//! [`LocationContext`] owns the last known fix, the movement detector and the
//! cluster manager. The GPS task writes through it; the decision task and
//! the HTTP surface read from it. Each structure sits behind its own lock and
//! no lock is held across an await point.
//!
//! The last fix is kept through GPS outages, but cluster learning and
//! location-conditioned thresholds only use it while it is younger than the
//! staleness threshold.

use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tether_common::models::{GpsData, LocationCluster, MemberClass, Metrics, MovementEvent};
use tracing::{debug, warn};

use crate::cluster::{ClusterStats, LocationClusterManager, MaintenanceReport, PerformanceSample};
use crate::config::{ClusteringConfig, GpsConfig, MovementConfig};
use crate::decision::quality::{ThresholdAdjustment, Thresholds};
use crate::error::GpsError;
use crate::gps::GpsCollector;
use crate::movement::{MovementDetector, MovementSummary};

pub struct LocationContext {
    last_fix: RwLock<Option<GpsData>>,
    movement: RwLock<MovementDetector>,
    clusters: RwLock<LocationClusterManager>,
    staleness: Duration,
}

impl LocationContext {
    pub fn new(movement: MovementConfig, clustering: ClusteringConfig) -> Self {
        Self {
            last_fix: RwLock::new(None),
            movement: RwLock::new(MovementDetector::new(movement)),
            clusters: RwLock::new(LocationClusterManager::new(clustering)),
            staleness: GpsConfig::default().staleness_threshold,
        }
    }

    /// Age beyond which the last fix no longer describes the current position.
    pub fn with_staleness(mut self, staleness: Duration) -> Self {
        self.staleness = staleness;
        self
    }

    /// Collect a fix and ingest it. On failure the last known fix is kept.
    pub async fn refresh(&self, collector: &GpsCollector) -> Result<Option<MovementEvent>, GpsError> {
        let fix = collector.collect().await?;
        self.ingest_fix(fix)
    }

    /// Diff a validated fix against the last known one, then make it the
    /// last known fix. Returns the movement event, if there was a previous
    /// fix to compare with.
    pub fn ingest_fix(&self, fix: GpsData) -> Result<Option<MovementEvent>, GpsError> {
        let mut last = self.last_fix.write().unwrap_or_else(|e| e.into_inner());
        let event = match last.as_ref() {
            Some(prev) => {
                let mut detector = self.movement.write().unwrap_or_else(|e| e.into_inner());
                Some(detector.observe(prev, &fix)?)
            }
            None => {
                debug!(
                    latitude = fix.latitude,
                    longitude = fix.longitude,
                    source = fix.source.as_str(),
                    "first GPS fix"
                );
                None
            }
        };
        *last = Some(fix);
        Ok(event)
    }

    pub fn last_fix(&self) -> Option<GpsData> {
        self.last_fix
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// The last fix, if it was taken no more than the staleness threshold
    /// before `at`.
    pub fn current_fix(&self, at: DateTime<Utc>) -> Option<GpsData> {
        let fix = self.last_fix()?;
        let age = (at - fix.timestamp).to_std().unwrap_or_default();
        if age > self.staleness {
            debug!(age_s = age.as_secs(), "last GPS fix is stale, ignoring for location context");
            return None;
        }
        Some(fix)
    }

    /// Feed a satellite sample into the cluster at the current position.
    pub fn record_performance(&self, metrics: &Metrics, class: MemberClass) -> Option<String> {
        if class != MemberClass::Satellite {
            return None;
        }
        let fix = self.current_fix(metrics.timestamp)?;
        let sample = PerformanceSample {
            latitude: fix.latitude,
            longitude: fix.longitude,
            latency_ms: metrics.latency_ms,
            loss_pct: metrics.loss_pct,
            obstruction_pct: metrics.obstruction_pct.unwrap_or(0.0),
            at: metrics.timestamp,
        };
        self.clusters
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .add_sample(&sample)
    }

    /// Thresholds for the position at `at`. Without a fresh fix the base
    /// thresholds apply.
    pub fn thresholds(
        &self,
        base: Thresholds,
        at: DateTime<Utc>,
    ) -> (Thresholds, ThresholdAdjustment) {
        let Some(fix) = self.current_fix(at) else {
            return (base, ThresholdAdjustment::Baseline);
        };
        let clusters = self.clusters.read().unwrap_or_else(|e| e.into_inner());
        let (thresholds, adjustment, _) = clusters.thresholds_at(fix.latitude, fix.longitude, base);
        (thresholds, adjustment)
    }

    /// Whether the last known position lies in a problematic cluster.
    pub fn in_problematic_area(&self) -> Option<LocationCluster> {
        let fix = self.last_fix()?;
        let clusters = self.clusters.read().unwrap_or_else(|e| e.into_inner());
        clusters
            .problematic()
            .into_iter()
            .find(|c| {
                crate::geo::haversine_m(fix.latitude, fix.longitude, c.center_latitude, c.center_longitude)
                    <= c.radius_m
            })
            .cloned()
    }

    pub fn maintain(&self, now: DateTime<Utc>) -> MaintenanceReport {
        self.clusters
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .maintain(now)
    }

    pub fn cluster_stats(&self) -> ClusterStats {
        self.clusters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .stats()
    }

    pub fn clusters(&self) -> Vec<LocationCluster> {
        self.clusters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clusters()
            .to_vec()
    }

    pub fn movement_summary(&self, now: DateTime<Utc>) -> MovementSummary {
        self.movement
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .summary(now)
    }

    pub fn recent_movements(&self, n: usize) -> Vec<MovementEvent> {
        self.movement
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .recent(n)
    }

    pub fn is_moving(&self) -> bool {
        self.movement
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_moving()
    }

    /// Last fix and clusters for persistence.
    pub fn export(&self) -> (Option<GpsData>, Vec<LocationCluster>) {
        (self.last_fix(), self.clusters())
    }

    pub fn restore(&self, last_fix: Option<GpsData>, clusters: Vec<LocationCluster>) {
        if let Some(fix) = &last_fix {
            let age = Utc::now() - fix.timestamp;
            if age > chrono::Duration::days(1) {
                warn!(age_h = age.num_hours(), "restored GPS fix is old");
            }
        }
        *self.last_fix.write().unwrap_or_else(|e| e.into_inner()) = last_fix;
        self.clusters
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .restore(clusters);
    }
}
