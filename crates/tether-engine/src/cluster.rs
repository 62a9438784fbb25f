//! # Location Clustering
//!
//! Groups performance samples by where they were taken. Each cluster keeps an
//! incrementally weighted center, EWMA performance figures and a radius that
//! only grows. Once a cluster has enough samples it is classified healthy or
//! problematic, which shifts the decision thresholds applied there.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tether_common::ids::cluster_id;
use tether_common::models::LocationCluster;
use tracing::{debug, info};

use crate::config::ClusteringConfig;
use crate::decision::quality::{ThresholdAdjustment, Thresholds};
use crate::ewma::Ewma;
use crate::geo::haversine_m;

/// One performance observation at a location.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerformanceSample {
    pub latitude: f64,
    pub longitude: f64,
    pub latency_ms: f64,
    pub loss_pct: f64,
    pub obstruction_pct: f64,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClusterStats {
    pub total: usize,
    pub problematic: usize,
    pub healthy: usize,
    /// Clusters still below the sample floor.
    pub unclassified: usize,
    pub total_samples: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub expired: usize,
    pub merged: usize,
}

/// Composite 0–100 performance of a cluster's averages.
pub fn performance_score(latency_ms: f64, loss_pct: f64, obstruction_pct: f64) -> f64 {
    let latency = (100.0 - latency_ms / 10.0).max(0.0);
    let loss = (100.0 - loss_pct * 10.0).max(0.0);
    let obstruction = (100.0 - obstruction_pct * 5.0).max(0.0);
    (latency + loss + obstruction) / 3.0
}

#[derive(Debug)]
pub struct LocationClusterManager {
    cfg: ClusteringConfig,
    clusters: Vec<LocationCluster>,
}

impl LocationClusterManager {
    pub fn new(cfg: ClusteringConfig) -> Self {
        Self {
            cfg,
            clusters: Vec::new(),
        }
    }

    pub fn clusters(&self) -> &[LocationCluster] {
        &self.clusters
    }

    /// Replace the cluster set with persisted clusters.
    pub fn restore(&mut self, mut clusters: Vec<LocationCluster>) {
        clusters.truncate(self.cfg.max_clusters);
        self.clusters = clusters;
    }

    /// Fold a sample into its cluster, creating one if none is close enough.
    /// Returns the id of the updated cluster.
    pub fn add_sample(&mut self, sample: &PerformanceSample) -> Option<String> {
        if !self.cfg.enabled {
            return None;
        }
        let idx = match self.nearest_within(sample.latitude, sample.longitude, self.cfg.merge_distance_m) {
            Some((idx, _)) => idx,
            None => self.create(sample),
        };
        self.update(idx, sample);
        self.evaluate_health(idx);
        Some(self.clusters[idx].id.clone())
    }

    fn nearest_within(&self, lat: f64, lon: f64, max_m: f64) -> Option<(usize, f64)> {
        self.clusters
            .iter()
            .enumerate()
            .map(|(i, c)| (i, haversine_m(lat, lon, c.center_latitude, c.center_longitude)))
            .filter(|(_, d)| *d <= max_m)
            .min_by(|a, b| a.1.total_cmp(&b.1))
    }

    fn create(&mut self, sample: &PerformanceSample) -> usize {
        if self.clusters.len() >= self.cfg.max_clusters {
            let oldest = self
                .clusters
                .iter()
                .enumerate()
                .min_by_key(|(_, c)| c.last_seen)
                .map(|(i, _)| i);
            if let Some(oldest) = oldest {
                let evicted = self.clusters.remove(oldest);
                debug!(cluster = %evicted.id, "evicted oldest cluster");
            }
        }
        self.clusters.push(LocationCluster {
            id: cluster_id(),
            center_latitude: sample.latitude,
            center_longitude: sample.longitude,
            radius_m: self.cfg.min_radius_m,
            sample_count: 0,
            avg_latency_ms: 0.0,
            avg_loss_pct: 0.0,
            avg_obstruction_pct: 0.0,
            problematic: false,
            first_seen: sample.at,
            last_seen: sample.at,
        });
        info!(
            center_lat = sample.latitude,
            center_lon = sample.longitude,
            total = self.clusters.len(),
            "location cluster created"
        );
        self.clusters.len() - 1
    }

    fn update(&mut self, idx: usize, sample: &PerformanceSample) {
        let alpha = self.cfg.ewma_alpha;
        let max_radius = self.cfg.max_radius_m;
        let c = &mut self.clusters[idx];

        let w = 1.0 / (c.sample_count as f64 + 1.0);
        c.center_latitude = c.center_latitude * (1.0 - w) + sample.latitude * w;
        c.center_longitude = c.center_longitude * (1.0 - w) + sample.longitude * w;

        let seeded = c.sample_count > 0;
        c.avg_latency_ms = smooth(alpha, seeded, c.avg_latency_ms, sample.latency_ms);
        c.avg_loss_pct = smooth(alpha, seeded, c.avg_loss_pct, sample.loss_pct);
        c.avg_obstruction_pct =
            smooth(alpha, seeded, c.avg_obstruction_pct, sample.obstruction_pct);
        c.sample_count += 1;
        if sample.at > c.last_seen {
            c.last_seen = sample.at;
        }

        let d = haversine_m(
            sample.latitude,
            sample.longitude,
            c.center_latitude,
            c.center_longitude,
        );
        if d > c.radius_m {
            c.radius_m = (d * 1.1).min(max_radius).max(c.radius_m);
        }
    }

    fn evaluate_health(&mut self, idx: usize) {
        let min_samples = self.cfg.min_samples;
        let threshold = self.cfg.problematic_threshold;
        let c = &mut self.clusters[idx];
        if c.sample_count < min_samples {
            return;
        }
        let score = performance_score(c.avg_latency_ms, c.avg_loss_pct, c.avg_obstruction_pct);
        let was = c.problematic;
        c.problematic = score < threshold;
        if was != c.problematic {
            info!(
                cluster = %c.id,
                from = if was { "problematic" } else { "healthy" },
                to = if c.problematic { "problematic" } else { "healthy" },
                score,
                avg_latency_ms = c.avg_latency_ms,
                avg_loss_pct = c.avg_loss_pct,
                avg_obstruction_pct = c.avg_obstruction_pct,
                samples = c.sample_count,
                "cluster health changed"
            );
        }
    }

    /// Thresholds adjusted for the closest classified cluster containing the
    /// point. Unclassified or distant points keep `base`.
    pub fn thresholds_at(
        &self,
        lat: f64,
        lon: f64,
        base: Thresholds,
    ) -> (Thresholds, ThresholdAdjustment, Option<&LocationCluster>) {
        let closest = self
            .clusters
            .iter()
            .filter(|c| c.sample_count >= self.cfg.min_samples)
            .map(|c| (c, haversine_m(lat, lon, c.center_latitude, c.center_longitude)))
            .filter(|(c, d)| *d <= c.radius_m)
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(c, _)| c);

        match closest {
            Some(c) if c.problematic => (
                base.scaled(&self.cfg.relaxed),
                ThresholdAdjustment::Relaxed,
                Some(c),
            ),
            Some(c) => (
                base.scaled(&self.cfg.tightened),
                ThresholdAdjustment::Tightened,
                Some(c),
            ),
            None => (base, ThresholdAdjustment::Baseline, None),
        }
    }

    /// Problematic clusters, best-sampled first.
    pub fn problematic(&self) -> Vec<&LocationCluster> {
        let mut out: Vec<&LocationCluster> = self
            .clusters
            .iter()
            .filter(|c| c.problematic && c.sample_count >= self.cfg.min_samples)
            .collect();
        out.sort_by(|a, b| b.sample_count.cmp(&a.sample_count));
        out
    }

    /// Expire stale clusters and merge ones that drifted together.
    pub fn maintain(&mut self, now: DateTime<Utc>) -> MaintenanceReport {
        let cutoff = now - Duration::days(i64::from(self.cfg.expiry_days));
        let before = self.clusters.len();
        self.clusters.retain(|c| c.last_seen > cutoff);
        let expired = before - self.clusters.len();

        let mut merged = 0;
        let mut i = 0;
        while i < self.clusters.len() {
            let mut j = i + 1;
            while j < self.clusters.len() {
                let (a, b) = (&self.clusters[i], &self.clusters[j]);
                let d = haversine_m(
                    a.center_latitude,
                    a.center_longitude,
                    b.center_latitude,
                    b.center_longitude,
                );
                if d <= self.cfg.merge_distance_m {
                    let source = self.clusters.remove(j);
                    merge_into(&mut self.clusters[i], &source);
                    merged += 1;
                } else {
                    j += 1;
                }
            }
            i += 1;
        }

        if expired > 0 || merged > 0 {
            info!(expired, merged, remaining = self.clusters.len(), "cluster maintenance");
        }
        MaintenanceReport { expired, merged }
    }

    pub fn stats(&self) -> ClusterStats {
        let mut s = ClusterStats {
            total: self.clusters.len(),
            ..ClusterStats::default()
        };
        for c in &self.clusters {
            s.total_samples += c.sample_count;
            if c.sample_count < self.cfg.min_samples {
                s.unclassified += 1;
            } else if c.problematic {
                s.problematic += 1;
            } else {
                s.healthy += 1;
            }
        }
        s
    }
}

/// One EWMA step over a stored average. An empty cluster takes the
/// measurement as is.
fn smooth(alpha: f64, seeded: bool, average: f64, measurement: f64) -> f64 {
    let mut ewma = if seeded {
        Ewma::seeded(alpha, average)
    } else {
        Ewma::new(alpha)
    };
    ewma.update(measurement)
}

/// Sample-weighted merge of `source` into `target`.
fn merge_into(target: &mut LocationCluster, source: &LocationCluster) {
    let total = target.sample_count + source.sample_count;
    let (w1, w2) = if total == 0 {
        (0.5, 0.5)
    } else {
        (
            target.sample_count as f64 / total as f64,
            source.sample_count as f64 / total as f64,
        )
    };
    target.center_latitude = target.center_latitude * w1 + source.center_latitude * w2;
    target.center_longitude = target.center_longitude * w1 + source.center_longitude * w2;
    target.avg_latency_ms = target.avg_latency_ms * w1 + source.avg_latency_ms * w2;
    target.avg_loss_pct = target.avg_loss_pct * w1 + source.avg_loss_pct * w2;
    target.avg_obstruction_pct = target.avg_obstruction_pct * w1 + source.avg_obstruction_pct * w2;
    target.sample_count = total;
    target.radius_m = target.radius_m.max(source.radius_m);
    target.problematic = target.problematic || source.problematic;
    target.first_seen = target.first_seen.min(source.first_seen);
    target.last_seen = target.last_seen.max(source.last_seen);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DecisionConfig;
    use crate::geo::offset_north;

    fn sample(lat: f64, obstruction: f64, at: DateTime<Utc>) -> PerformanceSample {
        PerformanceSample {
            latitude: lat,
            longitude: 18.0,
            latency_ms: 50.0,
            loss_pct: 0.0,
            obstruction_pct: obstruction,
            at,
        }
    }

    #[test]
    fn obstructed_area_becomes_problematic_and_relaxes_thresholds() {
        let mut m = LocationClusterManager::new(ClusteringConfig::default());
        let now = Utc::now();
        for i in 0..5 {
            let lat = offset_north(59.0, 20.0 * i as f64);
            m.add_sample(&sample(lat, 20.0, now + Duration::seconds(i)));
        }
        assert_eq!(m.clusters().len(), 1);
        let c = &m.clusters()[0];
        assert_eq!(c.sample_count, 5);
        assert!(c.problematic);

        let base = Thresholds::from_config(&DecisionConfig::default());
        let (t, adj, hit) = m.thresholds_at(offset_north(59.0, 40.0), 18.0, base);
        assert_eq!(adj, ThresholdAdjustment::Relaxed);
        assert!(hit.is_some());
        assert_eq!(t.latency_ms, base.latency_ms * 1.5);
        assert_eq!(t.loss_pct, base.loss_pct * 2.0);
    }

    #[test]
    fn averages_are_smoothed() {
        let mut m = LocationClusterManager::new(ClusteringConfig {
            ewma_alpha: 0.5,
            ..ClusteringConfig::default()
        });
        let now = Utc::now();
        m.add_sample(&sample(59.0, 10.0, now));
        assert_eq!(m.clusters()[0].avg_obstruction_pct, 10.0);
        m.add_sample(&sample(59.0, 30.0, now + Duration::seconds(1)));
        assert_eq!(m.clusters()[0].avg_obstruction_pct, 20.0);

        let mut nan = sample(59.0, 0.0, now + Duration::seconds(2));
        nan.latency_ms = f64::NAN;
        m.add_sample(&nan);
        assert_eq!(m.clusters()[0].avg_latency_ms, 50.0);
    }

    #[test]
    fn healthy_well_sampled_area_tightens() {
        let mut m = LocationClusterManager::new(ClusteringConfig::default());
        let now = Utc::now();
        for i in 0..5 {
            m.add_sample(&sample(59.0, 0.0, now + Duration::seconds(i)));
        }
        let base = Thresholds::from_config(&DecisionConfig::default());
        let (t, adj, _) = m.thresholds_at(59.0, 18.0, base);
        assert_eq!(adj, ThresholdAdjustment::Tightened);
        assert!((t.latency_ms - base.latency_ms * 0.8).abs() < 1e-9);
    }

    #[test]
    fn under_sampled_cluster_keeps_baseline() {
        let mut m = LocationClusterManager::new(ClusteringConfig::default());
        let now = Utc::now();
        for i in 0..4 {
            m.add_sample(&sample(59.0, 20.0, now + Duration::seconds(i)));
        }
        assert!(!m.clusters()[0].problematic);
        let base = Thresholds::from_config(&DecisionConfig::default());
        let (t, adj, _) = m.thresholds_at(59.0, 18.0, base);
        assert_eq!(adj, ThresholdAdjustment::Baseline);
        assert_eq!(t, base);
        assert_eq!(m.stats().unclassified, 1);
    }

    #[test]
    fn distant_sample_creates_new_cluster_and_radius_grows() {
        let mut m = LocationClusterManager::new(ClusteringConfig::default());
        let now = Utc::now();
        m.add_sample(&sample(59.0, 0.0, now));
        m.add_sample(&sample(offset_north(59.0, 5_000.0), 0.0, now));
        assert_eq!(m.clusters().len(), 2);

        m.add_sample(&sample(offset_north(59.0, 190.0), 0.0, now));
        let c = &m.clusters()[0];
        assert!(c.radius_m >= 100.0);
        assert!(c.radius_m <= 1000.0);
    }

    #[test]
    fn max_clusters_evicts_oldest() {
        let mut m = LocationClusterManager::new(ClusteringConfig {
            max_clusters: 2,
            ..ClusteringConfig::default()
        });
        let now = Utc::now();
        let first = m.add_sample(&sample(10.0, 0.0, now)).unwrap();
        m.add_sample(&sample(20.0, 0.0, now + Duration::seconds(1)));
        m.add_sample(&sample(30.0, 0.0, now + Duration::seconds(2)));
        assert_eq!(m.clusters().len(), 2);
        assert!(m.clusters().iter().all(|c| c.id != first));
    }

    #[test]
    fn maintenance_expires_and_merges() {
        let mut m = LocationClusterManager::new(ClusteringConfig::default());
        let now = Utc::now();
        m.add_sample(&sample(10.0, 0.0, now - Duration::days(40)));
        m.add_sample(&sample(59.0, 0.0, now));
        m.add_sample(&sample(offset_north(59.0, 1_000.0), 10.0, now));
        // Force two live clusters within merge distance.
        m.clusters[2].center_latitude = offset_north(59.0, 150.0);

        let report = m.maintain(now);
        assert_eq!(report, MaintenanceReport { expired: 1, merged: 1 });
        assert_eq!(m.clusters().len(), 1);
        assert_eq!(m.clusters()[0].sample_count, 2);
    }

    #[test]
    fn center_converges_regardless_of_order() {
        let now = Utc::now();
        let lats: Vec<f64> = (0..8).map(|i| offset_north(59.0, 10.0 * i as f64)).collect();

        let mut forward = LocationClusterManager::new(ClusteringConfig::default());
        for lat in &lats {
            forward.add_sample(&sample(*lat, 20.0, now));
        }
        let mut reverse = LocationClusterManager::new(ClusteringConfig::default());
        for lat in lats.iter().rev() {
            reverse.add_sample(&sample(*lat, 20.0, now));
        }

        let (a, b) = (&forward.clusters()[0], &reverse.clusters()[0]);
        let d = haversine_m(
            a.center_latitude,
            a.center_longitude,
            b.center_latitude,
            b.center_longitude,
        );
        assert!(d < 0.01, "centers differ by {d} m");
        assert_eq!(a.problematic, b.problematic);
        assert_eq!(a.sample_count, b.sample_count);
    }

    #[test]
    fn score_floors_each_component() {
        assert_eq!(performance_score(2000.0, 50.0, 50.0), 0.0);
        assert!((performance_score(0.0, 0.0, 0.0) - 100.0).abs() < 1e-9);
    }
}
