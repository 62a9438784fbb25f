//! # Movement Detection
//!
//! Turns consecutive GPS fixes into [`MovementEvent`]s: distance, velocity,
//! acceleration and a coarse movement class. A displacement of at least
//! `movement_threshold_m` between fixes requests an obstruction baseline
//! reset, since the sky view the satellite terminal learned no longer applies.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tether_common::models::{GpsData, MovementAction, MovementEvent, MovementType};
use tracing::{info, warn};

use crate::config::MovementConfig;
use crate::error::GpsError;
use crate::geo::haversine_m;

/// Events considered by the trend classification.
const TREND_EVENTS: usize = 10;
const TREND_ACCEL_MPS2: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementTrend {
    Stationary,
    Mobile,
    Accelerating,
    Decelerating,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MovementSummary {
    pub moving: bool,
    pub events: usize,
    pub total_distance_m: f64,
    pub avg_velocity_mps: f64,
    pub max_velocity_mps: f64,
    pub max_abs_acceleration_mps2: f64,
    pub stationary_events: usize,
    pub last_movement: Option<DateTime<Utc>>,
    pub trend: MovementTrend,
}

/// Classify one displacement.
pub fn classify(distance_m: f64, velocity_mps: f64, stationary_threshold_m: f64) -> MovementType {
    if distance_m < stationary_threshold_m {
        MovementType::Stationary
    } else if velocity_mps < 1.0 {
        MovementType::Slow
    } else if velocity_mps < 5.0 {
        MovementType::Normal
    } else if velocity_mps < 15.0 {
        MovementType::Fast
    } else {
        MovementType::Rapid
    }
}

#[derive(Debug)]
pub struct MovementDetector {
    cfg: MovementConfig,
    history: VecDeque<MovementEvent>,
    moving: bool,
}

impl MovementDetector {
    pub fn new(cfg: MovementConfig) -> Self {
        Self {
            history: VecDeque::with_capacity(cfg.history_size),
            cfg,
            moving: false,
        }
    }

    /// Compare a new valid fix against the previous one.
    pub fn observe(&mut self, from: &GpsData, to: &GpsData) -> Result<MovementEvent, GpsError> {
        if !to.valid {
            return Err(GpsError::InvalidFix("fix flagged invalid".into()));
        }
        let duration_s = (to.timestamp - from.timestamp).num_milliseconds() as f64 / 1000.0;
        if duration_s <= 0.0 {
            return Err(GpsError::OutOfOrder {
                previous: from.timestamp.to_rfc3339(),
                current: to.timestamp.to_rfc3339(),
            });
        }

        let distance_m = haversine_m(from.latitude, from.longitude, to.latitude, to.longitude);
        let velocity_mps = distance_m / duration_s;
        let acceleration_mps2 = self
            .history
            .back()
            .map_or(0.0, |prev| (velocity_mps - prev.velocity_mps) / duration_s);
        let movement_type = classify(distance_m, velocity_mps, self.cfg.stationary_threshold_m);

        let was_moving = self.moving;
        if distance_m < self.cfg.stationary_threshold_m {
            self.moving = false;
        } else if distance_m >= self.cfg.movement_threshold_m {
            self.moving = true;
        }
        if was_moving != self.moving {
            info!(
                from = if was_moving { "moving" } else { "stationary" },
                to = if self.moving { "moving" } else { "stationary" },
                distance_m,
                velocity_mps,
                movement_type = movement_type.as_str(),
                "movement state changed"
            );
        }

        let action_triggered = if distance_m >= self.cfg.movement_threshold_m {
            info!(
                distance_m,
                threshold_m = self.cfg.movement_threshold_m,
                from_lat = from.latitude,
                from_lon = from.longitude,
                to_lat = to.latitude,
                to_lon = to.longitude,
                "significant movement, requesting obstruction baseline reset"
            );
            MovementAction::ObstructionMapReset
        } else {
            MovementAction::None
        };

        if acceleration_mps2.abs() > self.cfg.acceleration_threshold_mps2 {
            warn!(
                acceleration_mps2,
                threshold = self.cfg.acceleration_threshold_mps2,
                velocity_mps,
                "high acceleration between fixes"
            );
        }

        let event = MovementEvent {
            timestamp: to.timestamp,
            from: from.clone(),
            to: to.clone(),
            distance_m,
            duration_s,
            velocity_mps,
            acceleration_mps2,
            movement_type,
            action_triggered,
        };
        self.history.push_back(event.clone());
        while self.history.len() > self.cfg.history_size {
            self.history.pop_front();
        }
        Ok(event)
    }

    pub fn is_moving(&self) -> bool {
        self.moving
    }

    /// Most recent events, oldest first.
    pub fn recent(&self, n: usize) -> Vec<MovementEvent> {
        let skip = self.history.len().saturating_sub(n);
        self.history.iter().skip(skip).cloned().collect()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Summary over events inside the configured time window ending at `now`.
    pub fn summary(&self, now: DateTime<Utc>) -> MovementSummary {
        let window = chrono::Duration::from_std(self.cfg.time_window)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        let events: Vec<&MovementEvent> = self
            .history
            .iter()
            .filter(|e| e.timestamp >= now - window)
            .collect();

        let total_distance_m = events.iter().map(|e| e.distance_m).sum();
        let max_velocity_mps = events.iter().map(|e| e.velocity_mps).fold(0.0, f64::max);
        let max_abs_acceleration_mps2 = events
            .iter()
            .map(|e| e.acceleration_mps2.abs())
            .fold(0.0, f64::max);
        let avg_velocity_mps = if events.is_empty() {
            0.0
        } else {
            events.iter().map(|e| e.velocity_mps).sum::<f64>() / events.len() as f64
        };
        let stationary_events = events
            .iter()
            .filter(|e| e.movement_type == MovementType::Stationary)
            .count();
        let last_movement = events
            .iter()
            .rev()
            .find(|e| e.movement_type != MovementType::Stationary)
            .map(|e| e.timestamp);

        MovementSummary {
            moving: self.moving,
            events: events.len(),
            total_distance_m,
            avg_velocity_mps,
            max_velocity_mps,
            max_abs_acceleration_mps2,
            stationary_events,
            last_movement,
            trend: self.trend(),
        }
    }

    /// Trend over the last few events regardless of age.
    pub fn trend(&self) -> MovementTrend {
        let recent = self.recent(TREND_EVENTS);
        if recent.is_empty() {
            return MovementTrend::Stationary;
        }
        let avg_accel =
            recent.iter().map(|e| e.acceleration_mps2).sum::<f64>() / recent.len() as f64;
        if avg_accel > TREND_ACCEL_MPS2 {
            MovementTrend::Accelerating
        } else if avg_accel < -TREND_ACCEL_MPS2 {
            MovementTrend::Decelerating
        } else if recent
            .iter()
            .any(|e| e.movement_type != MovementType::Stationary)
        {
            MovementTrend::Mobile
        } else {
            MovementTrend::Stationary
        }
    }
}
