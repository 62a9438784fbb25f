use std::sync::Arc;

use chrono::{DateTime, Utc};
use tether_common::models::GpsData;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::source::{GpsSource, SimulatedGps};
use crate::config::GpsConfig;
use crate::error::GpsError;
use crate::geo::in_bounds;

/// Clock disagreement tolerated between a source and the host.
const FUTURE_TOLERANCE: std::time::Duration = std::time::Duration::from_secs(30);

/// Tries position sources in priority order and returns the first fix that
/// validates. Holds no position state of its own.
#[derive(Debug, Clone)]
pub struct GpsCollector {
    sources: Vec<GpsSource>,
    cfg: GpsConfig,
}

impl GpsCollector {
    pub fn new(sources: Vec<GpsSource>, cfg: GpsConfig) -> Self {
        Self { sources, cfg }
    }

    /// Hardware sources in the configured order. A `simulated` entry is
    /// filled from `simulated` when given, and skipped otherwise.
    pub fn from_config(cfg: &GpsConfig, simulated: Option<Arc<SimulatedGps>>) -> Self {
        let mut sources = Vec::with_capacity(cfg.sources.len());
        for kind in &cfg.sources {
            match GpsSource::from_kind(*kind, cfg) {
                Some(source) => sources.push(source),
                None => match &simulated {
                    Some(sim) => sources.push(GpsSource::Simulated(sim.clone())),
                    None => warn!("simulated GPS source configured without --simulate, skipping"),
                },
            }
        }
        Self::new(sources, cfg.clone())
    }

    pub fn sources(&self) -> &[GpsSource] {
        &self.sources
    }

    /// Check a fix against bounds, accuracy and staleness limits.
    pub fn validate(&self, fix: &GpsData, now: DateTime<Utc>) -> Result<(), GpsError> {
        if !fix.valid {
            return Err(GpsError::InvalidFix("fix flagged invalid by source".into()));
        }
        if !in_bounds(fix.latitude, fix.longitude) {
            return Err(GpsError::InvalidFix(format!(
                "coordinates out of range: {}, {}",
                fix.latitude, fix.longitude
            )));
        }
        if !(fix.accuracy <= self.cfg.accuracy_threshold_m) {
            return Err(GpsError::InvalidFix(format!(
                "accuracy too low: {:.1} m > {:.1} m",
                fix.accuracy, self.cfg.accuracy_threshold_m
            )));
        }
        if let Ok(ahead) = (fix.timestamp - now).to_std() {
            if ahead > FUTURE_TOLERANCE {
                return Err(GpsError::InvalidFix(format!(
                    "fix timestamp {:.0}s in the future",
                    ahead.as_secs_f64()
                )));
            }
        }
        let age = (now - fix.timestamp).to_std().unwrap_or_default();
        if age > self.cfg.staleness_threshold {
            return Err(GpsError::InvalidFix(format!(
                "fix too stale: {:.0}s old",
                age.as_secs_f64()
            )));
        }
        Ok(())
    }

    /// Collect one validated fix.
    ///
    /// Every availability check and collection attempt runs under
    /// `command_timeout`. Unavailable sources are skipped; available ones get
    /// `retry_attempts` tries with `retry_delay` between them.
    pub async fn collect(&self) -> Result<GpsData, GpsError> {
        if !self.cfg.enabled {
            return Err(GpsError::Disabled);
        }
        let limit = self.cfg.command_timeout;
        let mut any_available = false;
        let mut failures = Vec::new();

        for source in &self.sources {
            let available = timeout(limit, source.is_available()).await.unwrap_or(false);
            if !available {
                debug!(source = source.name(), "GPS source unavailable");
                continue;
            }
            any_available = true;

            for attempt in 1..=self.cfg.retry_attempts {
                let outcome = match timeout(limit, source.collect()).await {
                    Ok(Ok(fix)) => self.validate(&fix, Utc::now()).map(|()| fix),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(GpsError::Timeout {
                        origin: source.name().to_string(),
                        after: limit,
                    }),
                };
                match outcome {
                    Ok(fix) => {
                        debug!(
                            source = source.name(),
                            latitude = fix.latitude,
                            longitude = fix.longitude,
                            accuracy = fix.accuracy,
                            satellites = fix.satellites,
                            attempt,
                            "GPS fix collected"
                        );
                        return Ok(fix);
                    }
                    Err(e) => {
                        debug!(source = source.name(), attempt, error = %e, "GPS attempt failed");
                        failures.push(format!("{}: {e}", source.name()));
                    }
                }
                if attempt < self.cfg.retry_attempts {
                    tokio::time::sleep(self.cfg.retry_delay).await;
                }
            }
        }

        if any_available {
            Err(GpsError::AllSourcesFailed(failures))
        } else {
            Err(GpsError::NoSourcesAvailable)
        }
    }

    /// Name of the highest-priority source currently available.
    pub async fn best_source(&self) -> Option<&'static str> {
        for source in &self.sources {
            if timeout(self.cfg.command_timeout, source.is_available())
                .await
                .unwrap_or(false)
            {
                return Some(source.name());
            }
        }
        None
    }
}
