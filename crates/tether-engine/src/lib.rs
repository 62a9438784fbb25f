//! # Tether Engine
//!
//! Uplink health scoring and failover decisions for multi-WAN gateways.
//!
//! - [`scoring`]: per-sample quality score and EWMA/window smoothing
//! - [`decision`]: quality predicate, predictive triggers, failover state
//!   machine, decision audit log
//! - [`gps`], [`movement`], [`cluster`], [`context`]: position acquisition,
//!   movement detection and location-aware thresholds
//! - [`runtime`], [`sampling`]: task wiring for the daemon and adaptive
//!   poll cadence

pub mod cluster;
pub mod config;
pub mod context;
pub mod decision;
pub mod error;
pub mod ewma;
pub mod geo;
pub mod gps;
pub mod interfaces;
pub mod metrics;
pub mod movement;
pub mod notify;
pub mod runtime;
pub mod sampling;
pub mod scoring;
pub mod state;
pub mod telemetry;
pub mod util;
