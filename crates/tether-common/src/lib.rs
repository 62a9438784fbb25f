//! Shared types for the Tether uplink failover engine.
//!
//! This crate contains:
//! - **Data models**: Member, Metrics, Score, GpsData, MovementEvent,
//!   LocationCluster and Decision
//! - **ID generation**: Prefixed UUIDv7 helpers (`dec_`, `clu_`)

pub mod ids;
pub mod models;
