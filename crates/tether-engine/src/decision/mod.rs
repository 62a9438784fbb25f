//! Failover decisions: the quality predicate, predictive triggers, the
//! per-member state machine and the audit log.

pub mod engine;
pub mod log;
pub mod predictive;
pub mod quality;

pub use engine::{DecisionEngine, EngineStatus, MemberStatus};
pub use log::{DecisionLog, DecisionStats};
