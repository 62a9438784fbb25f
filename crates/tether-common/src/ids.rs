//! Prefixed ID generation.
//!
//! All record IDs use a `prefix_` followed by a UUIDv7 (time-ordered), so
//! decision IDs sort by creation time in logs and audit queries.

use uuid::Uuid;

fn prefixed_id(prefix: &str) -> String {
    let id = Uuid::now_v7();
    format!("{}_{}", prefix, id.as_simple())
}

/// Generate a decision ID: `dec_<uuid7>`
pub fn decision_id() -> String {
    prefixed_id("dec")
}

/// Generate a location cluster ID: `clu_<uuid7>`
pub fn cluster_id() -> String {
    prefixed_id("clu")
}
