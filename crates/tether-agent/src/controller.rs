//! Routing control shims.
//!
//! [`CommandController`] hands every change to an external executable so the
//! daemon stays agnostic of the router's routing stack (mwan3, ip rules,
//! a vendor CLI). [`MemoryController`] keeps the routing table in memory
//! for simulation.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use tether_engine::error::ControlError;
use tether_engine::interfaces::Controller;
use tracing::{debug, info};

/// Invokes `<program> metric <member> <metric>`, `<program> switch <from> <to>`
/// and `<program> current`.
pub struct CommandController {
    program: PathBuf,
}

impl CommandController {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String, String> {
        debug!(program = %self.program.display(), ?args, "running controller command");
        let output = tokio::process::Command::new(&self.program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| format!("{} not runnable: {e}", self.program.display()))?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(format!("{} ({})", stderr.trim(), output.status))
        }
    }
}

#[async_trait::async_trait]
impl Controller for CommandController {
    async fn switch(&self, from: &str, to: &str) -> Result<(), ControlError> {
        self.run(&["switch", from, to])
            .await
            .map(|_| ())
            .map_err(|reason| ControlError::Switch {
                from: from.into(),
                to: to.into(),
                reason,
            })
    }

    async fn current_member(&self) -> Result<Option<String>, ControlError> {
        let out = self.run(&["current"]).await.map_err(ControlError::Query)?;
        Ok(out.lines().next().filter(|l| !l.is_empty()).map(str::to_string))
    }

    async fn apply_metric(&self, member: &str, metric: u32) -> Result<(), ControlError> {
        let value = metric.to_string();
        self.run(&["metric", member, &value])
            .await
            .map(|_| ())
            .map_err(|reason| ControlError::ApplyMetric {
                member: member.into(),
                metric,
                reason,
            })
    }
}

#[derive(Debug, Default)]
struct Table {
    metrics: BTreeMap<String, u32>,
    active: Option<String>,
}

/// In-memory routing table. The lowest-metric member is not promoted
/// automatically; only explicit switches change the active member.
#[derive(Debug, Default)]
pub struct MemoryController {
    table: Mutex<Table>,
}

impl MemoryController {
    pub fn new(active: Option<String>) -> Self {
        Self {
            table: Mutex::new(Table {
                metrics: BTreeMap::new(),
                active,
            }),
        }
    }

    pub fn metric(&self, member: &str) -> Option<u32> {
        self.table
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .metrics
            .get(member)
            .copied()
    }
}

#[async_trait::async_trait]
impl Controller for MemoryController {
    async fn switch(&self, from: &str, to: &str) -> Result<(), ControlError> {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        info!(from, to, "simulated switch");
        table.active = Some(to.to_string());
        Ok(())
    }

    async fn current_member(&self) -> Result<Option<String>, ControlError> {
        Ok(self
            .table
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .active
            .clone())
    }

    async fn apply_metric(&self, member: &str, metric: u32) -> Result<(), ControlError> {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        info!(member, metric, "simulated metric change");
        table.metrics.insert(member.to_string(), metric);
        Ok(())
    }
}
