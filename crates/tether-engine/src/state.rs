//! Persisted engine memory.
//!
//! One JSON document holds everything the engine needs to resume after a
//! restart: the last known fix, per-member failover state and the cluster
//! set. Writes go to a sibling temp file which is fsynced and renamed over
//! the target, so a crash leaves either the old or the new document.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tether_common::models::{GpsData, LinkState, LocationCluster};
use tracing::{debug, info};

use crate::error::StateError;

pub const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedMember {
    pub state: LinkState,
    pub stability_count: u32,
    pub applied_metric: u32,
    #[serde(default)]
    pub ewma: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    #[serde(default)]
    pub last_fix: Option<GpsData>,
    #[serde(default)]
    pub members: BTreeMap<String, PersistedMember>,
    #[serde(default)]
    pub clusters: Vec<LocationCluster>,
}

impl PersistedState {
    pub fn new(saved_at: DateTime<Utc>) -> Self {
        Self {
            version: STATE_VERSION,
            saved_at,
            last_fix: None,
            members: BTreeMap::new(),
            clusters: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(path: &Path, source: std::io::Error) -> StateError {
        StateError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Read the state document. A missing file is not an error.
    pub fn load(&self) -> Result<Option<PersistedState>, StateError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no persisted state");
                return Ok(None);
            }
            Err(e) => return Err(Self::io_err(&self.path, e)),
        };
        let state: PersistedState =
            serde_json::from_str(&raw).map_err(|e| StateError::Corrupt {
                path: self.path.clone(),
                source: e,
            })?;
        info!(
            path = %self.path.display(),
            saved_at = %state.saved_at,
            members = state.members.len(),
            clusters = state.clusters.len(),
            "persisted state loaded"
        );
        Ok(Some(state))
    }

    pub fn save(&self, state: &PersistedState) -> Result<(), StateError> {
        let encoded = serde_json::to_vec_pretty(state)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| Self::io_err(parent, e))?;
        }

        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);

        let mut file = File::create(&tmp).map_err(|e| Self::io_err(&tmp, e))?;
        file.write_all(&encoded).map_err(|e| Self::io_err(&tmp, e))?;
        file.sync_all().map_err(|e| Self::io_err(&tmp, e))?;
        drop(file);
        std::fs::rename(&tmp, &self.path).map_err(|e| Self::io_err(&self.path, e))?;

        debug!(path = %self.path.display(), bytes = encoded.len(), "state persisted");
        Ok(())
    }
}
