//! Persistent state surviving reboots and crashes.
//!
//! The store is a single JSON file holding the device's committed provides
//! map and the in-flight update record, if any. Every mutation rewrites the
//! file atomically through a temp file in the same directory, so a crash
//! leaves either the old or the new contents, never a torn file.
//!
//! The previous client generation persisted a flat `Key=Value` text blob;
//! [`migrate_legacy`] lifts those files into the current schema on first
//! read.

use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
};

use ab_update_engine_core::Slot;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub const SCHEMA_VERSION: u32 = 2;

/// Key under which the committed artifact name lives in the provides map.
pub const ARTIFACT_NAME_KEY: &str = "artifact_name";
pub const ARTIFACT_GROUP_KEY: &str = "artifact_group";
pub const PAYLOAD_TYPES_KEY: &str = "payload_types";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed reading state store at `{}`", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed writing state store at `{}`", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed parsing state store at `{}`", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Lifecycle state of an in-flight update attempt.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum UpdateState {
    Downloading,
    ArtifactInstall,
    ArtifactReboot,
    ArtifactCommit,
    ArtifactRollback,
}

/// Everything the engine must remember about an update attempt to carry it
/// across a reboot or resume it after an interruption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRecord {
    pub state: UpdateState,
    pub artifact_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_group: Option<String>,
    pub payload_types: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub provides: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub clears_provides: Vec<String>,
    /// Slot that was active when the attempt started. Absent only in
    /// records migrated from the legacy schema, which did not track it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_active: Option<Slot>,
    pub supports_rollback: bool,
    #[serde(default)]
    pub needs_reboot: bool,
    /// Last hook point completed during commit, used to resume an
    /// interrupted commit without repeating hooks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reached: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreData {
    pub schema_version: u32,
    #[serde(default)]
    pub provides: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub clears_provides: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_progress: Option<UpdateRecord>,
}

impl Default for StoreData {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            provides: BTreeMap::new(),
            clears_provides: Vec::new(),
            in_progress: None,
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

    /// Loads the store, creating an empty one in memory if the file does
    /// not exist yet and migrating legacy flat files transparently.
    pub fn load(&self) -> Result<StoreData, Error> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no state store yet, starting empty");
                return Ok(StoreData::default());
            }
            Err(source) => {
                return Err(Error::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        if text.trim_start().starts_with('{') {
            return serde_json::from_str(&text).map_err(|source| Error::Parse {
                path: self.path.clone(),
                source,
            });
        }
        info!(path = %self.path.display(), "migrating legacy state store");
        Ok(migrate_legacy(&text))
    }

    /// Atomically replaces the store file with `data`.
    pub fn save(&self, data: &StoreData) -> Result<(), Error> {
        let write_err = |source| Error::Write {
            path: self.path.clone(),
            source,
        };
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir).map_err(write_err)?;
        let tmp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
        serde_json::to_writer_pretty(tmp.as_file(), data).map_err(|source| Error::Parse {
            path: self.path.clone(),
            source,
        })?;
        tmp.as_file().sync_all().map_err(write_err)?;
        tmp.persist(&self.path)
            .map_err(|e| write_err(e.error))?;
        Ok(())
    }

    pub fn clear_in_progress(&self) -> Result<(), Error> {
        let mut data = self.load()?;
        data.in_progress = None;
        self.save(&data)
    }
}

/// Lifts a legacy flat `Key=Value` state file into the current schema.
///
/// The legacy client wrote this file between updates, so the keys describe
/// the committed artifact; a mid-update `State=` line is preserved as an
/// in-flight record with no original-slot information. The function is
/// pure, so migrating the same text twice yields the same result.
pub fn migrate_legacy(text: &str) -> StoreData {
    let mut data = StoreData::default();
    let mut state = None;
    let mut payload_types = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key {
            "ArtifactName" => {
                data.provides
                    .insert(ARTIFACT_NAME_KEY.to_string(), value.to_string());
            }
            "ArtifactGroup" => {
                data.provides
                    .insert(ARTIFACT_GROUP_KEY.to_string(), value.to_string());
            }
            "PayloadTypes" => {
                payload_types =
                    value.split(',').map(|s| s.trim().to_string()).collect();
                data.provides
                    .insert(PAYLOAD_TYPES_KEY.to_string(), value.to_string());
            }
            "ClearsProvides" => {
                data.clears_provides =
                    value.split(',').map(|s| s.trim().to_string()).collect();
            }
            "State" => state = Some(value.to_string()),
            _ => {
                if let Some(name) = key.strip_prefix("Provides.") {
                    data.provides.insert(name.to_string(), value.to_string());
                }
            }
        }
    }
    if let Some(state) = state.and_then(|s| parse_legacy_state(&s)) {
        data.in_progress = Some(UpdateRecord {
            state,
            artifact_name: data
                .provides
                .get(ARTIFACT_NAME_KEY)
                .cloned()
                .unwrap_or_else(|| "unknown".to_string()),
            artifact_group: data.provides.get(ARTIFACT_GROUP_KEY).cloned(),
            payload_types,
            provides: BTreeMap::new(),
            clears_provides: data.clears_provides.clone(),
            original_active: None,
            supports_rollback: false,
            needs_reboot: false,
            reached: None,
        });
    }
    data
}

fn parse_legacy_state(state: &str) -> Option<UpdateState> {
    match state {
        "Downloading" => Some(UpdateState::Downloading),
        "ArtifactInstall" => Some(UpdateState::ArtifactInstall),
        "ArtifactReboot" => Some(UpdateState::ArtifactReboot),
        "ArtifactCommit" => Some(UpdateState::ArtifactCommit),
        "ArtifactRollback" => Some(UpdateState::ArtifactRollback),
        _ => None,
    }
}
