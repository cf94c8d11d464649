use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use riftpatch_core::{InstallFingerprint, InstallState};
use tracing::warn;

use crate::fs_utils::{remove_file_if_exists, write_atomic};
use crate::layout::AppLayout;

/// Persistence for the fingerprint cache (`installstate.json`).
#[derive(Debug, Clone)]
pub struct InstallStateStore {
    path: PathBuf,
}

impl InstallStateStore {
    pub fn new(layout: &AppLayout) -> Self {
        Self {
            path: layout.install_state_path(),
        }
    }

    /// A missing or corrupt cache is the same as no cache: everything gets
    /// hashed again.
    pub fn load(&self) -> Option<InstallState> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "install state unreadable");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(state) => Some(state),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "install state corrupt");
                None
            }
        }
    }

    pub fn save(&self, state: &InstallState) -> Result<()> {
        let raw = serde_json::to_string_pretty(state).context("failed to serialize install state")?;
        write_atomic(&self.path, raw.as_bytes())
            .with_context(|| format!("failed to write install state: {}", self.path.display()))
    }

    pub fn mark_verified(
        &self,
        manifest_version: &str,
        files: BTreeMap<String, InstallFingerprint>,
    ) -> Result<InstallState> {
        let state = InstallState::new(manifest_version, files);
        self.save(&state)?;
        Ok(state)
    }

    pub fn clear(&self) -> Result<()> {
        remove_file_if_exists(&self.path)
            .with_context(|| format!("failed to remove install state: {}", self.path.display()))
    }
}
