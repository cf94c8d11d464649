use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::manifest::ManifestFile;

/// Cached assertion that a file with this size and modification time hashes
/// to `sha256`. An empty `sha256` records a file verified without a hash.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InstallFingerprint {
    pub size: u64,
    pub last_write_time_ticks: u64,
    #[serde(default)]
    pub sha256: String,
}

impl InstallFingerprint {
    pub fn matches(&self, size: u64, last_write_time_ticks: u64, expected_sha256: &str) -> bool {
        self.size == size
            && self.last_write_time_ticks == last_write_time_ticks
            && !self.sha256.is_empty()
            && self.sha256.eq_ignore_ascii_case(expected_sha256.trim())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InstallState {
    pub manifest_version: String,
    pub verified_at_utc: DateTime<Utc>,
    #[serde(default)]
    pub files: BTreeMap<String, InstallFingerprint>,
}

impl InstallState {
    pub fn new(
        manifest_version: impl Into<String>,
        files: BTreeMap<String, InstallFingerprint>,
    ) -> Self {
        Self {
            manifest_version: manifest_version.into(),
            verified_at_utc: Utc::now(),
            files,
        }
    }

    /// Cached fingerprints are only meaningful for the manifest they were
    /// recorded against.
    pub fn is_trusted_for(&self, manifest_version: &str) -> bool {
        !self.manifest_version.is_empty() && self.manifest_version == manifest_version
    }

    pub fn fingerprint(&self, relative_path: &str) -> Option<&InstallFingerprint> {
        self.files.get(relative_path)
    }
}

/// A downloaded and validated file waiting outside the installation tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub manifest_file: ManifestFile,
    pub staging_path: PathBuf,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Applying,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AppliedFile {
    pub relative_path: String,
    #[serde(default)]
    pub backup_path: String,
}

impl AppliedFile {
    pub fn backup(&self) -> Option<&Path> {
        if self.backup_path.trim().is_empty() {
            None
        } else {
            Some(Path::new(&self.backup_path))
        }
    }
}

/// Write-ahead record of one apply operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTransaction {
    pub version: String,
    pub started_at_utc: DateTime<Utc>,
    pub status: TransactionStatus,
    #[serde(default)]
    pub applied_files: Vec<AppliedFile>,
}

impl UpdateTransaction {
    pub fn begin(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            started_at_utc: Utc::now(),
            status: TransactionStatus::Applying,
            applied_files: Vec::new(),
        }
    }
}
