use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use riftpatch_core::{InstallFingerprint, Manifest, UpdateError, UpdateStage};
use tracing::{debug, error, info, warn};

use crate::apply::PatchApplier;
use crate::cancel::{ensure_active, CancellationToken};
use crate::config::EngineConfig;
use crate::download::{DownloadReport, Downloader};
use crate::fs_utils::format_bytes;
use crate::install_state::InstallStateStore;
use crate::layout::AppLayout;
use crate::manifest_store::{ManifestOrigin, ManifestStore};
use crate::progress::{ProgressReporter, ProgressSink};
use crate::transactions::TransactionLog;
use crate::verifier::FileVerifier;

const MANIFEST_SLICE: (f64, f64) = (0.0, 10.0);
const VERIFY_SLICE: (f64, f64) = (10.0, 25.0);
const DOWNLOAD_SLICE: (f64, f64) = (35.0, 55.0);
const APPLY_SLICE: (f64, f64) = (90.0, 8.0);
const FINAL_CHECK_SLICE: (f64, f64) = (98.0, 2.0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Normal,
    /// Re-hash everything and remove orphaned files.
    Repair,
}

impl RunMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Repair => "repair",
        }
    }

    fn is_repair(self) -> bool {
        self == Self::Repair
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub manifest_version: String,
    pub manifest_origin: ManifestOrigin,
    /// An interrupted apply from an earlier run was rolled back first.
    pub recovered: bool,
    pub verified: usize,
    pub downloaded: usize,
    pub applied: usize,
    pub orphans_removed: Vec<String>,
    pub wire_bytes: u64,
}

/// Sequences one update run: recover, fetch, verify, (cleanup), download,
/// apply, final check.
pub struct Orchestrator {
    layout: AppLayout,
    config: EngineConfig,
    verifier: FileVerifier,
}

impl Orchestrator {
    pub fn new(layout: AppLayout, config: EngineConfig) -> Self {
        Self {
            layout,
            config,
            verifier: FileVerifier::new(),
        }
    }

    pub fn with_verifier(mut self, verifier: FileVerifier) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn layout(&self) -> &AppLayout {
        &self.layout
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Rolls back an interrupted apply, if one is recorded.
    pub fn recover(&self) -> Result<bool, UpdateError> {
        TransactionLog::new(&self.layout)
            .recover_if_pending(&self.config.install_dir)
            .map_err(|err| {
                UpdateError::unexpected("Could not recover the interrupted update.", &err)
            })
    }

    pub fn run(
        &self,
        mode: RunMode,
        sink: Arc<ProgressSink>,
        cancel: &CancellationToken,
    ) -> Result<RunSummary, UpdateError> {
        let reporter = ProgressReporter::new(sink);
        info!(mode = mode.as_str(), install_dir = %self.config.install_dir.display(), "update run started");

        match self.run_pipeline(mode, &reporter, cancel) {
            Ok(summary) => {
                info!(
                    version = %summary.manifest_version,
                    downloaded = summary.downloaded,
                    applied = summary.applied,
                    orphans = summary.orphans_removed.len(),
                    "update run finished"
                );
                Ok(summary)
            }
            Err(err) if err.is_cancelled() => {
                info!("update run cancelled");
                Err(err)
            }
            Err(err) => {
                error!(headline = err.headline(), detail = %err.detail(), "update run failed");
                Err(err)
            }
        }
    }

    fn run_pipeline(
        &self,
        mode: RunMode,
        reporter: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<RunSummary, UpdateError> {
        let install_dir = self.config.install_dir.as_path();
        self.layout.ensure_base_dirs()?;
        let log = TransactionLog::new(&self.layout);
        let recovered = self.recover()?;
        ensure_active(cancel)?;

        let stage = reporter.stage(
            UpdateStage::FetchManifest,
            MANIFEST_SLICE.0,
            MANIFEST_SLICE.1,
            "Checking for updates",
        );
        stage.start(self.config.manifest_source.describe());
        let fetched = ManifestStore::new(&self.layout, &self.config)?.fetch(cancel)?;
        let manifest = fetched.manifest;
        stage.finish(match fetched.origin {
            ManifestOrigin::Network => format!("Version {}", manifest.version),
            ManifestOrigin::Cache => format!("Version {} (using cached manifest)", manifest.version),
        });

        fs::create_dir_all(install_dir)
            .with_context(|| format!("failed to create install dir: {}", install_dir.display()))?;

        let orphans_removed = if mode.is_repair() {
            reporter.report(
                UpdateStage::CleanupOrphans,
                VERIFY_SLICE.0,
                "Removing unknown files",
                install_dir.display().to_string(),
            );
            self.verifier.cleanup_orphans(
                install_dir,
                &manifest,
                &self.config.orphan_whitelist,
                cancel,
            )?
        } else {
            Vec::new()
        };

        let state_store = InstallStateStore::new(&self.layout);
        let previous = if mode.is_repair() {
            None
        } else {
            state_store.load()
        };
        let stage = reporter.stage(
            UpdateStage::VerifyFiles,
            VERIFY_SLICE.0,
            VERIFY_SLICE.1,
            "Verifying files",
        );
        let outcome = self.verifier.verify(
            install_dir,
            &manifest,
            mode.is_repair(),
            previous.as_ref(),
            &stage,
            cancel,
        )?;
        stage.finish(format!(
            "{} of {} files need updating",
            outcome.missing_or_invalid.len(),
            manifest.files.len()
        ));

        let download = if outcome.missing_or_invalid.is_empty() {
            DownloadReport::default()
        } else {
            let stage = reporter.stage(
                UpdateStage::Downloading,
                DOWNLOAD_SLICE.0,
                DOWNLOAD_SLICE.1,
                "Downloading",
            );
            let report = Downloader::new(&self.config)?.download(
                &manifest.base_url,
                &outcome.missing_or_invalid,
                &self.layout.temp_dir(),
                &stage,
                cancel,
            )?;
            stage.finish(format!(
                "{} files, {} transferred",
                report.staged.len(),
                format_bytes(report.wire_bytes)
            ));
            report
        };

        let applied = if download.staged.is_empty() {
            Vec::new()
        } else {
            ensure_active(cancel)?;
            log.begin(&manifest.version)?;
            let backup_root =
                PatchApplier::claim_backup_root(&self.layout.backup_dir(), Utc::now())?;
            let stage = reporter.stage(
                UpdateStage::Applying,
                APPLY_SLICE.0,
                APPLY_SLICE.1,
                "Installing update",
            );
            let applied = PatchApplier::new().apply(
                install_dir,
                &backup_root,
                &download.staged,
                &log,
                &stage,
                cancel,
            )?;
            stage.finish(format!("{} files installed", applied.len()));
            applied
        };

        let stage = reporter.stage(
            UpdateStage::FinalCheck,
            FINAL_CHECK_SLICE.0,
            FINAL_CHECK_SLICE.1,
            "Final check",
        );
        stage.start(format!("{} files", manifest.files.len()));
        self.verifier
            .quick_check(install_dir, &manifest, mode.is_repair(), cancel)?;
        if !applied.is_empty() {
            log.complete()?;
        }
        stage.finish("Installation verified");

        self.refresh_install_state(&state_store, &manifest, outcome.verified_fingerprints);
        self.clean_staging();
        if !applied.is_empty() {
            self.prune_backups();
        }

        reporter.report(
            UpdateStage::Ready,
            100.0,
            "Ready to play",
            format!("Version {}", manifest.version),
        );

        Ok(RunSummary {
            manifest_version: manifest.version.clone(),
            manifest_origin: fetched.origin,
            recovered,
            verified: manifest.files.len() - outcome.missing_or_invalid.len(),
            downloaded: download.staged.len(),
            applied: applied.len(),
            orphans_removed,
            wire_bytes: download.wire_bytes,
        })
    }

    fn refresh_install_state(
        &self,
        store: &InstallStateStore,
        manifest: &Manifest,
        mut fingerprints: BTreeMap<String, InstallFingerprint>,
    ) {
        let install_dir = self.config.install_dir.as_path();
        for file in &manifest.files {
            if fingerprints.contains_key(&file.path) {
                continue;
            }
            match self.verifier.fingerprint_file(install_dir, file) {
                Ok(fingerprint) => {
                    fingerprints.insert(file.path.clone(), fingerprint);
                }
                Err(err) => {
                    warn!(path = %file.path, error = %format!("{err:#}"), "failed to fingerprint file")
                }
            }
        }
        if let Err(err) = store.mark_verified(&manifest.version, fingerprints) {
            warn!(error = %format!("{err:#}"), "failed to persist install state");
        }
    }

    fn clean_staging(&self) {
        let temp_dir = self.layout.temp_dir();
        match fs::remove_dir_all(&temp_dir) {
            Ok(()) => debug!(path = %temp_dir.display(), "staging area cleared"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %temp_dir.display(), error = %err, "failed to clear staging area"),
        }
    }

    fn prune_backups(&self) {
        if let Err(err) = prune_backup_dirs(&self.layout.backup_dir(), self.config.backup_retention)
        {
            warn!(error = %format!("{err:#}"), "failed to prune old backups");
        }
    }
}

/// Keeps the newest `retention` backup directories. Names are UTC timestamps,
/// so lexical order is chronological.
pub(crate) fn prune_backup_dirs(backup_dir: &Path, retention: usize) -> anyhow::Result<()> {
    let entries = match fs::read_dir(backup_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read {}", backup_dir.display()))
        }
    };

    let mut dirs = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read {}", backup_dir.display()))?;
        if entry.file_type().map(|kind| kind.is_dir()).unwrap_or(false) {
            dirs.push(entry.path());
        }
    }
    dirs.sort();

    let excess = dirs.len().saturating_sub(retention);
    for dir in dirs.into_iter().take(excess) {
        fs::remove_dir_all(&dir)
            .with_context(|| format!("failed to remove old backup {}", dir.display()))?;
        debug!(path = %dir.display(), "pruned backup");
    }
    Ok(())
}
