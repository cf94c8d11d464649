use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use riftpatch_core::{StagedFile, UpdateError};
use tracing::{debug, info};

use crate::cancel::{ensure_active, CancellationToken};
use crate::fs_utils::{is_cross_device_error, is_locked_error, remove_file_if_exists};
use crate::progress::StageProgress;
use crate::transactions::TransactionLog;

const MAX_BACKUP_SUFFIX: u32 = 99;

/// Moves staged files into the installation with backup-then-replace.
#[derive(Debug, Clone, Copy, Default)]
pub struct PatchApplier;

impl PatchApplier {
    pub fn new() -> Self {
        Self
    }

    /// `backup/<UTC yyyyMMddHHmmss>` for an apply started at `now`.
    pub fn backup_root_for(backup_dir: &Path, now: DateTime<Utc>) -> PathBuf {
        backup_dir.join(now.format("%Y%m%d%H%M%S").to_string())
    }

    /// Creates a backup root no earlier apply owns. Applies started within
    /// the same second get `-01`, `-02`, ... suffixes, which keep name order
    /// equal to creation order.
    pub fn claim_backup_root(backup_dir: &Path, now: DateTime<Utc>) -> anyhow::Result<PathBuf> {
        fs::create_dir_all(backup_dir)
            .with_context(|| format!("failed to create {}", backup_dir.display()))?;
        let base = Self::backup_root_for(backup_dir, now);
        for suffix in 0..=MAX_BACKUP_SUFFIX {
            let candidate = if suffix == 0 {
                base.clone()
            } else {
                let mut name = base.as_os_str().to_os_string();
                name.push(format!("-{suffix:02}"));
                PathBuf::from(name)
            };
            match fs::create_dir(&candidate) {
                Ok(()) => return Ok(candidate),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed to create {}", candidate.display()))
                }
            }
        }
        anyhow::bail!(
            "no free backup directory for {} in {}",
            base.display(),
            backup_dir.display()
        )
    }

    /// Applies `staged` in order. Each file is recorded in `log` only after
    /// its backup exists and the replace has happened. Cancellation is
    /// observed between files.
    pub fn apply(
        &self,
        install_dir: &Path,
        backup_root: &Path,
        staged: &[StagedFile],
        log: &TransactionLog,
        progress: &StageProgress<'_>,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, UpdateError> {
        let total = staged.len().max(1) as f64;
        let mut applied = Vec::with_capacity(staged.len());
        progress.start(format!("Applying {} files", staged.len()));

        for (index, file) in staged.iter().enumerate() {
            ensure_active(cancel)?;
            let relative = &file.manifest_file.path;
            let target = install_dir.join(file.manifest_file.relative_path());

            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }

            let backup = if target.exists() {
                let backup_path = backup_path_for(backup_root, file);
                if let Some(parent) = backup_path.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("failed to create {}", parent.display()))?;
                }
                fs::copy(&target, &backup_path)
                    .map_err(|err| io_failure(err, relative, "back up", &target))?;
                Some(backup_path)
            } else {
                None
            };

            replace(&file.staging_path, &target)
                .map_err(|err| io_failure(err, relative, "replace", &target))?;
            log.mark_applied(relative, backup.as_deref())?;

            debug!(
                path = %relative,
                backup = %backup.as_deref().map(|path| path.display().to_string()).unwrap_or_default(),
                "file applied"
            );
            applied.push(relative.clone());
            progress.report_fraction((index + 1) as f64 / total, relative.clone());
        }

        info!(applied = applied.len(), backup_root = %backup_root.display(), "apply finished");
        Ok(applied)
    }
}

fn backup_path_for(backup_root: &Path, file: &StagedFile) -> PathBuf {
    let mut path = backup_root.join(file.manifest_file.relative_path());
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".bak");
    path.set_file_name(name);
    path
}

/// Same-volume rename, or copy into place and drop the staged file when the
/// staging area lives on another device.
fn replace(staged: &Path, target: &Path) -> io::Result<()> {
    match fs::rename(staged, target) {
        Ok(()) => Ok(()),
        Err(err) if is_cross_device_error(&err) => {
            fs::copy(staged, target)?;
            remove_file_if_exists(staged)
        }
        Err(err) => Err(err),
    }
}

fn io_failure(err: io::Error, relative: &str, action: &str, target: &Path) -> UpdateError {
    if is_locked_error(&err) {
        return UpdateError::FileLocked {
            path: relative.to_string(),
        };
    }
    anyhow::Error::new(err)
        .context(format!("failed to {action} {}", target.display()))
        .into()
}
