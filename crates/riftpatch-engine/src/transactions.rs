use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use riftpatch_core::{AppliedFile, TransactionStatus, UpdateError, UpdateTransaction};
use tracing::{info, warn};

use crate::fs_utils::{remove_file_if_exists, write_atomic};
use crate::layout::AppLayout;

/// Durable write-ahead log for one apply operation (`updatestate.json`).
///
/// The file exists only while an apply is running or after one was
/// interrupted; its absence is the clean state. Every mutation re-reads the
/// file and rewrites it atomically.
#[derive(Debug, Clone)]
pub struct TransactionLog {
    path: PathBuf,
}

impl TransactionLog {
    pub fn new(layout: &AppLayout) -> Self {
        Self {
            path: layout.update_state_path(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_pending(&self) -> bool {
        self.path.exists()
    }

    pub fn pending(&self) -> Result<Option<UpdateTransaction>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to read transaction log: {}", self.path.display())
                })
            }
        };
        let transaction = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse transaction log: {}", self.path.display()))?;
        Ok(Some(transaction))
    }

    pub fn begin(&self, version: &str) -> Result<UpdateTransaction, UpdateError> {
        if let Some(existing) = self.pending()? {
            if existing.status == TransactionStatus::Applying && existing.version != version {
                return Err(UpdateError::TransactionConflict {
                    pending_version: existing.version,
                    requested_version: version.to_string(),
                });
            }
        }

        let transaction = UpdateTransaction::begin(version);
        self.persist(&transaction)?;
        info!(version, "update transaction started");
        Ok(transaction)
    }

    /// Appends one entry. Callers invoke this only after the physical
    /// replace succeeded, so the log never claims more than was applied.
    pub fn mark_applied(&self, relative_path: &str, backup_path: Option<&Path>) -> Result<()> {
        let mut transaction = self
            .pending()?
            .ok_or_else(|| anyhow!("no update transaction in progress"))?;
        transaction.applied_files.push(AppliedFile {
            relative_path: relative_path.to_string(),
            backup_path: backup_path
                .map(|path| path.display().to_string())
                .unwrap_or_default(),
        });
        self.persist(&transaction)
    }

    pub fn complete(&self) -> Result<()> {
        let Some(mut transaction) = self.pending()? else {
            return Ok(());
        };
        transaction.status = TransactionStatus::Completed;
        self.persist(&transaction)?;
        remove_file_if_exists(&self.path).with_context(|| {
            format!("failed to clear transaction log: {}", self.path.display())
        })?;
        info!(
            version = %transaction.version,
            applied = transaction.applied_files.len(),
            "update transaction completed"
        );
        Ok(())
    }

    /// Undoes recorded entries newest first. Entries that fail are logged and
    /// skipped; the log is kept in that case so the next launch retries.
    pub fn rollback(&self, install_dir: &Path) -> Result<()> {
        let Some(transaction) = self.pending()? else {
            return Ok(());
        };

        let mut failures = Vec::new();
        for applied in transaction.applied_files.iter().rev() {
            if let Err(err) = restore_entry(install_dir, applied) {
                warn!(
                    path = %applied.relative_path,
                    error = %format!("{err:#}"),
                    "rollback step failed"
                );
                failures.push(applied.relative_path.clone());
            }
        }

        if !failures.is_empty() {
            return Err(anyhow!(
                "rollback of version {} left {} file(s) unrestored: {}",
                transaction.version,
                failures.len(),
                failures.join(", ")
            ));
        }

        remove_file_if_exists(&self.path).with_context(|| {
            format!("failed to clear transaction log: {}", self.path.display())
        })?;
        info!(
            version = %transaction.version,
            restored = transaction.applied_files.len(),
            "update transaction rolled back"
        );
        Ok(())
    }

    /// Rolls back an interrupted apply. Runs before any other engine work.
    pub fn recover_if_pending(&self, install_dir: &Path) -> Result<bool> {
        let Some(transaction) = self.pending()? else {
            return Ok(false);
        };
        if transaction.status == TransactionStatus::Completed {
            remove_file_if_exists(&self.path).with_context(|| {
                format!("failed to clear transaction log: {}", self.path.display())
            })?;
            return Ok(false);
        }

        warn!(
            version = %transaction.version,
            applied = transaction.applied_files.len(),
            "recovering interrupted update"
        );
        self.rollback(install_dir)?;
        Ok(true)
    }

    fn persist(&self, transaction: &UpdateTransaction) -> Result<()> {
        let raw = serde_json::to_string_pretty(transaction)
            .context("failed to serialize transaction log")?;
        write_atomic(&self.path, raw.as_bytes())
            .with_context(|| format!("failed to write transaction log: {}", self.path.display()))
    }
}

fn restore_entry(install_dir: &Path, applied: &AppliedFile) -> Result<()> {
    let target = install_dir.join(
        applied
            .relative_path
            .split('/')
            .collect::<PathBuf>(),
    );

    match applied.backup() {
        Some(backup) => {
            if !backup.is_file() {
                return Err(anyhow!("backup copy is missing: {}", backup.display()));
            }
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            fs::copy(backup, &target).with_context(|| {
                format!(
                    "failed to restore {} from {}",
                    target.display(),
                    backup.display()
                )
            })?;
        }
        None => {
            remove_file_if_exists(&target)
                .with_context(|| format!("failed to remove {}", target.display()))?;
        }
    }
    Ok(())
}
