use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use anyhow::{Context, Result};
use riftpatch_core::{InstallFingerprint, InstallState, Manifest, ManifestFile, UpdateError};
use riftpatch_security::{sha256_file, sha256_matches};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::cancel::{ensure_active, CancellationToken};
use crate::config::OrphanWhitelist;
use crate::fs_utils::{is_locked_error, modified_ticks, normalize_relative};
use crate::progress::StageProgress;

const QUICK_CHECK_WORKERS: usize = 3;

pub trait FileHasher: Send + Sync {
    /// Lowercase hex SHA-256 of the file contents.
    fn sha256(&self, path: &Path) -> Result<String>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256FileHasher;

impl FileHasher for Sha256FileHasher {
    fn sha256(&self, path: &Path) -> Result<String> {
        sha256_file(path)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyOutcome {
    pub missing_or_invalid: Vec<ManifestFile>,
    pub verified_fingerprints: BTreeMap<String, InstallFingerprint>,
    /// Files whose contents were read and hashed during this pass.
    pub hashed: usize,
    /// Files accepted from a cached fingerprint without reading them.
    pub trusted: usize,
}

impl VerifyOutcome {
    pub fn is_clean(&self) -> bool {
        self.missing_or_invalid.is_empty()
    }
}

#[derive(Clone)]
pub struct FileVerifier {
    hasher: Arc<dyn FileHasher>,
}

impl Default for FileVerifier {
    fn default() -> Self {
        Self::new()
    }
}

enum FileCheck {
    Valid {
        fingerprint: InstallFingerprint,
        hashed: bool,
    },
    Invalid(String),
}

impl FileVerifier {
    pub fn new() -> Self {
        Self::with_hasher(Arc::new(Sha256FileHasher))
    }

    pub fn with_hasher(hasher: Arc<dyn FileHasher>) -> Self {
        Self { hasher }
    }

    /// Tiered check of every manifest entry: existence, size, cached
    /// fingerprint, full hash. `force_strong` disables the fingerprint tier.
    pub fn verify(
        &self,
        install_dir: &Path,
        manifest: &Manifest,
        force_strong: bool,
        previous: Option<&InstallState>,
        progress: &StageProgress<'_>,
        cancel: &CancellationToken,
    ) -> Result<VerifyOutcome, UpdateError> {
        let cache = previous.filter(|state| {
            !force_strong && state.is_trusted_for(&manifest.version) && install_dir.is_dir()
        });
        debug!(
            version = %manifest.version,
            force_strong,
            fingerprint_cache = cache.is_some(),
            "verifying installation"
        );

        let mut outcome = VerifyOutcome::default();
        let total = manifest.files.len().max(1) as f64;
        progress.start(format!("Checking {} files", manifest.files.len()));

        for (index, file) in manifest.files.iter().enumerate() {
            ensure_active(cancel)?;

            match self.check_file(install_dir, file, cache) {
                FileCheck::Valid {
                    fingerprint,
                    hashed,
                } => {
                    if hashed {
                        outcome.hashed += 1;
                    } else if file.has_hash() {
                        outcome.trusted += 1;
                    }
                    outcome
                        .verified_fingerprints
                        .insert(file.path.clone(), fingerprint);
                }
                FileCheck::Invalid(reason) => {
                    debug!(path = %file.path, reason = %reason, "file needs download");
                    outcome.missing_or_invalid.push(file.clone());
                }
            }

            progress.report_fraction((index + 1) as f64 / total, file.path.clone());
        }

        info!(
            checked = manifest.files.len(),
            invalid = outcome.missing_or_invalid.len(),
            hashed = outcome.hashed,
            trusted = outcome.trusted,
            "verification finished"
        );
        Ok(outcome)
    }

    fn check_file(
        &self,
        install_dir: &Path,
        file: &ManifestFile,
        cache: Option<&InstallState>,
    ) -> FileCheck {
        let target = install_dir.join(file.relative_path());
        let metadata = match fs::metadata(&target) {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => return FileCheck::Invalid("not a regular file".to_string()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return FileCheck::Invalid("missing".to_string())
            }
            Err(err) => return FileCheck::Invalid(format!("unreadable: {err}")),
        };

        let size = metadata.len();
        if file.size > 0 && size != file.size {
            return FileCheck::Invalid(format!("size {size}, expected {}", file.size));
        }
        let ticks = modified_ticks(&metadata);

        let Some(expected) = file.expected_sha256() else {
            return FileCheck::Valid {
                fingerprint: InstallFingerprint {
                    size,
                    last_write_time_ticks: ticks,
                    sha256: String::new(),
                },
                hashed: false,
            };
        };

        if let Some(cached) = cache.and_then(|state| state.fingerprint(&file.path)) {
            if cached.matches(size, ticks, expected) {
                return FileCheck::Valid {
                    fingerprint: cached.clone(),
                    hashed: false,
                };
            }
        }

        match self.hasher.sha256(&target) {
            Ok(actual) if sha256_matches(expected, &actual) => FileCheck::Valid {
                fingerprint: InstallFingerprint {
                    size,
                    last_write_time_ticks: ticks,
                    sha256: actual.to_ascii_lowercase(),
                },
                hashed: true,
            },
            Ok(actual) => FileCheck::Invalid(format!("sha256 {actual}, expected {expected}")),
            Err(err) => {
                warn!(path = %file.path, error = %format!("{err:#}"), "failed to hash file");
                FileCheck::Invalid(format!("hash failed: {err:#}"))
            }
        }
    }

    /// Deletes files under `install_dir` that the manifest does not list and
    /// the whitelist does not cover. Returns their relative paths.
    pub fn cleanup_orphans(
        &self,
        install_dir: &Path,
        manifest: &Manifest,
        whitelist: &OrphanWhitelist,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, UpdateError> {
        if !install_dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut removed = Vec::new();
        let mut touched_dirs = BTreeSet::new();

        for entry in WalkDir::new(install_dir).min_depth(1) {
            ensure_active(cancel)?;
            let entry = entry
                .with_context(|| format!("failed to walk {}", install_dir.display()))?;
            if entry.file_type().is_dir() {
                continue;
            }

            let Ok(relative) = entry.path().strip_prefix(install_dir) else {
                continue;
            };
            let relative = normalize_relative(relative);
            if manifest.contains_path(&relative) || whitelist.covers(&relative) {
                continue;
            }

            if let Err(err) = fs::remove_file(entry.path()) {
                if is_locked_error(&err) {
                    return Err(UpdateError::FileLocked { path: relative });
                }
                return Err(anyhow::Error::new(err)
                    .context(format!("failed to remove orphan {}", entry.path().display()))
                    .into());
            }
            info!(path = %relative, "removed orphan file");
            if let Some(parent) = entry.path().parent() {
                touched_dirs.insert(parent.to_path_buf());
            }
            removed.push(relative);
        }

        remove_empty_dirs(install_dir, touched_dirs);
        Ok(removed)
    }

    /// Post-apply assertion that every manifest file is in place. Runs with
    /// bounded parallelism and stops at the first failure.
    pub fn quick_check(
        &self,
        install_dir: &Path,
        manifest: &Manifest,
        include_hash: bool,
        cancel: &CancellationToken,
    ) -> Result<(), UpdateError> {
        let files = &manifest.files;
        let next = AtomicUsize::new(0);
        let stop = AtomicBool::new(false);
        let failure: Mutex<Option<UpdateError>> = Mutex::new(None);
        let workers = QUICK_CHECK_WORKERS.min(files.len()).max(1);

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    if stop.load(Ordering::Relaxed) {
                        break;
                    }
                    let index = next.fetch_add(1, Ordering::Relaxed);
                    let Some(file) = files.get(index) else {
                        break;
                    };
                    let result = ensure_active(cancel)
                        .and_then(|()| self.quick_check_file(install_dir, file, include_hash));
                    if let Err(err) = result {
                        stop.store(true, Ordering::Relaxed);
                        let mut slot = failure.lock().unwrap_or_else(PoisonError::into_inner);
                        if slot.is_none() {
                            *slot = Some(err);
                        }
                        break;
                    }
                });
            }
        });

        match failure.into_inner().unwrap_or_else(PoisonError::into_inner) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn quick_check_file(
        &self,
        install_dir: &Path,
        file: &ManifestFile,
        include_hash: bool,
    ) -> Result<(), UpdateError> {
        let failed = |reason: String| UpdateError::FinalCheckFailed {
            path: file.path.clone(),
            reason,
        };

        let target = install_dir.join(file.relative_path());
        let metadata = match fs::metadata(&target) {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => return Err(failed("not a regular file".to_string())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(failed("file is missing".to_string()))
            }
            Err(err) => return Err(failed(format!("file is unreadable: {err}"))),
        };
        if file.size > 0 && metadata.len() != file.size {
            return Err(failed(format!(
                "size is {} bytes, expected {}",
                metadata.len(),
                file.size
            )));
        }

        if include_hash {
            if let Some(expected) = file.expected_sha256() {
                let actual = self
                    .hasher
                    .sha256(&target)
                    .map_err(|err| failed(format!("hash failed: {err:#}")))?;
                if !sha256_matches(expected, &actual) {
                    return Err(failed(format!("sha256 is {actual}, expected {expected}")));
                }
            }
        }
        Ok(())
    }

    /// Fingerprint of an installed file, recorded against the manifest hash
    /// it was validated with.
    pub fn fingerprint_file(
        &self,
        install_dir: &Path,
        file: &ManifestFile,
    ) -> Result<InstallFingerprint> {
        let target = install_dir.join(file.relative_path());
        let metadata = fs::metadata(&target)
            .with_context(|| format!("failed to stat {}", target.display()))?;
        Ok(InstallFingerprint {
            size: metadata.len(),
            last_write_time_ticks: modified_ticks(&metadata),
            sha256: file
                .expected_sha256()
                .map(str::to_ascii_lowercase)
                .unwrap_or_default(),
        })
    }
}

/// Removes directories emptied by orphan deletion, deepest first, up to but
/// never including `root`.
fn remove_empty_dirs(root: &Path, touched: BTreeSet<PathBuf>) {
    let mut candidates = BTreeSet::new();
    for dir in touched {
        let mut current = Some(dir.as_path());
        while let Some(path) = current {
            if path == root || !path.starts_with(root) {
                break;
            }
            candidates.insert(path.to_path_buf());
            current = path.parent();
        }
    }

    let mut ordered: Vec<PathBuf> = candidates.into_iter().collect();
    ordered.sort_by_key(|path| std::cmp::Reverse(path.components().count()));
    for dir in ordered {
        let is_empty = fs::read_dir(&dir)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(false);
        if is_empty {
            match fs::remove_dir(&dir) {
                Ok(()) => debug!(path = %dir.display(), "removed empty directory"),
                Err(err) => {
                    warn!(path = %dir.display(), error = %err, "failed to remove empty directory")
                }
            }
        }
    }
}
