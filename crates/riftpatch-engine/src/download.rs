use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::{Client, Response};
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::{StatusCode, Url};
use riftpatch_core::{ManifestFile, StagedFile, UpdateError};
use riftpatch_security::{sha256_file, sha256_matches};
use tracing::{debug, info, warn};

use crate::cancel::{ensure_active, sleep_or_cancel, CancellationToken};
use crate::config::{EngineConfig, RetryPolicy};
use crate::fs_utils::{format_bytes, remove_file_if_exists};
use crate::progress::StageProgress;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const CHUNK_SIZE: usize = 64 * 1024;
const PROGRESS_STEP: f64 = 0.002;
const BODY_QUEUE_DEPTH: usize = 4;
const CANCEL_POLL: Duration = Duration::from_millis(50);
const STAGED_DIR: &str = "ready";
const PARTIAL_DIR: &str = "partial";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadReport {
    pub staged: Vec<StagedFile>,
    /// Body bytes received over the network during this batch.
    pub wire_bytes: u64,
}

/// Sequential, resumable, retrying transfer of manifest files into staging.
pub struct Downloader {
    client: Client,
    retry_policy: RetryPolicy,
}

enum TransferError {
    Cancelled,
    Transport(String),
}

impl From<io::Error> for TransferError {
    fn from(err: io::Error) -> Self {
        Self::Transport(format!("local write failed: {err}"))
    }
}

enum BodyChunk {
    Data(Vec<u8>),
    Done,
    Failed(String),
}

struct BatchProgress<'a> {
    progress: &'a StageProgress<'a>,
    total_bytes: u64,
    total_files: usize,
    finished_files: usize,
    finished_bytes: u64,
    current_bytes: u64,
    wire_bytes: u64,
    last_fraction: f64,
}

impl<'a> BatchProgress<'a> {
    fn new(progress: &'a StageProgress<'a>, files: &[ManifestFile]) -> Self {
        Self {
            progress,
            total_bytes: files.iter().map(|file| file.size).sum(),
            total_files: files.len(),
            finished_files: 0,
            finished_bytes: 0,
            current_bytes: 0,
            wire_bytes: 0,
            last_fraction: 0.0,
        }
    }

    fn fraction(&self) -> f64 {
        if self.total_bytes > 0 {
            (self.finished_bytes + self.current_bytes) as f64 / self.total_bytes as f64
        } else if self.total_files > 0 {
            self.finished_files as f64 / self.total_files as f64
        } else {
            1.0
        }
    }

    fn set_current(&mut self, bytes: u64, label: &str) {
        self.current_bytes = bytes;
        self.emit(label, false);
    }

    fn received(&mut self, bytes: u64, label: &str) {
        self.current_bytes += bytes;
        self.wire_bytes += bytes;
        self.emit(label, false);
    }

    fn file_finished(&mut self, declared_size: u64, label: &str) {
        self.finished_files += 1;
        self.finished_bytes += declared_size;
        self.current_bytes = 0;
        self.emit(label, true);
    }

    fn emit(&mut self, label: &str, force: bool) {
        let fraction = self.fraction();
        if !force && fraction - self.last_fraction < PROGRESS_STEP {
            return;
        }
        self.last_fraction = self.last_fraction.max(fraction);
        let detail = if self.total_bytes > 0 {
            format!(
                "{label} ({} / {})",
                format_bytes(self.finished_bytes + self.current_bytes),
                format_bytes(self.total_bytes)
            )
        } else {
            format!(
                "{label} ({} of {} files)",
                self.finished_files, self.total_files
            )
        };
        self.progress.report_fraction(fraction, detail);
    }
}

impl Downloader {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("riftpatch/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(config.request_timeout)
            .build()
            .context("failed to build download http client")?;
        Ok(Self {
            client,
            retry_policy: config.retry_policy.clone(),
        })
    }

    /// Downloads `files` one after another into `staging_root`. Progress is
    /// byte based across the whole batch.
    pub fn download(
        &self,
        base_url: &str,
        files: &[ManifestFile],
        staging_root: &Path,
        progress: &StageProgress<'_>,
        cancel: &CancellationToken,
    ) -> Result<DownloadReport, UpdateError> {
        let mut batch = BatchProgress::new(progress, files);
        let mut staged = Vec::with_capacity(files.len());
        progress.start(format!(
            "Downloading {} files ({})",
            files.len(),
            format_bytes(batch.total_bytes)
        ));

        for file in files {
            ensure_active(cancel)?;
            let staged_file = self.download_file(base_url, file, staging_root, &mut batch, cancel)?;
            batch.file_finished(file.size, &file.path);
            staged.push(staged_file);
        }

        info!(
            files = staged.len(),
            wire_bytes = batch.wire_bytes,
            "downloads finished"
        );
        Ok(DownloadReport {
            staged,
            wire_bytes: batch.wire_bytes,
        })
    }

    fn download_file(
        &self,
        base_url: &str,
        file: &ManifestFile,
        staging_root: &Path,
        batch: &mut BatchProgress<'_>,
        cancel: &CancellationToken,
    ) -> Result<StagedFile, UpdateError> {
        let source = resolve_source_url(base_url, file)?;
        let staging_path = staging_path_for(staging_root, file);
        let part_path = part_path_for(staging_root, file);

        for dir in [staging_path.parent(), part_path.parent()].into_iter().flatten() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create staging dir: {}", dir.display()))?;
        }
        remove_file_if_exists(&staging_path).with_context(|| {
            format!("failed to clear stale staged file: {}", staging_path.display())
        })?;

        let max_attempts = self.retry_policy.max_attempts();
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            ensure_active(cancel)?;
            debug!(path = %file.path, url = %source, attempt, "downloading");

            match self.transfer(&source, file, &part_path, batch, cancel) {
                Ok(()) => match validate_part(file, &part_path) {
                    Ok(()) => {
                        fs::rename(&part_path, &staging_path).with_context(|| {
                            format!(
                                "failed to move {} into staging at {}",
                                part_path.display(),
                                staging_path.display()
                            )
                        })?;
                        debug!(path = %file.path, attempt, "file staged");
                        return Ok(StagedFile {
                            manifest_file: file.clone(),
                            staging_path,
                        });
                    }
                    Err(err) => {
                        remove_file_if_exists(&part_path).with_context(|| {
                            format!("failed to discard {}", part_path.display())
                        })?;
                        last_error = err.to_string();
                    }
                },
                Err(TransferError::Cancelled) => return Err(UpdateError::Cancelled),
                Err(TransferError::Transport(reason)) => last_error = reason,
            }

            warn!(
                path = %file.path,
                attempt,
                max_attempts,
                error = %last_error,
                "download attempt failed"
            );
            batch.set_current(0, &file.path);
            if attempt < max_attempts {
                sleep_or_cancel(cancel, self.retry_policy.delay_after(attempt))?;
            }
        }

        remove_file_if_exists(&part_path)
            .with_context(|| format!("failed to discard {}", part_path.display()))?;
        Err(UpdateError::DownloadFailed {
            path: file.path.clone(),
            attempts: max_attempts,
            last_error,
        })
    }

    /// One attempt: resumes `part_path` when it holds bytes, restarts when the
    /// server ignores the range.
    fn transfer(
        &self,
        source: &str,
        file: &ManifestFile,
        part_path: &Path,
        batch: &mut BatchProgress<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        let mut existing = fs::metadata(part_path).map(|meta| meta.len()).unwrap_or(0);
        if file.size > 0 && existing > file.size {
            debug!(path = %file.path, existing, "partial larger than declared size, discarding");
            remove_file_if_exists(part_path)?;
            existing = 0;
        }
        if file.size > 0 && existing == file.size {
            debug!(path = %file.path, "partial already complete");
            batch.set_current(existing, &file.path);
            return Ok(());
        }

        let mut request = self.client.get(source);
        if existing > 0 {
            request = request.header(RANGE, format!("bytes={existing}-"));
        }
        let response = run_cancellable(cancel, move || request.send())?
            .map_err(|err| TransferError::Transport(format!("request to {source} failed: {err}")))?;

        let status = response.status();
        let mut output = if status == StatusCode::PARTIAL_CONTENT && existing > 0 {
            let start = response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|value| value.to_str().ok())
                .and_then(content_range_start);
            if start != Some(existing) {
                remove_file_if_exists(part_path)?;
                return Err(TransferError::Transport(format!(
                    "server resumed at an unexpected offset for {source}"
                )));
            }
            debug!(path = %file.path, offset = existing, "resuming download");
            batch.set_current(existing, &file.path);
            OpenOptions::new().append(true).open(part_path)?
        } else if status.is_success() {
            if existing > 0 {
                debug!(path = %file.path, "server ignored range request, restarting");
            }
            batch.set_current(0, &file.path);
            File::create(part_path)?
        } else if status == StatusCode::RANGE_NOT_SATISFIABLE {
            remove_file_if_exists(part_path)?;
            return Err(TransferError::Transport(format!(
                "{source} rejected resume at byte {existing}"
            )));
        } else {
            return Err(TransferError::Transport(format!("{source} answered HTTP {status}")));
        };

        let body = spawn_body_reader(response, source)?;
        loop {
            if cancel.is_cancelled() {
                output.flush()?;
                return Err(TransferError::Cancelled);
            }
            match body.recv_timeout(CANCEL_POLL) {
                Ok(BodyChunk::Data(chunk)) => {
                    output.write_all(&chunk)?;
                    batch.received(chunk.len() as u64, &file.path);
                }
                Ok(BodyChunk::Done) => break,
                Ok(BodyChunk::Failed(reason)) => {
                    output.flush()?;
                    return Err(TransferError::Transport(reason));
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    output.flush()?;
                    return Err(TransferError::Transport(format!(
                        "body reader for {source} stopped unexpectedly"
                    )));
                }
            }
        }
        output.flush()?;
        output.sync_all()?;
        Ok(())
    }
}

/// Runs a blocking network call on a helper thread and waits for it while
/// polling `cancel`. A cancelled call is abandoned; its thread finishes on
/// its own once the socket gives up.
fn run_cancellable<T, F>(cancel: &CancellationToken, job: F) -> Result<T, TransferError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (sender, receiver) = mpsc::sync_channel(1);
    thread::Builder::new()
        .name("riftpatch-request".to_string())
        .spawn(move || {
            let _ = sender.send(job());
        })
        .map_err(|err| TransferError::Transport(format!("failed to spawn request worker: {err}")))?;
    loop {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        match receiver.recv_timeout(CANCEL_POLL) {
            Ok(value) => return Ok(value),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                return Err(TransferError::Transport(
                    "request worker stopped unexpectedly".to_string(),
                ))
            }
        }
    }
}

/// Reads the response body on its own thread so a stalled peer never keeps
/// the caller from observing cancellation. The reader exits once the
/// receiver is dropped.
fn spawn_body_reader(
    mut response: Response,
    source: &str,
) -> Result<Receiver<BodyChunk>, TransferError> {
    let (sender, receiver) = mpsc::sync_channel(BODY_QUEUE_DEPTH);
    let source = source.to_string();
    thread::Builder::new()
        .name("riftpatch-body".to_string())
        .spawn(move || {
            let mut buffer = vec![0_u8; CHUNK_SIZE];
            loop {
                let chunk = match response.read(&mut buffer) {
                    Ok(0) => BodyChunk::Done,
                    Ok(read) => BodyChunk::Data(buffer[..read].to_vec()),
                    Err(err) => {
                        BodyChunk::Failed(format!("transfer from {source} interrupted: {err}"))
                    }
                };
                let last = !matches!(chunk, BodyChunk::Data(_));
                if sender.send(chunk).is_err() || last {
                    break;
                }
            }
        })
        .map_err(|err| TransferError::Transport(format!("failed to spawn body reader: {err}")))?;
    Ok(receiver)
}

fn validate_part(file: &ManifestFile, part_path: &Path) -> Result<(), UpdateError> {
    let actual_size = fs::metadata(part_path)
        .with_context(|| format!("failed to stat {}", part_path.display()))?
        .len();
    if file.size > 0 && actual_size != file.size {
        return Err(UpdateError::SizeMismatch {
            path: file.path.clone(),
            expected: file.size,
            actual: actual_size,
        });
    }
    if let Some(expected) = file.expected_sha256() {
        let actual = sha256_file(part_path)?;
        if !sha256_matches(expected, &actual) {
            return Err(UpdateError::HashMismatch {
                path: file.path.clone(),
                expected: expected.to_string(),
                actual,
            });
        }
    }
    Ok(())
}

fn content_range_start(value: &str) -> Option<u64> {
    let range = value.trim().strip_prefix("bytes")?.trim_start();
    let (start, _) = range.split_once('-')?;
    start.trim().parse().ok()
}

/// Absolute `url` as-is, a relative `url` against `base_url`, else `path`
/// against `base_url`.
pub fn resolve_source_url(base_url: &str, file: &ManifestFile) -> Result<String, UpdateError> {
    let relative = match file.url_override() {
        Some(url) => {
            let url = url.replace('\\', "/");
            if let Ok(absolute) = Url::parse(&url) {
                return Ok(absolute.to_string());
            }
            url
        }
        None => file.path.clone(),
    };

    let mut base = base_url.trim().replace('\\', "/");
    if !base.ends_with('/') {
        base.push('/');
    }
    let base = Url::parse(&base).map_err(|err| UpdateError::ManifestInvalid {
        detail: format!("baseUrl '{base_url}' is not a valid url: {err}"),
    })?;
    base.join(relative.trim_start_matches('/'))
        .map(|url| url.to_string())
        .map_err(|err| UpdateError::ManifestInvalid {
            detail: format!("cannot resolve download url for {}: {err}", file.path),
        })
}

/// Validated files live under `ready/` and partials under `partial/`, so no
/// manifest path can name another entry's partial.
pub fn staging_path_for(staging_root: &Path, file: &ManifestFile) -> PathBuf {
    staging_root.join(STAGED_DIR).join(file.relative_path())
}

pub fn part_path_for(staging_root: &Path, file: &ManifestFile) -> PathBuf {
    let mut path = staging_root.join(PARTIAL_DIR).join(file.relative_path());
    let mut name = path.file_name().map(|name| name.to_os_string()).unwrap_or_default();
    name.push(".part");
    path.set_file_name(name);
    path
}
