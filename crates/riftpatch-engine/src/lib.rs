//! Update engine: brings an installation directory into conformity with a
//! signed manifest, crash-safely.
//!
//! Pipeline order is recover → fetch manifest → verify → (repair: orphan
//! cleanup) → download → apply under a write-ahead transaction → final check.

mod apply;
mod cancel;
mod config;
mod download;
mod fs_utils;
mod install_state;
mod layout;
pub mod logging;
mod manifest_store;
mod orchestrator;
mod progress;
mod session;
mod transactions;
mod verifier;

pub use apply::PatchApplier;
pub use cancel::{ensure_active, sleep_or_cancel, CancellationToken};
pub use config::{
    EngineConfig, ManifestSource, OrphanWhitelist, RetryPolicy, Settings, TrustedKeys,
    DEFAULT_MANIFEST_URL, EMBEDDED_RSA_PUBLIC_KEY_PEM, MANIFEST_URL_ENV,
};
pub use download::{part_path_for, resolve_source_url, staging_path_for, DownloadReport, Downloader};
pub use fs_utils::format_bytes;
pub use install_state::InstallStateStore;
pub use layout::{default_data_dir, AppLayout};
pub use manifest_store::{
    verify_manifest_signature, FetchedManifest, ManifestOrigin, ManifestStore,
};
pub use orchestrator::{Orchestrator, RunMode, RunSummary};
pub use progress::{ProgressReporter, ProgressSink, StageProgress};
pub use riftpatch_core::{
    InstallFingerprint, InstallState, Manifest, ManifestFile, StagedFile, UpdateError,
    UpdateProgress, UpdateStage, UpdateTransaction,
};
pub use session::{RunHandle, UpdateController};
pub use transactions::TransactionLog;
pub use verifier::{FileHasher, FileVerifier, Sha256FileHasher, VerifyOutcome};
