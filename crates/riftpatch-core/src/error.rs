use thiserror::Error;

/// Every failure the update engine reports to its caller.
///
/// `Cancelled` is an expected outcome of a user action rather than a failure
/// and must be rendered differently from the other kinds.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpdateError {
    #[error("manifest unavailable: {detail}")]
    ManifestUnavailable { detail: String },
    #[error("manifest invalid: {detail}")]
    ManifestInvalid { detail: String },
    #[error("manifest is not signed and unsigned manifests are not allowed for this source")]
    ManifestUnsigned,
    #[error("manifest signature invalid: {detail}")]
    SignatureInvalid { detail: String },
    #[error("download of {path} failed after {attempts} attempt(s): {last_error}")]
    DownloadFailed {
        path: String,
        attempts: u32,
        last_error: String,
    },
    #[error("sha256 mismatch for {path}: expected {expected}, got {actual}")]
    HashMismatch {
        path: String,
        expected: String,
        actual: String,
    },
    #[error("size mismatch for {path}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        path: String,
        expected: u64,
        actual: u64,
    },
    #[error("file is in use: {path}")]
    FileLocked { path: String },
    #[error("final check failed for {path}: {reason}")]
    FinalCheckFailed { path: String, reason: String },
    #[error(
        "an update to version {pending_version} is still pending; cannot begin {requested_version}"
    )]
    TransactionConflict {
        pending_version: String,
        requested_version: String,
    },
    #[error("an interrupted update must be recovered before launching")]
    TransactionPending,
    #[error("update cancelled")]
    Cancelled,
    #[error("{headline}: {detail}")]
    Unexpected { headline: String, detail: String },
}

impl UpdateError {
    pub fn unexpected(headline: impl Into<String>, err: &anyhow::Error) -> Self {
        Self::Unexpected {
            headline: headline.into(),
            detail: format!("{err:#}"),
        }
    }

    /// Short, user-facing summary.
    pub fn headline(&self) -> &str {
        match self {
            Self::ManifestUnavailable { .. } => "Could not retrieve the update manifest.",
            Self::ManifestInvalid { .. } => "The update manifest is invalid.",
            Self::ManifestUnsigned => "The update manifest is not signed.",
            Self::SignatureInvalid { .. } => "The update manifest signature is invalid.",
            Self::DownloadFailed { .. } => "A download could not be completed.",
            Self::HashMismatch { .. } | Self::SizeMismatch { .. } => {
                "A downloaded file failed validation."
            }
            Self::FileLocked { .. } => "A game file is in use. Close the game and try again.",
            Self::FinalCheckFailed { .. } => "The installation failed its final check.",
            Self::TransactionConflict { .. } => "Another update is still pending.",
            Self::TransactionPending => "An interrupted update has to be recovered first.",
            Self::Cancelled => "Update cancelled.",
            Self::Unexpected { headline, .. } => headline,
        }
    }

    /// Diagnostic text; may include the underlying cause chain.
    pub fn detail(&self) -> String {
        match self {
            Self::Unexpected { detail, .. } => detail.clone(),
            other => other.to_string(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Failures that download retry loops may absorb locally.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::DownloadFailed { .. }
                | Self::HashMismatch { .. }
                | Self::SizeMismatch { .. }
                | Self::FileLocked { .. }
        )
    }
}

impl From<anyhow::Error> for UpdateError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(typed) = err
            .chain()
            .find_map(|cause| cause.downcast_ref::<UpdateError>())
        {
            return typed.clone();
        }
        Self::unexpected("The update failed unexpectedly.", &err)
    }
}
