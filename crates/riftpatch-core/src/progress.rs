use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateStage {
    FetchManifest,
    VerifyFiles,
    CleanupOrphans,
    Downloading,
    Applying,
    FinalCheck,
    Ready,
}

impl UpdateStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FetchManifest => "fetch-manifest",
            Self::VerifyFiles => "verify",
            Self::CleanupOrphans => "cleanup",
            Self::Downloading => "download",
            Self::Applying => "apply",
            Self::FinalCheck => "final-check",
            Self::Ready => "ready",
        }
    }
}

impl fmt::Display for UpdateStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot handed to progress observers. `percent` is in `0.0..=100.0`.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateProgress {
    pub stage: UpdateStage,
    pub percent: f64,
    pub headline: String,
    pub detail: String,
}

impl UpdateProgress {
    pub fn new(
        stage: UpdateStage,
        percent: f64,
        headline: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            stage,
            percent,
            headline: headline.into(),
            detail: detail.into(),
        }
    }
}
