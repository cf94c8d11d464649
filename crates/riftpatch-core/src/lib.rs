mod error;
mod manifest;
mod progress;
mod state;

pub use error::UpdateError;
pub use manifest::{Manifest, ManifestFile};
pub use progress::{UpdateProgress, UpdateStage};
pub use state::{
    AppliedFile, InstallFingerprint, InstallState, StagedFile, TransactionStatus,
    UpdateTransaction,
};

#[cfg(test)]
mod tests;
