use std::path::PathBuf;
use std::process::Command;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use anyhow::Context;
use riftpatch_core::UpdateError;
use tracing::{info, warn};

use crate::cancel::{ensure_active, CancellationToken};
use crate::config::EngineConfig;
use crate::layout::AppLayout;
use crate::orchestrator::{Orchestrator, RunMode, RunSummary};
use crate::progress::ProgressSink;
use crate::transactions::TransactionLog;

/// A run started by [`UpdateController::start_update`].
pub struct RunHandle {
    join: JoinHandle<Result<RunSummary, UpdateError>>,
    cancel: CancellationToken,
}

impl RunHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub fn join(self) -> Result<RunSummary, UpdateError> {
        self.join.join().unwrap_or_else(|_| {
            Err(UpdateError::Unexpected {
                headline: "The update failed unexpectedly.".to_string(),
                detail: "update worker panicked".to_string(),
            })
        })
    }
}

/// Command surface for a shell: start, cancel, launch, open folder.
///
/// At most one run executes at a time. Starting a run cancels the previous
/// one, and the new worker waits for it to release the run gate.
pub struct UpdateController {
    layout: AppLayout,
    fixed_config: Option<EngineConfig>,
    current: Mutex<Option<CancellationToken>>,
    run_gate: Arc<Mutex<()>>,
}

impl UpdateController {
    /// Configuration is resolved from settings and environment for each run.
    pub fn new(layout: AppLayout) -> Self {
        Self {
            layout,
            fixed_config: None,
            current: Mutex::new(None),
            run_gate: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_config(layout: AppLayout, config: EngineConfig) -> Self {
        Self {
            fixed_config: Some(config),
            ..Self::new(layout)
        }
    }

    pub fn layout(&self) -> &AppLayout {
        &self.layout
    }

    fn resolve_config(&self) -> EngineConfig {
        match &self.fixed_config {
            Some(config) => config.clone(),
            None => EngineConfig::resolve(&self.layout),
        }
    }

    pub fn start_update(
        &self,
        mode: RunMode,
        sink: Arc<ProgressSink>,
    ) -> Result<RunHandle, UpdateError> {
        let token = CancellationToken::new();
        {
            let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(previous) = current.replace(token.clone()) {
                if !previous.is_cancelled() {
                    info!("superseding update run in progress");
                }
                previous.cancel();
            }
        }

        let orchestrator = Orchestrator::new(self.layout.clone(), self.resolve_config());
        let gate = Arc::clone(&self.run_gate);
        let run_token = token.clone();
        let join = thread::Builder::new()
            .name("riftpatch-update".to_string())
            .spawn(move || {
                let _guard = gate.lock().unwrap_or_else(PoisonError::into_inner);
                ensure_active(&run_token)?;
                orchestrator.run(mode, sink, &run_token)
            })
            .context("failed to spawn update worker")?;

        Ok(RunHandle {
            join,
            cancel: token,
        })
    }

    pub fn cancel(&self) {
        let current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(token) = current.as_ref() {
            info!("cancelling update run");
            token.cancel();
        }
    }

    /// Starts the game. Refused while an interrupted update awaits recovery.
    pub fn launch(&self) -> Result<u32, UpdateError> {
        if TransactionLog::new(&self.layout).is_pending() {
            warn!("launch refused: update transaction pending");
            return Err(UpdateError::TransactionPending);
        }

        let config = self.resolve_config();
        let executable = config.install_dir.join(&config.game_executable);
        if !executable.is_file() {
            return Err(UpdateError::FinalCheckFailed {
                path: config.game_executable.clone(),
                reason: "game executable is missing; run a repair".to_string(),
            });
        }

        let child = Command::new(&executable)
            .current_dir(&config.install_dir)
            .spawn()
            .with_context(|| format!("failed to start {}", executable.display()))?;
        info!(pid = child.id(), executable = %executable.display(), "game launched");
        Ok(child.id())
    }

    pub fn open_install_folder(&self) -> Result<PathBuf, UpdateError> {
        let install_dir = self.resolve_config().install_dir;
        std::fs::create_dir_all(&install_dir)
            .with_context(|| format!("failed to create {}", install_dir.display()))?;

        let opener = if cfg!(windows) {
            "explorer"
        } else if cfg!(target_os = "macos") {
            "open"
        } else {
            "xdg-open"
        };
        Command::new(opener)
            .arg(&install_dir)
            .spawn()
            .with_context(|| format!("failed to run {opener} for {}", install_dir.display()))?;
        Ok(install_dir)
    }
}
