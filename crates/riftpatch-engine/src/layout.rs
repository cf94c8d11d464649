use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Per-user persisted state of the launcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppLayout {
    root: PathBuf,
}

impl AppLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn settings_path(&self) -> PathBuf {
        self.root.join("settings.json")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    pub fn manifest_cache_path(&self) -> PathBuf {
        self.cache_dir().join("manifest.json")
    }

    pub fn install_state_path(&self) -> PathBuf {
        self.root.join("installstate.json")
    }

    pub fn update_state_path(&self) -> PathBuf {
        self.root.join("updatestate.json")
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.root.join("temp")
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.root.join("backup")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn log_file_path(&self) -> PathBuf {
        self.logs_dir().join("launcher.log")
    }

    pub fn default_install_dir(&self) -> PathBuf {
        self.root.join("game")
    }

    pub fn ensure_base_dirs(&self) -> Result<()> {
        for dir in [
            self.root.clone(),
            self.cache_dir(),
            self.temp_dir(),
            self.backup_dir(),
            self.logs_dir(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

pub fn default_data_dir() -> Result<PathBuf> {
    if cfg!(windows) {
        let app_data = std::env::var("LOCALAPPDATA")
            .context("LOCALAPPDATA is not set; cannot resolve Windows data directory")?;
        return Ok(PathBuf::from(app_data).join("Riftpatch"));
    }

    if let Some(data_home) = std::env::var_os("XDG_DATA_HOME").filter(|value| !value.is_empty()) {
        return Ok(PathBuf::from(data_home).join("riftpatch"));
    }

    let home = std::env::var("HOME").context("HOME is not set; cannot resolve data directory")?;
    Ok(PathBuf::from(home)
        .join(".local")
        .join("share")
        .join("riftpatch"))
}
