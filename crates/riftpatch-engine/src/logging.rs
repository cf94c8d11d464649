//! Diagnostic logging: stderr plus an append-only log file.

use std::fs::{self, File, OpenOptions};
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::Context;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::layout::AppLayout;

pub const LOG_ENV: &str = "RIFTPATCH_LOG";

/// Installs the global subscriber. `console_level` filters stderr and the
/// log file records `info` and above. A valid `RIFTPATCH_LOG` overrides both.
pub fn init(layout: &AppLayout, console_level: &str) -> anyhow::Result<()> {
    let env_directives = std::env::var(LOG_ENV).ok();
    let (console_filter, file_filter) = resolve_filters(console_level, env_directives.as_deref());

    // Writes from every subsystem funnel through this one mutex.
    let file_layer = open_log_file(layout).map(|file| {
        fmt::layer()
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .with_filter(file_filter)
    });

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_filter(console_filter),
        )
        .with(file_layer)
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(())
}

/// Console and file filters. Unparseable directives fall back to the defaults.
fn resolve_filters(console_level: &str, env_directives: Option<&str>) -> (EnvFilter, EnvFilter) {
    let from_env = || {
        env_directives
            .filter(|directives| !directives.trim().is_empty())
            .and_then(|directives| EnvFilter::try_new(directives).ok())
    };
    let console = from_env()
        .or_else(|| EnvFilter::try_new(console_level).ok())
        .unwrap_or_else(|| EnvFilter::new("warn"));
    let file = from_env().unwrap_or_else(|| EnvFilter::new("info"));
    (console, file)
}

fn open_log_file(layout: &AppLayout) -> Option<File> {
    let candidates: [PathBuf; 2] = [
        layout.log_file_path(),
        std::env::temp_dir().join("riftpatch-launcher.log"),
    ];
    candidates.into_iter().find_map(|path| {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).ok()?;
        }
        OpenOptions::new().create(true).append(true).open(&path).ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_directives_override_console_and_file() {
        let (console, file) = resolve_filters("warn", Some("debug"));
        assert_eq!(console.to_string(), "debug");
        assert_eq!(file.to_string(), "debug");
    }

    #[test]
    fn defaults_apply_without_env_directives() {
        let (console, file) = resolve_filters("error", None);
        assert_eq!(console.to_string(), "error");
        assert_eq!(file.to_string(), "info");

        let (console, _) = resolve_filters("error", Some("   "));
        assert_eq!(console.to_string(), "error");
    }
}
