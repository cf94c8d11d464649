use std::fs::{self, File, Metadata};
use std::io::{self, Write};
use std::path::{Component, Path};
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result};

pub(crate) fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// Writes through a sibling `*.tmp` file and renames it over `path`.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let mut tmp_name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    let mut file = File::create(&tmp_path)
        .with_context(|| format!("failed to create {}", tmp_path.display()))?;
    file.write_all(bytes)
        .with_context(|| format!("failed to write {}", tmp_path.display()))?;
    file.sync_all()
        .with_context(|| format!("failed to flush {}", tmp_path.display()))?;
    drop(file);

    fs::rename(&tmp_path, path).with_context(|| {
        format!(
            "failed to move {} into place at {}",
            tmp_path.display(),
            path.display()
        )
    })
}

/// Modification time as nanoseconds since the unix epoch, 0 if unavailable.
pub(crate) fn modified_ticks(metadata: &Metadata) -> u64 {
    metadata
        .modified()
        .ok()
        .and_then(|modified| modified.duration_since(UNIX_EPOCH).ok())
        .map(|elapsed| elapsed.as_nanos() as u64)
        .unwrap_or(0)
}

/// Forward-slash form of a relative path, the key space manifests use.
pub(crate) fn normalize_relative(path: &Path) -> String {
    path.components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

pub(crate) fn is_locked_error(err: &io::Error) -> bool {
    if cfg!(windows) {
        // ERROR_SHARING_VIOLATION, ERROR_LOCK_VIOLATION
        return matches!(err.raw_os_error(), Some(32 | 33))
            || err.kind() == io::ErrorKind::PermissionDenied;
    }
    // ETXTBSY
    err.raw_os_error() == Some(26)
}

pub(crate) fn is_cross_device_error(err: &io::Error) -> bool {
    if cfg!(windows) {
        // ERROR_NOT_SAME_DEVICE
        return err.raw_os_error() == Some(17);
    }
    // EXDEV
    err.raw_os_error() == Some(18)
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
