use std::fs;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::fs_utils::write_atomic;
use crate::layout::AppLayout;

pub const MANIFEST_URL_ENV: &str = "RIFTPATCH_MANIFEST_URL";
pub const DEFAULT_MANIFEST_URL: &str = "https://updates.riftpatch.example/live/manifest.json";
const DEFAULT_GAME_EXECUTABLE: &str = if cfg!(windows) { "game.exe" } else { "game" };
const DEFAULT_BACKUP_RETENTION: usize = 3;
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const DEFAULT_ORPHAN_WHITELIST: [&str; 5] =
    ["settings.json", "config/", "logs/", "screenshots/", "saves/"];

/// Release signing key. Rotating it requires shipping a new launcher build.
pub const EMBEDDED_RSA_PUBLIC_KEY_PEM: &str = "-----BEGIN PUBLIC KEY-----
MIIBIjANBgkqhkiG9w0BAQEFAAOCAQ8AMIIBCgKCAQEAy6n5zvYVZN5sjODcXHjn
pbBvdyMWB+zO3+FdEXdZ0lazidDRRT5A2wbOlN8K559pb3u3pfR8Iu6KmZf4F8tE
sFfA6RuC8+SHO03qsOqo9GFi70OI9CEhLYlyyMQis7q0B6r1rsc/2Ng8oYfC6Mq/
KSk0MSTjYWBWXD/VAq2RLntg1FgOsizz7rt0zZOTUPcAB4b1NwE0+SbyClRnRT0j
5mwkJML7wXPYDtP97oAzMzyVpIxVdNz+1VXOXePEf1qwZ/DKtX4ZuS1mjSm3o9MN
gcR3AStqyySRMoxPyY5U6IXNUPPNtj3MVFz4LGPnu6U6QFtmfZDZUsX36yeAlwiS
9QIDAQAB
-----END PUBLIC KEY-----";

/// Contents of `settings.json`. Every field is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_unsigned_manifest: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_executable: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orphan_whitelist: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub whitelist_case_sensitive: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_retention: Option<usize>,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read settings: {}", path.display()))
            }
        };
        let settings = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse settings: {}", path.display()))?;
        Ok(Some(settings))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let raw = serde_json::to_string_pretty(self).context("failed to serialize settings")?;
        write_atomic(path, raw.as_bytes())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestSource {
    Http(String),
    File(PathBuf),
}

impl ManifestSource {
    pub fn parse(value: &str) -> Self {
        let value = value.trim();
        let lower = value.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            return Self::Http(value.to_string());
        }
        if lower.starts_with("file://") {
            return Self::File(PathBuf::from(&value["file://".len()..]));
        }
        Self::File(PathBuf::from(value))
    }

    /// Local files and loopback hosts.
    pub fn is_local(&self) -> bool {
        match self {
            Self::File(_) => true,
            Self::Http(url) => reqwest::Url::parse(url)
                .ok()
                .and_then(|url| url.host_str().map(is_loopback_host))
                .unwrap_or(false),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Http(url) => url.clone(),
            Self::File(path) => path.display().to_string(),
        }
    }
}

fn is_loopback_host(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .map(|ip| ip.is_loopback())
        .unwrap_or(false)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustedKeys {
    pub rsa_public_key_pem: Option<String>,
    pub ed25519_public_key_hex: Option<String>,
}

impl Default for TrustedKeys {
    fn default() -> Self {
        Self {
            rsa_public_key_pem: Some(EMBEDDED_RSA_PUBLIC_KEY_PEM.to_string()),
            ed25519_public_key_hex: None,
        }
    }
}

/// Relative-path prefixes that orphan cleanup must never delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanWhitelist {
    prefixes: Vec<String>,
    case_sensitive: bool,
}

impl OrphanWhitelist {
    pub fn new<I, S>(prefixes: I, case_sensitive: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            prefixes: prefixes
                .into_iter()
                .map(Into::into)
                .map(|prefix: String| prefix.trim().replace('\\', "/"))
                .filter(|prefix| !prefix.is_empty())
                .collect(),
            case_sensitive,
        }
    }

    pub fn prefixes(&self) -> &[String] {
        &self.prefixes
    }

    pub fn covers(&self, relative_path: &str) -> bool {
        self.prefixes.iter().any(|prefix| {
            if self.case_sensitive {
                relative_path.starts_with(prefix.as_str())
            } else {
                relative_path.len() >= prefix.len()
                    && relative_path.is_char_boundary(prefix.len())
                    && relative_path[..prefix.len()].eq_ignore_ascii_case(prefix)
            }
        })
    }
}

impl Default for OrphanWhitelist {
    fn default() -> Self {
        Self::new(DEFAULT_ORPHAN_WHITELIST, false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub delays: Vec<Duration>,
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.delays.len() as u32 + 1
    }

    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.delays
            .get(attempt.saturating_sub(1) as usize)
            .copied()
            .unwrap_or_default()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delays: vec![
                Duration::from_millis(350),
                Duration::from_millis(900),
                Duration::from_millis(1800),
            ],
        }
    }
}

/// Configuration for one update run, resolved once and handed to each
/// component explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub manifest_source: ManifestSource,
    pub allow_unsigned_manifest: bool,
    pub install_dir: PathBuf,
    pub game_executable: String,
    pub orphan_whitelist: OrphanWhitelist,
    pub trusted_keys: TrustedKeys,
    pub retry_policy: RetryPolicy,
    pub request_timeout: Duration,
    pub backup_retention: usize,
}

impl EngineConfig {
    /// Resolves from the environment and `settings.json`. An unreadable
    /// settings file is logged and treated as absent.
    pub fn resolve(layout: &AppLayout) -> Self {
        let settings = match Settings::load(&layout.settings_path()) {
            Ok(settings) => settings,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "ignoring unreadable settings");
                None
            }
        };
        let env_override = std::env::var(MANIFEST_URL_ENV).ok();
        Self::resolve_with(layout, settings, env_override)
    }

    pub fn resolve_with(
        layout: &AppLayout,
        settings: Option<Settings>,
        env_override: Option<String>,
    ) -> Self {
        let settings = settings.unwrap_or_default();

        let manifest_url = env_override
            .filter(|value| !value.trim().is_empty())
            .or_else(|| {
                settings
                    .manifest_url
                    .clone()
                    .filter(|value| !value.trim().is_empty())
            })
            .unwrap_or_else(|| DEFAULT_MANIFEST_URL.to_string());
        let manifest_source = ManifestSource::parse(&manifest_url);
        let allow_unsigned_manifest = settings
            .allow_unsigned_manifest
            .unwrap_or_else(|| manifest_source.is_local());

        let orphan_whitelist = match settings.orphan_whitelist {
            Some(prefixes) => {
                OrphanWhitelist::new(prefixes, settings.whitelist_case_sensitive.unwrap_or(false))
            }
            None => OrphanWhitelist::new(
                DEFAULT_ORPHAN_WHITELIST,
                settings.whitelist_case_sensitive.unwrap_or(false),
            ),
        };

        Self {
            manifest_source,
            allow_unsigned_manifest,
            install_dir: settings
                .install_dir
                .unwrap_or_else(|| layout.default_install_dir()),
            game_executable: settings
                .game_executable
                .unwrap_or_else(|| DEFAULT_GAME_EXECUTABLE.to_string()),
            orphan_whitelist,
            trusted_keys: TrustedKeys::default(),
            retry_policy: RetryPolicy::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            backup_retention: settings
                .backup_retention
                .unwrap_or(DEFAULT_BACKUP_RETENTION),
        }
    }
}
