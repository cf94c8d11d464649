use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use base64::Engine;
use reqwest::blocking::Client;
use reqwest::header::CACHE_CONTROL;
use reqwest::StatusCode;
use riftpatch_core::{Manifest, UpdateError};
use riftpatch_security::{verify_ed25519_signature, verify_rsa_sha256_signature};
use tracing::{debug, info, warn};

use crate::cancel::{ensure_active, CancellationToken};
use crate::config::{EngineConfig, ManifestSource, TrustedKeys};
use crate::fs_utils::write_atomic;
use crate::layout::AppLayout;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestOrigin {
    Network,
    Cache,
}

#[derive(Debug, Clone)]
pub struct FetchedManifest {
    pub manifest: Manifest,
    pub origin: ManifestOrigin,
}

enum FetchOutcome {
    Fresh(String),
    NotModified,
    Unreachable(String),
}

/// Fetches, verifies and caches the manifest.
pub struct ManifestStore {
    source: ManifestSource,
    allow_unsigned: bool,
    trusted_keys: TrustedKeys,
    cache_path: PathBuf,
    client: Client,
}

impl ManifestStore {
    pub fn new(layout: &AppLayout, config: &EngineConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("riftpatch/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(std::time::Duration::from_secs(15))
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .context("failed to build manifest http client")?;
        Ok(Self {
            source: config.manifest_source.clone(),
            allow_unsigned: config.allow_unsigned_manifest,
            trusted_keys: config.trusted_keys.clone(),
            cache_path: layout.manifest_cache_path(),
            client,
        })
    }

    /// A fresh manifest that fails validation is an error in its own right;
    /// only an unreachable source (or `304`) falls back to the cached copy.
    pub fn fetch(&self, cancel: &CancellationToken) -> Result<FetchedManifest, UpdateError> {
        ensure_active(cancel)?;

        let network_reason = match self.fetch_remote() {
            FetchOutcome::Fresh(raw) => {
                let manifest = self.parse_trusted(&raw)?;
                if let Err(err) = write_atomic(&self.cache_path, raw.as_bytes()) {
                    warn!(error = %format!("{err:#}"), "failed to cache manifest");
                }
                info!(
                    version = %manifest.version,
                    files = manifest.files.len(),
                    source = %self.source.describe(),
                    "manifest fetched"
                );
                return Ok(FetchedManifest {
                    manifest,
                    origin: ManifestOrigin::Network,
                });
            }
            FetchOutcome::NotModified => "source reported not modified".to_string(),
            FetchOutcome::Unreachable(reason) => reason,
        };

        ensure_active(cancel)?;
        warn!(reason = %network_reason, "falling back to cached manifest");

        let raw = match fs::read_to_string(&self.cache_path) {
            Ok(raw) => raw,
            Err(err) => {
                let cache_reason = if err.kind() == io::ErrorKind::NotFound {
                    "no cached manifest".to_string()
                } else {
                    format!("cached manifest unreadable: {err}")
                };
                return Err(UpdateError::ManifestUnavailable {
                    detail: format!("{network_reason}; {cache_reason}"),
                });
            }
        };

        let manifest = self
            .parse_trusted(&raw)
            .map_err(|err| UpdateError::ManifestUnavailable {
                detail: format!("{network_reason}; cached manifest rejected: {err}"),
            })?;
        info!(version = %manifest.version, "using cached manifest");
        Ok(FetchedManifest {
            manifest,
            origin: ManifestOrigin::Cache,
        })
    }

    fn parse_trusted(&self, raw: &str) -> Result<Manifest, UpdateError> {
        let manifest = Manifest::from_json_str(raw)?;
        verify_manifest_signature(&manifest, &self.trusted_keys, self.allow_unsigned)?;
        Ok(manifest)
    }

    fn fetch_remote(&self) -> FetchOutcome {
        match &self.source {
            ManifestSource::File(path) => match fs::read_to_string(path) {
                Ok(raw) => FetchOutcome::Fresh(raw),
                Err(err) => {
                    FetchOutcome::Unreachable(format!("cannot read {}: {err}", path.display()))
                }
            },
            ManifestSource::Http(url) => self.fetch_http(url),
        }
    }

    fn fetch_http(&self, url: &str) -> FetchOutcome {
        let mut request_url = match reqwest::Url::parse(url) {
            Ok(parsed) => parsed,
            Err(err) => return FetchOutcome::Unreachable(format!("invalid manifest url {url}: {err}")),
        };
        let cache_buster = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis())
            .unwrap_or_default();
        request_url
            .query_pairs_mut()
            .append_pair("t", &cache_buster.to_string());

        debug!(url = %request_url, "requesting manifest");
        let response = match self
            .client
            .get(request_url)
            .header(CACHE_CONTROL, "no-cache")
            .send()
        {
            Ok(response) => response,
            Err(err) => return FetchOutcome::Unreachable(format!("request to {url} failed: {err}")),
        };

        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            return FetchOutcome::NotModified;
        }
        if !status.is_success() {
            return FetchOutcome::Unreachable(format!("{url} answered HTTP {status}"));
        }
        match response.text() {
            Ok(raw) => FetchOutcome::Fresh(raw),
            Err(err) => FetchOutcome::Unreachable(format!("failed reading body from {url}: {err}")),
        }
    }
}

/// Checks the manifest signature against the trusted keys. Unknown
/// algorithms fail closed.
pub fn verify_manifest_signature(
    manifest: &Manifest,
    keys: &TrustedKeys,
    allow_unsigned: bool,
) -> Result<(), UpdateError> {
    if !manifest.is_signed() {
        if allow_unsigned {
            warn!(version = %manifest.version, "accepting unsigned manifest");
            return Ok(());
        }
        return Err(UpdateError::ManifestUnsigned);
    }

    let invalid = |detail: String| UpdateError::SignatureInvalid { detail };

    let payload = manifest
        .canonical_payload()
        .map_err(|err| invalid(format!("failed to canonicalize manifest: {err}")))?;
    let signature = base64::engine::general_purpose::STANDARD
        .decode(manifest.signature.as_deref().unwrap_or_default().trim())
        .map_err(|err| invalid(format!("signature is not valid base64: {err}")))?;
    let algorithm = manifest
        .signature_algorithm
        .as_deref()
        .unwrap_or_default()
        .trim()
        .to_ascii_uppercase();

    let verified = match algorithm.as_str() {
        "RSA-SHA256" => {
            let pem = keys
                .rsa_public_key_pem
                .as_deref()
                .ok_or_else(|| invalid("no RSA public key is trusted".to_string()))?;
            verify_rsa_sha256_signature(payload.as_bytes(), pem, &signature)
                .map_err(|err| invalid(format!("{err:#}")))?
        }
        "ED25519" => {
            let key_hex = keys
                .ed25519_public_key_hex
                .as_deref()
                .ok_or_else(|| invalid("no Ed25519 public key is trusted".to_string()))?;
            verify_ed25519_signature(payload.as_bytes(), key_hex, &signature)
                .map_err(|err| invalid(format!("{err:#}")))?
        }
        other => {
            return Err(invalid(format!("unsupported signature algorithm '{other}'")));
        }
    };

    if !verified {
        return Err(invalid(
            "signature does not match the manifest contents".to_string(),
        ));
    }
    Ok(())
}
