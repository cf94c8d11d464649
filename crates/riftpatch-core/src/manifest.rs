use std::collections::HashSet;
use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::ser::{CharEscape, Formatter};

use crate::error::UpdateError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ManifestFile {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default)]
    pub size: u64,
}

impl ManifestFile {
    /// Expected digest, if the entry carries a non-blank one.
    pub fn expected_sha256(&self) -> Option<&str> {
        self.sha256
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn has_hash(&self) -> bool {
        self.expected_sha256().is_some()
    }

    pub fn url_override(&self) -> Option<&str> {
        self.url
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    /// Platform path for this entry, relative to the installation root.
    pub fn relative_path(&self) -> PathBuf {
        self.path.split('/').collect()
    }
}

/// Desired installation state as published by the update server.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub version: String,
    pub base_url: String,
    pub files: Vec<ManifestFile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature_algorithm: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestWire {
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    base_url: Option<String>,
    #[serde(default)]
    files: Option<Vec<ManifestFile>>,
    #[serde(default)]
    signature_algorithm: Option<String>,
    #[serde(default)]
    signature: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CanonicalManifest<'a> {
    version: &'a str,
    base_url: &'a str,
    files: Vec<CanonicalFile<'a>>,
}

#[derive(Serialize)]
struct CanonicalFile<'a> {
    path: &'a str,
    url: &'a str,
    sha256: &'a str,
    size: u64,
}

impl Manifest {
    pub fn from_json_str(input: &str) -> Result<Self, UpdateError> {
        let wire: ManifestWire =
            serde_json::from_str(input).map_err(|err| UpdateError::ManifestInvalid {
                detail: format!("failed to parse manifest json: {err}"),
            })?;

        let base_url = match wire.base_url {
            Some(base_url) if !base_url.trim().is_empty() => base_url,
            _ => {
                return Err(UpdateError::ManifestInvalid {
                    detail: "manifest does not declare baseUrl".to_string(),
                })
            }
        };
        let Some(files) = wire.files else {
            return Err(UpdateError::ManifestInvalid {
                detail: "manifest does not declare files".to_string(),
            });
        };

        let manifest = Self {
            version: wire.version.unwrap_or_default(),
            base_url,
            files,
            signature_algorithm: wire.signature_algorithm,
            signature: wire.signature,
        };
        manifest.validate_paths()?;
        Ok(manifest)
    }

    /// True when both the algorithm and the signature are present and non-blank.
    pub fn is_signed(&self) -> bool {
        let present = |value: &Option<String>| {
            value
                .as_deref()
                .map(|value| !value.trim().is_empty())
                .unwrap_or(false)
        };
        present(&self.signature_algorithm) && present(&self.signature)
    }

    /// Compact JSON of `{version, baseUrl, files[{path,url,sha256,size}]}`,
    /// the byte string covered by the manifest signature. Missing optional
    /// fields serialize as empty strings. Strings are escaped the way the
    /// signing tool escapes them, see [`SignerEscapeFormatter`].
    pub fn canonical_payload(&self) -> serde_json::Result<String> {
        let canonical = CanonicalManifest {
            version: &self.version,
            base_url: &self.base_url,
            files: self
                .files
                .iter()
                .map(|file| CanonicalFile {
                    path: &file.path,
                    url: file.url.as_deref().unwrap_or(""),
                    sha256: file.sha256.as_deref().unwrap_or(""),
                    size: file.size,
                })
                .collect(),
        };
        let mut out = Vec::new();
        let mut serializer = serde_json::Serializer::with_formatter(&mut out, SignerEscapeFormatter);
        canonical.serialize(&mut serializer)?;
        // Every escape above is ASCII.
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|file| file.size).sum()
    }

    pub fn contains_path(&self, relative_path: &str) -> bool {
        self.files
            .iter()
            .any(|file| file.path.eq_ignore_ascii_case(relative_path))
    }

    fn validate_paths(&self) -> Result<(), UpdateError> {
        let mut seen = HashSet::with_capacity(self.files.len());
        for file in &self.files {
            validate_relative_path(&file.path).map_err(|reason| UpdateError::ManifestInvalid {
                detail: format!("invalid file path '{}': {reason}", file.path),
            })?;
            if !seen.insert(file.path.to_ascii_lowercase()) {
                return Err(UpdateError::ManifestInvalid {
                    detail: format!("duplicate file path '{}'", file.path),
                });
            }
        }
        Ok(())
    }
}

fn validate_relative_path(path: &str) -> Result<(), &'static str> {
    if path.trim().is_empty() {
        return Err("path must not be empty");
    }
    if path.contains('\\') {
        return Err("path must use forward slashes");
    }
    if path.starts_with('/') {
        return Err("path must be relative");
    }
    if path.contains(':') {
        return Err("path must not carry a drive or stream prefix");
    }
    for segment in path.split('/') {
        match segment {
            "" => return Err("path contains an empty segment"),
            "." | ".." => return Err("path must not contain '.' or '..' segments"),
            _ => {}
        }
    }
    Ok(())
}

/// Compact formatter whose string escaping matches the manifest signing
/// tool: only printable ASCII outside `&'+<>` and backtick is written raw,
/// `"` becomes `\u0022`, and every other character is written as uppercase
/// `\uXXXX` UTF-16 code units (surrogate pairs above the BMP).
struct SignerEscapeFormatter;

impl Formatter for SignerEscapeFormatter {
    fn write_string_fragment<W>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        let mut start = 0;
        for (index, ch) in fragment.char_indices() {
            if is_written_raw(ch) {
                continue;
            }
            writer.write_all(fragment[start..index].as_bytes())?;
            let mut units = [0_u16; 2];
            for unit in ch.encode_utf16(&mut units) {
                write!(writer, "\\u{unit:04X}")?;
            }
            start = index + ch.len_utf8();
        }
        writer.write_all(fragment[start..].as_bytes())
    }

    fn write_char_escape<W>(&mut self, writer: &mut W, char_escape: CharEscape) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        match char_escape {
            CharEscape::Quote => writer.write_all(b"\\u0022"),
            CharEscape::ReverseSolidus => writer.write_all(b"\\\\"),
            CharEscape::Solidus => writer.write_all(b"/"),
            CharEscape::Backspace => writer.write_all(b"\\b"),
            CharEscape::FormFeed => writer.write_all(b"\\f"),
            CharEscape::LineFeed => writer.write_all(b"\\n"),
            CharEscape::CarriageReturn => writer.write_all(b"\\r"),
            CharEscape::Tab => writer.write_all(b"\\t"),
            CharEscape::AsciiControl(byte) => write!(writer, "\\u{byte:04X}"),
        }
    }
}

fn is_written_raw(ch: char) -> bool {
    matches!(ch, ' '..='~') && !matches!(ch, '&' | '\'' | '+' | '<' | '>' | '`')
}
