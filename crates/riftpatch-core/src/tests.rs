use super::*;

const SAMPLE: &str = r#"{
  "version": "1.4.2",
  "baseUrl": "https://cdn.example.test/game/",
  "files": [
    { "path": "game.exe", "sha256": "AA11", "size": 12 },
    { "path": "data/a.bin", "url": "https://mirror.example.test/a.bin", "size": 1024 }
  ],
  "signatureAlgorithm": "RSA-SHA256",
  "signature": "c2ln"
}"#;

#[test]
fn parse_manifest_with_optional_fields() {
    let manifest = Manifest::from_json_str(SAMPLE).expect("must parse");
    assert_eq!(manifest.version, "1.4.2");
    assert_eq!(manifest.files.len(), 2);
    assert_eq!(manifest.files[0].expected_sha256(), Some("AA11"));
    assert!(manifest.files[1].expected_sha256().is_none());
    assert_eq!(
        manifest.files[1].url_override(),
        Some("https://mirror.example.test/a.bin")
    );
    assert!(manifest.is_signed());
    assert_eq!(manifest.total_size(), 1036);
}

#[test]
fn parse_manifest_rejects_missing_base_url() {
    let raw = r#"{"version":"1","files":[]}"#;
    let err = Manifest::from_json_str(raw).expect_err("baseUrl is required");
    assert!(matches!(err, UpdateError::ManifestInvalid { .. }));
    assert!(err.detail().contains("baseUrl"));
}

#[test]
fn parse_manifest_rejects_blank_base_url() {
    let raw = r#"{"version":"1","baseUrl":"  ","files":[]}"#;
    let err = Manifest::from_json_str(raw).expect_err("blank baseUrl is invalid");
    assert!(matches!(err, UpdateError::ManifestInvalid { .. }));
}

#[test]
fn parse_manifest_rejects_missing_files() {
    let raw = r#"{"version":"1","baseUrl":"https://cdn.example.test/"}"#;
    let err = Manifest::from_json_str(raw).expect_err("files are required");
    assert!(err.detail().contains("files"));
}

#[test]
fn parse_manifest_accepts_empty_file_list() {
    let raw = r#"{"version":"1","baseUrl":"https://cdn.example.test/","files":[]}"#;
    let manifest = Manifest::from_json_str(raw).expect("empty list is a valid state");
    assert!(manifest.files.is_empty());
    assert!(!manifest.is_signed());
}

#[test]
fn parse_manifest_rejects_escaping_paths() {
    for path in [
        "../outside.dll",
        "data/../../x",
        "/etc/passwd",
        "C:/Windows/x.dll",
        "data\\a.bin",
        "data//a.bin",
        "./a.bin",
        "",
    ] {
        let raw = format!(
            r#"{{"version":"1","baseUrl":"https://cdn.example.test/","files":[{{"path":{},"size":1}}]}}"#,
            serde_json::to_string(path).expect("must encode path")
        );
        let err = Manifest::from_json_str(&raw).expect_err("path must be rejected");
        assert!(
            matches!(err, UpdateError::ManifestInvalid { .. }),
            "unexpected error for {path:?}: {err:?}"
        );
    }
}

#[test]
fn parse_manifest_rejects_duplicate_paths_ignoring_case() {
    let raw = r#"{"version":"1","baseUrl":"https://cdn.example.test/","files":[
        {"path":"Data/a.bin","size":1},{"path":"data/A.bin","size":1}]}"#;
    let err = Manifest::from_json_str(raw).expect_err("duplicates must be rejected");
    assert!(err.detail().contains("duplicate"));
}

#[test]
fn canonical_payload_is_compact_and_ordered() {
    let manifest = Manifest::from_json_str(SAMPLE).expect("must parse");
    let payload = manifest.canonical_payload().expect("must serialize");
    assert_eq!(
        payload,
        concat!(
            r#"{"version":"1.4.2","baseUrl":"https://cdn.example.test/game/","files":["#,
            r#"{"path":"game.exe","url":"","sha256":"AA11","size":12},"#,
            r#"{"path":"data/a.bin","url":"https://mirror.example.test/a.bin","sha256":"","size":1024}]}"#
        )
    );
}

#[test]
fn canonical_payload_escapes_like_signing_tool() {
    let manifest = Manifest {
        version: "say \"hi\" \u{1F3AE}".to_string(),
        base_url: "https://cdn.example.test/<q>/".to_string(),
        files: vec![
            ManifestFile {
                path: "mods/a+b&c'd`e.pak".to_string(),
                url: None,
                sha256: None,
                size: 1,
            },
            ManifestFile {
                path: "\u{e9}t\u{e9}.dat".to_string(),
                url: Some("x\\y\n\u{7f}".to_string()),
                sha256: None,
                size: 2,
            },
        ],
        signature_algorithm: None,
        signature: None,
    };

    let payload = manifest.canonical_payload().expect("must serialize");
    assert!(payload.is_ascii());
    assert_eq!(
        payload,
        concat!(
            r#"{"version":"say \u0022hi\u0022 \uD83C\uDFAE","#,
            r#""baseUrl":"https://cdn.example.test/\u003Cq\u003E/","files":["#,
            r#"{"path":"mods/a\u002Bb\u0026c\u0027d\u0060e.pak","url":"","sha256":"","size":1},"#,
            r#"{"path":"\u00E9t\u00E9.dat","url":"x\\y\n\u007F","sha256":"","size":2}]}"#
        )
    );
}

#[test]
fn canonical_payload_ignores_signature_fields() {
    let signed = Manifest::from_json_str(SAMPLE).expect("must parse");
    let mut unsigned = signed.clone();
    unsigned.signature = None;
    unsigned.signature_algorithm = None;
    assert_eq!(
        signed.canonical_payload().expect("must serialize"),
        unsigned.canonical_payload().expect("must serialize")
    );
}

#[test]
fn relative_path_splits_on_forward_slashes() {
    let file = ManifestFile {
        path: "data/maps/a.bin".to_string(),
        url: None,
        sha256: None,
        size: 0,
    };
    let expected: std::path::PathBuf = ["data", "maps", "a.bin"].iter().collect();
    assert_eq!(file.relative_path(), expected);
}

#[test]
fn fingerprint_match_requires_size_mtime_and_hash() {
    let fingerprint = InstallFingerprint {
        size: 10,
        last_write_time_ticks: 99,
        sha256: "abcd".to_string(),
    };
    assert!(fingerprint.matches(10, 99, "ABCD"));
    assert!(!fingerprint.matches(11, 99, "abcd"));
    assert!(!fingerprint.matches(10, 98, "abcd"));
    assert!(!fingerprint.matches(10, 99, "ffff"));

    let unhashed = InstallFingerprint {
        sha256: String::new(),
        ..fingerprint
    };
    assert!(!unhashed.matches(10, 99, ""));
}

#[test]
fn install_state_is_trusted_only_for_same_version() {
    let state = InstallState::new("2.0.0", Default::default());
    assert!(state.is_trusted_for("2.0.0"));
    assert!(!state.is_trusted_for("2.0.1"));

    let blank = InstallState::new("", Default::default());
    assert!(!blank.is_trusted_for(""));
}

#[test]
fn transaction_serializes_with_camel_case_fields() {
    let mut tx = UpdateTransaction::begin("3.1.0");
    tx.applied_files.push(AppliedFile {
        relative_path: "data/a.bin".to_string(),
        backup_path: String::new(),
    });
    let raw = serde_json::to_string(&tx).expect("must serialize");
    assert!(raw.contains("\"startedAtUtc\""));
    assert!(raw.contains("\"status\":\"applying\""));
    assert!(raw.contains("\"appliedFiles\""));
    assert!(raw.contains("\"relativePath\":\"data/a.bin\""));

    let parsed: UpdateTransaction = serde_json::from_str(&raw).expect("must parse");
    assert_eq!(parsed, tx);
    assert!(parsed.applied_files[0].backup().is_none());
}

#[test]
fn applied_file_without_backup_field_defaults_to_empty() {
    let raw = r#"{"relativePath":"a.txt"}"#;
    let applied: AppliedFile = serde_json::from_str(raw).expect("must parse");
    assert!(applied.backup().is_none());
}

#[test]
fn anyhow_conversion_preserves_typed_errors_through_context() {
    use anyhow::Context;

    let typed: anyhow::Result<()> = Err(UpdateError::FileLocked {
        path: "game.exe".to_string(),
    }
    .into());
    let wrapped = typed.context("applying game.exe").expect_err("must fail");
    let converted = UpdateError::from(wrapped);
    assert_eq!(
        converted,
        UpdateError::FileLocked {
            path: "game.exe".to_string()
        }
    );
}

#[test]
fn anyhow_conversion_wraps_foreign_errors_as_unexpected() {
    let err = anyhow::anyhow!("disk on fire").context("writing install state");
    let converted = UpdateError::from(err);
    match converted {
        UpdateError::Unexpected { detail, .. } => {
            assert!(detail.contains("writing install state"));
            assert!(detail.contains("disk on fire"));
        }
        other => panic!("unexpected conversion: {other:?}"),
    }
}

#[test]
fn cancelled_is_distinct_and_not_retryable() {
    assert!(UpdateError::Cancelled.is_cancelled());
    assert!(!UpdateError::Cancelled.is_retryable());
    assert!(UpdateError::SizeMismatch {
        path: "a".to_string(),
        expected: 1,
        actual: 2
    }
    .is_retryable());
}
