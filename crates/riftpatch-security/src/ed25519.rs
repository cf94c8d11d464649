use anyhow::{Context, Result};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};

/// Checks a detached Ed25519 `signature` over `payload`. Malformed keys or
/// signatures are errors; a well-formed signature that does not match is
/// `Ok(false)`.
pub fn verify_ed25519_signature(
    payload: &[u8],
    public_key_hex: &str,
    signature: &[u8],
) -> Result<bool> {
    let verifying_key = parse_public_key(public_key_hex)?;
    let signature = Signature::from_slice(signature).with_context(|| {
        format!(
            "invalid Ed25519 signature length: expected 64 bytes, got {}",
            signature.len()
        )
    })?;

    Ok(verifying_key.verify(payload, &signature).is_ok())
}

fn parse_public_key(public_key_hex: &str) -> Result<VerifyingKey> {
    let mut key = [0_u8; 32];
    hex::decode_to_slice(public_key_hex.trim(), &mut key)
        .context("Ed25519 public key must be 32 bytes of hex")?;
    VerifyingKey::from_bytes(&key).context("invalid Ed25519 public key bytes")
}

#[cfg(test)]
mod tests {
    use ed25519_dalek::{Signer, SigningKey};

    use super::*;

    const PAYLOAD: &[u8] =
        br#"{"version":"2.1.0","baseUrl":"https://cdn.example.test/","files":[]}"#;

    fn release_key() -> SigningKey {
        SigningKey::from_bytes(&[0x2a; 32])
    }

    fn public_hex(key: &SigningKey) -> String {
        hex::encode(key.verifying_key().to_bytes())
    }

    #[test]
    fn accepts_signature_from_release_key() {
        let key = release_key();
        let signature = key.sign(PAYLOAD).to_bytes();

        let padded_hex = format!("  {}\n", public_hex(&key));
        assert!(verify_ed25519_signature(PAYLOAD, &padded_hex, &signature)
            .expect("verification must complete"));
    }

    #[test]
    fn rejects_modified_payload_and_foreign_key() {
        let key = release_key();
        let signature = key.sign(PAYLOAD).to_bytes();

        let modified = PAYLOAD.to_ascii_uppercase();
        assert!(!verify_ed25519_signature(&modified, &public_hex(&key), &signature)
            .expect("verification must complete"));

        let foreign = SigningKey::from_bytes(&[0x11; 32]);
        assert!(!verify_ed25519_signature(PAYLOAD, &public_hex(&foreign), &signature)
            .expect("verification must complete"));
    }

    #[test]
    fn malformed_signature_or_key_is_an_error() {
        let key = release_key();
        let signature = key.sign(PAYLOAD).to_bytes();

        assert!(verify_ed25519_signature(PAYLOAD, &public_hex(&key), &signature[..63]).is_err());
        assert!(verify_ed25519_signature(PAYLOAD, "not hex", &signature).is_err());
        assert!(verify_ed25519_signature(PAYLOAD, "abcd", &signature).is_err());
    }
}
