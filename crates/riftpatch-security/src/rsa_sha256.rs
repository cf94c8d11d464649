use anyhow::{anyhow, Context, Result};
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs1v15::{Signature, VerifyingKey};
use rsa::pkcs8::DecodePublicKey;
use rsa::sha2::Sha256;
use rsa::signature::Verifier;
use rsa::RsaPublicKey;

/// Verifies an RSASSA-PKCS1-v1_5 signature over SHA-256.
///
/// The key may be PEM encoded either as SubjectPublicKeyInfo
/// (`BEGIN PUBLIC KEY`) or PKCS#1 (`BEGIN RSA PUBLIC KEY`). Malformed keys are
/// errors; a well-formed signature that does not verify is `Ok(false)`.
pub fn verify_rsa_sha256_signature(
    payload: &[u8],
    public_key_pem: &str,
    signature: &[u8],
) -> Result<bool> {
    let public_key = parse_public_key_pem(public_key_pem)?;
    let signature = match Signature::try_from(signature) {
        Ok(signature) => signature,
        Err(_) => return Ok(false),
    };

    let verifying_key = VerifyingKey::<Sha256>::new(public_key);
    Ok(verifying_key.verify(payload, &signature).is_ok())
}

fn parse_public_key_pem(pem: &str) -> Result<RsaPublicKey> {
    let pem = pem.trim();
    if pem.contains("BEGIN RSA PUBLIC KEY") {
        return RsaPublicKey::from_pkcs1_pem(pem).context("invalid PKCS#1 RSA public key PEM");
    }
    if pem.contains("BEGIN PUBLIC KEY") {
        return RsaPublicKey::from_public_key_pem(pem).context("invalid RSA public key PEM");
    }
    Err(anyhow!("unsupported RSA public key encoding: expected PEM"))
}

#[cfg(test)]
mod tests {
    use base64::Engine;

    use super::*;

    const PUBLIC_KEY_PEM: &str = "-----BEGIN PUBLIC KEY-----
MIIBIjANBgkqhkiG9w0BAQEFAAOCAQ8AMIIBCgKCAQEAswQIaXJT/6HolgYecQxg
5mHKXWLtf7/6aFAsIjQI4gTpEIrLzAaTq7VK5nK29gXcaUQ5mqaQBnAIfO5sZqfW
83+AhM20cOLktBrdMmGVd+xLfPG4EUxp74vuFer+uOAualn42j5LHgpsMj5F20Nt
4aMauwZdgNKUk9V/9bdSdlPcAsCIcMmUlQGMm+ToiRCyZ4GNlsv6dm3yD53hrKf5
QTQ1G2TNhuBmhnmTKd+GFUywpK4XkJLrNaz09sTMM4/np3nyp/HoCCbcoY30EE+L
1IrqycC7IwPLokSFoAyIs4AIkSkeUjbgHb3Q38sfB1WFpSYMZKOR81WHg4r/Xp58
VQIDAQAB
-----END PUBLIC KEY-----";

    const PAYLOAD: &str = r#"{"version":"1.0.0","baseUrl":"https://cdn.example.test/game/","files":[{"path":"data/a.bin","url":"","sha256":"abc","size":1024}]}"#;

    // openssl dgst -sha256 -sign over PAYLOAD with the matching private key
    const SIGNATURE_B64: &str = "ndOH3ssngIU2x+mRFjGbv3FnKM+q8dofspf541qtiIp1AopEtg7ifPm30vLNCHrGYZvYq17uVxZkfTuLg/pWaFmgSY9AvRs6PlHzP0fnqwZNCqHi4AgOF2ZMMMTznXAx2s5D7y7Js3cwgCgpoI7CrUZX3XSrUNsbYBrXj8cEQnfrJNEsMlcXGUCktcqDMRsuepJ2yeIBI+59A5AcGTq5j3nhGv+k2h5PVuxrJO5GsxiDyGmzNciaGTfudan7VTFt6YfdZIrAoACygKE9I779nWwISKpFlto3aY8eDgW73+WpK7Df9lR5six/+N8Ic8rQMNmm0fvX8+/tL3gay7/MhA==";

    fn signature() -> Vec<u8> {
        base64::engine::general_purpose::STANDARD
            .decode(SIGNATURE_B64)
            .expect("must decode signature vector")
    }

    #[test]
    fn verify_rsa_accepts_signature_produced_by_openssl() {
        let verified =
            verify_rsa_sha256_signature(PAYLOAD.as_bytes(), PUBLIC_KEY_PEM, &signature())
                .expect("verification must complete");
        assert!(verified);
    }

    #[test]
    fn verify_rsa_rejects_tampered_payload() {
        let tampered = PAYLOAD.replace("cdn.example.test", "evil.example.test");
        let verified =
            verify_rsa_sha256_signature(tampered.as_bytes(), PUBLIC_KEY_PEM, &signature())
                .expect("verification must complete");
        assert!(!verified);
    }

    #[test]
    fn verify_rsa_rejects_truncated_signature() {
        let mut truncated = signature();
        truncated.truncate(16);
        let verified = verify_rsa_sha256_signature(PAYLOAD.as_bytes(), PUBLIC_KEY_PEM, &truncated)
            .expect("verification must complete");
        assert!(!verified);
    }

    #[test]
    fn verify_rsa_errors_for_garbage_key() {
        let result = verify_rsa_sha256_signature(PAYLOAD.as_bytes(), "not a key", &signature());
        assert!(result.is_err());
    }
}
