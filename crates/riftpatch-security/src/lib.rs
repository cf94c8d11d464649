mod checksum;
mod ed25519;
mod rsa_sha256;

pub use checksum::{sha256_file, sha256_hex, sha256_matches, sha256_reader};
pub use ed25519::verify_ed25519_signature;
pub use rsa_sha256::verify_rsa_sha256_signature;
