//! PKCE verifier and challenge (RFC 7636)

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::Rng;
use sha2::{Digest, Sha256};

/// RFC 7636 "unreserved" characters
const UNRESERVED: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-._~";

/// Verifier length. RFC 7636 allows 43..=128.
pub const VERIFIER_LEN: usize = 128;

/// Challenge method sent with the authorize request
pub const CHALLENGE_METHOD: &str = "S256";

/// Generate a random code verifier from the unreserved set
pub fn generate_verifier() -> String {
    // thread_rng is a CSPRNG seeded from the OS
    let mut rng = rand::thread_rng();
    (0..VERIFIER_LEN)
        .map(|_| UNRESERVED[rng.gen_range(0..UNRESERVED.len())] as char)
        .collect()
}

/// S256 challenge: base64url (no padding) of the verifier's SHA-256 digest
pub fn challenge_for(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}
