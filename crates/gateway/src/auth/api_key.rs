//! API key generation and format validation
//!
//! Keys are opaque secrets of the form `sk_mt_` + 64 base62 characters.
//! Only the SHA-256 hash of a key is ever stored; lookups go through the
//! repository by hash.

use rand::Rng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

pub const API_KEY_PREFIX: &str = "sk_mt_";
const SECRET_LEN: usize = 64;
const BASE62: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Generate a new API key secret.
/// Returns (full_key, key_hash).
pub fn generate_key() -> (String, String) {
    let mut rng = rand::thread_rng();
    let body: String = (0..SECRET_LEN)
        .map(|_| BASE62[rng.gen_range(0..BASE62.len())] as char)
        .collect();
    let full_key = format!("{}{}", API_KEY_PREFIX, body);
    let key_hash = hash_secret(&full_key);
    (full_key, key_hash)
}

/// Cheap format check run before any repository round-trip
pub fn looks_like_key(secret: &str) -> bool {
    let Some(body) = secret.strip_prefix(API_KEY_PREFIX) else {
        return false;
    };
    body.len() == SECRET_LEN && body.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// Hash a key secret for storage and lookup
pub fn hash_secret(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

/// Constant-time comparison of two secrets
pub fn secrets_match(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        // Constant-time dummy work so length is not a timing oracle
        let dummy = vec![0u8; a.len()];
        let _ = a.as_bytes().ct_eq(&dummy);
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Extract the displayable prefix of a key for logging
pub fn display_prefix(secret: &str) -> String {
    if secret.len() > 12 {
        format!("{}...", &secret[..12])
    } else {
        secret.to_string()
    }
}
