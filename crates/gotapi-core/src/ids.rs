//! Identifier issuance and reply signing.

use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Issue a fresh opaque identifier (client ids, tokens, request codes).
///
/// 32 random bytes are hex encoded, suffixed with the issue time and hashed
/// once more, so raw random bytes never leave the process.
#[must_use]
pub fn unique_id() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    let seed = format!(
        "{}_{}",
        hex::encode(bytes),
        chrono::Utc::now().timestamp_millis()
    );
    hex::encode(Sha256::digest(seed.as_bytes()))
}

/// HMAC-SHA256 of `nonce` keyed by `key`, hex encoded.
///
/// Both inputs are taken as their ASCII bytes; callers check them with
/// [`is_ascii_token`] first. `None` only if the MAC rejects the key length,
/// which HMAC never does.
#[must_use]
pub fn sign(key: &str, nonce: &str) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(key.as_bytes()).ok()?;
    mac.update(nonce.as_bytes());
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Non-empty printable ASCII without whitespace.
#[must_use]
pub fn is_ascii_token(value: &str) -> bool {
    !value.is_empty() && value.bytes().all(|b| b.is_ascii_graphic())
}
