//! Shared-secret request authentication.
//!
//! Callers present `Authorization: token <secret>`. Both sides are reduced to
//! SHA-256 digests before comparison so the work done never depends on where
//! the first mismatching byte sits or on how long the caller's header is.

use sha2::{Digest, Sha256};

/// Prefix expected in front of the secret in the `Authorization` header.
pub const TOKEN_PREFIX: &str = "token ";

const DIGEST_LEN: usize = 32;

fn digest(value: &str) -> [u8; DIGEST_LEN] {
    Sha256::digest(value.as_bytes()).into()
}

/// Compare two strings without short-circuiting on the first difference.
///
/// Every call folds exactly `DIGEST_LEN` byte pairs, whatever the inputs.
pub fn secure_compare(expected: &str, provided: &str) -> bool {
    let expected = digest(expected);
    let provided = digest(provided);

    let mut mismatch = 0u8;
    for (a, b) in expected.iter().zip(provided.iter()) {
        mismatch |= a ^ b;
    }
    mismatch == 0
}

/// Check an `Authorization` header value against the configured secret.
///
/// A missing header should be passed as `""`. An empty secret never
/// authenticates anyone.
pub fn is_authorized(secret: &str, header: &str) -> bool {
    if secret.is_empty() {
        return false;
    }
    secure_compare(&format!("{}{}", TOKEN_PREFIX, secret), header)
}
