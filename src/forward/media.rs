//! Sora media pass-through: `/sora/media/*` (api-key authenticated) and
//! `/sora/media-signed/*` (unauthenticated, gated by an HMAC `sig` over
//! the path and an `expires` unix timestamp instead of a bearer token —
//! useful for handing a playable URL to a browser that can't send headers).

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const SORA_MEDIA_BASE_URL: &str = "https://api.openai.com";

/// Builds the string the signature is computed over: `{path}:{expires}`.
fn signing_payload(path: &str, expires: i64) -> String {
    format!("{path}:{expires}")
}

pub fn sign(secret: &str, path: &str, expires: i64) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(signing_payload(path, expires).as_bytes());
    hex::encode_bytes(&mac.finalize().into_bytes())
}

/// Verifies a caller-presented `sig` against `path`/`expires`, rejecting
/// expired links outright regardless of signature validity.
pub fn verify(secret: &str, path: &str, expires: i64, now: i64, sig: &str) -> bool {
    if expires < now {
        return false;
    }
    let expected = sign(secret, path, expires);
    constant_time_eq(expected.as_bytes(), sig.as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

pub fn media_url(path: &str) -> String {
    format!("{SORA_MEDIA_BASE_URL}/{}", path.trim_start_matches('/'))
}

/// Minimal hex encoder so this module doesn't need a second crate on top
/// of `hmac`/`sha2` just to stringify a signature.
mod hex {
    pub fn encode_bytes(bytes: &[u8]) -> String {
        let mut out = String::with_capacity(bytes.len() * 2);
        for b in bytes {
            out.push_str(&format!("{b:02x}"));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_signature_round_trips() {
        let sig = sign("secret", "/abc", 1000);
        assert!(verify("secret", "/abc", 1000, 500, &sig));
    }

    #[test]
    fn expired_link_is_rejected_even_with_correct_signature() {
        let sig = sign("secret", "/abc", 1000);
        assert!(!verify("secret", "/abc", 1000, 1001, &sig));
    }

    #[test]
    fn tampered_path_is_rejected() {
        let sig = sign("secret", "/abc", 1000);
        assert!(!verify("secret", "/other", 1000, 500, &sig));
    }
}
