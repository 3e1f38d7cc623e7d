use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

// HMAC-SHA256(raw_body, WEBHOOK_SECRET) → hex, optionally prefixed "sha256="

type HmacSha256 = Hmac<Sha256>;

/// Prefixes a provider may put in front of the hex digest. Matched
/// case-insensitively and stripped repeatedly, so `Bearer sha256=<hex>` works.
const SIGNATURE_PREFIXES: &[&str] = &["bearer ", "sha256=", "hmac-sha256="];

/// Signature header value for `body`, in the form providers send it.
pub fn compute_signature_hex(secret: &str, body: &[u8]) -> String {
    format!("sha256={}", hex::encode(digest(secret.as_bytes(), body)))
}

fn digest(secret: &[u8], body: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length; new_from_slice cannot fail for Hmac<Sha256>.
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return Vec::new(),
    };
    mac.update(body);
    mac.finalize().into_bytes().to_vec()
}

fn strip_prefixes(presented: &str) -> &str {
    let mut rest = presented.trim();
    loop {
        let before = rest.len();
        for prefix in SIGNATURE_PREFIXES {
            if rest.len() >= prefix.len()
                && rest.is_char_boundary(prefix.len())
                && rest[..prefix.len()].eq_ignore_ascii_case(prefix)
            {
                rest = rest[prefix.len()..].trim_start();
            }
        }
        if rest.len() == before {
            return rest;
        }
    }
}

/// Check `presented` against HMAC-SHA256 of the raw body.
///
/// Returns `false` for a missing secret, an undecodable or wrong-length
/// signature, or a mismatch. Never panics and never errors: all of these
/// are authentication failures. Byte comparison goes through `subtle` so it
/// does not short-circuit on the first differing byte.
pub fn verify(raw_body: &[u8], presented: &str, secret: &str) -> bool {
    if secret.is_empty() {
        return false;
    }
    let provided = match hex::decode(strip_prefixes(presented)) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    let expected = digest(secret.as_bytes(), raw_body);
    if expected.is_empty() || provided.len() != expected.len() {
        return false;
    }
    provided.ct_eq(expected.as_slice()).unwrap_u8() == 1
}
