use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

/// Case-folds, strips punctuation and collapses whitespace. Used only to derive
/// cache keys; the prompt sent to the provider is never rewritten.
pub fn normalize_prompt(prompt: &str) -> String {
    let stripped: String = prompt
        .chars()
        .filter(|ch| ch.is_alphanumeric() || ch.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect();

    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Hash of the normalized prompt. Tenant isolation is enforced by the cache
/// key being `(tenant, hash)`, not by salting the hash.
pub fn prompt_cache_key(prompt: &str) -> String {
    sha256_hex(normalize_prompt(prompt).as_bytes())
}

/// Hash of inbound message text for the analysis cache (lower-cased, trimmed).
pub fn content_hash(text: &str) -> String {
    sha256_hex(text.trim().to_lowercase().as_bytes())
}

pub fn sha256_hex(payload: &[u8]) -> String {
    let digest = Sha256::digest(payload);
    encode_hex(digest.as_slice())
}

/// Keyed digest for signed attachment URLs. An unusable key falls back to a
/// plain digest of the payload.
pub fn hmac_sha256_hex(secret: &[u8], payload: &[u8]) -> String {
    let mut mac = match Hmac::<Sha256>::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return sha256_hex(payload),
    };
    mac.update(payload);
    encode_hex(mac.finalize().into_bytes().as_slice())
}

fn encode_hex(bytes: &[u8]) -> String {
    let mut output = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}
