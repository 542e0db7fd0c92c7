use chrono::{DateTime, Duration, Utc};
use secrecy::{ExposeSecret, SecretString};

use tollgate_core::normalize::hmac_sha256_hex;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedUrl {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

/// Produces time-limited download links for stored files. Only the URL
/// contract is consumed here, never storage internals.
pub trait FileUrlSigner: Send + Sync {
    fn sign(&self, file_ref: &str, now: DateTime<Utc>) -> SignedUrl;
}

/// `{base}/{file_ref}?expires=<unix>&signature=<hmac>` with an HMAC-SHA256
/// over `file_ref:expires`.
pub struct HmacUrlSigner {
    base_url: String,
    secret: SecretString,
    ttl: Duration,
}

impl HmacUrlSigner {
    pub fn new(base_url: impl Into<String>, secret: SecretString, ttl: Duration) -> Self {
        Self { base_url: base_url.into().trim_end_matches('/').to_string(), secret, ttl }
    }

    pub fn verify(&self, file_ref: &str, expires: i64, signature: &str, now: DateTime<Utc>) -> bool {
        if now.timestamp() >= expires {
            return false;
        }
        self.signature(file_ref, expires) == signature
    }

    fn signature(&self, file_ref: &str, expires: i64) -> String {
        let payload = format!("{file_ref}:{expires}");
        hmac_sha256_hex(self.secret.expose_secret().as_bytes(), payload.as_bytes())
    }
}

impl FileUrlSigner for HmacUrlSigner {
    fn sign(&self, file_ref: &str, now: DateTime<Utc>) -> SignedUrl {
        let expires_at = now + self.ttl;
        let expires = expires_at.timestamp();
        let file_ref = file_ref.trim_start_matches('/');
        let signature = self.signature(file_ref, expires);

        SignedUrl {
            url: format!("{}/{file_ref}?expires={expires}&signature={signature}", self.base_url),
            expires_at,
        }
    }
}
