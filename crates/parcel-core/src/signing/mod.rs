//! HMAC-SHA256 signed download links.
//!
//! A token authorizes one subject until an absolute expiry. The signature
//! covers the canonical string `subject|expiresAtEpochMs[|clientIp]` and is
//! carried hex-encoded in the query string, so verification needs no
//! server-side state.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use url::Url;

use crate::util::{sanitize, unix_millis_now};
use crate::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Hex length of an HMAC-SHA256 tag.
const SIGNATURE_HEX_LEN: usize = 64;

/// Millisecond wall clock used to stamp and check expiries.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

/// Clock backed by the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        unix_millis_now()
    }
}

/// A self-contained download authorization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedToken {
    pub subject_id: String,
    pub expires_at_epoch_ms: i64,
    pub signature_hex: String,
}

impl SignedToken {
    /// Build `<base>/download/redirect/<subject>?expires=..&signature=..`.
    pub fn redirect_url(&self, base_url: &str) -> Result<String> {
        let mut url = Url::parse(base_url)
            .map_err(|error| Error::InvalidInput(format!("Invalid base URL: {}", sanitize(&error))))?;
        url.path_segments_mut()
            .map_err(|()| Error::InvalidInput("Base URL cannot carry a path".to_string()))?
            .pop_if_empty()
            .extend(["download", "redirect", self.subject_id.as_str()]);
        url.query_pairs_mut()
            .append_pair("expires", &self.expires_at_epoch_ms.to_string())
            .append_pair("signature", &self.signature_hex);
        Ok(url.into())
    }
}

/// Issues and verifies [`SignedToken`]s with one shared secret.
#[derive(Clone)]
pub struct SignedUrlCodec {
    keyed: HmacSha256,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for SignedUrlCodec {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("SignedUrlCodec")
            .field("secret", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

impl SignedUrlCodec {
    pub fn new(secret: &[u8]) -> Result<Self> {
        Self::with_clock(secret, Arc::new(SystemClock))
    }

    pub fn with_clock(secret: &[u8], clock: Arc<dyn Clock>) -> Result<Self> {
        if secret.is_empty() {
            return Err(Error::InvalidInput(
                "Signing secret must not be empty".to_string(),
            ));
        }
        let keyed = HmacSha256::new_from_slice(secret).map_err(|error| {
            Error::InvalidInput(format!("Unusable signing secret: {}", sanitize(&error)))
        })?;
        Ok(Self { keyed, clock })
    }

    /// Sign `subject_id` for `ttl` from now, optionally bound to `client_ip`.
    pub fn issue(&self, subject_id: &str, ttl: Duration, client_ip: Option<IpAddr>) -> SignedToken {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let expires_at_epoch_ms = self.clock.now_millis().saturating_add(ttl_ms);
        let signature_hex = hex::encode(self.sign(subject_id, expires_at_epoch_ms, client_ip));
        SignedToken {
            subject_id: subject_id.to_string(),
            expires_at_epoch_ms,
            signature_hex,
        }
    }

    /// Boolean verification; never errors.
    pub fn verify(
        &self,
        subject_id: &str,
        expires_at_epoch_ms: i64,
        signature_hex: &str,
        client_ip: Option<IpAddr>,
    ) -> bool {
        self.check(subject_id, expires_at_epoch_ms, signature_hex, client_ip)
            .is_ok()
    }

    /// Like [`Self::verify`] but reports whether the link expired or was forged.
    pub fn check(
        &self,
        subject_id: &str,
        expires_at_epoch_ms: i64,
        signature_hex: &str,
        client_ip: Option<IpAddr>,
    ) -> Result<()> {
        if self.clock.now_millis() > expires_at_epoch_ms {
            return Err(Error::SignatureExpired);
        }
        // only the exact form `issue` emits is accepted
        if !is_canonical_hex(signature_hex) {
            return Err(Error::SignatureInvalid);
        }
        let Ok(provided) = hex::decode(signature_hex) else {
            return Err(Error::SignatureInvalid);
        };
        let mut mac = self.keyed.clone();
        mac.update(canonical_string(subject_id, expires_at_epoch_ms, client_ip).as_bytes());
        // verify_slice compares in constant time and rejects any length mismatch
        mac.verify_slice(&provided)
            .map_err(|_| Error::SignatureInvalid)
    }

    fn sign(&self, subject_id: &str, expires_at_epoch_ms: i64, client_ip: Option<IpAddr>) -> Vec<u8> {
        let mut mac = self.keyed.clone();
        mac.update(canonical_string(subject_id, expires_at_epoch_ms, client_ip).as_bytes());
        mac.finalize().into_bytes().to_vec()
    }
}

fn is_canonical_hex(signature_hex: &str) -> bool {
    signature_hex.len() == SIGNATURE_HEX_LEN
        && signature_hex
            .bytes()
            .all(|byte| byte.is_ascii_digit() || (b'a'..=b'f').contains(&byte))
}

/// The exact byte string covered by the signature.
pub fn canonical_string(subject_id: &str, expires_at_epoch_ms: i64, client_ip: Option<IpAddr>) -> String {
    match client_ip {
        Some(ip) => format!("{subject_id}|{expires_at_epoch_ms}|{ip}"),
        None => format!("{subject_id}|{expires_at_epoch_ms}"),
    }
}
