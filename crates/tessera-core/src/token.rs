//! Signed session tokens.
//!
//! Format: `base64url(random) "." unix_seconds "." hex(hmac)`, where the MAC
//! covers the random bytes, the owning user, the bound IP address and the
//! issue time. A token is therefore only valid for the user and address it was
//! minted for, and carries its own age.
//!
//! CSRF tokens are `hex(hmac) "." unix_seconds` over a separate MAC domain,
//! tied to one session token.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use crate::error::TesseraError;

type HmacSha256 = Hmac<Sha256>;

const MIN_RANDOM_BYTES: usize = 16;
const MAX_RANDOM_BYTES: usize = 256;
const SIGNATURE_BYTES: usize = 32;

/// Tokens issued this far in the future are still accepted (clock skew).
const MAX_FUTURE_SKEW_SECS: i64 = 60;

/// Default lifetime of a CSRF token.
pub const CSRF_MAX_AGE_SECS: i64 = 3600;

const CSRF_DOMAIN: &[u8] = b"tessera-csrf-v1";

/// Mints and verifies session tokens. Cheap to share; holds only the keyed MAC.
#[derive(Clone)]
pub struct TokenSigner {
    mac: HmacSha256,
}

impl std::fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSigner").finish_non_exhaustive()
    }
}

impl TokenSigner {
    pub fn new(secret: &[u8]) -> Result<Self, TesseraError> {
        if secret.is_empty() {
            return Err(TesseraError::Config("token secret is empty".to_string()));
        }
        let mac = HmacSha256::new_from_slice(secret)
            .map_err(|e| TesseraError::Config(format!("invalid token secret: {e}")))?;
        Ok(Self { mac })
    }

    /// Mint a token for `user_id` bound to `ip`.
    ///
    /// `byte_len` is clamped to 16..=256 random bytes.
    pub fn new_token(&self, user_id: i32, ip: Option<&str>, byte_len: usize, issued_at: i64) -> String {
        let mut random = vec![0u8; byte_len.clamp(MIN_RANDOM_BYTES, MAX_RANDOM_BYTES)];
        OsRng.fill_bytes(&mut random);

        let signature = self.sign(&random, user_id, ip, issued_at).finalize().into_bytes();
        format!(
            "{}.{}.{}",
            URL_SAFE_NO_PAD.encode(&random),
            issued_at,
            hex::encode(signature)
        )
    }

    /// Check signature, binding and age. Never errors: anything malformed is `false`.
    pub fn verify(
        &self,
        token: &str,
        user_id: i32,
        ip: Option<&str>,
        now: i64,
        max_lifetime_secs: i64,
    ) -> bool {
        let Some(parts) = Parts::parse(token) else {
            return false;
        };
        if parts.issued_at > now.saturating_add(MAX_FUTURE_SKEW_SECS) {
            return false;
        }
        if now.saturating_sub(parts.issued_at) > max_lifetime_secs {
            return false;
        }
        self.sign(&parts.random, user_id, ip, parts.issued_at)
            .verify_slice(&parts.signature)
            .is_ok()
    }

    /// Mint a CSRF token for the session holding `session_token`.
    pub fn csrf_token(&self, session_token: &str, now: i64) -> String {
        let signature = self.sign_csrf(session_token, now).finalize().into_bytes();
        format!("{}.{}", hex::encode(signature), now)
    }

    /// Constant-time check of a CSRF token against `session_token`.
    pub fn verify_csrf(&self, csrf: &str, session_token: &str, now: i64, max_age_secs: i64) -> bool {
        let Some((sig, ts)) = csrf.split_once('.') else {
            return false;
        };
        if ts.is_empty() || ts.len() > 19 || !ts.bytes().all(|b| b.is_ascii_digit()) {
            return false;
        }
        let Ok(issued_at) = ts.parse::<i64>() else {
            return false;
        };
        if issued_at > now.saturating_add(MAX_FUTURE_SKEW_SECS)
            || now.saturating_sub(issued_at) > max_age_secs
        {
            return false;
        }
        let Ok(signature) = hex::decode(sig) else {
            return false;
        };
        if signature.len() != SIGNATURE_BYTES {
            return false;
        }
        self.sign_csrf(session_token, issued_at)
            .verify_slice(&signature)
            .is_ok()
    }

    fn sign_csrf(&self, session_token: &str, issued_at: i64) -> HmacSha256 {
        let mut mac = self.mac.clone();
        mac.update(CSRF_DOMAIN);
        mac.update(&(session_token.len() as u32).to_be_bytes());
        mac.update(session_token.as_bytes());
        mac.update(&issued_at.to_be_bytes());
        mac
    }

    fn sign(&self, random: &[u8], user_id: i32, ip: Option<&str>, issued_at: i64) -> HmacSha256 {
        let ip = ip.unwrap_or("").as_bytes();
        let mut mac = self.mac.clone();
        mac.update(&(random.len() as u32).to_be_bytes());
        mac.update(random);
        mac.update(&user_id.to_be_bytes());
        mac.update(&(ip.len() as u32).to_be_bytes());
        mac.update(ip);
        mac.update(&issued_at.to_be_bytes());
        mac
    }
}

/// Issue time embedded in a well-formed token.
pub fn issued_at(token: &str) -> Option<i64> {
    Parts::parse(token).map(|p| p.issued_at)
}

/// Structural check only; says nothing about the signature.
pub fn is_well_formed(token: &str) -> bool {
    Parts::parse(token).is_some()
}

/// SHA-256 hash a token for safe database storage.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

struct Parts {
    random: Vec<u8>,
    issued_at: i64,
    signature: Vec<u8>,
}

impl Parts {
    fn parse(token: &str) -> Option<Self> {
        // 256 random bytes encode to 342 chars; anything much longer is junk.
        if token.len() > 512 {
            return None;
        }
        let mut split = token.split('.');
        let (random, ts, sig) = (split.next()?, split.next()?, split.next()?);
        if split.next().is_some() {
            return None;
        }

        let random = URL_SAFE_NO_PAD.decode(random).ok()?;
        if !(MIN_RANDOM_BYTES..=MAX_RANDOM_BYTES).contains(&random.len()) {
            return None;
        }
        if ts.is_empty() || !ts.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let issued_at = ts.parse().ok()?;
        let signature = hex::decode(sig).ok()?;
        if signature.len() != SIGNATURE_BYTES {
            return None;
        }

        Some(Self {
            random,
            issued_at,
            signature,
        })
    }
}
