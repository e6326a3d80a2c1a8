//! Short-lived signed tokens at the service boundary.
//!
//! Identity resolution happens outside this system; whatever fronts it
//! exchanges a verified identity for one of these tokens, and the router
//! then only ever checks signatures. The signing secret is a single
//! process-wide file minted on first use, so every worker process sharing
//! a storage root honors the same tokens.
//!
//! Token shape: `<principal>:<expiry-unix-seconds>:<hex hmac>`, with the
//! principal percent-encoded so the separators stay unambiguous. Tokens
//! past their half-life validate successfully but come back with a
//! replacement, which the router hands to the client in
//! `X-Set-Authorization`.

use std::io;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use snafu::Snafu;

use logring_store::{encode_segment, read_unique};

const SECRET_FILE: &str = "token_secret.txt";
const SECRET_LEN: usize = 20;

type HmacSha256 = Hmac<Sha256>;

/// Error raised when a token fails validation.
#[derive(Debug, Snafu)]
pub enum AuthError {
    #[snafu(display("token is malformed"))]
    Malformed,

    #[snafu(display("token signature does not verify"))]
    BadSignature,

    #[snafu(display("token expired"))]
    Expired,
}

/// A validated token: who it names, and a replacement if it was due for
/// renewal.
#[derive(Debug)]
pub struct Verified {
    pub principal: String,
    pub refreshed: Option<String>,
}

/// Mints and validates signed tokens against the process-wide secret.
pub struct TokenAuth {
    secret: Vec<u8>,
    ttl: Duration,
}

impl TokenAuth {
    /// Opens the signer, minting the secret file under `root` on first
    /// use.
    pub fn open(root: &Path, ttl: Duration) -> io::Result<TokenAuth> {
        let secret = read_unique(&root.join(SECRET_FILE), || {
            let mut secret = vec![0u8; SECRET_LEN];
            rand::rng().fill_bytes(&mut secret);
            secret
        })?;
        Ok(TokenAuth { secret, ttl })
    }

    /// Mints a token for `principal`, valid for the configured lifetime.
    pub fn mint(&self, principal: &str) -> String {
        self.mint_at(principal, now_secs() + self.ttl.as_secs())
    }

    fn mint_at(&self, principal: &str, expiry: u64) -> String {
        let body = format!("{}:{}", encode_segment(principal), expiry);
        format!("{}:{}", body, hex(&self.sign(&body)))
    }

    /// Checks a token, returning the principal and a refreshed token when
    /// the presented one is past its half-life.
    pub fn validate(&self, token: &str) -> Result<Verified, AuthError> {
        let mut parts = token.split(':');
        let (principal, expiry, signature) =
            match (parts.next(), parts.next(), parts.next(), parts.next()) {
                (Some(p), Some(e), Some(s), None) => (p, e, s),
                _ => return MalformedSnafu.fail(),
            };
        let expiry: u64 = expiry.parse().map_err(|_| AuthError::Malformed)?;
        let signature = unhex(signature).ok_or(AuthError::Malformed)?;

        let body = format!("{principal}:{expiry}");
        let mut mac = self.mac();
        mac.update(body.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| AuthError::BadSignature)?;

        let now = now_secs();
        if expiry <= now {
            return ExpiredSnafu.fail();
        }

        let principal = percent_encoding::percent_decode_str(principal)
            .decode_utf8_lossy()
            .into_owned();
        let refreshed = (expiry - now < self.ttl.as_secs() / 2).then(|| self.mint(&principal));
        Ok(Verified {
            principal,
            refreshed,
        })
    }

    fn mac(&self) -> HmacSha256 {
        HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts keys of any length")
    }

    fn sign(&self, body: &str) -> Vec<u8> {
        let mut mac = self.mac();
        mac.update(body.as_bytes());
        mac.finalize().into_bytes().to_vec()
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        write!(out, "{byte:02x}").expect("writing to a String cannot fail");
    }
    out
}

fn unhex(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&text[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer(ttl: Duration) -> (tempfile::TempDir, TokenAuth) {
        let dir = tempfile::tempdir().unwrap();
        let auth = TokenAuth::open(dir.path(), ttl).unwrap();
        (dir, auth)
    }

    #[test]
    fn mint_validate_round_trip() {
        let (_dir, auth) = signer(Duration::from_secs(3600));
        let token = auth.mint("someone@example.com");
        let verified = auth.validate(&token).unwrap();
        assert_eq!(verified.principal, "someone@example.com");
        assert!(verified.refreshed.is_none());
    }

    #[test]
    fn secret_is_shared_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let a = TokenAuth::open(dir.path(), Duration::from_secs(3600)).unwrap();
        let b = TokenAuth::open(dir.path(), Duration::from_secs(3600)).unwrap();
        let token = a.mint("user");
        assert!(b.validate(&token).is_ok());
    }

    #[test]
    fn tampering_is_detected() {
        let (_dir, auth) = signer(Duration::from_secs(3600));
        let token = auth.mint("someone");
        let tampered = token.replacen("someone", "someone2", 1);
        assert!(matches!(
            auth.validate(&tampered).unwrap_err(),
            AuthError::BadSignature
        ));
        assert!(matches!(
            auth.validate("garbage").unwrap_err(),
            AuthError::Malformed
        ));
    }

    #[test]
    fn expired_tokens_are_rejected() {
        let (_dir, auth) = signer(Duration::from_secs(3600));
        let token = auth.mint_at("someone", now_secs().saturating_sub(10));
        assert!(matches!(
            auth.validate(&token).unwrap_err(),
            AuthError::Expired
        ));
    }

    #[test]
    fn tokens_past_half_life_are_refreshed() {
        let (_dir, auth) = signer(Duration::from_secs(3600));
        // Expires in 100 seconds, well under half of the hour lifetime.
        let token = auth.mint_at("someone", now_secs() + 100);
        let verified = auth.validate(&token).unwrap();
        let refreshed = verified.refreshed.expect("should refresh");
        assert!(auth.validate(&refreshed).unwrap().refreshed.is_none());
    }

    #[test]
    fn principal_with_separator_survives() {
        let (_dir, auth) = signer(Duration::from_secs(3600));
        let token = auth.mint("odd:name:with:colons");
        assert_eq!(
            auth.validate(&token).unwrap().principal,
            "odd:name:with:colons"
        );
    }
}
