//! Session credential issuing and verification.
//!
//! A credential is `base64url(claims_json) . base64url(hmac_sha256(claims_json))`.
//! Claims embed the username and admin flag at issuance time; a later
//! role change does not touch already-issued tokens, and there is no
//! revocation list — a token stays valid until natural expiry.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Default credential lifetime: one hour.
pub const DEFAULT_TTL_SECS: i64 = 3600;

/// Claims embedded in a credential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Username the credential was issued to.
    pub sub: String,
    /// Admin flag *at issuance time*.
    pub admin: bool,
    /// Issued-at, unix seconds.
    pub iat: i64,
    /// Expires-at, unix seconds.
    pub exp: i64,
}

/// Why verification failed. Callers surface both variants to clients
/// as the single `invalid_credential` code so the distinction leaks
/// nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CredentialError {
    #[error("malformed credential")]
    Malformed,
    #[error("expired credential")]
    Expired,
}

/// Mints and verifies signed session credentials.
pub struct CredentialIssuer {
    secret: Vec<u8>,
    ttl_secs: i64,
}

impl CredentialIssuer {
    pub fn new(secret: impl Into<Vec<u8>>, ttl_secs: i64) -> Self {
        Self {
            secret: secret.into(),
            ttl_secs,
        }
    }

    /// An issuer with a random per-process secret. Tokens do not
    /// survive a restart; every client falls back to password login.
    pub fn ephemeral(ttl_secs: i64) -> Self {
        let secret: [u8; 32] = rand::random();
        Self::new(secret.to_vec(), ttl_secs)
    }

    fn mac(&self) -> HmacSha256 {
        // HMAC accepts keys of any length; this cannot fail.
        HmacSha256::new_from_slice(&self.secret).expect("HMAC key length")
    }

    /// Issue a credential for `username`, embedding the admin flag.
    pub fn issue(&self, username: &str, is_admin: bool) -> String {
        self.issue_at(username, is_admin, Utc::now().timestamp())
    }

    fn issue_at(&self, username: &str, is_admin: bool, now: i64) -> String {
        let claims = Claims {
            sub: username.to_string(),
            admin: is_admin,
            iat: now,
            exp: now + self.ttl_secs,
        };
        // Claims is a plain struct of strings and ints; serialization
        // cannot fail.
        let payload = serde_json::to_vec(&claims).expect("claims serialize");
        let mut mac = self.mac();
        mac.update(&payload);
        let sig = mac.finalize().into_bytes();
        format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&payload),
            URL_SAFE_NO_PAD.encode(sig)
        )
    }

    /// Verify a credential against the current clock.
    pub fn verify(&self, token: &str) -> Result<Claims, CredentialError> {
        self.verify_at(token, Utc::now().timestamp())
    }

    /// Verify a credential against an explicit clock (for tests).
    pub fn verify_at(&self, token: &str, now: i64) -> Result<Claims, CredentialError> {
        let (payload_b64, sig_b64) = token.split_once('.').ok_or(CredentialError::Malformed)?;
        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| CredentialError::Malformed)?;
        let sig = URL_SAFE_NO_PAD
            .decode(sig_b64)
            .map_err(|_| CredentialError::Malformed)?;

        let mut mac = self.mac();
        mac.update(&payload);
        mac.verify_slice(&sig)
            .map_err(|_| CredentialError::Malformed)?;

        let claims: Claims =
            serde_json::from_slice(&payload).map_err(|_| CredentialError::Malformed)?;
        if claims.exp <= now {
            return Err(CredentialError::Expired);
        }
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issuer() -> CredentialIssuer {
        CredentialIssuer::new(b"test-secret".to_vec(), DEFAULT_TTL_SECS)
    }

    #[test]
    fn roundtrip_before_expiry() {
        let issuer = issuer();
        let token = issuer.issue("alice", true);
        let claims = issuer.verify(&token).unwrap();
        assert_eq!(claims.sub, "alice");
        assert!(claims.admin);
        assert_eq!(claims.exp - claims.iat, DEFAULT_TTL_SECS);
    }

    #[test]
    fn admin_flag_fixed_at_issuance() {
        let issuer = issuer();
        let token = issuer.issue("bob", false);
        assert!(!issuer.verify(&token).unwrap().admin);
    }

    #[test]
    fn rejects_after_expiry() {
        let issuer = issuer();
        let token = issuer.issue_at("alice", false, 1_000_000);
        // Still valid one second before the boundary.
        assert!(issuer.verify_at(&token, 1_000_000 + DEFAULT_TTL_SECS - 1).is_ok());
        // exp is exclusive.
        assert_eq!(
            issuer.verify_at(&token, 1_000_000 + DEFAULT_TTL_SECS),
            Err(CredentialError::Expired)
        );
    }

    #[test]
    fn rejects_garbage_and_missing_signature() {
        let issuer = issuer();
        assert_eq!(issuer.verify("not a token"), Err(CredentialError::Malformed));
        assert_eq!(issuer.verify(""), Err(CredentialError::Malformed));
        assert_eq!(issuer.verify("a.b.c"), Err(CredentialError::Malformed));
    }

    #[test]
    fn rejects_tampered_payload() {
        let issuer = issuer();
        let token = issuer.issue("alice", false);
        let (_, sig) = token.split_once('.').unwrap();
        let forged_claims = br#"{"sub":"alice","admin":true,"iat":0,"exp":99999999999}"#;
        let forged = format!("{}.{sig}", URL_SAFE_NO_PAD.encode(forged_claims));
        assert_eq!(issuer.verify(&forged), Err(CredentialError::Malformed));
    }

    #[test]
    fn rejects_foreign_issuer() {
        let token = issuer().issue("alice", false);
        let other = CredentialIssuer::new(b"other-secret".to_vec(), DEFAULT_TTL_SECS);
        assert_eq!(other.verify(&token), Err(CredentialError::Malformed));
    }
}
