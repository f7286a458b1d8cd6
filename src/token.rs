//! Stateless signed access tokens.
//!
//! A token is `<issued_ms>.<expires_ms>.<signature>` where the signature is
//! the hex HMAC-SHA256 of `<issued_ms>.<expires_ms>` under a secret held for
//! the process lifetime. Nothing is stored server-side: validity is
//! recomputed from the secret and the token's own fields.
//!
//! Tokens are presented as `?token=` on the WebSocket upgrade (browsers can't
//! set headers on WebSocket upgrades) and optionally inside the `auth` message.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use tracing::warn;

use crate::util::now_ms;

type HmacSha256 = Hmac<Sha256>;

const DELIMITER: char = '.';

/// Mints and validates tokens. Immutable after construction; share via `Arc`.
pub struct TokenService {
    secret: Vec<u8>,
    ttl_ms: u64,
}

impl TokenService {
    /// Build a service from a configured secret, or generate a random one.
    ///
    /// A generated secret is logged: it cannot be recovered later and is the
    /// only way to mint tokens that this process will accept.
    pub fn new(secret: Option<&str>, ttl_secs: u64) -> Self {
        let secret = match secret {
            Some(s) => s.as_bytes().to_vec(),
            None => {
                let generated = generate_secret();
                warn!(
                    "No auth secret configured, generated one for this process: {generated} \
                     (set TERMGATE_SECRET to keep tokens valid across restarts)"
                );
                generated.into_bytes()
            }
        };
        Self {
            secret,
            ttl_ms: ttl_secs.saturating_mul(1000),
        }
    }

    /// Mint a token valid from now for the configured TTL.
    /// Returns `(token, expires_at_ms)`.
    pub fn issue(&self) -> (String, u64) {
        self.issue_at(now_ms())
    }

    /// Mint a token as if the current time were `now_ms`.
    pub fn issue_at(&self, now_ms: u64) -> (String, u64) {
        let expires_at = now_ms.saturating_add(self.ttl_ms);
        let payload = format!("{now_ms}{DELIMITER}{expires_at}");
        let signature = self.sign(&payload);
        (format!("{payload}{DELIMITER}{signature}"), expires_at)
    }

    /// Whether `token` carries a valid signature and has not expired.
    pub fn validate(&self, token: &str) -> bool {
        self.validate_at(token, now_ms())
    }

    /// Validate as if the current time were `now_ms`. Expiry is inclusive:
    /// a token is still valid at exactly `expires_at`.
    ///
    /// Any parse failure is simply "invalid".
    pub fn validate_at(&self, token: &str, now_ms: u64) -> bool {
        let fields: Vec<&str> = token.split(DELIMITER).collect();
        let [issued, expires, signature] = fields.as_slice() else {
            return false;
        };
        let (Ok(issued), Ok(expires)) = (issued.parse::<u64>(), expires.parse::<u64>()) else {
            return false;
        };
        let expected = self.sign(&format!("{issued}{DELIMITER}{expires}"));
        if !constant_time_eq(expected.as_bytes(), signature.as_bytes()) {
            return false;
        }
        now_ms <= expires
    }

    fn sign(&self, payload: &str) -> String {
        // HMAC accepts keys of any length, so this cannot fail.
        let mut mac = match HmacSha256::new_from_slice(&self.secret) {
            Ok(mac) => mac,
            Err(_) => return String::new(),
        };
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Compare a presented hex signature with the one we computed.
///
/// Every byte of `expected` is visited whatever `provided` looks like, and
/// mismatches are OR-ed together rather than returned early, so response time
/// does not reveal how long a correct prefix a forged token has.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, e) in expected.iter().enumerate() {
        diff |= e ^ provided.get(i).copied().unwrap_or(0xff);
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: u64 = 1_700_000_000_000;

    fn service() -> TokenService {
        TokenService::new(Some("test-secret"), 60)
    }

    #[test]
    fn test_fresh_token_is_valid() {
        let svc = service();
        let (token, expires) = svc.issue_at(T0);
        assert_eq!(expires, T0 + 60_000);
        assert!(svc.validate_at(&token, T0));
    }

    #[test]
    fn test_expiry_boundary_is_inclusive() {
        let svc = service();
        let (token, expires) = svc.issue_at(T0);
        assert!(svc.validate_at(&token, expires));
        assert!(!svc.validate_at(&token, expires + 1));
        assert!(!svc.validate_at(&token, T0 + 61_000));
    }

    #[test]
    fn test_any_single_character_change_invalidates() {
        let svc = service();
        let (token, _) = svc.issue_at(T0);
        for (i, c) in token.char_indices() {
            let replacement = if c == '0' { '1' } else { '0' };
            let mut tampered = token.clone();
            tampered.replace_range(i..=i, &replacement.to_string());
            assert!(
                !svc.validate_at(&tampered, T0),
                "tampered token at {i} still valid: {tampered}"
            );
        }
    }

    #[test]
    fn test_wrong_field_count_is_invalid() {
        let svc = service();
        let (token, _) = svc.issue_at(T0);
        assert!(!svc.validate_at("", T0));
        assert!(!svc.validate_at("1.2", T0));
        assert!(!svc.validate_at(&format!("{token}.extra"), T0));
        assert!(!svc.validate_at("a.b.c", T0));
    }

    #[test]
    fn test_other_secret_rejects() {
        let (token, _) = service().issue_at(T0);
        let other = TokenService::new(Some("another-secret"), 60);
        assert!(!other.validate_at(&token, T0));
    }

    #[test]
    fn test_generated_secret_round_trips_within_process() {
        let svc = TokenService::new(None, 60);
        let (token, _) = svc.issue();
        assert!(svc.validate(&token));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(!constant_time_eq(b"abc", b""));
    }

    #[test]
    fn test_signature_prefix_is_not_enough() {
        let svc = service();
        let (token, _) = svc.issue_at(T0);
        let truncated = &token[..token.len() - 1];
        assert!(!svc.validate_at(truncated, T0));
        let padded = format!("{token}0");
        assert!(!svc.validate_at(&padded, T0));
    }
}
