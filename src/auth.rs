//! Auth & Pairing (spec §4.10): bearer-token verification and one-time
//! pairing codes for binding a new surface identity to a user.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio::sync::RwLock;

use crate::error::AuthError;
use crate::events::{EventBus, GatewayEvent};
use crate::types::PairingCode;

const PAIRING_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz23456789";
const PAIRING_CODE_LENGTH: usize = 8;
const USED_CODE_TTL: ChronoDuration = ChronoDuration::hours(24);

/// Hash a raw bearer token to its hex-encoded SHA-256 digest, the form
/// stored in `gateway.toml`'s `token_hashes` and compared against on
/// every request.
pub fn hash_token(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    hex_encode(&digest)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Compare a raw token against the configured set of accepted hashes in
/// constant time, so a caller cannot learn anything about which hash (if
/// any) was close to matching.
fn token_is_authorized(token: &str, accepted_hashes: &[String]) -> bool {
    let candidate = hash_token(token);
    accepted_hashes
        .iter()
        .any(|accepted| candidate.as_bytes().ct_eq(accepted.as_bytes()).into())
}

/// Legacy path for `allow_legacy_tokens`: compare the raw token directly
/// against each configured entry, in constant time.
fn token_matches_plaintext(token: &str, accepted_hashes: &[String]) -> bool {
    accepted_hashes
        .iter()
        .any(|accepted| token.as_bytes().ct_eq(accepted.as_bytes()).into())
}

struct UsedEntry {
    expires_at: DateTime<Utc>,
}

/// Token verification plus the pairing-code issue/consume workflow.
#[derive(Clone)]
pub struct AuthManager {
    accepted_hashes: Arc<Vec<String>>,
    allow_legacy_tokens: bool,
    pending_codes: Arc<RwLock<HashMap<String, PairingCode>>>,
    used_codes: Arc<RwLock<HashMap<String, UsedEntry>>>,
    bus: EventBus,
}

impl AuthManager {
    /// Build a manager that accepts tokens hashing to one of `accepted_hashes`.
    ///
    /// When `allow_legacy_tokens` is set, a raw token is also accepted if it
    /// matches one of `accepted_hashes` byte-for-byte, so operators can seed
    /// `gateway.toml` with a plaintext token instead of a precomputed hash
    /// (spec §6: `allow_legacy_tokens` opt-in).
    pub fn new(accepted_hashes: Vec<String>, allow_legacy_tokens: bool, bus: EventBus) -> Self {
        Self {
            accepted_hashes: Arc::new(accepted_hashes),
            allow_legacy_tokens,
            pending_codes: Arc::new(RwLock::new(HashMap::new())),
            used_codes: Arc::new(RwLock::new(HashMap::new())),
            bus,
        }
    }

    /// Verify a bearer token presented on `connect` (spec §4.1, §4.10).
    pub fn verify_token(&self, token: &str) -> Result<(), AuthError> {
        let authorized = token_is_authorized(token, &self.accepted_hashes)
            || (self.allow_legacy_tokens && token_matches_plaintext(token, &self.accepted_hashes));
        if authorized {
            Ok(())
        } else {
            self.bus.publish(GatewayEvent::AuthFailed {
                principal: "unknown".to_string(),
            });
            Err(AuthError::InvalidToken)
        }
    }

    /// Generate an 8-character base62-ish pairing code for `user_id`,
    /// valid for `ttl`.
    pub async fn issue_pairing_code(&self, user_id: &str, ttl: std::time::Duration) -> PairingCode {
        let code = generate_pairing_code();
        let now = Utc::now();
        let expires_at = now
            + ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::minutes(10));
        let pairing = PairingCode {
            code: code.clone(),
            user_id: user_id.to_string(),
            created_at: now,
            expires_at,
            approved: false,
        };
        self.pending_codes
            .write()
            .await
            .insert(code, pairing.clone());
        pairing
    }

    /// Consume a pairing code, binding the calling surface to its user.
    /// Single-use: a replayed code, even before expiry, is rejected
    /// (spec §4.10 replay guard).
    pub async fn approve_pairing_code(&self, code: &str) -> Result<String, AuthError> {
        self.gc_used().await;

        if self.used_codes.read().await.contains_key(code) {
            return Err(AuthError::InvalidPairingCode);
        }

        let mut pending = self.pending_codes.write().await;
        let Some(pairing) = pending.remove(code) else {
            return Err(AuthError::InvalidPairingCode);
        };
        if pairing.expires_at <= Utc::now() {
            return Err(AuthError::InvalidPairingCode);
        }

        self.used_codes.write().await.insert(
            code.to_string(),
            UsedEntry {
                expires_at: Utc::now() + USED_CODE_TTL,
            },
        );

        self.bus.publish(GatewayEvent::PairingApproved {
            user_id: pairing.user_id.clone(),
        });
        Ok(pairing.user_id)
    }

    async fn gc_used(&self) {
        let now = Utc::now();
        self.used_codes.write().await.retain(|_, entry| entry.expires_at > now);
    }
}

fn generate_pairing_code() -> String {
    let mut rng = rand::thread_rng();
    (0..PAIRING_CODE_LENGTH)
        .map(|_| {
            let idx = rng.gen_range(0..PAIRING_CODE_ALPHABET.len());
            PAIRING_CODE_ALPHABET[idx] as char
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_token_is_stable() {
        assert_eq!(hash_token("secret"), hash_token("secret"));
        assert_ne!(hash_token("secret"), hash_token("other"));
    }

    #[test]
    fn verify_token_accepts_known_hash() {
        let hash = hash_token("secret");
        let auth = AuthManager::new(vec![hash], false, EventBus::new());
        assert!(auth.verify_token("secret").is_ok());
        assert!(auth.verify_token("wrong").is_err());
    }

    #[test]
    fn legacy_plaintext_token_accepted_only_when_enabled() {
        let auth = AuthManager::new(vec!["plain-token".to_string()], false, EventBus::new());
        assert!(auth.verify_token("plain-token").is_err());

        let legacy = AuthManager::new(vec!["plain-token".to_string()], true, EventBus::new());
        assert!(legacy.verify_token("plain-token").is_ok());
        assert!(legacy.verify_token("someone-else").is_err());
    }

    #[tokio::test]
    async fn pairing_code_round_trips_once() {
        let auth = AuthManager::new(vec![], false, EventBus::new());
        let pairing = auth
            .issue_pairing_code("user-1", std::time::Duration::from_secs(600))
            .await;

        let user_id = auth.approve_pairing_code(&pairing.code).await.unwrap();
        assert_eq!(user_id, "user-1");

        let replay = auth.approve_pairing_code(&pairing.code).await;
        assert!(matches!(replay, Err(AuthError::InvalidPairingCode)));
    }

    #[tokio::test]
    async fn unknown_code_is_rejected() {
        let auth = AuthManager::new(vec![], false, EventBus::new());
        let err = auth.approve_pairing_code("NOPE0000").await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidPairingCode));
    }

    #[tokio::test]
    async fn expired_code_is_rejected() {
        let auth = AuthManager::new(vec![], false, EventBus::new());
        let pairing = auth
            .issue_pairing_code("user-1", std::time::Duration::from_millis(1))
            .await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let err = auth.approve_pairing_code(&pairing.code).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidPairingCode));
    }
}
