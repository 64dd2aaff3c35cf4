//! Single-use reconnect tokens.
//!
//! Only SHA-256 digests of issued tokens are stored. A token is handed to the
//! client while it is attached, armed when the client disconnects (its TTL
//! starts then), and spent by the first redemption attempt whether or not
//! that attempt succeeds.

use std::{
    collections::HashMap,
    fmt,
    time::{Duration, Instant},
};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};

use crate::session::SessionId;

const TOKEN_BYTES: usize = 32;

type TokenDigest = [u8; 32];

/// Reconnect credential as handed to the client. `Debug` never prints it.
#[derive(Clone, PartialEq, Eq)]
pub struct ReconnectToken(String);

impl ReconnectToken {
    fn generate() -> Self {
        let mut bytes = [0u8; TOKEN_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self(URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Debug for ReconnectToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ReconnectToken([redacted])")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("reconnect token does not match the session")]
    Mismatch,

    #[error("reconnect token was already used")]
    AlreadyUsed,

    #[error("reconnect token expired")]
    Expired,
}

#[derive(Debug, Clone, Copy)]
enum TokenState {
    /// Delivered to an attached client, not yet armed.
    Pending,
    Armed { since: Instant },
    Spent { at: Instant },
}

#[derive(Debug)]
struct TokenRecord {
    session_id: SessionId,
    state: TokenState,
}

#[derive(Debug)]
pub struct TokenIssuer {
    ttl: Duration,
    records: HashMap<TokenDigest, TokenRecord>,
    /// The single unspent token of each session.
    current: HashMap<SessionId, TokenDigest>,
}

fn digest(token: &str) -> TokenDigest {
    Sha256::digest(token.as_bytes()).into()
}

impl TokenIssuer {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            records: HashMap::new(),
            current: HashMap::new(),
        }
    }

    /// Mints a new token for `session_id`. Any unspent token the session
    /// still had is forgotten, so presenting it later is a mismatch.
    pub fn issue(&mut self, session_id: SessionId) -> ReconnectToken {
        let token = ReconnectToken::generate();
        let key = digest(token.as_str());
        if let Some(previous) = self.current.insert(session_id, key) {
            self.records.remove(&previous);
        }
        self.records.insert(
            key,
            TokenRecord {
                session_id,
                state: TokenState::Pending,
            },
        );
        token
    }

    /// Starts the TTL of the session's current token.
    pub fn arm(&mut self, session_id: SessionId, now: Instant) -> bool {
        let Some(key) = self.current.get(&session_id) else {
            return false;
        };
        match self.records.get_mut(key) {
            Some(record) => {
                if matches!(record.state, TokenState::Pending) {
                    record.state = TokenState::Armed { since: now };
                }
                true
            }
            None => false,
        }
    }

    /// Spends `presented`. Every call that finds the token spends it, so a
    /// second attempt always reports [`TokenError::AlreadyUsed`].
    pub fn redeem(
        &mut self,
        session_id: SessionId,
        presented: &str,
        now: Instant,
    ) -> Result<(), TokenError> {
        let key = digest(presented);
        let Some(record) = self.records.get_mut(&key) else {
            return Err(TokenError::Mismatch);
        };

        let previous = record.state;
        let owner = record.session_id;
        if matches!(previous, TokenState::Spent { .. }) {
            return Err(TokenError::AlreadyUsed);
        }

        record.state = TokenState::Spent { at: now };
        if self.current.get(&owner) == Some(&key) {
            self.current.remove(&owner);
        }

        if owner != session_id {
            return Err(TokenError::Mismatch);
        }
        match previous {
            TokenState::Armed { since } if now.saturating_duration_since(since) > self.ttl => {
                Err(TokenError::Expired)
            }
            _ => Ok(()),
        }
    }

    /// Forgets every token of a destroyed session.
    pub fn revoke(&mut self, session_id: SessionId) {
        self.current.remove(&session_id);
        self.records.retain(|_, record| record.session_id != session_id);
    }

    /// Drops spent and expired records older than the TTL.
    pub fn prune(&mut self, now: Instant) -> usize {
        let ttl = self.ttl;
        let before = self.records.len();
        self.records.retain(|_, record| match record.state {
            TokenState::Pending => true,
            TokenState::Armed { since } => now.saturating_duration_since(since) <= ttl,
            TokenState::Spent { at } => now.saturating_duration_since(at) <= ttl,
        });
        let records = &self.records;
        self.current.retain(|_, key| records.contains_key(key));
        before - self.records.len()
    }

    /// Number of unspent tokens.
    pub fn outstanding(&self) -> usize {
        self.current.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    const TTL: Duration = Duration::from_secs(60);

    #[test]
    fn test_tokens_are_random_and_url_safe() {
        let mut issuer = TokenIssuer::new(TTL);
        let a = issuer.issue(Uuid::new_v4());
        let b = issuer.issue(Uuid::new_v4());

        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 43);
        assert!(a
            .as_str()
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn test_debug_is_redacted() {
        let mut issuer = TokenIssuer::new(TTL);
        let token = issuer.issue(Uuid::new_v4());
        let debug = format!("{:?}", token);
        assert!(!debug.contains(token.as_str()));
    }

    #[test]
    fn test_redeem_once() {
        let mut issuer = TokenIssuer::new(TTL);
        let id = Uuid::new_v4();
        let token = issuer.issue(id);
        let now = Instant::now();
        issuer.arm(id, now);

        assert_eq!(issuer.redeem(id, token.as_str(), now), Ok(()));
        assert_eq!(
            issuer.redeem(id, token.as_str(), now),
            Err(TokenError::AlreadyUsed)
        );
        assert_eq!(issuer.outstanding(), 0);
    }

    #[test]
    fn test_failed_redeem_still_spends_token() {
        let mut issuer = TokenIssuer::new(TTL);
        let id = Uuid::new_v4();
        let other = Uuid::new_v4();
        let token = issuer.issue(id);

        assert_eq!(
            issuer.redeem(other, token.as_str(), Instant::now()),
            Err(TokenError::Mismatch)
        );
        assert_eq!(
            issuer.redeem(id, token.as_str(), Instant::now()),
            Err(TokenError::AlreadyUsed)
        );
    }

    #[test]
    fn test_unknown_token_is_mismatch() {
        let mut issuer = TokenIssuer::new(TTL);
        let id = Uuid::new_v4();
        issuer.issue(id);
        assert_eq!(
            issuer.redeem(id, "not-a-token", Instant::now()),
            Err(TokenError::Mismatch)
        );
    }

    #[test]
    fn test_expired_after_ttl() {
        let mut issuer = TokenIssuer::new(TTL);
        let id = Uuid::new_v4();
        let token = issuer.issue(id);
        let armed_at = Instant::now();
        issuer.arm(id, armed_at);

        let later = armed_at + TTL + Duration::from_secs(1);
        assert_eq!(
            issuer.redeem(id, token.as_str(), later),
            Err(TokenError::Expired)
        );
        assert_eq!(
            issuer.redeem(id, token.as_str(), later),
            Err(TokenError::AlreadyUsed)
        );
    }

    #[test]
    fn test_pending_token_does_not_expire() {
        let mut issuer = TokenIssuer::new(TTL);
        let id = Uuid::new_v4();
        let token = issuer.issue(id);
        let later = Instant::now() + TTL * 10;
        assert_eq!(issuer.redeem(id, token.as_str(), later), Ok(()));
    }

    #[test]
    fn test_reissue_replaces_unspent_token() {
        let mut issuer = TokenIssuer::new(TTL);
        let id = Uuid::new_v4();
        let old = issuer.issue(id);
        let new = issuer.issue(id);

        assert_eq!(issuer.outstanding(), 1);
        assert_eq!(
            issuer.redeem(id, old.as_str(), Instant::now()),
            Err(TokenError::Mismatch)
        );
        assert_eq!(issuer.redeem(id, new.as_str(), Instant::now()), Ok(()));
    }

    #[test]
    fn test_revoke_forgets_session() {
        let mut issuer = TokenIssuer::new(TTL);
        let id = Uuid::new_v4();
        let token = issuer.issue(id);
        issuer.revoke(id);

        assert_eq!(issuer.outstanding(), 0);
        assert_eq!(
            issuer.redeem(id, token.as_str(), Instant::now()),
            Err(TokenError::Mismatch)
        );
    }

    #[test]
    fn test_prune_drops_old_spent_records() {
        let mut issuer = TokenIssuer::new(TTL);
        let id = Uuid::new_v4();
        let token = issuer.issue(id);
        let now = Instant::now();
        issuer.redeem(id, token.as_str(), now).unwrap();

        assert_eq!(issuer.prune(now), 0);
        assert_eq!(issuer.prune(now + TTL + Duration::from_secs(1)), 1);
    }
}
