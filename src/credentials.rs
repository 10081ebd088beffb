//! Credential rotation across an ordered ring of signing keys
//!
//! The rotator caches one token at a time. A token is only minted when the
//! cache is empty, and minting always consumes the key under the cursor, so
//! [`CredentialRotator::invalidate`] followed by [`CredentialRotator::token`]
//! moves the link on to the next key. This is how a single revoked key is
//! routed around without operator action.

use crate::clock::Clock;
use crate::config::MAX_TOKEN_TTL_SECS;
use crate::identity::DeviceIdentity;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Signed, time-bounded credential
#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    secret: String,
    issued_at: DateTime<Utc>,
    ttl: Duration,
    key_index: usize,
}

impl Token {
    pub fn as_str(&self) -> &str {
        &self.secret
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::zero());
        self.issued_at + ttl
    }

    /// Ring slot of the key that signed this token
    pub fn key_index(&self) -> usize {
        self.key_index
    }
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Token")
            .field("issued_at", &self.issued_at)
            .field("ttl", &self.ttl)
            .field("key_index", &self.key_index)
            .finish_non_exhaustive()
    }
}

/// Key ring with a rotation cursor and a single cached token
pub struct CredentialRotator {
    keys: Vec<String>,
    cursor: usize,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    token: Option<Token>,
}

impl CredentialRotator {
    pub fn new(keys: Vec<String>, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            keys: normalize_keys(keys),
            cursor: 0,
            ttl: ttl.min(Duration::from_secs(MAX_TOKEN_TTL_SECS)),
            clock,
            token: None,
        }
    }

    /// Current token, minting a fresh one if the cache is empty
    ///
    /// Returns `None` while the clock is unsynchronised (the cursor does not
    /// move) or when the selected key cannot sign (the cursor has moved past it).
    pub fn token(&mut self, identity: &mut dyn DeviceIdentity) -> Option<Token> {
        if let Some(token) = &self.token {
            return Some(token.clone());
        }

        let Some(issued_at) = self.clock.synced_now() else {
            debug!("Clock not synchronised yet, deferring token");
            return None;
        };

        if self.keys.is_empty() {
            warn!("Key ring is empty, cannot sign a token");
            return None;
        }

        let key_index = self.advance();
        debug!(key_index, "Refreshing device token");

        if let Err(e) = identity.set_private_key(&self.keys[key_index]) {
            warn!(key_index, error = %e, "Signing key unusable, skipping it");
            return None;
        }

        match identity.create_jwt(issued_at, self.ttl) {
            Ok(secret) => {
                info!(key_index, ttl_secs = self.ttl.as_secs(), "Device token issued");
                let token = Token {
                    secret,
                    issued_at,
                    ttl: self.ttl,
                    key_index,
                };
                self.token = Some(token.clone());
                Some(token)
            }
            Err(e) => {
                warn!(key_index, error = %e, "Token signing failed");
                None
            }
        }
    }

    /// Drop the cached token so the next request signs with the next key
    pub fn invalidate(&mut self) {
        if self.token.take().is_some() {
            debug!("Device token invalidated");
        }
    }

    /// Replace the ring and restart at slot 0; the cached token is kept
    pub fn set_keys(&mut self, keys: Vec<String>) {
        self.keys = normalize_keys(keys);
        self.cursor = 0;
    }

    /// Return the cursor to slot 0 and forget the cached token
    pub fn reset(&mut self) {
        self.cursor = 0;
        self.token = None;
    }

    /// Slot the next mint will use
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    pub fn cached(&self) -> Option<&Token> {
        self.token.as_ref()
    }

    /// Take the slot under the cursor and move the cursor on, wrapping to 0
    fn advance(&mut self) -> usize {
        if self.cursor >= self.keys.len() {
            self.cursor = 0;
        }
        let selected = self.cursor;
        self.cursor = (self.cursor + 1) % self.keys.len();
        selected
    }
}

fn normalize_keys(keys: Vec<String>) -> Vec<String> {
    keys.into_iter()
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::{ManualClock, MockIdentity};

    fn ring(keys: &[&str]) -> Vec<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    fn rotator(keys: &[&str], clock: &ManualClock) -> CredentialRotator {
        CredentialRotator::new(ring(keys), Duration::from_secs(3600), Arc::new(clock.clone()))
    }

    #[test]
    fn test_token_is_cached() {
        let clock = ManualClock::synced();
        let mut identity = MockIdentity::new("dev");
        let mut rotator = rotator(&["A", "B"], &clock);

        let first = rotator.token(&mut identity).unwrap();
        let second = rotator.token(&mut identity).unwrap();

        assert_eq!(first, second);
        assert_eq!(identity.loaded_keys(), vec!["A"]);
        assert_eq!(rotator.cursor(), 1);
    }

    #[test]
    fn test_unsynced_clock_declines_without_moving_cursor() {
        let clock = ManualClock::unsynced();
        let mut identity = MockIdentity::new("dev");
        let mut rotator = rotator(&["A", "B"], &clock);

        assert!(rotator.token(&mut identity).is_none());
        assert!(rotator.token(&mut identity).is_none());
        assert_eq!(rotator.cursor(), 0);
        assert!(identity.loaded_keys().is_empty());

        clock.sync();
        let token = rotator.token(&mut identity).unwrap();
        assert_eq!(token.key_index(), 0);
    }

    #[test]
    fn test_invalidate_moves_to_next_key_and_wraps() {
        let clock = ManualClock::synced();
        let mut identity = MockIdentity::new("dev");
        let mut rotator = rotator(&["A", "B", "C"], &clock);

        let mut used = Vec::new();
        for _ in 0..4 {
            used.push(rotator.token(&mut identity).unwrap().key_index());
            rotator.invalidate();
        }

        assert_eq!(used, vec![0, 1, 2, 0]);
        assert_eq!(identity.loaded_keys(), vec!["A", "B", "C", "A"]);
    }

    #[test]
    fn test_single_key_ring_reuses_key() {
        let clock = ManualClock::synced();
        let mut identity = MockIdentity::new("dev");
        let mut rotator = rotator(&["A"], &clock);

        rotator.token(&mut identity);
        rotator.invalidate();
        rotator.token(&mut identity);

        assert_eq!(identity.loaded_keys(), vec!["A", "A"]);
        assert_eq!(rotator.cursor(), 0);
    }

    #[test]
    fn test_empty_ring_yields_nothing() {
        let clock = ManualClock::synced();
        let mut identity = MockIdentity::new("dev");
        let mut rotator = rotator(&["", "  "], &clock);

        assert_eq!(rotator.key_count(), 0);
        assert!(rotator.token(&mut identity).is_none());
    }

    #[test]
    fn test_unusable_key_is_skipped_on_next_request() {
        let clock = ManualClock::synced();
        let mut identity = MockIdentity::new("dev").rejecting("A");
        let mut rotator = rotator(&["A", "B"], &clock);

        assert!(rotator.token(&mut identity).is_none());
        let token = rotator.token(&mut identity).unwrap();
        assert_eq!(token.key_index(), 1);
    }

    #[test]
    fn test_set_keys_resets_cursor_and_keeps_token() {
        let clock = ManualClock::synced();
        let mut identity = MockIdentity::new("dev");
        let mut rotator = rotator(&["A", "B", "C"], &clock);

        rotator.token(&mut identity);
        rotator.invalidate();
        rotator.token(&mut identity);
        assert_eq!(rotator.cursor(), 2);

        rotator.set_keys(ring(&["X", "Y"]));
        assert_eq!(rotator.cursor(), 0);
        assert!(rotator.cached().is_some());

        rotator.invalidate();
        rotator.token(&mut identity);
        assert_eq!(identity.loaded_keys().last().map(String::as_str), Some("X"));
    }

    #[test]
    fn test_shrinking_ring_keeps_cursor_in_range() {
        let clock = ManualClock::synced();
        let mut identity = MockIdentity::new("dev");
        let mut rotator = rotator(&["A", "B", "C"], &clock);
        rotator.token(&mut identity);
        rotator.invalidate();
        rotator.token(&mut identity);
        rotator.invalidate();

        // cursor on slot 2; a shorter ring installed without set_keys semantics
        rotator.keys = ring(&["Z"]);
        let token = rotator.token(&mut identity).unwrap();
        assert_eq!(token.key_index(), 0);
    }

    #[test]
    fn test_ttl_capped_at_protocol_ceiling() {
        let clock = ManualClock::synced();
        let mut identity = MockIdentity::new("dev");
        let mut rotator = CredentialRotator::new(
            ring(&["A"]),
            Duration::from_secs(MAX_TOKEN_TTL_SECS * 2),
            Arc::new(clock),
        );

        let token = rotator.token(&mut identity).unwrap();
        assert_eq!(token.ttl(), Duration::from_secs(MAX_TOKEN_TTL_SECS));
        assert_eq!(
            token.expires_at() - token.issued_at(),
            chrono::Duration::hours(24)
        );
    }

    #[test]
    fn test_debug_does_not_leak_secret() {
        let clock = ManualClock::synced();
        let mut identity = MockIdentity::new("dev");
        let mut rotator = rotator(&["A"], &clock);
        let token = rotator.token(&mut identity).unwrap();

        assert!(!format!("{token:?}").contains(token.as_str()));
    }
}
