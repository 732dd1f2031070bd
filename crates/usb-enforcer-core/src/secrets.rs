//! Passphrase handles and the single-use token table.
//!
//! A passphrase enters through the secrets channel, is parked here behind a
//! random token id, and leaves exactly once when a Remote API request redeems
//! the token. Every copy lives in a [`Zeroizing`] buffer so the bytes are
//! overwritten on drop, whichever way the handle goes away.

use crate::error::TokenError;
use crate::operation::OperationKind;
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};
use zeroize::{Zeroize, Zeroizing};

const TOKEN_ID_BYTES: usize = 32;

/// Owned secret bytes, scrubbed when dropped.
pub struct SecretBytes(Zeroizing<Vec<u8>>);

impl SecretBytes {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(Zeroizing::new(bytes))
    }

    pub fn expose(&self) -> &[u8] {
        &self.0
    }

    /// Length in characters when the bytes are UTF-8, bytes otherwise.
    pub fn char_len(&self) -> usize {
        std::str::from_utf8(&self.0)
            .map(|s| s.chars().count())
            .unwrap_or(self.0.len())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&[u8]> for SecretBytes {
    fn from(value: &[u8]) -> Self {
        Self::new(value.to_vec())
    }
}

impl fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretBytes(<redacted {} bytes>)", self.0.len())
    }
}

enum Slot {
    Pending(SecretBytes),
    /// Tombstone kept until the deadline so replays report `Consumed`.
    Consumed,
}

struct Token {
    device: String,
    kind: OperationKind,
    created_at: Instant,
    ttl: Duration,
    slot: Slot,
}

impl Token {
    fn expired_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) >= self.ttl
    }
}

/// Lock-free on its own; callers guard it with the context's token mutex.
#[derive(Default)]
pub struct TokenTable {
    tokens: HashMap<String, Token>,
}

impl TokenTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park `secret` for `device`/`kind` and return the new token id.
    pub fn issue(
        &mut self,
        device: &str,
        kind: OperationKind,
        secret: SecretBytes,
        ttl: Duration,
    ) -> String {
        self.issue_at(device, kind, secret, ttl, Instant::now())
    }

    pub fn issue_at(
        &mut self,
        device: &str,
        kind: OperationKind,
        secret: SecretBytes,
        ttl: Duration,
        now: Instant,
    ) -> String {
        let id = loop {
            let candidate = generate_token_id();
            if !self.tokens.contains_key(&candidate) {
                break candidate;
            }
        };
        self.tokens.insert(
            id.clone(),
            Token {
                device: device.to_string(),
                kind,
                created_at: now,
                ttl,
                slot: Slot::Pending(secret),
            },
        );
        id
    }

    /// Hand out the parked secret once. Mismatches leave the token untouched.
    pub fn redeem(
        &mut self,
        id: &str,
        device: &str,
        kind: OperationKind,
    ) -> Result<SecretBytes, TokenError> {
        self.redeem_at(id, device, kind, Instant::now())
    }

    pub fn redeem_at(
        &mut self,
        id: &str,
        device: &str,
        kind: OperationKind,
        now: Instant,
    ) -> Result<SecretBytes, TokenError> {
        let token = self.tokens.get_mut(id).ok_or(TokenError::NotFound)?;

        if token.expired_at(now) {
            let consumed = matches!(token.slot, Slot::Consumed);
            self.tokens.remove(id);
            return Err(if consumed {
                TokenError::Consumed
            } else {
                TokenError::Expired
            });
        }
        if matches!(token.slot, Slot::Consumed) {
            return Err(TokenError::Consumed);
        }
        if token.device != device {
            return Err(TokenError::DeviceMismatch);
        }
        if token.kind != kind {
            return Err(TokenError::KindMismatch);
        }

        match std::mem::replace(&mut token.slot, Slot::Consumed) {
            Slot::Pending(secret) => Ok(secret),
            Slot::Consumed => Err(TokenError::Consumed),
        }
    }

    /// Drop every entry past its deadline, scrubbing unredeemed secrets.
    pub fn purge_expired(&mut self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    pub fn purge_expired_at(&mut self, now: Instant) -> usize {
        let before = self.tokens.len();
        self.tokens.retain(|_, token| !token.expired_at(now));
        before - self.tokens.len()
    }

    /// Tokens still holding a secret.
    pub fn pending(&self) -> usize {
        self.tokens
            .values()
            .filter(|token| matches!(token.slot, Slot::Pending(_)))
            .count()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

fn generate_token_id() -> String {
    let mut raw = [0u8; TOKEN_ID_BYTES];
    OsRng.fill_bytes(&mut raw);
    let id = hex::encode(raw);
    raw.zeroize();
    id
}
