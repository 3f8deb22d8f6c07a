use crate::domain::money::Amount;
use crate::domain::product::{Product, ProductId};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub type SessionId = Uuid;
pub type UserId = u64;

/// Alphabet for shareable session codes. Drops 0/O and 1/I so codes survive
/// being read aloud or retyped from a chat message.
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const CODE_LEN: usize = 6;

/// Opaque shareable code identifying a session to joiners.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionCode(String);

impl SessionCode {
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let code = (0..CODE_LEN)
            .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
            .collect();
        Self(code)
    }

    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    /// Accepting joins.
    Active,
    /// Reached capacity; waiting for the draw to be finalized.
    Filling,
    /// Drawn and settled (or settling). Terminal.
    Success,
    /// Expired before filling; participants refunded. Terminal.
    Timeout,
    /// Administratively cancelled while empty. Terminal.
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Success | SessionStatus::Timeout | SessionStatus::Cancelled
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Active => "ACTIVE",
            SessionStatus::Filling => "FILLING",
            SessionStatus::Success => "SUCCESS",
            SessionStatus::Timeout => "TIMEOUT",
            SessionStatus::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// One group-buy attempt for a product. Never deleted; terminal sessions are
/// retained as audit records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub product_id: ProductId,
    pub code: SessionCode,
    pub status: SessionStatus,
    /// Snapshot of `product.group_size` at creation. Never changes.
    pub capacity: u32,
    pub participant_count: u32,
    /// Snapshot of `product.price_per_person` at creation.
    pub price_per_person: Amount,
    pub created_at: i64,
    pub expires_at: i64,
}

impl Session {
    pub fn new(product: &Product, code: SessionCode, now_millis: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            product_id: product.id,
            code,
            status: SessionStatus::Active,
            capacity: product.group_size,
            participant_count: 0,
            price_per_person: product.price_per_person,
            created_at: now_millis,
            expires_at: now_millis + product.timeout_millis,
        }
    }

    pub fn is_expired(&self, now_millis: i64) -> bool {
        now_millis >= self.expires_at
    }

    pub fn is_full(&self) -> bool {
        self.participant_count >= self.capacity
    }
}
