use crate::domain::money::Amount;
use crate::domain::session::{SessionId, UserId};
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParticipantStatus {
    /// Admitted and paid; outcome not yet settled.
    Pending,
    Won,
    /// Draw decided against this participant; refund not yet confirmed.
    Lost,
    Refunded,
}

impl ParticipantStatus {
    /// Settlement is complete for this row, nothing left to apply.
    pub fn is_settled(&self) -> bool {
        matches!(self, ParticipantStatus::Won | ParticipantStatus::Refunded)
    }
}

/// One user's admitted slot (order) within a session. `position` and
/// `join_timestamp` are assigned at admission and immutable afterwards: they
/// are the only inputs to the draw, which is what keeps it auditable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: Uuid,
    pub session_id: SessionId,
    pub user_id: UserId,
    pub order_number: String,
    /// 0-based join order, dense and gapless within the session.
    pub position: u32,
    /// Server-assigned epoch millis at admission.
    pub join_timestamp: i64,
    pub status: ParticipantStatus,
    pub amount: Amount,
    pub debit_operation_key: String,
    /// Present only on the winning participant after settlement.
    pub pickup_code: Option<String>,
}

/// Admission payload handed to the store; the store assigns `position` under
/// the session's serialization guard. `id` is the admission attempt id and
/// becomes the participant row id on success.
#[derive(Debug, Clone)]
pub struct NewParticipant {
    pub id: Uuid,
    pub user_id: UserId,
    pub join_timestamp: i64,
    pub amount: Amount,
    pub order_number: String,
    pub debit_operation_key: String,
}

/// Stable idempotency key for a collaborator side effect. Retries after a
/// partial failure replay the same key and are absorbed by the ledger.
pub fn operation_key(session_id: SessionId, user_id: UserId, action: &str) -> String {
    format!("{session_id}:{user_id}:{action}")
}

/// Debit key for one admission attempt. Keyed per attempt, not per user:
/// once an attempt's debit has been reversed its key must never absorb a
/// later attempt's debit as an idempotent replay.
pub fn join_debit_key(session_id: SessionId, user_id: UserId, attempt_id: Uuid) -> String {
    format!("{session_id}:{user_id}:join:{attempt_id}")
}

/// Compensating credit key paired with [`join_debit_key`] for the same
/// attempt.
pub fn join_reversal_key(session_id: SessionId, user_id: UserId, attempt_id: Uuid) -> String {
    format!("{session_id}:{user_id}:join-reversal:{attempt_id}")
}

const ORDER_PREFIX: &str = "GB";
const BASE36: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Human-readable order number: `GB` + base36 millis + 6 random chars.
pub fn order_number(now_millis: i64) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..6)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect();
    format!("{}{}{}", ORDER_PREFIX, to_base36(now_millis.max(0) as u64), suffix)
}

fn to_base36(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while value > 0 {
        digits.push(BASE36[(value % 36) as usize]);
        value /= 36;
    }
    digits.reverse();
    String::from_utf8(digits).unwrap_or_default()
}
