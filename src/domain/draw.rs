//! The draw: deterministic selection of the winning participant once a
//! session fills.
//!
//! `winning_position = (Σ join_timestamp) mod capacity`. No party can steer
//! the outcome before the group is full because the sum depends on the
//! arrival instant of every future joiner; afterwards anyone holding the
//! participant list can recompute the same result.

use crate::domain::participant::Participant;
use crate::domain::session::{Session, SessionId, UserId};
use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Pickup claim window recorded on the draw result.
pub const CLAIM_WINDOW_MILLIS: i64 = 30 * 24 * 60 * 60 * 1_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrawOutcome {
    pub timestamp_sum: i128,
    pub winning_position: u32,
    pub winner_user_id: UserId,
}

/// One participant's contribution to the draw, embedded in the record so the
/// result stays verifiable without access to the participant table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrawEntry {
    pub position: u32,
    pub user_id: UserId,
    pub join_timestamp: i64,
}

/// The unique per-session draw result. Created exactly once, immutable after
/// creation; a session holds one iff its status is `Success`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrawRecord {
    pub id: Uuid,
    pub session_id: SessionId,
    pub timestamp_sum: i128,
    pub winning_position: u32,
    pub winner_user_id: UserId,
    pub pickup_code: Option<String>,
    pub entries: Vec<DrawEntry>,
    pub created_at: i64,
    pub claim_expires_at: i64,
}

impl DrawRecord {
    pub fn new(
        session: &Session,
        outcome: &DrawOutcome,
        participants: &[Participant],
        now_millis: i64,
    ) -> Self {
        let mut entries: Vec<DrawEntry> = participants
            .iter()
            .map(|p| DrawEntry {
                position: p.position,
                user_id: p.user_id,
                join_timestamp: p.join_timestamp,
            })
            .collect();
        entries.sort_by_key(|e| e.position);

        Self {
            id: Uuid::new_v4(),
            session_id: session.id,
            timestamp_sum: outcome.timestamp_sum,
            winning_position: outcome.winning_position,
            winner_user_id: outcome.winner_user_id,
            pickup_code: None,
            entries,
            created_at: now_millis,
            claim_expires_at: now_millis + CLAIM_WINDOW_MILLIS,
        }
    }
}

/// Pure draw computation over an already committed participant list. No side
/// effects; exactly-once execution is enforced by the store's unique draw
/// record constraint, not by this function.
pub fn compute(session: &Session, participants: &[Participant]) -> Result<DrawOutcome> {
    if participants.len() as u32 != session.capacity {
        return Err(EngineError::InvariantViolation(format!(
            "draw over session {} with {} participants, capacity {}",
            session.id,
            participants.len(),
            session.capacity
        )));
    }

    let timestamp_sum: i128 = participants
        .iter()
        .map(|p| i128::from(p.join_timestamp))
        .sum();
    let winning_position = timestamp_sum.rem_euclid(i128::from(session.capacity)) as u32;

    let winner = participants
        .iter()
        .find(|p| p.position == winning_position)
        .ok_or_else(|| {
            EngineError::InvariantViolation(format!(
                "no participant at winning position {winning_position} in session {}",
                session.id
            ))
        })?;

    Ok(DrawOutcome {
        timestamp_sum,
        winning_position,
        winner_user_id: winner.user_id,
    })
}

/// Independent recomputation of a stored result from its embedded entries.
/// Anyone holding the record can run this; a tampered record fails.
pub fn verify(record: &DrawRecord) -> bool {
    if record.entries.is_empty() {
        return false;
    }
    let capacity = record.entries.len() as i128;
    let sum: i128 = record
        .entries
        .iter()
        .map(|e| i128::from(e.join_timestamp))
        .sum();
    let position = sum.rem_euclid(capacity) as u32;

    sum == record.timestamp_sum
        && position == record.winning_position
        && record
            .entries
            .iter()
            .any(|e| e.position == position && e.user_id == record.winner_user_id)
}
