//! Ports consumed by the application layer. External collaborators (wallet,
//! pickup codes, notifications, catalog) are contracts only; the store port
//! is where per-session serialization and the guarded terminal transitions
//! live, so every backend enforces the same concurrency discipline.

use crate::domain::draw::DrawRecord;
use crate::domain::money::Amount;
use crate::domain::participant::{NewParticipant, Participant, ParticipantStatus};
use crate::domain::product::{Product, ProductId};
use crate::domain::session::{Session, SessionCode, SessionId, UserId};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

pub type SharedSessionStore = Arc<dyn SessionStore>;
pub type SharedWalletLedger = Arc<dyn WalletLedger>;
pub type SharedPickupCodeIssuer = Arc<dyn PickupCodeIssuer>;
pub type SharedNotificationDispatcher = Arc<dyn NotificationDispatcher>;
pub type SharedProductCatalog = Arc<dyn ProductCatalog>;
pub type SharedClock = Arc<dyn Clock>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebitOutcome {
    Ok,
    Insufficient,
}

/// Atomic debit/credit of user balances. Both calls are idempotent per
/// `op_key`: replaying an already applied key is a no-op that reports the
/// original outcome.
#[async_trait]
pub trait WalletLedger: Send + Sync {
    async fn debit(&self, user_id: UserId, amount: Amount, op_key: &str) -> Result<DebitOutcome>;
    async fn credit(&self, user_id: UserId, amount: Amount, op_key: &str) -> Result<()>;
}

/// Issues pickup codes unique across all fulfillment tables.
#[async_trait]
pub trait PickupCodeIssuer: Send + Sync {
    async fn issue(&self) -> Result<String>;
}

/// Best-effort push of a templated message. Implementations log failures;
/// they never surface to the caller.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn send(&self, user_id: UserId, template: &str, payload: serde_json::Value);
}

#[async_trait]
pub trait ProductCatalog: Send + Sync {
    async fn get(&self, product_id: ProductId) -> Result<Option<Product>>;
}

pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

/// Wall-clock time in epoch millis.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// Result of a successful atomic admission.
#[derive(Debug, Clone)]
pub struct AdmittedSlot {
    pub participant: Participant,
    /// Post-admission session snapshot (`Filling` when the slot filled it).
    pub session: Session,
    /// True when this admission brought the session to capacity.
    pub filled: bool,
}

/// Session persistence. Implementations must serialize all mutations of one
/// session against each other; different sessions proceed in parallel.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Persists a new session together with its creator at position 0, as one
    /// atomic operation. A capacity-1 session comes back already `filled`.
    async fn create(&self, session: Session, creator: NewParticipant) -> Result<AdmittedSlot>;

    async fn get(&self, session_id: SessionId) -> Result<Option<Session>>;
    async fn find_by_code(&self, code: &SessionCode) -> Result<Option<Session>>;
    async fn participants(&self, session_id: SessionId) -> Result<Vec<Participant>>;
    async fn draw_record(&self, session_id: SessionId) -> Result<Option<DrawRecord>>;

    /// Atomic check-assign-increment under the session's serialization guard.
    /// Re-validates status, expiry, capacity and per-user uniqueness, assigns
    /// the next dense position, and transitions the session to `Filling` when
    /// this admission reaches capacity. Typed admission errors report which
    /// check failed; nothing is mutated on failure.
    async fn admit(&self, session_id: SessionId, participant: NewParticipant)
    -> Result<AdmittedSlot>;

    /// Guarded `Filling -> Success` transition plus the unique draw record
    /// insert, as one conditional update. Returns `false` without touching
    /// state when the session already reached a terminal status (the caller
    /// lost the finalize race).
    async fn complete_success(&self, session_id: SessionId, record: DrawRecord) -> Result<bool>;

    /// Guarded `Active|Filling -> Timeout` transition; `false` when the
    /// session is already terminal.
    async fn claim_timeout(&self, session_id: SessionId) -> Result<bool>;

    /// Administrative `Active -> Cancelled`, permitted only while the session
    /// has no participants.
    async fn cancel(&self, session_id: SessionId) -> Result<()>;

    async fn set_participant_status(
        &self,
        session_id: SessionId,
        position: u32,
        status: ParticipantStatus,
    ) -> Result<()>;

    /// Stores the issued pickup code on both the winning participant and the
    /// draw record.
    async fn set_pickup_code(&self, session_id: SessionId, position: u32, code: &str)
    -> Result<()>;

    /// Sessions past `expires_at` that are still in a pre-terminal status.
    async fn expired_sessions(&self, now_millis: i64) -> Result<Vec<Session>>;

    async fn all_sessions(&self) -> Result<Vec<Session>>;
}
