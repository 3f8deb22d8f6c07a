use crate::domain::draw::DrawRecord;
use crate::domain::money::{Amount, Balance};
use crate::domain::participant::{NewParticipant, Participant, ParticipantStatus};
use crate::domain::ports::{
    AdmittedSlot, Clock, DebitOutcome, NotificationDispatcher, PickupCodeIssuer, ProductCatalog,
    SessionStore, WalletLedger,
};
use crate::domain::product::{Product, ProductId};
use crate::domain::session::{Session, SessionCode, SessionId, SessionStatus, UserId};
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use tokio::sync::{Mutex, RwLock};

struct SessionRecord {
    session: Session,
    participants: Vec<Participant>,
    draw_record: Option<DrawRecord>,
}

/// The default `SessionStore`. Each session lives behind its own
/// `tokio::sync::Mutex`, so admission's check-assign-increment and the
/// terminal transitions are serialized per session while unrelated sessions
/// proceed fully in parallel.
#[derive(Default, Clone)]
pub struct InMemorySessionStore {
    sessions: Arc<RwLock<HashMap<SessionId, Arc<Mutex<SessionRecord>>>>>,
    codes: Arc<RwLock<HashMap<SessionCode, SessionId>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn record(&self, session_id: SessionId) -> Result<Arc<Mutex<SessionRecord>>> {
        self.sessions
            .read()
            .await
            .get(&session_id)
            .cloned()
            .ok_or(EngineError::SessionNotFound)
    }

    /// Admission under the session's lock: re-validates everything the
    /// manager pre-checked, then assigns the next dense position.
    fn admit_locked(record: &mut SessionRecord, new: NewParticipant) -> Result<AdmittedSlot> {
        match record.session.status {
            SessionStatus::Active => {}
            SessionStatus::Filling | SessionStatus::Success => {
                return Err(EngineError::SessionFull);
            }
            SessionStatus::Timeout | SessionStatus::Cancelled => {
                return Err(EngineError::SessionExpired);
            }
        }
        if record.session.is_expired(new.join_timestamp) {
            return Err(EngineError::SessionExpired);
        }
        if record.session.is_full() {
            return Err(EngineError::SessionFull);
        }
        if record
            .participants
            .iter()
            .any(|p| p.user_id == new.user_id)
        {
            return Err(EngineError::DuplicateJoin);
        }

        let position = record.session.participant_count;
        let participant = Participant {
            id: new.id,
            session_id: record.session.id,
            user_id: new.user_id,
            order_number: new.order_number,
            position,
            join_timestamp: new.join_timestamp,
            status: ParticipantStatus::Pending,
            amount: new.amount,
            debit_operation_key: new.debit_operation_key,
            pickup_code: None,
        };
        record.participants.push(participant.clone());
        record.session.participant_count += 1;

        let filled = record.session.participant_count == record.session.capacity;
        if filled {
            record.session.status = SessionStatus::Filling;
        }
        Ok(AdmittedSlot {
            participant,
            session: record.session.clone(),
            filled,
        })
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(&self, session: Session, creator: NewParticipant) -> Result<AdmittedSlot> {
        let mut sessions = self.sessions.write().await;
        let mut codes = self.codes.write().await;
        if sessions.contains_key(&session.id) {
            return Err(EngineError::Storage(format!(
                "session {} already exists",
                session.id
            )));
        }
        if codes.contains_key(&session.code) {
            return Err(EngineError::CodeCollision);
        }

        let mut record = SessionRecord {
            session,
            participants: Vec::new(),
            draw_record: None,
        };
        let slot = Self::admit_locked(&mut record, creator)?;
        codes.insert(record.session.code.clone(), record.session.id);
        sessions.insert(record.session.id, Arc::new(Mutex::new(record)));
        Ok(slot)
    }

    async fn get(&self, session_id: SessionId) -> Result<Option<Session>> {
        match self.sessions.read().await.get(&session_id) {
            Some(record) => Ok(Some(record.lock().await.session.clone())),
            None => Ok(None),
        }
    }

    async fn find_by_code(&self, code: &SessionCode) -> Result<Option<Session>> {
        let id = match self.codes.read().await.get(code) {
            Some(id) => *id,
            None => return Ok(None),
        };
        self.get(id).await
    }

    async fn participants(&self, session_id: SessionId) -> Result<Vec<Participant>> {
        let record = self.record(session_id).await?;
        let guard = record.lock().await;
        Ok(guard.participants.clone())
    }

    async fn draw_record(&self, session_id: SessionId) -> Result<Option<DrawRecord>> {
        let record = self.record(session_id).await?;
        let guard = record.lock().await;
        Ok(guard.draw_record.clone())
    }

    async fn admit(
        &self,
        session_id: SessionId,
        participant: NewParticipant,
    ) -> Result<AdmittedSlot> {
        let record = self.record(session_id).await?;
        let mut guard = record.lock().await;
        Self::admit_locked(&mut guard, participant)
    }

    async fn complete_success(&self, session_id: SessionId, record: DrawRecord) -> Result<bool> {
        let entry = self.record(session_id).await?;
        let mut guard = entry.lock().await;
        match guard.session.status {
            SessionStatus::Success | SessionStatus::Timeout | SessionStatus::Cancelled => Ok(false),
            SessionStatus::Active => Err(EngineError::InvariantViolation(format!(
                "finalize attempted on unfilled session {session_id}"
            ))),
            SessionStatus::Filling => {
                if guard.draw_record.is_some() {
                    return Err(EngineError::InvariantViolation(format!(
                        "second draw record attempted for session {session_id}"
                    )));
                }
                guard.session.status = SessionStatus::Success;
                guard.draw_record = Some(record);
                Ok(true)
            }
        }
    }

    async fn claim_timeout(&self, session_id: SessionId) -> Result<bool> {
        let entry = self.record(session_id).await?;
        let mut guard = entry.lock().await;
        match guard.session.status {
            SessionStatus::Active | SessionStatus::Filling => {
                guard.session.status = SessionStatus::Timeout;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cancel(&self, session_id: SessionId) -> Result<()> {
        let entry = self.record(session_id).await?;
        let mut guard = entry.lock().await;
        if guard.session.status != SessionStatus::Active || guard.session.participant_count > 0 {
            return Err(EngineError::CancellationRejected);
        }
        guard.session.status = SessionStatus::Cancelled;
        Ok(())
    }

    async fn set_participant_status(
        &self,
        session_id: SessionId,
        position: u32,
        status: ParticipantStatus,
    ) -> Result<()> {
        let entry = self.record(session_id).await?;
        let mut guard = entry.lock().await;
        let participant = guard
            .participants
            .iter_mut()
            .find(|p| p.position == position)
            .ok_or_else(|| {
                EngineError::InvariantViolation(format!(
                    "no participant at position {position} in session {session_id}"
                ))
            })?;
        participant.status = status;
        Ok(())
    }

    async fn set_pickup_code(
        &self,
        session_id: SessionId,
        position: u32,
        code: &str,
    ) -> Result<()> {
        let entry = self.record(session_id).await?;
        let mut guard = entry.lock().await;
        let participant = guard
            .participants
            .iter_mut()
            .find(|p| p.position == position)
            .ok_or_else(|| {
                EngineError::InvariantViolation(format!(
                    "no participant at position {position} in session {session_id}"
                ))
            })?;
        participant.pickup_code = Some(code.to_string());
        if let Some(record) = guard.draw_record.as_mut() {
            record.pickup_code = Some(code.to_string());
        }
        Ok(())
    }

    async fn expired_sessions(&self, now_millis: i64) -> Result<Vec<Session>> {
        let records: Vec<_> = self.sessions.read().await.values().cloned().collect();
        let mut expired = Vec::new();
        for record in records {
            let guard = record.lock().await;
            if !guard.session.status.is_terminal() && guard.session.is_expired(now_millis) {
                expired.push(guard.session.clone());
            }
        }
        Ok(expired)
    }

    async fn all_sessions(&self) -> Result<Vec<Session>> {
        let records: Vec<_> = self.sessions.read().await.values().cloned().collect();
        let mut sessions = Vec::new();
        for record in records {
            sessions.push(record.lock().await.session.clone());
        }
        Ok(sessions)
    }
}

#[derive(Default)]
struct WalletState {
    balances: HashMap<UserId, Balance>,
    /// Applied operation keys; replays are absorbed without moving money.
    applied: HashSet<String>,
}

/// In-memory `WalletLedger` with per-key idempotency, used by tests and the
/// replay CLI. A debit that reports `Insufficient` records nothing, so a
/// later retry with the same key may still succeed.
#[derive(Default, Clone)]
pub struct InMemoryWallet {
    state: Arc<RwLock<WalletState>>,
}

impl InMemoryWallet {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn fund(&self, user_id: UserId, amount: Balance) {
        let mut state = self.state.write().await;
        *state.balances.entry(user_id).or_default() += amount;
    }

    pub async fn balance(&self, user_id: UserId) -> Balance {
        self.state
            .read()
            .await
            .balances
            .get(&user_id)
            .copied()
            .unwrap_or(Balance::ZERO)
    }

    /// Number of distinct ledger mutations ever applied. Lets tests assert
    /// that a settlement retry produced zero additional credits.
    pub async fn operation_count(&self) -> usize {
        self.state.read().await.applied.len()
    }
}

#[async_trait]
impl WalletLedger for InMemoryWallet {
    async fn debit(&self, user_id: UserId, amount: Amount, op_key: &str) -> Result<DebitOutcome> {
        let mut state = self.state.write().await;
        if state.applied.contains(op_key) {
            return Ok(DebitOutcome::Ok);
        }
        let balance = state.balances.entry(user_id).or_default();
        if !balance.covers(amount) {
            return Ok(DebitOutcome::Insufficient);
        }
        *balance -= Balance::from(amount);
        state.applied.insert(op_key.to_string());
        Ok(DebitOutcome::Ok)
    }

    async fn credit(&self, user_id: UserId, amount: Amount, op_key: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if state.applied.contains(op_key) {
            return Ok(());
        }
        *state.balances.entry(user_id).or_default() += Balance::from(amount);
        state.applied.insert(op_key.to_string());
        Ok(())
    }
}

/// Monotonic pickup codes. Uniqueness across fulfillment is the issuer's
/// contract; a counter satisfies it in-process.
#[derive(Default)]
pub struct SequentialPickupCodes {
    next: AtomicU64,
}

#[async_trait]
impl PickupCodeIssuer for SequentialPickupCodes {
    async fn issue(&self) -> Result<String> {
        let n = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("PK-{n:06}"))
    }
}

/// Fire-and-forget dispatcher that writes notifications to the log.
pub struct TracingDispatcher;

#[async_trait]
impl NotificationDispatcher for TracingDispatcher {
    async fn send(&self, user_id: UserId, template: &str, payload: serde_json::Value) {
        tracing::info!(user_id, template, %payload, "notification dispatched");
    }
}

/// Dispatcher that records every send; test helper.
#[derive(Default, Clone)]
pub struct RecordingDispatcher {
    sent: Arc<RwLock<Vec<(UserId, String)>>>,
}

impl RecordingDispatcher {
    pub async fn sent(&self) -> Vec<(UserId, String)> {
        self.sent.read().await.clone()
    }
}

#[async_trait]
impl NotificationDispatcher for RecordingDispatcher {
    async fn send(&self, user_id: UserId, template: &str, _payload: serde_json::Value) {
        self.sent.write().await.push((user_id, template.to_string()));
    }
}

/// Fixed product catalog, read-only to the engine.
#[derive(Default, Clone)]
pub struct StaticCatalog {
    products: HashMap<ProductId, Product>,
}

impl StaticCatalog {
    pub fn new(products: impl IntoIterator<Item = Product>) -> Self {
        Self {
            products: products.into_iter().map(|p| (p.id, p)).collect(),
        }
    }
}

#[async_trait]
impl ProductCatalog for StaticCatalog {
    async fn get(&self, product_id: ProductId) -> Result<Option<Product>> {
        Ok(self.products.get(&product_id).cloned())
    }
}

/// Externally driven clock for tests and CSV replay.
#[derive(Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now_millis: i64) -> Self {
        Self {
            now: AtomicI64::new(now_millis),
        }
    }

    pub fn set(&self, now_millis: i64) {
        self.now.store(now_millis, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_millis: i64) {
        self.now.fetch_add(delta_millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}
