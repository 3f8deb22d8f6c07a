use crate::domain::draw::DrawRecord;
use crate::domain::participant::{NewParticipant, Participant, ParticipantStatus};
use crate::domain::ports::{AdmittedSlot, SessionStore};
use crate::domain::session::{Session, SessionCode, SessionId, SessionStatus};
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, IteratorMode, Options, WriteBatch};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

/// Column Family for session rows.
pub const CF_SESSIONS: &str = "sessions";
/// Column Family for participant rows, keyed `{session_id}:{position}`.
pub const CF_PARTICIPANTS: &str = "participants";
/// Column Family for draw records, one per SUCCESS session.
pub const CF_RECORDS: &str = "records";
/// Column Family mapping shareable codes to session ids.
pub const CF_CODES: &str = "codes";

/// Persistent `SessionStore` on RocksDB. Sessions are audit records and are
/// never deleted, so the database doubles as the draw's public history.
///
/// RocksDB gives atomic batches but no transactions, so the per-session
/// serialization guard is an in-process lock map, same discipline as the
/// in-memory store. `Clone` shares the underlying `Arc<DB>`.
#[derive(Clone)]
pub struct RocksDbSessionStore {
    db: Arc<DB>,
    locks: Arc<RwLock<HashMap<SessionId, Arc<Mutex<()>>>>>,
}

impl RocksDbSessionStore {
    /// Opens or creates the database, ensuring all column families exist.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cfs = [CF_SESSIONS, CF_PARTICIPANTS, CF_RECORDS, CF_CODES]
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect::<Vec<_>>();
        let db = DB::open_cf_descriptors(&opts, path, cfs)?;

        Ok(Self {
            db: Arc::new(db),
            locks: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| EngineError::Storage(format!("column family {name} not found")))
    }

    async fn session_lock(&self, session_id: SessionId) -> Arc<Mutex<()>> {
        if let Some(lock) = self.locks.read().await.get(&session_id) {
            return lock.clone();
        }
        let mut locks = self.locks.write().await;
        locks
            .entry(session_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn participant_key(session_id: SessionId, position: u32) -> Vec<u8> {
        format!("{session_id}:{position:010}").into_bytes()
    }

    fn load_session(&self, session_id: SessionId) -> Result<Option<Session>> {
        let cf = self.cf(CF_SESSIONS)?;
        match self.db.get_cf(cf, session_id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn require_session(&self, session_id: SessionId) -> Result<Session> {
        self.load_session(session_id)?
            .ok_or(EngineError::SessionNotFound)
    }

    fn load_participants(&self, session_id: SessionId) -> Result<Vec<Participant>> {
        let cf = self.cf(CF_PARTICIPANTS)?;
        let prefix = format!("{session_id}:").into_bytes();
        let mut participants = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, rocksdb::Direction::Forward));
        for item in iter {
            let (key, value) =
                item.map_err(|e| EngineError::Storage(format!("iteration error: {e}")))?;
            if !key.starts_with(&prefix) {
                break;
            }
            participants.push(serde_json::from_slice(&value)?);
        }
        Ok(participants)
    }

    fn put_session(&self, batch: &mut WriteBatch, session: &Session) -> Result<()> {
        let cf = self.cf(CF_SESSIONS)?;
        batch.put_cf(cf, session.id.as_bytes(), serde_json::to_vec(session)?);
        Ok(())
    }

    fn put_participant(&self, batch: &mut WriteBatch, participant: &Participant) -> Result<()> {
        let cf = self.cf(CF_PARTICIPANTS)?;
        batch.put_cf(
            cf,
            Self::participant_key(participant.session_id, participant.position),
            serde_json::to_vec(participant)?,
        );
        Ok(())
    }

    /// Shared admission body, called with the session's lock held. Extra
    /// writes staged into `batch` (such as `create`'s code-index entry) land
    /// atomically with the session and participant rows, or not at all when
    /// admission is rejected.
    fn admit_guarded(
        &self,
        session: &mut Session,
        new: NewParticipant,
        mut batch: WriteBatch,
    ) -> Result<AdmittedSlot> {
        match session.status {
            SessionStatus::Active => {}
            SessionStatus::Filling | SessionStatus::Success => {
                return Err(EngineError::SessionFull);
            }
            SessionStatus::Timeout | SessionStatus::Cancelled => {
                return Err(EngineError::SessionExpired);
            }
        }
        if session.is_expired(new.join_timestamp) {
            return Err(EngineError::SessionExpired);
        }
        if session.is_full() {
            return Err(EngineError::SessionFull);
        }
        if self
            .load_participants(session.id)?
            .iter()
            .any(|p| p.user_id == new.user_id)
        {
            return Err(EngineError::DuplicateJoin);
        }

        let participant = Participant {
            id: new.id,
            session_id: session.id,
            user_id: new.user_id,
            order_number: new.order_number,
            position: session.participant_count,
            join_timestamp: new.join_timestamp,
            status: ParticipantStatus::Pending,
            amount: new.amount,
            debit_operation_key: new.debit_operation_key,
            pickup_code: None,
        };
        session.participant_count += 1;
        let filled = session.participant_count == session.capacity;
        if filled {
            session.status = SessionStatus::Filling;
        }

        self.put_session(&mut batch, session)?;
        self.put_participant(&mut batch, &participant)?;
        self.db.write(batch)?;

        Ok(AdmittedSlot {
            participant,
            session: session.clone(),
            filled,
        })
    }
}

#[async_trait]
impl SessionStore for RocksDbSessionStore {
    async fn create(&self, session: Session, creator: NewParticipant) -> Result<AdmittedSlot> {
        let lock = self.session_lock(session.id).await;
        let _guard = lock.lock().await;

        if self.load_session(session.id)?.is_some() {
            return Err(EngineError::Storage(format!(
                "session {} already exists",
                session.id
            )));
        }
        let codes = self.cf(CF_CODES)?;
        if self.db.get_cf(codes, session.code.as_str())?.is_some() {
            return Err(EngineError::CodeCollision);
        }

        // Staged, not written: the code index must never exist without its
        // session row, so it rides the admission batch.
        let mut batch = WriteBatch::default();
        batch.put_cf(codes, session.code.as_str(), session.id.as_bytes());

        let mut session = session;
        self.admit_guarded(&mut session, creator, batch)
    }

    async fn get(&self, session_id: SessionId) -> Result<Option<Session>> {
        self.load_session(session_id)
    }

    async fn find_by_code(&self, code: &SessionCode) -> Result<Option<Session>> {
        let codes = self.cf(CF_CODES)?;
        match self.db.get_cf(codes, code.as_str())? {
            Some(bytes) => {
                let id = Uuid::from_slice(&bytes)
                    .map_err(|e| EngineError::Storage(format!("corrupt code index: {e}")))?;
                self.load_session(id)
            }
            None => Ok(None),
        }
    }

    async fn participants(&self, session_id: SessionId) -> Result<Vec<Participant>> {
        self.require_session(session_id)?;
        self.load_participants(session_id)
    }

    async fn draw_record(&self, session_id: SessionId) -> Result<Option<DrawRecord>> {
        let cf = self.cf(CF_RECORDS)?;
        match self.db.get_cf(cf, session_id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn admit(
        &self,
        session_id: SessionId,
        participant: NewParticipant,
    ) -> Result<AdmittedSlot> {
        let lock = self.session_lock(session_id).await;
        let _guard = lock.lock().await;
        let mut session = self.require_session(session_id)?;
        self.admit_guarded(&mut session, participant, WriteBatch::default())
    }

    async fn complete_success(&self, session_id: SessionId, record: DrawRecord) -> Result<bool> {
        let lock = self.session_lock(session_id).await;
        let _guard = lock.lock().await;
        let mut session = self.require_session(session_id)?;

        match session.status {
            SessionStatus::Success | SessionStatus::Timeout | SessionStatus::Cancelled => Ok(false),
            SessionStatus::Active => Err(EngineError::InvariantViolation(format!(
                "finalize attempted on unfilled session {session_id}"
            ))),
            SessionStatus::Filling => {
                let records = self.cf(CF_RECORDS)?;
                if self.db.get_cf(records, session_id.as_bytes())?.is_some() {
                    return Err(EngineError::InvariantViolation(format!(
                        "second draw record attempted for session {session_id}"
                    )));
                }
                session.status = SessionStatus::Success;
                let mut batch = WriteBatch::default();
                self.put_session(&mut batch, &session)?;
                batch.put_cf(records, session_id.as_bytes(), serde_json::to_vec(&record)?);
                self.db.write(batch)?;
                Ok(true)
            }
        }
    }

    async fn claim_timeout(&self, session_id: SessionId) -> Result<bool> {
        let lock = self.session_lock(session_id).await;
        let _guard = lock.lock().await;
        let mut session = self.require_session(session_id)?;

        match session.status {
            SessionStatus::Active | SessionStatus::Filling => {
                session.status = SessionStatus::Timeout;
                let mut batch = WriteBatch::default();
                self.put_session(&mut batch, &session)?;
                self.db.write(batch)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cancel(&self, session_id: SessionId) -> Result<()> {
        let lock = self.session_lock(session_id).await;
        let _guard = lock.lock().await;
        let mut session = self.require_session(session_id)?;

        if session.status != SessionStatus::Active || session.participant_count > 0 {
            return Err(EngineError::CancellationRejected);
        }
        session.status = SessionStatus::Cancelled;
        let mut batch = WriteBatch::default();
        self.put_session(&mut batch, &session)?;
        self.db.write(batch)?;
        Ok(())
    }

    async fn set_participant_status(
        &self,
        session_id: SessionId,
        position: u32,
        status: ParticipantStatus,
    ) -> Result<()> {
        let lock = self.session_lock(session_id).await;
        let _guard = lock.lock().await;

        let cf = self.cf(CF_PARTICIPANTS)?;
        let key = Self::participant_key(session_id, position);
        let mut participant: Participant = match self.db.get_cf(cf, &key)? {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => {
                return Err(EngineError::InvariantViolation(format!(
                    "no participant at position {position} in session {session_id}"
                )));
            }
        };
        participant.status = status;
        self.db.put_cf(cf, &key, serde_json::to_vec(&participant)?)?;
        Ok(())
    }

    async fn set_pickup_code(
        &self,
        session_id: SessionId,
        position: u32,
        code: &str,
    ) -> Result<()> {
        let lock = self.session_lock(session_id).await;
        let _guard = lock.lock().await;

        let cf = self.cf(CF_PARTICIPANTS)?;
        let key = Self::participant_key(session_id, position);
        let mut participant: Participant = match self.db.get_cf(cf, &key)? {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => {
                return Err(EngineError::InvariantViolation(format!(
                    "no participant at position {position} in session {session_id}"
                )));
            }
        };
        participant.pickup_code = Some(code.to_string());

        let mut batch = WriteBatch::default();
        batch.put_cf(cf, &key, serde_json::to_vec(&participant)?);

        let records = self.cf(CF_RECORDS)?;
        if let Some(bytes) = self.db.get_cf(records, session_id.as_bytes())? {
            let mut record: DrawRecord = serde_json::from_slice(&bytes)?;
            record.pickup_code = Some(code.to_string());
            batch.put_cf(records, session_id.as_bytes(), serde_json::to_vec(&record)?);
        }
        self.db.write(batch)?;
        Ok(())
    }

    async fn expired_sessions(&self, now_millis: i64) -> Result<Vec<Session>> {
        Ok(self
            .all_sessions()
            .await?
            .into_iter()
            .filter(|s| !s.status.is_terminal() && s.is_expired(now_millis))
            .collect())
    }

    async fn all_sessions(&self) -> Result<Vec<Session>> {
        let cf = self.cf(CF_SESSIONS)?;
        let mut sessions = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_key, value) =
                item.map_err(|e| EngineError::Storage(format!("iteration error: {e}")))?;
            sessions.push(serde_json::from_slice(&value)?);
        }
        Ok(sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::money::Amount;
    use crate::domain::participant::operation_key;
    use crate::domain::product::Product;
    use rust_decimal_macros::dec;
    use tempfile::tempdir;

    fn product() -> Product {
        Product {
            id: 1,
            price_per_person: Amount::new(dec!(10.0)).unwrap(),
            group_size: 2,
            timeout_millis: 60_000,
            active: true,
            stock: 10,
            sold: 0,
        }
    }

    fn new_participant(session: &Session, user_id: u64, ts: i64) -> NewParticipant {
        NewParticipant {
            id: Uuid::new_v4(),
            user_id,
            join_timestamp: ts,
            amount: session.price_per_person,
            order_number: format!("GB{user_id}"),
            debit_operation_key: operation_key(session.id, user_id, "join"),
        }
    }

    #[tokio::test]
    async fn test_open_creates_column_families() {
        let dir = tempdir().unwrap();
        let store = RocksDbSessionStore::open(dir.path()).unwrap();
        for cf in [CF_SESSIONS, CF_PARTICIPANTS, CF_RECORDS, CF_CODES] {
            assert!(store.db.cf_handle(cf).is_some());
        }
    }

    #[tokio::test]
    async fn test_session_survives_reopen() {
        let dir = tempdir().unwrap();
        let session = Session::new(&product(), SessionCode::new("BBBBBB"), 0);
        let session_id = session.id;

        {
            let store = RocksDbSessionStore::open(dir.path()).unwrap();
            let creator = new_participant(&session, 1, 100);
            store.create(session, creator).await.unwrap();
        }

        let store = RocksDbSessionStore::open(dir.path()).unwrap();
        let reloaded = store.get(session_id).await.unwrap().unwrap();
        assert_eq!(reloaded.participant_count, 1);

        let by_code = store
            .find_by_code(&SessionCode::new("BBBBBB"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_code.id, session_id);

        let participants = store.participants(session_id).await.unwrap();
        assert_eq!(participants.len(), 1);
        assert_eq!(participants[0].position, 0);
    }

    #[tokio::test]
    async fn test_code_collision_leaves_no_orphan_index_entry() {
        let dir = tempdir().unwrap();
        let store = RocksDbSessionStore::open(dir.path()).unwrap();

        let first = Session::new(&product(), SessionCode::new("DDDDDD"), 0);
        let first_id = first.id;
        store
            .create(first.clone(), new_participant(&first, 1, 100))
            .await
            .unwrap();

        let clashing = Session::new(&product(), SessionCode::new("DDDDDD"), 0);
        let clashing_id = clashing.id;
        let err = store
            .create(clashing, new_participant(&first, 2, 200))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::CodeCollision));

        // The index still maps to the first session and no row leaked in
        // for the rejected one.
        let by_code = store
            .find_by_code(&SessionCode::new("DDDDDD"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_code.id, first_id);
        assert!(store.get(clashing_id).await.unwrap().is_none());

        // Rejected admission inside create leaves no index entry either.
        let stale = Session::new(&product(), SessionCode::new("EEEEEE"), 0);
        let late_creator = new_participant(&stale, 3, stale.expires_at);
        assert!(matches!(
            store.create(stale, late_creator).await,
            Err(EngineError::SessionExpired)
        ));
        assert!(
            store
                .find_by_code(&SessionCode::new("EEEEEE"))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_fill_draw_and_claims() {
        let dir = tempdir().unwrap();
        let store = RocksDbSessionStore::open(dir.path()).unwrap();
        let session = Session::new(&product(), SessionCode::new("CCCCCC"), 0);
        let session_id = session.id;
        let creator = new_participant(&session, 1, 1_000);
        store.create(session, creator).await.unwrap();

        let session = store.get(session_id).await.unwrap().unwrap();
        let slot = store
            .admit(session_id, new_participant(&session, 2, 2_000))
            .await
            .unwrap();
        assert!(slot.filled);

        let session = store.get(session_id).await.unwrap().unwrap();
        let participants = store.participants(session_id).await.unwrap();
        let outcome = crate::domain::draw::compute(&session, &participants).unwrap();
        let record =
            crate::domain::draw::DrawRecord::new(&session, &outcome, &participants, 3_000);

        assert!(store.complete_success(session_id, record).await.unwrap());
        // Timeout must now lose the race.
        assert!(!store.claim_timeout(session_id).await.unwrap());
        assert!(store.draw_record(session_id).await.unwrap().is_some());

        store
            .set_participant_status(session_id, outcome.winning_position, ParticipantStatus::Won)
            .await
            .unwrap();
        store
            .set_pickup_code(session_id, outcome.winning_position, "PK-000001")
            .await
            .unwrap();
        let record = store.draw_record(session_id).await.unwrap().unwrap();
        assert_eq!(record.pickup_code.as_deref(), Some("PK-000001"));
    }
}
