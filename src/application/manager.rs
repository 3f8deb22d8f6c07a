use crate::application::settlement::{EscalatedCredit, EscalationQueue, SettlementService};
use crate::domain::draw::{self, DrawRecord};
use crate::domain::money::Amount;
use crate::domain::participant::{
    NewParticipant, Participant, join_debit_key, join_reversal_key, order_number,
};
use crate::domain::ports::{
    Clock, DebitOutcome, ProductCatalog, SessionStore, SharedClock, SharedProductCatalog,
    SharedSessionStore, SharedWalletLedger, WalletLedger,
};
use crate::domain::session::{Session, SessionCode, SessionId, SessionStatus, UserId};
use crate::error::{EngineError, Result};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

/// Collisions in the 6-character code space are vanishingly rare; a short
/// regeneration loop keeps them invisible to the creator.
const CODE_RETRIES: usize = 5;

/// Point-in-time view of a session, with the draw result and enough
/// participant data for third-party verification once it succeeded.
#[derive(Debug, Clone, Serialize)]
pub struct SessionState {
    pub session: Session,
    pub result: Option<DrawRecord>,
}

/// Owns session creation, join admission and the capacity-safe handoff to
/// the draw and settlement. The store serializes per-session mutations; the
/// manager's job is ordering the wallet debit around them so "debited but
/// never admitted" can never become a permanent state.
pub struct SessionManager {
    store: SharedSessionStore,
    catalog: SharedProductCatalog,
    wallet: SharedWalletLedger,
    clock: SharedClock,
    settlement: Arc<SettlementService>,
    escalations: EscalationQueue,
}

impl SessionManager {
    pub fn new(
        store: SharedSessionStore,
        catalog: SharedProductCatalog,
        wallet: SharedWalletLedger,
        clock: SharedClock,
        settlement: Arc<SettlementService>,
        escalations: EscalationQueue,
    ) -> Self {
        Self {
            store,
            catalog,
            wallet,
            clock,
            settlement,
            escalations,
        }
    }

    /// Starts a new session for `product_id` and admits the caller at
    /// position 0. The creator pays like any joiner; an insufficient balance
    /// aborts with no session persisted.
    pub async fn create_session(
        &self,
        user_id: UserId,
        product_id: u32,
    ) -> Result<(Session, Participant)> {
        let product = self
            .catalog
            .get(product_id)
            .await?
            .ok_or(EngineError::ProductUnavailable)?;
        if !product.available() {
            return Err(EngineError::ProductUnavailable);
        }

        let now = self.clock.now_millis();
        let mut session = Session::new(&product, SessionCode::generate(), now);
        let attempt_id = Uuid::new_v4();
        let op_key = join_debit_key(session.id, user_id, attempt_id);
        match self
            .wallet
            .debit(user_id, product.price_per_person, &op_key)
            .await?
        {
            DebitOutcome::Ok => {}
            DebitOutcome::Insufficient => return Err(EngineError::InsufficientBalance),
        }

        let creator = NewParticipant {
            id: attempt_id,
            user_id,
            join_timestamp: now,
            amount: product.price_per_person,
            order_number: order_number(now),
            debit_operation_key: op_key,
        };
        let amount = product.price_per_person;
        let session_id = session.id;
        let mut retries = 0;
        let slot = loop {
            match self.store.create(session.clone(), creator.clone()).await {
                Ok(slot) => break slot,
                Err(EngineError::CodeCollision) if retries < CODE_RETRIES => {
                    retries += 1;
                    tracing::debug!(%session_id, "session code taken; regenerating");
                    session.code = SessionCode::generate();
                }
                Err(e) => {
                    self.retract_session_debit(session_id, user_id, attempt_id, amount, &e)
                        .await;
                    return Err(e);
                }
            }
        };

        tracing::info!(
            session_id = %slot.session.id,
            code = %slot.session.code,
            user_id,
            capacity = slot.session.capacity,
            "session created"
        );
        self.after_admission(slot).await
    }

    /// The capacity-critical operation: admits `user_id` into the session
    /// identified by `code`, assigning the next dense position. Exactly
    /// `capacity` callers ever succeed per session.
    pub async fn join_session(
        &self,
        user_id: UserId,
        code: &SessionCode,
    ) -> Result<(Session, Participant)> {
        let session = self
            .store
            .find_by_code(code)
            .await?
            .ok_or(EngineError::SessionNotFound)?;
        let now = self.clock.now_millis();

        // Fail-fast pre-checks; rejected requests touch nothing. The store
        // re-validates all of them under the session's serialization guard.
        match session.status {
            SessionStatus::Active => {}
            SessionStatus::Filling | SessionStatus::Success => {
                return Err(EngineError::SessionFull);
            }
            SessionStatus::Timeout | SessionStatus::Cancelled => {
                return Err(EngineError::SessionExpired);
            }
        }
        if session.is_expired(now) {
            return Err(EngineError::SessionExpired);
        }
        if session.is_full() {
            return Err(EngineError::SessionFull);
        }
        if self
            .store
            .participants(session.id)
            .await?
            .iter()
            .any(|p| p.user_id == user_id)
        {
            return Err(EngineError::DuplicateJoin);
        }

        let attempt_id = Uuid::new_v4();
        let op_key = join_debit_key(session.id, user_id, attempt_id);
        match self
            .wallet
            .debit(user_id, session.price_per_person, &op_key)
            .await?
        {
            DebitOutcome::Ok => {}
            DebitOutcome::Insufficient => return Err(EngineError::InsufficientBalance),
        }

        let participant = NewParticipant {
            id: attempt_id,
            user_id,
            join_timestamp: now,
            amount: session.price_per_person,
            order_number: order_number(now),
            debit_operation_key: op_key,
        };
        let slot = match self.store.admit(session.id, participant).await {
            Ok(slot) => slot,
            Err(e) => {
                // Lost a race (duplicate, filled, expired) or the store
                // failed after the money moved. The debit is keyed to this
                // attempt, so retracting it touches nobody's seated slot and
                // a later retry debits for real.
                self.retract_session_debit(session.id, user_id, attempt_id, session.price_per_person, &e)
                    .await;
                return Err(e);
            }
        };

        tracing::debug!(
            session_id = %slot.session.id,
            user_id,
            position = slot.participant.position,
            count = slot.session.participant_count,
            "participant admitted"
        );
        self.after_admission(slot).await
    }

    /// Administrative cancellation, permitted only while the session has no
    /// participants. Partially filled sessions go through the timeout path.
    pub async fn cancel_session(&self, session_id: SessionId) -> Result<()> {
        self.store.cancel(session_id).await
    }

    pub async fn session_state(&self, session_id: SessionId) -> Result<SessionState> {
        let session = self
            .store
            .get(session_id)
            .await?
            .ok_or(EngineError::SessionNotFound)?;
        let result = if session.status == SessionStatus::Success {
            self.store.draw_record(session_id).await?
        } else {
            None
        };
        Ok(SessionState { session, result })
    }

    /// Runs the draw and settlement when the admission filled the session,
    /// then returns a fresh snapshot.
    async fn after_admission(
        &self,
        slot: crate::domain::ports::AdmittedSlot,
    ) -> Result<(Session, Participant)> {
        if !slot.filled {
            return Ok((slot.session, slot.participant));
        }

        let session_id = slot.session.id;
        self.finalize(session_id).await?;
        let session = self.store.get(session_id).await?.ok_or_else(|| {
            EngineError::InvariantViolation(format!("session {session_id} vanished after finalize"))
        })?;
        Ok((session, slot.participant))
    }

    /// Exactly-once draw finalization. Competes with the sweeper's
    /// expiry-to-`Timeout` claim through the store's conditional transition;
    /// the loser aborts without side effects.
    async fn finalize(&self, session_id: SessionId) -> Result<()> {
        let session = self.store.get(session_id).await?.ok_or_else(|| {
            EngineError::InvariantViolation(format!("filled session {session_id} not found"))
        })?;
        if session.status != SessionStatus::Filling {
            // Already finalized, or timed out underneath us.
            return Ok(());
        }

        let participants = self.store.participants(session_id).await?;
        let outcome = draw::compute(&session, &participants)?;
        let record = DrawRecord::new(&session, &outcome, &participants, self.clock.now_millis());

        if !self
            .store
            .complete_success(session_id, record.clone())
            .await?
        {
            tracing::warn!(
                %session_id,
                "lost the terminal-transition race; draw discarded without settlement"
            );
            return Ok(());
        }

        tracing::info!(
            %session_id,
            winning_position = record.winning_position,
            winner_user_id = record.winner_user_id,
            timestamp_sum = %record.timestamp_sum,
            "session drawn"
        );

        let session = self.store.get(session_id).await?.ok_or_else(|| {
            EngineError::InvariantViolation(format!("session {session_id} vanished after draw"))
        })?;
        self.settlement.settle_success(&session, &record).await
    }

    async fn retract_session_debit(
        &self,
        session_id: SessionId,
        user_id: UserId,
        attempt_id: Uuid,
        amount: Amount,
        cause: &EngineError,
    ) {
        let op_key = join_reversal_key(session_id, user_id, attempt_id);
        if let Err(e) = self.wallet.credit(user_id, amount, &op_key).await {
            tracing::error!(
                %session_id,
                user_id,
                error = %e,
                cause = %cause,
                "failed to retract debit after rejected admission; escalating"
            );
            self.escalations
                .push(EscalatedCredit {
                    session_id,
                    user_id,
                    amount,
                    op_key,
                    reason: e.to_string(),
                })
                .await;
        } else {
            tracing::debug!(%session_id, user_id, cause = %cause, "debit retracted");
        }
    }
}
