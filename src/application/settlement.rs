use crate::domain::draw::DrawRecord;
use crate::domain::money::Amount;
use crate::domain::participant::{Participant, ParticipantStatus, operation_key};
use crate::domain::ports::{
    NotificationDispatcher, PickupCodeIssuer, SessionStore, SharedNotificationDispatcher,
    SharedPickupCodeIssuer, SharedSessionStore, SharedWalletLedger, WalletLedger,
};
use crate::domain::session::{Session, SessionId, SessionStatus, UserId};
use crate::error::{EngineError, Result};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Bounded retries for a refund credit before it is escalated.
const CREDIT_ATTEMPTS: u32 = 3;

pub const TEMPLATE_WIN: &str = "group_buy_win";
pub const TEMPLATE_REFUND: &str = "group_buy_refund";
pub const TEMPLATE_TIMEOUT: &str = "group_buy_timeout";

/// A credit that could not be applied after bounded retries. Represents real
/// user funds, so it is queued for an operator instead of being dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct EscalatedCredit {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub amount: Amount,
    pub op_key: String,
    pub reason: String,
}

/// In-process operator queue for settlement effects that exhausted retries.
#[derive(Default, Clone)]
pub struct EscalationQueue {
    entries: Arc<RwLock<Vec<EscalatedCredit>>>,
}

impl EscalationQueue {
    pub async fn push(&self, entry: EscalatedCredit) {
        self.entries.write().await.push(entry);
    }

    pub async fn drain(&self) -> Vec<EscalatedCredit> {
        std::mem::take(&mut *self.entries.write().await)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

/// Finalizes terminal sessions: pays out the winner, refunds everyone else,
/// exactly once per participant. Safe to re-run after a partial crash;
/// already settled rows are skipped and produce no further wallet calls.
pub struct SettlementService {
    store: SharedSessionStore,
    wallet: SharedWalletLedger,
    pickup_codes: SharedPickupCodeIssuer,
    notifier: SharedNotificationDispatcher,
    escalations: EscalationQueue,
}

impl SettlementService {
    pub fn new(
        store: SharedSessionStore,
        wallet: SharedWalletLedger,
        pickup_codes: SharedPickupCodeIssuer,
        notifier: SharedNotificationDispatcher,
        escalations: EscalationQueue,
    ) -> Self {
        Self {
            store,
            wallet,
            pickup_codes,
            notifier,
            escalations,
        }
    }

    pub fn escalations(&self) -> &EscalationQueue {
        &self.escalations
    }

    /// Settles a drawn session: the winner gets a pickup code, every other
    /// participant is refunded `price_per_person`.
    pub async fn settle_success(&self, session: &Session, record: &DrawRecord) -> Result<()> {
        if session.status != SessionStatus::Success {
            return Err(EngineError::InvariantViolation(format!(
                "settle_success on session {} with status {}",
                session.id, session.status
            )));
        }

        let participants = self.store.participants(session.id).await?;
        let fully_settled = participants.iter().all(|p| {
            p.status.is_settled()
                && (p.status != ParticipantStatus::Won || p.pickup_code.is_some())
        });
        if fully_settled {
            return Ok(());
        }

        let mut winner_seen = false;
        for participant in &participants {
            if participant.position == record.winning_position {
                winner_seen = true;
                self.settle_winner(session, record, participant).await?;
            } else {
                self.settle_loser(session, participant).await?;
            }
        }

        if !winner_seen {
            return Err(EngineError::InvariantViolation(format!(
                "no participant at winning position {} in session {}",
                record.winning_position, session.id
            )));
        }
        Ok(())
    }

    /// Refunds every participant of an expired session. The sweeper claims
    /// the `Timeout` status before this runs.
    pub async fn settle_timeout(&self, session: &Session) -> Result<()> {
        if session.status != SessionStatus::Timeout {
            return Err(EngineError::InvariantViolation(format!(
                "settle_timeout on session {} with status {}",
                session.id, session.status
            )));
        }

        for participant in self.store.participants(session.id).await? {
            if participant.status == ParticipantStatus::Refunded {
                continue;
            }
            if participant.status == ParticipantStatus::Won {
                return Err(EngineError::InvariantViolation(format!(
                    "winner row in timed-out session {}",
                    session.id
                )));
            }

            let op_key = operation_key(session.id, participant.user_id, "refund");
            if self
                .credit_with_retry(session.id, participant.user_id, participant.amount, &op_key)
                .await
            {
                self.store
                    .set_participant_status(
                        session.id,
                        participant.position,
                        ParticipantStatus::Refunded,
                    )
                    .await?;
                self.notifier
                    .send(
                        participant.user_id,
                        TEMPLATE_TIMEOUT,
                        json!({
                            "session_code": session.code.as_str(),
                            "refund_amount": participant.amount,
                        }),
                    )
                    .await;
            }
        }
        Ok(())
    }

    async fn settle_winner(
        &self,
        session: &Session,
        record: &DrawRecord,
        participant: &Participant,
    ) -> Result<()> {
        let first_pass = participant.status == ParticipantStatus::Pending;
        if first_pass {
            self.store
                .set_participant_status(session.id, participant.position, ParticipantStatus::Won)
                .await?;
        } else if participant.status != ParticipantStatus::Won {
            return Err(EngineError::InvariantViolation(format!(
                "winning participant of session {} has status {:?}",
                session.id, participant.status
            )));
        }

        // A failed issuance leaves the row `Won` without a code; the next
        // settlement run retries it.
        let mut code = participant.pickup_code.clone();
        if code.is_none() {
            match self.pickup_codes.issue().await {
                Ok(issued) => {
                    self.store
                        .set_pickup_code(session.id, participant.position, &issued)
                        .await?;
                    code = Some(issued);
                }
                Err(e) => {
                    tracing::error!(
                        session_id = %session.id,
                        user_id = participant.user_id,
                        error = %e,
                        "pickup code issuance failed; will retry on next settlement run"
                    );
                }
            }
        }

        if first_pass {
            self.notifier
                .send(
                    participant.user_id,
                    TEMPLATE_WIN,
                    json!({
                        "session_code": session.code.as_str(),
                        "winning_position": record.winning_position,
                        "pickup_code": code,
                    }),
                )
                .await;
            tracing::info!(
                session_id = %session.id,
                user_id = participant.user_id,
                position = participant.position,
                "winner settled"
            );
        }
        Ok(())
    }

    async fn settle_loser(&self, session: &Session, participant: &Participant) -> Result<()> {
        match participant.status {
            ParticipantStatus::Refunded => return Ok(()),
            ParticipantStatus::Won => {
                return Err(EngineError::InvariantViolation(format!(
                    "second winner row (position {}) in session {}",
                    participant.position, session.id
                )));
            }
            ParticipantStatus::Pending => {
                self.store
                    .set_participant_status(
                        session.id,
                        participant.position,
                        ParticipantStatus::Lost,
                    )
                    .await?;
            }
            // Lost with no confirmed credit yet: retry the refund below.
            ParticipantStatus::Lost => {}
        }

        let op_key = operation_key(session.id, participant.user_id, "refund");
        if self
            .credit_with_retry(session.id, participant.user_id, participant.amount, &op_key)
            .await
        {
            self.store
                .set_participant_status(
                    session.id,
                    participant.position,
                    ParticipantStatus::Refunded,
                )
                .await?;
            self.notifier
                .send(
                    participant.user_id,
                    TEMPLATE_REFUND,
                    json!({
                        "session_code": session.code.as_str(),
                        "refund_amount": participant.amount,
                    }),
                )
                .await;
        }
        Ok(())
    }

    /// Applies a refund credit, retrying transient ledger failures. Returns
    /// false after escalating; the participant keeps its pre-refund status so
    /// a later settlement run picks it up again.
    async fn credit_with_retry(
        &self,
        session_id: SessionId,
        user_id: UserId,
        amount: Amount,
        op_key: &str,
    ) -> bool {
        let mut last_error = String::new();
        for attempt in 1..=CREDIT_ATTEMPTS {
            match self.wallet.credit(user_id, amount, op_key).await {
                Ok(()) => return true,
                Err(e) => {
                    tracing::warn!(
                        %session_id,
                        user_id,
                        attempt,
                        error = %e,
                        "refund credit failed"
                    );
                    last_error = e.to_string();
                }
            }
        }

        tracing::error!(
            %session_id,
            user_id,
            op_key,
            "refund credit exhausted retries; escalating to operator queue"
        );
        self.escalations
            .push(EscalatedCredit {
                session_id,
                user_id,
                amount,
                op_key: op_key.to_string(),
                reason: last_error,
            })
            .await;
        false
    }
}
