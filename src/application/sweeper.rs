use crate::application::settlement::SettlementService;
use crate::domain::participant::ParticipantStatus;
use crate::domain::ports::{Clock, SessionStore, SharedClock, SharedSessionStore};
use crate::domain::session::SessionStatus;
use crate::error::{EngineError, Result};
use std::sync::Arc;
use std::time::Duration;

/// Background scan that expires sessions which never filled, then re-drives
/// settlement for any terminal session still carrying unsettled rows. The
/// sweeper only ever *claims* the `Timeout` transition; a session that fills
/// concurrently wins the race and the sweeper skips it without side effects.
pub struct TimeoutSweeper {
    store: SharedSessionStore,
    settlement: Arc<SettlementService>,
    clock: SharedClock,
}

impl TimeoutSweeper {
    pub fn new(
        store: SharedSessionStore,
        settlement: Arc<SettlementService>,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            settlement,
            clock,
        }
    }

    /// One scan. Returns how many sessions were transitioned to `Timeout`.
    pub async fn sweep_once(&self) -> Result<usize> {
        let now = self.clock.now_millis();
        let mut swept = 0;
        for session in self.store.expired_sessions(now).await? {
            match self.store.claim_timeout(session.id).await {
                Ok(true) => {
                    swept += 1;
                    tracing::info!(
                        session_id = %session.id,
                        code = %session.code,
                        participants = session.participant_count,
                        "session expired"
                    );
                    let session = match self.store.get(session.id).await? {
                        Some(s) => s,
                        None => continue,
                    };
                    if let Err(e) = self.settlement.settle_timeout(&session).await {
                        tracing::error!(
                            session_id = %session.id,
                            error = %e,
                            "timeout settlement failed; will retry on a later sweep"
                        );
                    }
                }
                Ok(false) => {
                    tracing::debug!(
                        session_id = %session.id,
                        "session finalized concurrently; skipping"
                    );
                }
                Err(e) => {
                    tracing::error!(session_id = %session.id, error = %e, "timeout claim failed");
                }
            }
        }

        self.resettle_terminal().await?;
        Ok(swept)
    }

    /// A crash or store failure partway through settlement leaves a terminal
    /// session with rows still `Pending`/`Lost` (or a winner without a pickup
    /// code), and the expiry scan will never revisit it. Settlement is
    /// idempotent per participant, so re-running it here eventually drains
    /// every pending effect.
    async fn resettle_terminal(&self) -> Result<()> {
        for session in self.store.all_sessions().await? {
            if !matches!(
                session.status,
                SessionStatus::Success | SessionStatus::Timeout
            ) {
                continue;
            }
            let participants = self.store.participants(session.id).await?;
            let unsettled = participants.iter().any(|p| {
                !p.status.is_settled()
                    || (p.status == ParticipantStatus::Won && p.pickup_code.is_none())
            });
            if !unsettled {
                continue;
            }

            tracing::info!(
                session_id = %session.id,
                status = %session.status,
                "re-running settlement for partially settled session"
            );
            let outcome = if session.status == SessionStatus::Success {
                match self.store.draw_record(session.id).await? {
                    Some(record) => self.settlement.settle_success(&session, &record).await,
                    None => Err(EngineError::InvariantViolation(format!(
                        "drawn session {} has no draw record",
                        session.id
                    ))),
                }
            } else {
                self.settlement.settle_timeout(&session).await
            };
            if let Err(e) = outcome {
                tracing::error!(
                    session_id = %session.id,
                    error = %e,
                    "re-settlement failed; will retry on a later sweep"
                );
            }
        }
        Ok(())
    }

    /// Interval loop; runs until the owning task is aborted. Errors are
    /// logged and the next tick proceeds.
    pub async fn run(&self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.sweep_once().await {
                tracing::error!(error = %e, "sweep failed");
            }
        }
    }
}
