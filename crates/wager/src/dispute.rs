use crate::error::SessionError;
use crate::event::{CancelReason, DisputeReason, SessionEvent};
use crate::net::protocol::{DisputeOutcome, Evidence, Message, MessageKind};
use crate::session::machine::SessionMachine;
use crate::session::model::{Phase, PhaseKind, Role};

pub fn dispute_deadline(settled_at_ms: u64, window_ms: u64) -> u64 {
    settled_at_ms.saturating_add(window_ms)
}

/// Local receive time decides. The deadline instant itself is closed.
pub fn window_open(deadline_ms: u64, now_ms: u64) -> bool {
    now_ms < deadline_ms
}

impl SessionMachine {
    fn check_window(&self, now: u64) -> Result<(), SessionError> {
        if !window_open(self.session.dispute_deadline_ms, now) {
            return Err(SessionError::DisputeWindowClosed);
        }
        Ok(())
    }

    pub(crate) fn on_raise_dispute(
        &mut self,
        reason: String,
        evidence: Evidence,
        now: u64,
    ) -> Result<(), SessionError> {
        if self.session.phase_kind() != PhaseKind::Settled {
            return Err(self.invalid("raise a dispute"));
        }
        self.check_window(now)?;

        self.send(Message::DisputeRaise {
            reason: reason.clone(),
            evidence: evidence.clone(),
        });
        self.open_dispute(self.session.role, reason, evidence)
    }

    pub(crate) fn on_dispute_raised(
        &mut self,
        reason: String,
        evidence: Evidence,
        now: u64,
    ) -> Result<(), SessionError> {
        match self.session.phase_kind() {
            PhaseKind::Settled => {
                self.check_window(now)?;
                self.open_dispute(self.session.role.opposite(), reason, evidence)
            }
            PhaseKind::Disputed => {
                self.push_evidence(evidence);
                Ok(())
            }
            _ => Err(self.unexpected(MessageKind::DisputeRaise)),
        }
    }

    fn open_dispute(
        &mut self,
        by: Role,
        reason: String,
        evidence: Evidence,
    ) -> Result<(), SessionError> {
        log::warn!(
            "session {}: dispute raised by {}: {}",
            self.session.id,
            by,
            reason
        );
        self.session.last_error = Some(format!("dispute: {}", reason));
        self.transition(Phase::Disputed {
            reason: DisputeReason::Raised { by, reason },
            evidence: vec![evidence],
        })
    }

    fn push_evidence(&mut self, item: Evidence) {
        if let Phase::Disputed { evidence, .. } = &mut self.session.phase {
            evidence.push(item);
        }
    }

    pub(crate) fn on_submit_evidence(&mut self, evidence: Evidence) -> Result<(), SessionError> {
        if self.session.phase_kind() != PhaseKind::Disputed {
            return Err(self.invalid("submit evidence"));
        }
        self.send(Message::DisputeEvidence(evidence.clone()));
        self.push_evidence(evidence);
        Ok(())
    }

    pub(crate) fn on_dispute_evidence(&mut self, evidence: Evidence) -> Result<(), SessionError> {
        if self.session.phase_kind() != PhaseKind::Disputed {
            return Err(self.unexpected(MessageKind::DisputeEvidence));
        }
        self.push_evidence(evidence);
        Ok(())
    }

    pub(crate) fn on_resolve_dispute(
        &mut self,
        outcome: DisputeOutcome,
        now: u64,
    ) -> Result<(), SessionError> {
        if self.session.phase_kind() != PhaseKind::Disputed {
            return Err(self.invalid("resolve a dispute"));
        }
        self.apply_resolution(outcome, now)
    }

    pub(crate) fn on_dispute_resolved(
        &mut self,
        outcome: DisputeOutcome,
        now: u64,
    ) -> Result<(), SessionError> {
        if self.session.phase_kind() != PhaseKind::Disputed {
            return Err(self.unexpected(MessageKind::DisputeResolved));
        }
        self.apply_resolution(outcome, now)
    }

    fn apply_resolution(&mut self, outcome: DisputeOutcome, now: u64) -> Result<(), SessionError> {
        match outcome {
            DisputeOutcome::Upheld { winner, tx_hash } => {
                log::info!("session {}: dispute resolved, result upheld", self.session.id);
                self.transition(Phase::Settled { settled_at_ms: now })?;
                self.session.dispute_deadline_ms =
                    dispute_deadline(now, self.config.timeouts.dispute_window_ms);
                self.set_winner(winner);
                if self.session.settle_tx.is_none() {
                    self.session.settle_tx = tx_hash;
                }
                self.finalize();
                Ok(())
            }
            DisputeOutcome::Voided => {
                log::info!("session {}: dispute resolved, session voided", self.session.id);
                self.session.last_error = Some(CancelReason::DisputeVoided.as_str().to_string());
                self.transition(Phase::Cancelled {
                    reason: CancelReason::DisputeVoided,
                })
            }
        }
    }

    pub(crate) fn on_dispute_window_closed(&mut self) -> Result<(), SessionError> {
        log::info!("session {}: dispute window closed", self.session.id);
        self.finalize();
        Ok(())
    }

    fn finalize(&mut self) {
        self.session.finalized = true;
        self.push_event(SessionEvent::Finalized {
            session_id: self.session.id.clone(),
        });
    }
}
