use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::event::CancelReason;
use crate::net::protocol::{Message, MessageKind, StakeProposal};
use crate::session::machine::{Effect, SessionMachine};
use crate::session::model::{Amount, Phase, PhaseKind, Role, SessionConfig, TxHash};
use crate::session::timer::TimerKind;
use crate::wallet::WalletError;

/// State carried by `STAKE_PENDING`. Each side's lock is tracked here until
/// both are confirmed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StakeNegotiation {
    pub proposal: StakeProposal,
    pub accepted: bool,
    pub local_lock: Option<TxHash>,
    pub opponent_lock: Option<TxHash>,
}

impl StakeNegotiation {
    pub fn new(proposal: StakeProposal) -> Self {
        Self {
            proposal,
            accepted: false,
            local_lock: None,
            opponent_lock: None,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.local_lock.is_some() && self.opponent_lock.is_some()
    }
}

pub fn validate_proposal(
    proposal: &StakeProposal,
    config: &SessionConfig,
) -> Result<(), SessionError> {
    if proposal.amount.is_zero() {
        return Err(SessionError::InvalidStake("amount must be positive".into()));
    }
    if proposal.game_type != config.game_type {
        return Err(SessionError::InvalidStake(format!(
            "game type {} does not match {}",
            proposal.game_type, config.game_type
        )));
    }
    if proposal.duration_ms != config.duration_ms {
        return Err(SessionError::InvalidStake(format!(
            "duration {}ms does not match {}ms",
            proposal.duration_ms, config.duration_ms
        )));
    }
    Ok(())
}

impl SessionMachine {
    fn negotiation(&self) -> Option<&StakeNegotiation> {
        match &self.session.phase {
            Phase::StakePending(negotiation) => Some(negotiation),
            _ => None,
        }
    }

    fn negotiation_mut(&mut self) -> Option<&mut StakeNegotiation> {
        match &mut self.session.phase {
            Phase::StakePending(negotiation) => Some(negotiation),
            _ => None,
        }
    }

    fn awaiting_locks(&self) -> bool {
        self.negotiation().is_some_and(|n| n.accepted)
    }

    pub(crate) fn on_propose_stake(&mut self, amount: Amount, _now: u64) -> Result<(), SessionError> {
        self.require_role("propose a stake", Role::Host)?;
        if !self.session.config.is_wagered() || self.session.phase_kind() != PhaseKind::Lobby {
            return Err(self.invalid("propose a stake"));
        }
        let proposal = StakeProposal {
            amount,
            game_type: self.session.config.game_type.clone(),
            duration_ms: self.session.config.duration_ms,
        };
        validate_proposal(&proposal, &self.session.config)?;

        log::info!("session {}: proposing stake {}", self.session.id, amount);
        self.transition(Phase::StakePending(StakeNegotiation::new(proposal.clone())))?;
        self.send(Message::StakeProposal(proposal));
        self.arm(
            TimerKind::StakeResponse,
            self.config.timeouts.stake_response_ms,
        );
        Ok(())
    }

    pub(crate) fn on_stake_proposal(
        &mut self,
        proposal: StakeProposal,
        _now: u64,
    ) -> Result<(), SessionError> {
        self.expect_from(MessageKind::StakeProposal, Role::Host)?;
        if !self.session.config.is_wagered() || self.session.phase_kind() != PhaseKind::Lobby {
            return Err(self.unexpected(MessageKind::StakeProposal));
        }
        validate_proposal(&proposal, &self.session.config)?;

        self.transition(Phase::StakePending(StakeNegotiation::new(proposal)))?;
        self.arm(
            TimerKind::StakeResponse,
            self.config.timeouts.stake_response_ms,
        );
        Ok(())
    }

    pub(crate) fn on_respond_to_stake(&mut self, accept: bool, _now: u64) -> Result<(), SessionError> {
        self.require_role("respond to a stake", Role::Guest)?;
        if self.negotiation().is_none_or(|n| n.accepted) {
            return Err(self.invalid("respond to a stake"));
        }

        if !accept {
            self.send(Message::StakeRejected {
                reason: "declined".to_string(),
            });
            return self.transition(Phase::Cancelled {
                reason: CancelReason::StakeRejected,
            });
        }

        self.send(Message::StakeAccepted);
        self.accept_stake();
        Ok(())
    }

    pub(crate) fn on_stake_accepted(&mut self, _now: u64) -> Result<(), SessionError> {
        self.expect_from(MessageKind::StakeAccepted, Role::Guest)?;
        if self.negotiation().is_none_or(|n| n.accepted) {
            return Err(self.unexpected(MessageKind::StakeAccepted));
        }
        self.accept_stake();
        Ok(())
    }

    fn accept_stake(&mut self) {
        let Some(negotiation) = self.negotiation_mut() else {
            return;
        };
        negotiation.accepted = true;
        let amount = negotiation.proposal.amount;

        self.session.agreed_stake = amount;
        log::info!(
            "session {}: stake {} accepted, locking",
            self.session.id,
            amount
        );
        self.effect(Effect::CancelTimer(TimerKind::StakeResponse));
        self.effect(Effect::LockStake { amount, attempt: 1 });
        self.arm(TimerKind::StakeLock, self.config.timeouts.stake_lock_ms);
    }

    pub(crate) fn on_stake_rejected(&mut self, reason: &str) -> Result<(), SessionError> {
        self.expect_from(MessageKind::StakeRejected, Role::Guest)?;
        if self.negotiation().is_none_or(|n| n.accepted) {
            return Err(self.unexpected(MessageKind::StakeRejected));
        }
        log::info!("session {}: stake rejected: {}", self.session.id, reason);
        self.session.last_error = Some(format!("stake rejected: {}", reason));
        self.transition(Phase::Cancelled {
            reason: CancelReason::StakeRejected,
        })
    }

    pub(crate) fn on_lock_outcome(
        &mut self,
        attempt: u32,
        result: Result<TxHash, WalletError>,
    ) -> Result<(), SessionError> {
        if !self.awaiting_locks() || self.negotiation().is_some_and(|n| n.local_lock.is_some()) {
            log::debug!(
                "session {}: ignoring stake lock result during {}",
                self.session.id,
                self.session.phase_kind()
            );
            return Ok(());
        }

        match result {
            Ok(tx_hash) => {
                log::info!("session {}: stake locked in {}", self.session.id, tx_hash);
                if let Some(negotiation) = self.negotiation_mut() {
                    negotiation.local_lock = Some(tx_hash.clone());
                }
                self.session.local.has_approved_stake = true;
                self.send(Message::StakeLocked { tx_hash });
                self.maybe_lock_in()
            }
            Err(err) if attempt < self.config.retry.stake_lock_attempts => {
                log::warn!(
                    "session {}: stake lock attempt {} failed: {}",
                    self.session.id,
                    attempt,
                    err
                );
                self.effect(Effect::LockStake {
                    amount: self.session.agreed_stake,
                    attempt: attempt + 1,
                });
                Ok(())
            }
            Err(err) => {
                log::warn!(
                    "session {}: stake lock failed after {} attempts: {}",
                    self.session.id,
                    attempt,
                    err
                );
                self.session.last_error = Some(format!("stake lock failed: {}", err));
                self.send(Message::StakeLockFailed {
                    reason: err.to_string(),
                });
                self.transition(Phase::Cancelled {
                    reason: CancelReason::StakeLockFailed,
                })
            }
        }
    }

    pub(crate) fn on_opponent_locked(&mut self, tx_hash: TxHash) -> Result<(), SessionError> {
        if !self.awaiting_locks() {
            return Err(self.unexpected(MessageKind::StakeLocked));
        }
        if let Some(negotiation) = self.negotiation_mut() {
            negotiation.opponent_lock = Some(tx_hash);
        }
        if let Some(opponent) = self.session.opponent.as_mut() {
            opponent.has_approved_stake = true;
        }
        self.maybe_lock_in()
    }

    pub(crate) fn on_opponent_lock_failed(&mut self, reason: &str) -> Result<(), SessionError> {
        if self.session.phase_kind() != PhaseKind::StakePending {
            return Err(self.unexpected(MessageKind::StakeLockFailed));
        }
        self.session.last_error = Some(format!("opponent stake lock failed: {}", reason));
        self.transition(Phase::Cancelled {
            reason: CancelReason::StakeLockFailed,
        })
    }

    fn maybe_lock_in(&mut self) -> Result<(), SessionError> {
        if !self.session.both_approved_stake() {
            return Ok(());
        }
        let Some(local_lock) = self
            .negotiation()
            .filter(|n| n.is_locked())
            .and_then(|n| n.local_lock.clone())
        else {
            return Ok(());
        };

        self.transition(Phase::StakeLocked)?;
        self.session.stake_lock_tx = Some(local_lock);
        self.arm(TimerKind::Ready, self.config.timeouts.ready_ms);
        Ok(())
    }

    pub(crate) fn on_stake_response_timeout(&mut self) -> Result<(), SessionError> {
        if self.awaiting_locks() {
            return Ok(());
        }
        self.cancel_on_timeout(TimerKind::StakeResponse, CancelReason::StakeResponseTimeout)
    }

    pub(crate) fn on_stake_lock_timeout(&mut self) -> Result<(), SessionError> {
        if !self.awaiting_locks() {
            return Ok(());
        }
        self.cancel_on_timeout(TimerKind::StakeLock, CancelReason::StakeLockTimeout)
    }
}
