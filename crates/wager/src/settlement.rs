use serde::{Deserialize, Serialize};

use crate::config::FeePolicy;
use crate::error::SessionError;
use crate::event::{DisputeReason, SessionEvent};
use crate::net::protocol::{Message, MessageKind};
use crate::session::machine::{Effect, SessionMachine};
use crate::session::model::{Amount, GameOverReason, Phase, PhaseKind, Role, TxHash, WalletAddress};
use crate::session::timer::TimerKind;
use crate::wallet::WalletError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub to: WalletAddress,
    pub amount: Amount,
}

/// Instruction handed to the wallet when a session settles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payout {
    pub winner: Option<WalletAddress>,
    pub pot: Amount,
    pub fee: Amount,
    pub transfers: Vec<Transfer>,
}

impl Payout {
    pub fn paid_to(&self, wallet: &WalletAddress) -> Amount {
        self.transfers
            .iter()
            .filter(|t| t.to == *wallet)
            .fold(Amount::ZERO, |acc, t| acc.saturating_add(t.amount))
    }
}

/// Winner takes both stakes minus the house fee. A draw refunds each stake
/// and the house takes nothing.
pub fn compute_payout(
    stake: Amount,
    winner: Option<&WalletAddress>,
    host: &WalletAddress,
    guest: &WalletAddress,
    fees: &FeePolicy,
) -> Payout {
    let pot = stake.saturating_add(stake);
    match winner {
        Some(winner) => {
            let fee = pot.basis_points(fees.house_fee_bps);
            let mut transfers = vec![Transfer {
                to: winner.clone(),
                amount: pot.saturating_sub(fee),
            }];
            if !fee.is_zero() {
                transfers.push(Transfer {
                    to: fees.house_wallet.clone(),
                    amount: fee,
                });
            }
            Payout {
                winner: Some(winner.clone()),
                pot,
                fee,
                transfers,
            }
        }
        None => Payout {
            winner: None,
            pot,
            fee: Amount::ZERO,
            transfers: vec![
                Transfer {
                    to: host.clone(),
                    amount: stake,
                },
                Transfer {
                    to: guest.clone(),
                    amount: stake,
                },
            ],
        },
    }
}

/// The host pays out, except after a forfeit where the side that stayed
/// connected does.
pub fn submits_payout(role: Role, reason: GameOverReason) -> bool {
    reason == GameOverReason::Forfeit || role == Role::Host
}

impl SessionMachine {
    fn payout(&self, winner: Option<&WalletAddress>) -> Payout {
        let local = self.session.local.wallet.clone();
        let opponent = self.session.opponent_wallet().cloned().unwrap_or_default();
        let (host, guest) = match self.session.role {
            Role::Host => (local, opponent),
            Role::Guest => (opponent, local),
        };
        compute_payout(
            self.session.agreed_stake,
            winner,
            &host,
            &guest,
            &self.config.fees,
        )
    }

    pub(crate) fn begin_settlement(
        &mut self,
        winner: Option<WalletAddress>,
        now: u64,
    ) -> Result<(), SessionError> {
        let reason = match &self.session.phase {
            Phase::GameOver { reason, .. } => *reason,
            _ => return Err(self.invalid("settle")),
        };

        if !self.session.config.is_wagered() {
            self.transition(Phase::Settling {
                winner,
                attempts: 0,
            })?;
            return self.settle(None, now);
        }

        self.submits_payout = submits_payout(self.session.role, reason);
        let attempts = if self.submits_payout { 1 } else { 0 };
        self.transition(Phase::Settling {
            winner: winner.clone(),
            attempts,
        })?;

        if self.submits_payout {
            let payout = self.payout(winner.as_ref());
            log::info!(
                "session {}: submitting payout of {} (fee {})",
                self.session.id,
                payout.pot.saturating_sub(payout.fee),
                payout.fee
            );
            self.effect(Effect::SubmitPayout {
                payout,
                attempt: 1,
            });
        }
        self.arm(TimerKind::Settlement, self.config.timeouts.settlement_ms);
        Ok(())
    }

    pub(crate) fn on_payout_outcome(
        &mut self,
        attempt: u32,
        result: Result<TxHash, WalletError>,
        now: u64,
    ) -> Result<(), SessionError> {
        let winner = match &self.session.phase {
            Phase::Settling { winner, .. } if self.submits_payout => winner.clone(),
            _ => {
                if let Ok(tx_hash) = result
                    && self.session.settle_tx.is_none()
                {
                    log::warn!(
                        "session {}: payout {} landed during {}",
                        self.session.id,
                        tx_hash,
                        self.session.phase_kind()
                    );
                    self.session.settle_tx = Some(tx_hash);
                }
                return Ok(());
            }
        };

        match result {
            Ok(tx_hash) => {
                self.send(Message::SettlementConfirmed {
                    tx_hash: tx_hash.clone(),
                });
                self.settle(Some(tx_hash), now)
            }
            Err(err) if attempt < self.config.retry.settlement_attempts => {
                log::warn!(
                    "session {}: payout attempt {} failed: {}",
                    self.session.id,
                    attempt,
                    err
                );
                if let Phase::Settling { attempts, .. } = &mut self.session.phase {
                    *attempts = attempt + 1;
                }
                let payout = self.payout(winner.as_ref());
                self.effect(Effect::SubmitPayout {
                    payout,
                    attempt: attempt + 1,
                });
                Ok(())
            }
            Err(err) => {
                log::warn!(
                    "session {}: payout failed after {} attempts: {}",
                    self.session.id,
                    attempt,
                    err
                );
                self.session.last_error = Some(format!("payout failed: {}", err));
                self.send(Message::SettlementFailed {
                    reason: err.to_string(),
                });
                self.transition(Phase::Disputed {
                    reason: DisputeReason::SettlementFailed,
                    evidence: Vec::new(),
                })
            }
        }
    }

    pub(crate) fn on_settlement_confirmed(
        &mut self,
        tx_hash: TxHash,
        now: u64,
    ) -> Result<(), SessionError> {
        match self.session.phase_kind() {
            PhaseKind::Settling if !self.submits_payout => self.settle(Some(tx_hash), now),
            PhaseKind::Settled if self.session.settle_tx.as_ref() == Some(&tx_hash) => Ok(()),
            _ => Err(self.unexpected(MessageKind::SettlementConfirmed)),
        }
    }

    pub(crate) fn on_settlement_failed(&mut self, reason: &str) -> Result<(), SessionError> {
        if self.session.phase_kind() != PhaseKind::Settling || self.submits_payout {
            return Err(self.unexpected(MessageKind::SettlementFailed));
        }
        self.session.last_error = Some(format!("payout failed: {}", reason));
        self.transition(Phase::Disputed {
            reason: DisputeReason::SettlementFailed,
            evidence: Vec::new(),
        })
    }

    /// The submitter gives up on a wallet that never answered and tells the
    /// opponent, which would otherwise wait out its own deadline.
    pub(crate) fn on_settlement_timeout(&mut self) -> Result<(), SessionError> {
        log::warn!("session {}: payout never confirmed", self.session.id);
        if self.submits_payout {
            self.send(Message::SettlementFailed {
                reason: DisputeReason::SettlementUnconfirmed.as_str().to_string(),
            });
        }
        self.push_event(SessionEvent::TimedOut {
            session_id: self.session.id.clone(),
            timer: TimerKind::Settlement,
        });
        self.session.last_error = Some(DisputeReason::SettlementUnconfirmed.as_str().to_string());
        self.transition(Phase::Disputed {
            reason: DisputeReason::SettlementUnconfirmed,
            evidence: Vec::new(),
        })
    }

    /// Enters `SETTLED` and opens the dispute window.
    pub(crate) fn settle(&mut self, tx_hash: Option<TxHash>, now: u64) -> Result<(), SessionError> {
        self.transition(Phase::Settled { settled_at_ms: now })?;
        if self.session.settle_tx.is_none() {
            self.session.settle_tx = tx_hash;
        }

        let window_ms = self.config.timeouts.dispute_window_ms;
        self.session.dispute_deadline_ms = crate::dispute::dispute_deadline(now, window_ms);
        log::info!(
            "session {}: settled, disputes accepted until {}",
            self.session.id,
            self.session.dispute_deadline_ms
        );
        self.arm(TimerKind::DisputeWindow, window_ms);
        Ok(())
    }
}
