use std::collections::VecDeque;

use crate::config::ProtocolConfig;
use crate::error::SessionError;
use crate::event::{CancelReason, SessionEvent};
use crate::net::protocol::{DisputeOutcome, Envelope, Evidence, Message, MessageKind, Metric};
use crate::net::transport::LinkState;
use crate::settlement::Payout;
use crate::sync::GameplaySync;
use crate::wallet::WalletError;

use super::model::{Amount, GameSession, Phase, PhaseKind, Role, TxHash, WalletAddress};
use super::timer::{TimerKind, TimerRequest};

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    ProposeStake {
        amount: Amount,
    },
    RespondToStake {
        accept: bool,
    },
    SetReady,
    UpdateLocalState {
        score: u32,
        metrics: Vec<Metric>,
        position: Option<f32>,
    },
    FinishGame,
    RaiseDispute {
        reason: String,
        evidence: Evidence,
    },
    SubmitEvidence(Evidence),
    ResolveDispute(DisputeOutcome),
    Cancel,
    Acknowledge,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::ProposeStake { .. } => "propose a stake",
            Command::RespondToStake { .. } => "respond to a stake",
            Command::SetReady => "ready up",
            Command::UpdateLocalState { .. } => "update game state",
            Command::FinishGame => "finish the game",
            Command::RaiseDispute { .. } => "raise a dispute",
            Command::SubmitEvidence(_) => "submit evidence",
            Command::ResolveDispute(_) => "resolve a dispute",
            Command::Cancel => "cancel",
            Command::Acknowledge => "acknowledge",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WalletOutcome {
    StakeLock {
        attempt: u32,
        result: Result<TxHash, WalletError>,
    },
    Settlement {
        attempt: u32,
        result: Result<TxHash, WalletError>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Command(Command),
    Envelope(Envelope),
    Wallet(WalletOutcome),
    Timer { kind: TimerKind, generation: u64 },
    Link(LinkState),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Send(Message),
    LockStake { amount: Amount, attempt: u32 },
    SubmitPayout { payout: Payout, attempt: u32 },
    ArmTimer(TimerRequest),
    CancelTimer(TimerKind),
    CancelAllTimers,
}

/// Transition logic for one session. Pure: it never touches the network, the
/// wallet or the clock. Side effects come back as [`Effect`]s for the caller
/// to execute.
pub struct SessionMachine {
    pub(crate) session: GameSession,
    pub(crate) config: ProtocolConfig,
    pub(crate) sync: GameplaySync,
    pub(crate) link_up: bool,
    pub(crate) opponent_away: bool,
    pub(crate) submits_payout: bool,
    acknowledged: bool,
    effects: Vec<Effect>,
    events: VecDeque<SessionEvent>,
}

impl SessionMachine {
    pub fn new(session: GameSession, config: ProtocolConfig) -> Self {
        Self {
            session,
            config,
            sync: GameplaySync::new(),
            link_up: true,
            opponent_away: false,
            submits_payout: false,
            acknowledged: false,
            effects: Vec::new(),
            events: VecDeque::new(),
        }
    }

    pub fn session(&self) -> &GameSession {
        &self.session
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    /// True once the UI acknowledged a terminal session.
    pub fn is_closed(&self) -> bool {
        self.acknowledged
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = SessionEvent> + '_ {
        self.events.drain(..)
    }

    pub fn start(&mut self) -> Vec<Effect> {
        log::info!(
            "session {}: joined as {} against {}",
            self.session.id,
            self.session.role,
            self.session
                .opponent
                .as_ref()
                .map(|o| o.display_name.as_str())
                .unwrap_or("?")
        );
        vec![Effect::Send(Message::Hello {
            player: self.session.local.info(),
        })]
    }

    pub fn handle(&mut self, input: Input, now_ms: u64) -> Result<Vec<Effect>, SessionError> {
        self.effects.clear();

        let result = if self.session.is_terminal() {
            self.handle_terminal(input)
        } else {
            match input {
                Input::Command(command) => self.on_command(command, now_ms),
                Input::Envelope(envelope) => self.on_envelope(envelope, now_ms),
                Input::Wallet(outcome) => self.on_wallet(outcome, now_ms),
                Input::Timer { kind, generation } => self.on_timer(kind, generation, now_ms),
                Input::Link(state) => self.on_link(state, now_ms),
            }
        };

        match result {
            Ok(()) => Ok(std::mem::take(&mut self.effects)),
            Err(err) => {
                self.effects.clear();
                log::warn!("session {}: rejected: {}", self.session.id, err);
                self.session.last_error = Some(err.to_string());
                self.events.push_back(SessionEvent::Rejected {
                    session_id: self.session.id.clone(),
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }

    fn handle_terminal(&mut self, input: Input) -> Result<(), SessionError> {
        match input {
            Input::Command(Command::Acknowledge) => {
                self.acknowledged = true;
                Ok(())
            }
            Input::Wallet(WalletOutcome::StakeLock {
                result: Ok(tx_hash),
                ..
            }) => {
                log::warn!(
                    "session {}: stake lock {} confirmed after the session ended",
                    self.session.id,
                    tx_hash
                );
                Ok(())
            }
            Input::Timer { .. } | Input::Link(_) | Input::Wallet(_) => Ok(()),
            Input::Command(_) | Input::Envelope(_) => Err(SessionError::Finalized),
        }
    }

    fn on_command(&mut self, command: Command, now: u64) -> Result<(), SessionError> {
        match command {
            Command::ProposeStake { amount } => self.on_propose_stake(amount, now),
            Command::RespondToStake { accept } => self.on_respond_to_stake(accept, now),
            Command::SetReady => self.on_set_ready(now),
            Command::UpdateLocalState {
                score,
                metrics,
                position,
            } => self.on_update_local_state(score, metrics, position),
            Command::FinishGame => self.on_finish_game(now),
            Command::RaiseDispute { reason, evidence } => {
                self.on_raise_dispute(reason, evidence, now)
            }
            Command::SubmitEvidence(evidence) => self.on_submit_evidence(evidence),
            Command::ResolveDispute(outcome) => self.on_resolve_dispute(outcome, now),
            Command::Cancel => self.on_cancel(),
            Command::Acknowledge => Err(self.invalid("acknowledge")),
        }
    }

    fn on_envelope(&mut self, envelope: Envelope, now: u64) -> Result<(), SessionError> {
        if envelope.session_id != self.session.id {
            return Err(SessionError::SessionMismatch(envelope.session_id));
        }

        let kind = envelope.kind();
        log::debug!("session {}: received {}", self.session.id, kind);

        if !kind.is_relay_authored() {
            self.touch_opponent(now);
        }

        match envelope.message {
            Message::Hello { .. } | Message::Rejoin { .. } | Message::Heartbeat => Ok(()),
            Message::Error { message } => {
                log::warn!("session {}: opponent error: {}", self.session.id, message);
                self.session.last_error = Some(message);
                Ok(())
            }
            Message::Cancel { reason } => self.on_remote_cancel(&reason),
            Message::StakeProposal(proposal) => self.on_stake_proposal(proposal, now),
            Message::StakeAccepted => self.on_stake_accepted(now),
            Message::StakeRejected { reason } => self.on_stake_rejected(&reason),
            Message::StakeLocked { tx_hash } => self.on_opponent_locked(tx_hash),
            Message::StakeLockFailed { reason } => self.on_opponent_lock_failed(&reason),
            Message::Ready => self.on_opponent_ready(now),
            Message::CountdownStart { seconds } => self.on_countdown_start(seconds, now),
            Message::GameStart { .. } => self.on_game_start(now),
            Message::GameState(snapshot) => self.on_snapshot(snapshot),
            Message::GameEnd(report) => self.on_opponent_game_end(report, now),
            Message::SettlementConfirmed { tx_hash } => self.on_settlement_confirmed(tx_hash, now),
            Message::SettlementFailed { reason } => self.on_settlement_failed(&reason),
            Message::DisputeRaise { reason, evidence } => {
                self.on_dispute_raised(reason, evidence, now)
            }
            Message::DisputeEvidence(evidence) => self.on_dispute_evidence(evidence),
            Message::DisputeResolved(outcome) => self.on_dispute_resolved(outcome, now),
            Message::OpponentDisconnected => self.on_opponent_disconnected(now),
            Message::OpponentState { connected } => {
                if connected {
                    self.touch_opponent(now);
                    Ok(())
                } else {
                    self.on_opponent_disconnected(now)
                }
            }
            Message::QueueJoin(_)
            | Message::QueueLeave
            | Message::QueueStatus { .. }
            | Message::MatchFound(_)
            | Message::MatchAccepted
            | Message::MatchDeclined
            | Message::MatchConfirmed => Err(self.unexpected(kind)),
        }
    }

    fn on_wallet(&mut self, outcome: WalletOutcome, now: u64) -> Result<(), SessionError> {
        match outcome {
            WalletOutcome::StakeLock { attempt, result } => self.on_lock_outcome(attempt, result),
            WalletOutcome::Settlement { attempt, result } => {
                self.on_payout_outcome(attempt, result, now)
            }
        }
    }

    fn on_timer(&mut self, kind: TimerKind, generation: u64, now: u64) -> Result<(), SessionError> {
        let phase = self.session.phase_kind();
        if generation != self.session.generation || kind.phase().is_some_and(|p| p != phase) {
            log::debug!(
                "session {}: stale {} timer ignored during {}",
                self.session.id,
                kind,
                phase
            );
            return Ok(());
        }

        match kind {
            TimerKind::StakeResponse => self.on_stake_response_timeout(),
            TimerKind::StakeLock => self.on_stake_lock_timeout(),
            TimerKind::Ready => self.cancel_on_timeout(kind, CancelReason::ReadyTimeout),
            TimerKind::Countdown => self.on_countdown_elapsed(now),
            TimerKind::Duration => self.on_duration_elapsed(now),
            TimerKind::Heartbeat => self.on_heartbeat_due(now),
            TimerKind::Liveness => self.on_liveness_check(now),
            TimerKind::ForfeitGrace => self.on_forfeit_grace(now),
            TimerKind::GameEnd => self.on_game_end_timeout(),
            TimerKind::Settlement => self.on_settlement_timeout(),
            TimerKind::DisputeWindow => self.on_dispute_window_closed(),
            TimerKind::Reconnect => self.on_reconnect_timeout(),
            TimerKind::OpponentReturn => self.on_opponent_return_timeout(),
        }
    }

    fn on_link(&mut self, state: LinkState, now: u64) -> Result<(), SessionError> {
        match state {
            LinkState::Disconnected => {
                if !self.link_up {
                    return Ok(());
                }
                self.link_up = false;
                log::warn!("session {}: link lost", self.session.id);
                self.push_event(SessionEvent::LinkChanged {
                    session_id: self.session.id.clone(),
                    connected: false,
                });
                if self.session.phase_kind().is_pre_play() {
                    self.arm(TimerKind::Reconnect, self.config.timeouts.reconnect_ms);
                }
            }
            LinkState::Connected => {
                if self.link_up {
                    return Ok(());
                }
                self.link_up = true;
                log::info!("session {}: link restored, rejoining", self.session.id);
                self.push_event(SessionEvent::LinkChanged {
                    session_id: self.session.id.clone(),
                    connected: true,
                });
                self.effects.push(Effect::CancelTimer(TimerKind::Reconnect));
                self.send(Message::Rejoin {
                    player_id: self.session.local.id.clone(),
                });
                if self.session.phase_kind() == PhaseKind::Playing {
                    self.send_snapshot(now);
                }
            }
        }
        Ok(())
    }

    fn on_reconnect_timeout(&mut self) -> Result<(), SessionError> {
        if self.link_up || !self.session.phase_kind().is_pre_play() {
            return Ok(());
        }
        self.cancel_on_timeout(TimerKind::Reconnect, CancelReason::Disconnected)
    }

    // Readiness and countdown.

    fn readiness_phase(&self) -> bool {
        match self.session.phase {
            Phase::Lobby => !self.session.config.is_wagered(),
            Phase::StakeLocked => true,
            _ => false,
        }
    }

    fn on_set_ready(&mut self, now: u64) -> Result<(), SessionError> {
        if !self.readiness_phase() {
            return Err(self.invalid("ready up"));
        }
        if self.session.local.is_ready {
            return Ok(());
        }
        self.session.local.is_ready = true;
        self.send(Message::Ready);
        self.maybe_start_countdown(now)
    }

    fn on_opponent_ready(&mut self, now: u64) -> Result<(), SessionError> {
        if !self.readiness_phase() {
            return Err(self.unexpected(MessageKind::Ready));
        }
        if let Some(opponent) = self.session.opponent.as_mut() {
            opponent.is_ready = true;
        }
        self.maybe_start_countdown(now)
    }

    fn maybe_start_countdown(&mut self, now: u64) -> Result<(), SessionError> {
        if self.session.role != Role::Host || !self.session.both_ready() {
            return Ok(());
        }
        let countdown_ms = self.config.countdown_ms();
        self.transition(Phase::Countdown {
            ends_at_ms: now + countdown_ms,
        })?;
        self.send(Message::CountdownStart {
            seconds: self.config.countdown_secs,
        });
        self.arm(TimerKind::Countdown, countdown_ms);
        Ok(())
    }

    fn on_countdown_start(&mut self, seconds: u8, now: u64) -> Result<(), SessionError> {
        self.expect_from(MessageKind::CountdownStart, Role::Host)?;
        if !self.readiness_phase() || !self.session.both_ready() {
            return Err(self.unexpected(MessageKind::CountdownStart));
        }
        let countdown_ms = seconds as u64 * 1000;
        self.transition(Phase::Countdown {
            ends_at_ms: now + countdown_ms,
        })?;
        self.arm(
            TimerKind::Countdown,
            countdown_ms + self.config.timeouts.start_grace_ms,
        );
        Ok(())
    }

    fn on_countdown_elapsed(&mut self, now: u64) -> Result<(), SessionError> {
        match self.session.role {
            Role::Host => {
                self.start_playing(now)?;
                self.send(Message::GameStart { started_at_ms: now });
                Ok(())
            }
            Role::Guest => self.cancel_on_timeout(TimerKind::Countdown, CancelReason::StartTimeout),
        }
    }

    fn on_game_start(&mut self, now: u64) -> Result<(), SessionError> {
        self.expect_from(MessageKind::GameStart, Role::Host)?;
        if self.session.phase_kind() != PhaseKind::Countdown {
            return Err(self.unexpected(MessageKind::GameStart));
        }
        self.start_playing(now)
    }

    // Cancellation.

    fn on_cancel(&mut self) -> Result<(), SessionError> {
        if !self.session.phase_kind().is_cancellable() {
            return Err(self.invalid("cancel"));
        }
        self.send(Message::Cancel {
            reason: CancelReason::UserCancelled.as_str().to_string(),
        });
        self.transition(Phase::Cancelled {
            reason: CancelReason::UserCancelled,
        })
    }

    fn on_remote_cancel(&mut self, reason: &str) -> Result<(), SessionError> {
        if !self.session.phase_kind().is_cancellable() {
            return Err(self.unexpected(MessageKind::Cancel));
        }
        log::info!("session {}: opponent cancelled: {}", self.session.id, reason);
        self.session.last_error = Some(format!("opponent cancelled: {}", reason));
        self.transition(Phase::Cancelled {
            reason: CancelReason::OpponentCancelled,
        })
    }

    /// Forced cancellation after a deadline. The opponent is told best effort.
    pub(crate) fn cancel_on_timeout(
        &mut self,
        timer: TimerKind,
        reason: CancelReason,
    ) -> Result<(), SessionError> {
        log::warn!(
            "session {}: {} timed out: {}",
            self.session.id,
            timer,
            reason.as_str()
        );
        self.push_event(SessionEvent::TimedOut {
            session_id: self.session.id.clone(),
            timer,
        });
        self.session.last_error = Some(reason.as_str().to_string());
        self.send(Message::Cancel {
            reason: reason.as_str().to_string(),
        });
        self.transition(Phase::Cancelled { reason })
    }

    // Shared plumbing for the phase handlers.

    pub(crate) fn transition(&mut self, next: Phase) -> Result<(), SessionError> {
        let from = self.session.phase_kind();
        let to = next.kind();
        if !from.can_transition_to(to) {
            return Err(SessionError::IllegalTransition { from, to });
        }

        self.session.phase = next;
        self.session.generation += 1;
        self.effects.push(Effect::CancelAllTimers);
        if !self.link_up && to.is_pre_play() {
            self.arm(TimerKind::Reconnect, self.config.timeouts.reconnect_ms);
        }
        if self.opponent_away && to.is_pre_play() {
            self.arm(TimerKind::OpponentReturn, self.config.timeouts.reconnect_ms);
        }

        log::info!("session {}: {} -> {}", self.session.id, from, to);
        self.push_event(SessionEvent::PhaseChanged {
            session_id: self.session.id.clone(),
            from,
            to,
        });
        Ok(())
    }

    pub(crate) fn set_winner(&mut self, winner: Option<WalletAddress>) {
        let Some(winner) = winner else {
            return;
        };
        match &self.session.winner {
            None => self.session.winner = Some(winner),
            Some(existing) if *existing != winner => {
                log::warn!(
                    "session {}: ignoring winner {} (already {})",
                    self.session.id,
                    winner,
                    existing
                );
            }
            Some(_) => {}
        }
    }

    pub(crate) fn send(&mut self, message: Message) {
        self.effects.push(Effect::Send(message));
    }

    pub(crate) fn effect(&mut self, effect: Effect) {
        self.effects.push(effect);
    }

    pub(crate) fn arm(&mut self, kind: TimerKind, after_ms: u64) {
        self.effects.push(Effect::ArmTimer(TimerRequest {
            kind,
            after_ms,
            generation: self.session.generation,
        }));
    }

    pub(crate) fn push_event(&mut self, event: SessionEvent) {
        self.events.push_back(event);
    }

    pub(crate) fn expect_from(&self, kind: MessageKind, role: Role) -> Result<(), SessionError> {
        let sender = self.session.role.opposite();
        if sender != role {
            return Err(SessionError::WrongRole { kind, role: sender });
        }
        Ok(())
    }

    pub(crate) fn require_role(
        &self,
        command: &'static str,
        required: Role,
    ) -> Result<(), SessionError> {
        if self.session.role != required {
            return Err(SessionError::NotPermitted { command, required });
        }
        Ok(())
    }

    pub(crate) fn unexpected(&self, kind: MessageKind) -> SessionError {
        SessionError::UnexpectedMessage {
            kind,
            phase: self.session.phase_kind(),
        }
    }

    pub(crate) fn invalid(&self, command: &'static str) -> SessionError {
        SessionError::InvalidCommand {
            command,
            phase: self.session.phase_kind(),
        }
    }
}
