use sha2::{Digest, Sha256};

use crate::error::SessionError;
use crate::event::{CancelReason, DisputeReason, SessionEvent};
use crate::net::protocol::{GameEndReport, GameSnapshot, Message, MessageKind, Metric};
use crate::session::machine::{Effect, SessionMachine};
use crate::session::model::{GameOverReason, Phase, PhaseKind, WalletAddress};
use crate::session::timer::TimerKind;

/// Per-game bookkeeping for snapshots and opponent liveness.
#[derive(Debug, Clone, Default)]
pub struct GameplaySync {
    last_seen_ms: u64,
    last_opponent_elapsed_ms: Option<u64>,
    next_sequence: u32,
    snapshots_sent: u32,
    local_metrics: Vec<Metric>,
    local_position: Option<f32>,
    final_elapsed_ms: u64,
}

impl GameplaySync {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self, now_ms: u64) {
        *self = Self {
            last_seen_ms: now_ms,
            ..Self::default()
        };
    }

    pub fn touch(&mut self, now_ms: u64) {
        self.last_seen_ms = self.last_seen_ms.max(now_ms);
    }

    pub fn last_seen_ms(&self) -> u64 {
        self.last_seen_ms
    }

    pub fn silent_for(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_seen_ms)
    }

    pub fn snapshots_sent(&self) -> u32 {
        self.snapshots_sent
    }

    /// Pins the elapsed time reported in every `GAME_END` for this game.
    pub fn freeze(&mut self, elapsed_ms: u64) {
        self.final_elapsed_ms = elapsed_ms;
    }

    pub fn final_elapsed_ms(&self) -> u64 {
        self.final_elapsed_ms
    }

    pub fn record_local(&mut self, metrics: Vec<Metric>, position: Option<f32>) {
        self.local_metrics = metrics;
        self.local_position = position;
    }

    pub fn next_snapshot(&mut self, elapsed_ms: u64, score: u32) -> GameSnapshot {
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        self.snapshots_sent += 1;
        GameSnapshot {
            sequence,
            elapsed_ms,
            score,
            metrics: self.local_metrics.clone(),
            position: self.local_position,
        }
    }

    /// Returns false for a snapshot older than the last accepted one.
    pub fn accept(&mut self, snapshot: &GameSnapshot) -> bool {
        if self
            .last_opponent_elapsed_ms
            .is_some_and(|last| snapshot.elapsed_ms < last)
        {
            return false;
        }
        self.last_opponent_elapsed_ms = Some(snapshot.elapsed_ms);
        true
    }
}

pub fn integrity_hash(
    session_id: &str,
    final_score: u32,
    opponent_score: u32,
    elapsed_ms: u64,
    snapshots_sent: u32,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(session_id.as_bytes());
    hasher.update(final_score.to_le_bytes());
    hasher.update(opponent_score.to_le_bytes());
    hasher.update(elapsed_ms.to_le_bytes());
    hasher.update(snapshots_sent.to_le_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Higher authoritative score wins. A tie, or a leader below the activity
/// threshold, is a draw.
pub fn decide_winner(
    local_score: u32,
    opponent_score: u32,
    local_wallet: &WalletAddress,
    opponent_wallet: &WalletAddress,
    min_activity: u32,
) -> Option<WalletAddress> {
    let (score, wallet) = if local_score > opponent_score {
        (local_score, local_wallet)
    } else if opponent_score > local_score {
        (opponent_score, opponent_wallet)
    } else {
        return None;
    };
    (score >= min_activity).then(|| wallet.clone())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    Agreed { winner: Option<WalletAddress> },
    Mismatch(String),
}

pub fn reconcile(
    local: &GameEndReport,
    remote: &GameEndReport,
    local_wallet: &WalletAddress,
    opponent_wallet: &WalletAddress,
    min_activity: u32,
) -> Reconciliation {
    if local.final_score != remote.opponent_score || local.opponent_score != remote.final_score {
        return Reconciliation::Mismatch(format!(
            "scores disagree: {}/{} vs {}/{}",
            local.final_score, local.opponent_score, remote.final_score, remote.opponent_score
        ));
    }
    if local.declared_winner != remote.declared_winner {
        return Reconciliation::Mismatch("declared winners differ".to_string());
    }
    let computed = decide_winner(
        local.final_score,
        remote.final_score,
        local_wallet,
        opponent_wallet,
        min_activity,
    );
    if computed != local.declared_winner {
        return Reconciliation::Mismatch("declared winner contradicts the scores".to_string());
    }
    Reconciliation::Agreed { winner: computed }
}

impl SessionMachine {
    pub(crate) fn start_playing(&mut self, now: u64) -> Result<(), SessionError> {
        let duration_ms = self.session.config.duration_ms;
        self.transition(Phase::Playing {
            ends_at_ms: now + duration_ms,
            silent_since_ms: None,
        })?;
        self.session.started_at_ms = now;
        self.sync.reset(now);

        let timeouts = &self.config.timeouts;
        let (heartbeat, liveness) = (timeouts.heartbeat_interval_ms, timeouts.liveness_ms);
        self.arm(TimerKind::Duration, duration_ms);
        self.arm(TimerKind::Heartbeat, heartbeat);
        self.arm(TimerKind::Liveness, liveness);
        Ok(())
    }

    pub(crate) fn on_update_local_state(
        &mut self,
        score: u32,
        metrics: Vec<Metric>,
        position: Option<f32>,
    ) -> Result<(), SessionError> {
        if self.session.phase_kind() != PhaseKind::Playing {
            return Err(self.invalid("update game state"));
        }
        self.session.local_score = score;
        self.sync.record_local(metrics, position);
        Ok(())
    }

    fn elapsed_ms(&self, now: u64) -> u64 {
        now.saturating_sub(self.session.started_at_ms)
            .min(self.session.config.duration_ms)
    }

    pub(crate) fn send_snapshot(&mut self, now: u64) {
        let elapsed = self.elapsed_ms(now);
        let snapshot = self.sync.next_snapshot(elapsed, self.session.local_score);
        self.send(Message::GameState(snapshot));
    }

    pub(crate) fn on_heartbeat_due(&mut self, now: u64) -> Result<(), SessionError> {
        if self.link_up {
            self.send_snapshot(now);
        }
        self.arm(
            TimerKind::Heartbeat,
            self.config.timeouts.heartbeat_interval_ms,
        );
        Ok(())
    }

    pub(crate) fn on_snapshot(&mut self, snapshot: GameSnapshot) -> Result<(), SessionError> {
        let phase = self.session.phase_kind();
        if phase.is_pre_play() {
            return Err(self.unexpected(MessageKind::GameState));
        }
        if phase != PhaseKind::Playing {
            // still in flight when the game ended
            return Ok(());
        }
        if !self.sync.accept(&snapshot) {
            log::debug!(
                "session {}: dropped stale snapshot #{}",
                self.session.id,
                snapshot.sequence
            );
            return Ok(());
        }
        self.session.opponent_score = snapshot.score;
        self.session.opponent_metrics = snapshot.metrics;
        self.session.opponent_position = snapshot.position;
        Ok(())
    }

    pub(crate) fn touch_opponent(&mut self, now: u64) {
        if self.opponent_away {
            log::info!("session {}: opponent rejoined", self.session.id);
            self.opponent_away = false;
            self.effect(Effect::CancelTimer(TimerKind::OpponentReturn));
        }
        if self.session.phase_kind() != PhaseKind::Playing {
            return;
        }
        self.sync.touch(now);
        if let Phase::Playing {
            silent_since_ms, ..
        } = &mut self.session.phase
            && silent_since_ms.take().is_some()
        {
            log::info!("session {}: opponent is back", self.session.id);
            self.effect(Effect::CancelTimer(TimerKind::ForfeitGrace));
            self.arm(TimerKind::Liveness, self.config.timeouts.liveness_ms);
        }
    }

    pub(crate) fn on_liveness_check(&mut self, now: u64) -> Result<(), SessionError> {
        let liveness_ms = self.config.timeouts.liveness_ms;
        let silent = self.sync.silent_for(now);
        if silent < liveness_ms {
            self.arm(TimerKind::Liveness, liveness_ms - silent);
            return Ok(());
        }
        self.mark_opponent_silent();
        Ok(())
    }

    fn mark_opponent_silent(&mut self) {
        let since = self.sync.last_seen_ms();
        let Phase::Playing {
            silent_since_ms, ..
        } = &mut self.session.phase
        else {
            return;
        };
        if silent_since_ms.is_some() {
            return;
        }
        *silent_since_ms = Some(since);

        log::warn!(
            "session {}: opponent silent since {}, forfeit in {}ms",
            self.session.id,
            since,
            self.config.timeouts.forfeit_grace_ms
        );
        self.session.last_error = Some("opponent disconnected".to_string());
        self.push_event(SessionEvent::OpponentSilent {
            session_id: self.session.id.clone(),
            since_ms: since,
        });
        self.arm(TimerKind::ForfeitGrace, self.config.timeouts.forfeit_grace_ms);
    }

    pub(crate) fn on_opponent_disconnected(&mut self, _now: u64) -> Result<(), SessionError> {
        let phase = self.session.phase_kind();
        if phase == PhaseKind::Playing {
            self.mark_opponent_silent();
            return Ok(());
        }
        if phase.is_pre_play() && !self.opponent_away {
            // Give the opponent the same reconnect window we would get.
            log::warn!("session {}: opponent dropped before play", self.session.id);
            self.opponent_away = true;
            self.arm(TimerKind::OpponentReturn, self.config.timeouts.reconnect_ms);
        }
        // After play the game end and settlement deadlines cover a missing peer.
        Ok(())
    }

    pub(crate) fn on_opponent_return_timeout(&mut self) -> Result<(), SessionError> {
        if !self.opponent_away || !self.session.phase_kind().is_pre_play() {
            return Ok(());
        }
        self.cancel_on_timeout(TimerKind::OpponentReturn, CancelReason::OpponentDisconnected)
    }

    pub(crate) fn on_forfeit_grace(&mut self, now: u64) -> Result<(), SessionError> {
        let silent = matches!(
            self.session.phase,
            Phase::Playing {
                silent_since_ms: Some(_),
                ..
            }
        );
        if !silent {
            return Ok(());
        }
        if !self.link_up {
            // We cannot tell who dropped. Let the game run out instead.
            log::warn!(
                "session {}: local link is down, not claiming a forfeit",
                self.session.id
            );
            return Ok(());
        }
        self.push_event(SessionEvent::TimedOut {
            session_id: self.session.id.clone(),
            timer: TimerKind::ForfeitGrace,
        });
        self.end_game(GameOverReason::Forfeit, None, now)
    }

    pub(crate) fn on_finish_game(&mut self, now: u64) -> Result<(), SessionError> {
        if self.session.phase_kind() != PhaseKind::Playing {
            return Err(self.invalid("finish the game"));
        }
        self.end_game(GameOverReason::Finished, None, now)
    }

    pub(crate) fn on_duration_elapsed(&mut self, now: u64) -> Result<(), SessionError> {
        self.end_game(GameOverReason::DurationElapsed, None, now)
    }

    pub(crate) fn on_opponent_game_end(
        &mut self,
        report: GameEndReport,
        now: u64,
    ) -> Result<(), SessionError> {
        match self.session.phase_kind() {
            PhaseKind::Playing => {
                // The opponent's own score is authoritative for its side.
                self.session.opponent_score = report.final_score;
                self.end_game(GameOverReason::OpponentFinished, Some(report), now)
            }
            PhaseKind::GameOver => self.store_opponent_report(report, now),
            _ => Err(self.unexpected(MessageKind::GameEnd)),
        }
    }

    /// A repeated report may only revise the sender's view of our score.
    fn store_opponent_report(
        &mut self,
        report: GameEndReport,
        now: u64,
    ) -> Result<(), SessionError> {
        let Phase::GameOver {
            opponent_report, ..
        } = &mut self.session.phase
        else {
            return Ok(());
        };
        let accepted = match opponent_report.as_ref() {
            Some(existing) if *existing == report => return Ok(()),
            Some(existing) => existing.final_score == report.final_score,
            None => true,
        };
        if !accepted {
            return Err(SessionError::UnexpectedMessage {
                kind: MessageKind::GameEnd,
                phase: PhaseKind::GameOver,
            });
        }
        *opponent_report = Some(report);
        self.reconcile_results(now)
    }

    fn local_report(&self, reason: GameOverReason) -> GameEndReport {
        let local_wallet = self.session.local.wallet.clone();
        let opponent_wallet = self.session.opponent_wallet().cloned().unwrap_or_default();
        let (local_score, opponent_score) = (self.session.local_score, self.session.opponent_score);

        let declared_winner = match reason {
            GameOverReason::Forfeit => Some(local_wallet),
            _ => decide_winner(
                local_score,
                opponent_score,
                &local_wallet,
                &opponent_wallet,
                self.session.config.min_activity,
            ),
        };
        GameEndReport {
            final_score: local_score,
            opponent_score,
            declared_winner,
            integrity_hash: integrity_hash(
                &self.session.id,
                local_score,
                opponent_score,
                self.sync.final_elapsed_ms(),
                self.sync.snapshots_sent(),
            ),
        }
    }

    /// Freezes scores, sends the local `GAME_END` and moves to `GAME_OVER`.
    pub(crate) fn end_game(
        &mut self,
        reason: GameOverReason,
        opponent_report: Option<GameEndReport>,
        now: u64,
    ) -> Result<(), SessionError> {
        self.sync.freeze(self.elapsed_ms(now));
        let report = self.local_report(reason);
        let has_opponent_report = opponent_report.is_some();

        self.transition(Phase::GameOver {
            reason,
            local_report: report.clone(),
            opponent_report,
        })?;
        self.send(Message::GameEnd(report));

        if reason == GameOverReason::Forfeit {
            let local_wallet = self.session.local.wallet.clone();
            log::info!("session {}: won by forfeit", self.session.id);
            self.set_winner(Some(local_wallet.clone()));
            return self.begin_settlement(Some(local_wallet), now);
        }
        self.arm(TimerKind::GameEnd, self.config.timeouts.game_end_ms);
        if has_opponent_report {
            return self.reconcile_results(now);
        }
        Ok(())
    }

    /// Reconciles once both reports describe the same final scores. Views
    /// taken from the last heartbeat may lag, so each side first corrects its
    /// own report from the other's authoritative score and sends it again.
    fn reconcile_results(&mut self, now: u64) -> Result<(), SessionError> {
        let Phase::GameOver {
            reason,
            local_report,
            opponent_report: Some(remote),
        } = &self.session.phase
        else {
            return Ok(());
        };
        let (reason, remote) = (*reason, remote.clone());

        if remote.final_score != local_report.opponent_score {
            self.revise_report(reason, remote.final_score);
        }
        if remote.opponent_score != self.session.local_score {
            log::debug!(
                "session {}: opponent reported {} for us, waiting for its revision",
                self.session.id,
                remote.opponent_score
            );
            return Ok(());
        }

        let Phase::GameOver { local_report, .. } = &self.session.phase else {
            return Ok(());
        };
        let opponent_wallet = self.session.opponent_wallet().cloned().unwrap_or_default();
        let outcome = reconcile(
            local_report,
            &remote,
            &self.session.local.wallet,
            &opponent_wallet,
            self.session.config.min_activity,
        );

        match outcome {
            Reconciliation::Agreed { winner } => {
                log::info!(
                    "session {}: results agree, winner {}",
                    self.session.id,
                    winner.as_ref().map(|w| w.as_str()).unwrap_or("none (draw)")
                );
                self.set_winner(winner.clone());
                self.begin_settlement(winner, now)
            }
            Reconciliation::Mismatch(detail) => {
                log::warn!("session {}: {}", self.session.id, detail);
                self.session.last_error = Some(detail);
                self.transition(Phase::Disputed {
                    reason: DisputeReason::ScoreMismatch,
                    evidence: Vec::new(),
                })
            }
        }
    }

    fn revise_report(&mut self, reason: GameOverReason, opponent_score: u32) {
        log::info!(
            "session {}: opponent finished on {}, not {}",
            self.session.id,
            opponent_score,
            self.session.opponent_score
        );
        self.session.opponent_score = opponent_score;
        let report = self.local_report(reason);
        if let Phase::GameOver { local_report, .. } = &mut self.session.phase {
            *local_report = report.clone();
        }
        self.send(Message::GameEnd(report));
    }

    pub(crate) fn on_game_end_timeout(&mut self) -> Result<(), SessionError> {
        log::warn!("session {}: opponent never reported a result", self.session.id);
        self.push_event(SessionEvent::TimedOut {
            session_id: self.session.id.clone(),
            timer: TimerKind::GameEnd,
        });
        self.session.last_error = Some(DisputeReason::MissingResult.as_str().to_string());
        self.transition(Phase::Disputed {
            reason: DisputeReason::MissingResult,
            evidence: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::machine::tests::*;
    use crate::session::machine::{Command, Input};
    use crate::session::model::{Role, SessionConfig};

    fn report(final_score: u32, opponent_score: u32, winner: Option<&str>) -> GameEndReport {
        GameEndReport {
            final_score,
            opponent_score,
            declared_winner: winner.map(WalletAddress::from),
            integrity_hash: String::new(),
        }
    }

    fn snapshot(elapsed_ms: u64, score: u32) -> GameSnapshot {
        GameSnapshot {
            sequence: 0,
            elapsed_ms,
            score,
            metrics: vec![],
            position: None,
        }
    }

    #[test]
    fn test_decide_winner_and_min_activity() {
        let a = WalletAddress::from("0xa");
        let b = WalletAddress::from("0xb");
        assert_eq!(decide_winner(120, 95, &a, &b, 0), Some(a.clone()));
        assert_eq!(decide_winner(95, 120, &a, &b, 0), Some(b.clone()));
        assert_eq!(decide_winner(50, 50, &a, &b, 0), None);
        assert_eq!(decide_winner(5, 2, &a, &b, 10), None);
    }

    #[test]
    fn test_reconcile_consistent_and_mismatched() {
        let a = WalletAddress::from("0xalice");
        let b = WalletAddress::from("0xbob");

        let agreed = reconcile(
            &report(120, 95, Some("0xalice")),
            &report(95, 120, Some("0xalice")),
            &a,
            &b,
            0,
        );
        assert_eq!(agreed, Reconciliation::Agreed { winner: Some(a.clone()) });

        let wrong_winner = reconcile(
            &report(120, 95, Some("0xalice")),
            &report(95, 120, Some("0xbob")),
            &a,
            &b,
            0,
        );
        assert!(matches!(wrong_winner, Reconciliation::Mismatch(_)));

        let wrong_view = reconcile(
            &report(120, 95, Some("0xalice")),
            &report(95, 110, Some("0xalice")),
            &a,
            &b,
            0,
        );
        assert!(matches!(wrong_view, Reconciliation::Mismatch(_)));
    }

    #[test]
    fn test_integrity_hash_is_stable_hex() {
        let first = integrity_hash("s-1", 120, 95, 60_000, 60);
        assert_eq!(first.len(), 64);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(first, integrity_hash("s-1", 120, 95, 60_000, 60));
        assert_ne!(first, integrity_hash("s-1", 121, 95, 60_000, 60));
    }

    #[test]
    fn test_stale_snapshot_dropped() {
        let mut sync = GameplaySync::new();
        assert!(sync.accept(&snapshot(2_000, 5)));
        assert!(!sync.accept(&snapshot(1_000, 3)));
        assert!(sync.accept(&snapshot(2_000, 6)));
    }

    #[test]
    fn test_scenario_liveness_then_forfeit() {
        let (mut host, _) = playing_pair(wagered_config());
        let start = host.session().started_at_ms;
        let liveness = host.config().timeouts.liveness_ms;
        let grace = host.config().timeouts.forfeit_grace_ms;

        fire(&mut host, TimerKind::Liveness, start + liveness);
        match host.session().phase {
            Phase::Playing {
                silent_since_ms, ..
            } => assert_eq!(silent_since_ms, Some(start)),
            _ => panic!("expected PLAYING"),
        }

        let effects = fire(&mut host, TimerKind::ForfeitGrace, start + liveness + grace);
        assert!(sent(&effects).contains(&MessageKind::GameEnd));
        assert_eq!(
            phases(&mut host),
            vec![PhaseKind::GameOver, PhaseKind::Settling]
        );
        assert_eq!(host.session().winner, Some(WalletAddress::from("0xalice")));
        assert!(
            effects
                .iter()
                .any(|e| matches!(e, Effect::SubmitPayout { .. }))
        );
    }

    #[test]
    fn test_opponent_traffic_keeps_liveness() {
        let (mut host, _) = playing_pair(wagered_config());
        let start = host.session().started_at_ms;

        host.handle(envelope(Message::GameState(snapshot(6_000, 4)), start + 6_000), start + 6_000)
            .unwrap();
        let effects = fire(&mut host, TimerKind::Liveness, start + 10_000);

        assert_eq!(host.session().phase_kind(), PhaseKind::Playing);
        assert_eq!(host.session().opponent_score, 4);
        assert_eq!(armed(&effects, TimerKind::Liveness).unwrap().after_ms, 6_000);
        assert!(armed(&effects, TimerKind::ForfeitGrace).is_none());
    }

    #[test]
    fn test_silent_opponent_returns_before_grace() {
        let (mut host, _) = playing_pair(wagered_config());
        let start = host.session().started_at_ms;
        fire(&mut host, TimerKind::Liveness, start + 10_000);

        let effects = host
            .handle(envelope(Message::Heartbeat, start + 11_000), start + 11_000)
            .unwrap();
        assert!(effects.contains(&Effect::CancelTimer(TimerKind::ForfeitGrace)));

        fire(&mut host, TimerKind::ForfeitGrace, start + 15_000);
        assert_eq!(host.session().phase_kind(), PhaseKind::Playing);
    }

    #[test]
    fn test_scenario_consistent_results_settle() {
        let (mut host, mut guest) = playing_pair(wagered_config());
        let start = host.session().started_at_ms;

        host.handle(
            Input::Command(Command::UpdateLocalState {
                score: 120,
                metrics: vec![],
                position: None,
            }),
            start + 1_000,
        )
        .unwrap();
        guest
            .handle(
                Input::Command(Command::UpdateLocalState {
                    score: 95,
                    metrics: vec![],
                    position: None,
                }),
                start + 1_000,
            )
            .unwrap();
        host.handle(envelope(Message::GameState(snapshot(1_000, 95)), start + 1_000), start + 1_000)
            .unwrap();
        guest
            .handle(envelope(Message::GameState(snapshot(1_000, 120)), start + 1_000), start + 1_000)
            .unwrap();

        let end = start + 60_000;
        fire(&mut host, TimerKind::Duration, end);
        fire(&mut guest, TimerKind::Duration, end);
        let host_report = report_of(&host);
        let guest_report = report_of(&guest);
        assert_eq!(host_report.final_score, 120);
        assert_eq!(guest_report.opponent_score, 120);

        let host_effects = host
            .handle(envelope(Message::GameEnd(guest_report), end), end)
            .unwrap();
        guest
            .handle(envelope(Message::GameEnd(host_report), end), end)
            .unwrap();

        assert_eq!(host.session().phase_kind(), PhaseKind::Settling);
        assert_eq!(guest.session().phase_kind(), PhaseKind::Settling);
        assert_eq!(host.session().winner, Some(WalletAddress::from("0xalice")));
        assert_eq!(guest.session().winner, Some(WalletAddress::from("0xalice")));
        assert!(
            host_effects
                .iter()
                .any(|e| matches!(e, Effect::SubmitPayout { .. }))
        );
    }

    #[test]
    fn test_scenario_mismatched_winner_disputes() {
        let (mut host, _) = playing_pair(wagered_config());
        let start = host.session().started_at_ms;
        host.handle(
            Input::Command(Command::UpdateLocalState {
                score: 120,
                metrics: vec![],
                position: None,
            }),
            start + 1_000,
        )
        .unwrap();
        host.handle(envelope(Message::GameState(snapshot(1_000, 95)), start + 1_000), start + 1_000)
            .unwrap();
        host.handle(Input::Command(Command::FinishGame), start + 2_000)
            .unwrap();

        let effects = host
            .handle(
                envelope(Message::GameEnd(report(95, 120, Some("0xbob"))), start + 2_000),
                start + 2_000,
            )
            .unwrap();

        assert_eq!(
            host.session().phase,
            Phase::Disputed {
                reason: DisputeReason::ScoreMismatch,
                evidence: vec![]
            }
        );
        assert!(host.session().winner.is_none());
        assert!(
            !effects
                .iter()
                .any(|e| matches!(e, Effect::SubmitPayout { .. }))
        );
    }

    #[test]
    fn test_missing_result_disputes() {
        let (mut host, _) = playing_pair(wagered_config());
        let start = host.session().started_at_ms;
        host.handle(Input::Command(Command::FinishGame), start + 2_000)
            .unwrap();
        fire(&mut host, TimerKind::GameEnd, start + 17_000);

        assert_eq!(
            host.session().phase,
            Phase::Disputed {
                reason: DisputeReason::MissingResult,
                evidence: vec![]
            }
        );
        assert!(host.session().last_error.is_some());
    }

    #[test]
    fn test_relay_disconnect_before_play_waits_for_rejoin() {
        let mut guest = machine(Role::Guest, SessionConfig::friendly("sprint", 30_000));
        let effects = guest
            .handle(envelope(Message::OpponentDisconnected, T0), T0)
            .unwrap();
        assert_eq!(guest.session().phase_kind(), PhaseKind::Lobby);
        assert_eq!(
            armed(&effects, TimerKind::OpponentReturn).map(|r| r.after_ms),
            Some(guest.config().timeouts.reconnect_ms)
        );

        let effects = guest
            .handle(
                envelope(
                    Message::Rejoin {
                        player_id: "p-alice".to_string(),
                    },
                    T0 + 1_000,
                ),
                T0 + 1_000,
            )
            .unwrap();
        assert!(effects.contains(&Effect::CancelTimer(TimerKind::OpponentReturn)));
        // A timer that slipped through the cancel is ignored.
        fire(&mut guest, TimerKind::OpponentReturn, T0 + 30_000);
        assert_eq!(guest.session().phase_kind(), PhaseKind::Lobby);
    }

    #[test]
    fn test_opponent_that_never_returns_cancels() {
        let mut guest = machine(Role::Guest, SessionConfig::friendly("sprint", 30_000));
        guest
            .handle(envelope(Message::OpponentDisconnected, T0), T0)
            .unwrap();
        let effects = fire(&mut guest, TimerKind::OpponentReturn, T0 + 30_000);

        assert_eq!(sent(&effects), vec![MessageKind::Cancel]);
        assert_eq!(
            guest.session().phase,
            Phase::Cancelled {
                reason: CancelReason::OpponentDisconnected
            }
        );
    }

    fn score(machine: &mut SessionMachine, score: u32, now: u64) {
        machine
            .handle(
                Input::Command(Command::UpdateLocalState {
                    score,
                    metrics: vec![],
                    position: None,
                }),
                now,
            )
            .unwrap();
    }

    fn sent_report(effects: &[Effect]) -> Option<GameEndReport> {
        effects.iter().find_map(|e| match e {
            Effect::Send(Message::GameEnd(report)) => Some(report.clone()),
            _ => None,
        })
    }

    #[test]
    fn test_snapshot_publishes_opponent_metrics() {
        let (mut host, _) = playing_pair(wagered_config());
        let start = host.session().started_at_ms;
        let snapshot = GameSnapshot {
            sequence: 3,
            elapsed_ms: 3_000,
            score: 42,
            metrics: vec![Metric::new("laps", 2.0)],
            position: Some(0.75),
        };

        host.handle(envelope(Message::GameState(snapshot), start + 3_000), start + 3_000)
            .unwrap();

        let session = host.session();
        assert_eq!(session.opponent_score, 42);
        assert_eq!(session.opponent_metrics, vec![Metric::new("laps", 2.0)]);
        assert_eq!(session.opponent_position, Some(0.75));
    }

    #[test]
    fn test_lead_change_between_heartbeats_still_settles() {
        let (mut host, mut guest) = playing_pair(wagered_config());
        let start = host.session().started_at_ms;
        score(&mut host, 120, start + 1_000);
        score(&mut guest, 95, start + 1_000);
        host.handle(envelope(Message::GameState(snapshot(1_000, 95)), start + 1_000), start + 1_000)
            .unwrap();
        guest
            .handle(envelope(Message::GameState(snapshot(1_000, 120)), start + 1_000), start + 1_000)
            .unwrap();
        // The guest takes the lead after its last snapshot went out.
        score(&mut guest, 130, start + 1_500);

        let end = start + 60_000;
        fire(&mut host, TimerKind::Duration, end);
        fire(&mut guest, TimerKind::Duration, end);
        let host_report = report_of(&host);
        let guest_report = report_of(&guest);
        assert_eq!(host_report.opponent_score, 95);
        assert_eq!(host_report.declared_winner, Some(WalletAddress::from("0xalice")));

        let host_effects = host
            .handle(envelope(Message::GameEnd(guest_report), end), end)
            .unwrap();
        let revised = sent_report(&host_effects).unwrap();
        assert_eq!(revised.final_score, 120);
        assert_eq!(revised.opponent_score, 130);
        assert_eq!(revised.declared_winner, Some(WalletAddress::from("0xbob")));
        assert_eq!(host.session().phase_kind(), PhaseKind::Settling);

        // The original report still carries the stale view and is held back.
        guest
            .handle(envelope(Message::GameEnd(host_report), end), end)
            .unwrap();
        assert_eq!(guest.session().phase_kind(), PhaseKind::GameOver);
        guest
            .handle(envelope(Message::GameEnd(revised), end + 10), end + 10)
            .unwrap();
        assert_eq!(guest.session().phase_kind(), PhaseKind::Settling);

        for m in [&host, &guest] {
            assert_eq!(m.session().winner, Some(WalletAddress::from("0xbob")));
        }
        assert_eq!(host.session().opponent_score, 130);
    }

    #[test]
    fn test_report_cannot_change_a_final_score() {
        let (mut host, _) = playing_pair(wagered_config());
        let start = host.session().started_at_ms;
        score(&mut host, 120, start + 1_000);
        host.handle(Input::Command(Command::FinishGame), start + 2_000)
            .unwrap();

        // Sender saw a different score for us, so a revision is expected.
        host.handle(
            envelope(Message::GameEnd(report(5, 7, Some("0xalice"))), start + 2_000),
            start + 2_000,
        )
        .unwrap();
        assert_eq!(host.session().phase_kind(), PhaseKind::GameOver);
        assert_eq!(host.session().opponent_score, 5);

        let result = host.handle(
            envelope(Message::GameEnd(report(9, 120, Some("0xalice"))), start + 3_000),
            start + 3_000,
        );
        assert!(matches!(
            result,
            Err(SessionError::UnexpectedMessage {
                kind: MessageKind::GameEnd,
                ..
            })
        ));
        assert_eq!(host.session().phase_kind(), PhaseKind::GameOver);
    }

    fn report_of(machine: &SessionMachine) -> GameEndReport {
        match &machine.session().phase {
            Phase::GameOver { local_report, .. } => local_report.clone(),
            other => panic!("expected GAME_OVER, got {:?}", other.kind()),
        }
    }
}
