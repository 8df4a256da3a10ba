use crate::error::MatchmakingError;
use crate::net::protocol::{Envelope, MatchOffer, Message, QueueTicket};
use crate::session::model::{Amount, GameMode, PlayerInfo, SessionId};

#[derive(Debug, Clone, PartialEq)]
pub enum QueueState {
    Idle,
    Queued {
        ticket: QueueTicket,
        position: Option<u32>,
        estimated_wait_secs: Option<u32>,
    },
    PendingMatch {
        session_id: SessionId,
        offer: MatchOffer,
        accepted: Option<bool>,
    },
    InSession {
        session_id: SessionId,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueueEffect {
    Send(Envelope),
    ArmAcceptTimer { after_ms: u64, generation: u64 },
    MatchFound { session_id: SessionId, offer: MatchOffer },
    MatchLost { session_id: SessionId },
    Confirmed { session_id: SessionId, offer: MatchOffer },
}

/// Client half of matchmaking. Like the session machine it only computes
/// effects; the owner sends them.
#[derive(Debug)]
pub struct QueueClient {
    player: PlayerInfo,
    state: QueueState,
    generation: u64,
}

impl QueueClient {
    pub fn new(player: PlayerInfo) -> Self {
        Self {
            player,
            state: QueueState::Idle,
            generation: 0,
        }
    }

    pub fn player(&self) -> &PlayerInfo {
        &self.player
    }

    pub fn state(&self) -> &QueueState {
        &self.state
    }

    pub fn join_queue(
        &mut self,
        game_type: &str,
        mode: GameMode,
        stake: Amount,
        duration_ms: u64,
        now: u64,
    ) -> Result<Vec<QueueEffect>, MatchmakingError> {
        match &self.state {
            QueueState::Idle => {}
            QueueState::Queued { .. } => return Err(MatchmakingError::AlreadyQueued),
            QueueState::PendingMatch { .. } => return Err(MatchmakingError::MatchPending),
            QueueState::InSession { session_id } => {
                return Err(MatchmakingError::AlreadyInSession(session_id.clone()));
            }
        }
        match mode {
            GameMode::Friendly if !stake.is_zero() => {
                return Err(MatchmakingError::InvalidStake("friendly"));
            }
            GameMode::Wagered if stake.is_zero() => {
                return Err(MatchmakingError::InvalidStake("wagered"));
            }
            _ => {}
        }

        let ticket = QueueTicket {
            player: self.player.clone(),
            game_type: game_type.to_string(),
            mode,
            stake,
            duration_ms,
        };
        log::info!(
            "{}: joining {} queue ({}, stake {})",
            self.player.display_name,
            game_type,
            mode.as_str(),
            stake
        );
        self.state = QueueState::Queued {
            ticket: ticket.clone(),
            position: None,
            estimated_wait_secs: None,
        };
        Ok(vec![QueueEffect::Send(Envelope::unbound(
            now,
            Message::QueueJoin(ticket),
        ))])
    }

    pub fn leave_queue(&mut self, now: u64) -> Vec<QueueEffect> {
        if !matches!(self.state, QueueState::Queued { .. }) {
            return Vec::new();
        }
        self.state = QueueState::Idle;
        vec![QueueEffect::Send(Envelope::unbound(now, Message::QueueLeave))]
    }

    pub fn respond_to_match(
        &mut self,
        accept: bool,
        now: u64,
    ) -> Result<Vec<QueueEffect>, MatchmakingError> {
        let QueueState::PendingMatch {
            session_id,
            accepted,
            ..
        } = &mut self.state
        else {
            return Err(MatchmakingError::NoPendingMatch);
        };
        if accepted.is_some() {
            return Err(MatchmakingError::NoPendingMatch);
        }
        let session_id = session_id.clone();

        if accept {
            *accepted = Some(true);
            return Ok(vec![QueueEffect::Send(Envelope::new(
                session_id,
                now,
                Message::MatchAccepted,
            ))]);
        }
        self.state = QueueState::Idle;
        Ok(vec![
            QueueEffect::Send(Envelope::new(session_id.clone(), now, Message::MatchDeclined)),
            QueueEffect::MatchLost { session_id },
        ])
    }

    pub fn on_envelope(&mut self, envelope: Envelope, now: u64) -> Vec<QueueEffect> {
        let session_id = envelope.session_id;
        match envelope.message {
            Message::QueueStatus {
                position: p,
                estimated_wait_secs: w,
            } => {
                if let QueueState::Queued {
                    position,
                    estimated_wait_secs,
                    ..
                } = &mut self.state
                {
                    *position = Some(p);
                    *estimated_wait_secs = Some(w);
                }
                Vec::new()
            }
            Message::MatchFound(offer) => {
                if !matches!(self.state, QueueState::Queued { .. }) {
                    log::debug!("{}: ignoring stray match {}", self.player.display_name, session_id);
                    return vec![QueueEffect::Send(Envelope::new(
                        session_id,
                        now,
                        Message::MatchDeclined,
                    ))];
                }
                log::info!(
                    "{}: matched with {} as {}",
                    self.player.display_name,
                    offer.opponent.display_name,
                    offer.role
                );
                self.generation += 1;
                self.state = QueueState::PendingMatch {
                    session_id: session_id.clone(),
                    offer: offer.clone(),
                    accepted: None,
                };
                vec![
                    QueueEffect::ArmAcceptTimer {
                        after_ms: offer.accept_timeout_ms,
                        generation: self.generation,
                    },
                    QueueEffect::MatchFound { session_id, offer },
                ]
            }
            Message::MatchConfirmed => match &self.state {
                QueueState::PendingMatch {
                    session_id: pending,
                    offer,
                    accepted: Some(true),
                } if *pending == session_id => {
                    let offer = offer.clone();
                    self.state = QueueState::InSession {
                        session_id: session_id.clone(),
                    };
                    vec![QueueEffect::Confirmed { session_id, offer }]
                }
                _ => Vec::new(),
            },
            Message::MatchDeclined => match &self.state {
                QueueState::PendingMatch {
                    session_id: pending,
                    ..
                } if *pending == session_id => {
                    log::info!("{}: match {} fell through", self.player.display_name, session_id);
                    self.state = QueueState::Idle;
                    vec![QueueEffect::MatchLost { session_id }]
                }
                _ => Vec::new(),
            },
            _ => Vec::new(),
        }
    }

    /// Expiry before a response is an implicit decline.
    pub fn on_accept_timeout(&mut self, generation: u64, now: u64) -> Vec<QueueEffect> {
        if generation != self.generation {
            return Vec::new();
        }
        match self.respond_to_match(false, now) {
            Ok(effects) => effects,
            Err(_) => Vec::new(),
        }
    }

    /// After a reconnect the relay has forgotten us: queue again, and treat a
    /// pending match as lost.
    pub fn on_reconnect(&mut self, now: u64) -> Vec<QueueEffect> {
        match &self.state {
            QueueState::Queued { ticket, .. } => vec![QueueEffect::Send(Envelope::unbound(
                now,
                Message::QueueJoin(ticket.clone()),
            ))],
            QueueState::PendingMatch { session_id, .. } => {
                let session_id = session_id.clone();
                self.state = QueueState::Idle;
                vec![QueueEffect::MatchLost { session_id }]
            }
            _ => Vec::new(),
        }
    }

    pub fn session_ended(&mut self, session_id: &str) {
        if matches!(&self.state, QueueState::InSession { session_id: active } if active == session_id)
        {
            self.state = QueueState::Idle;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::model::{Role, SessionConfig};

    fn client() -> QueueClient {
        QueueClient::new(PlayerInfo::new("p-alice", "Alice", "0xalice"))
    }

    fn offer() -> MatchOffer {
        MatchOffer {
            opponent: PlayerInfo::new("p-bob", "Bob", "0xbob"),
            role: Role::Host,
            config: SessionConfig::wagered("sprint", Amount::from_units(5.0), 60_000),
            accept_timeout_ms: 15_000,
        }
    }

    fn found(session_id: &str) -> Envelope {
        Envelope::new(session_id, 0, Message::MatchFound(offer()))
    }

    fn queued() -> QueueClient {
        let mut client = client();
        client
            .join_queue("sprint", GameMode::Wagered, Amount::from_units(5.0), 60_000, 0)
            .unwrap();
        client
    }

    #[test]
    fn test_join_rules() {
        let mut client = client();
        assert_eq!(
            client.join_queue("sprint", GameMode::Friendly, Amount::from_units(1.0), 60_000, 0),
            Err(MatchmakingError::InvalidStake("friendly"))
        );
        assert_eq!(
            client.join_queue("sprint", GameMode::Wagered, Amount::ZERO, 60_000, 0),
            Err(MatchmakingError::InvalidStake("wagered"))
        );

        let mut client = queued();
        assert_eq!(
            client.join_queue("sprint", GameMode::Wagered, Amount::from_units(5.0), 60_000, 0),
            Err(MatchmakingError::AlreadyQueued)
        );
        client.on_envelope(found("s-1"), 0);
        assert_eq!(
            client.join_queue("sprint", GameMode::Wagered, Amount::from_units(5.0), 60_000, 0),
            Err(MatchmakingError::MatchPending)
        );
    }

    #[test]
    fn test_leave_is_noop_when_idle() {
        let mut client = client();
        assert!(client.leave_queue(0).is_empty());

        let mut client = queued();
        assert_eq!(client.leave_queue(0).len(), 1);
        assert_eq!(*client.state(), QueueState::Idle);
    }

    #[test]
    fn test_status_never_leaves_queue() {
        let mut client = queued();
        client.on_envelope(
            Envelope::unbound(
                0,
                Message::QueueStatus {
                    position: 3,
                    estimated_wait_secs: 30,
                },
            ),
            0,
        );
        assert!(matches!(
            client.state(),
            QueueState::Queued {
                position: Some(3),
                estimated_wait_secs: Some(30),
                ..
            }
        ));
    }

    #[test]
    fn test_accept_then_confirm_enters_session() {
        let mut client = queued();
        let effects = client.on_envelope(found("s-1"), 0);
        assert!(effects.contains(&QueueEffect::ArmAcceptTimer {
            after_ms: 15_000,
            generation: 1
        }));

        let effects = client.respond_to_match(true, 10).unwrap();
        assert!(matches!(
            &effects[..],
            [QueueEffect::Send(Envelope {
                message: Message::MatchAccepted,
                ..
            })]
        ));
        // Responding twice is not allowed.
        assert!(client.respond_to_match(true, 10).is_err());
        // A late accept timer is ignored once we responded.
        assert!(client.on_accept_timeout(1, 15_000).is_empty());

        let effects = client.on_envelope(Envelope::new("s-1", 0, Message::MatchConfirmed), 20);
        assert!(matches!(&effects[..], [QueueEffect::Confirmed { session_id, .. }] if session_id == "s-1"));
        assert_eq!(
            client.join_queue("sprint", GameMode::Wagered, Amount::from_units(5.0), 60_000, 0),
            Err(MatchmakingError::AlreadyInSession("s-1".to_string()))
        );

        client.session_ended("s-1");
        assert_eq!(*client.state(), QueueState::Idle);
    }

    #[test]
    fn test_accept_timeout_declines() {
        let mut client = queued();
        client.on_envelope(found("s-1"), 0);

        let effects = client.on_accept_timeout(1, 15_000);
        assert!(effects.iter().any(|e| matches!(
            e,
            QueueEffect::Send(Envelope {
                message: Message::MatchDeclined,
                ..
            })
        )));
        assert_eq!(*client.state(), QueueState::Idle);
    }

    #[test]
    fn test_opponent_decline_returns_to_idle() {
        let mut client = queued();
        client.on_envelope(found("s-1"), 0);
        client.respond_to_match(true, 0).unwrap();

        let effects = client.on_envelope(Envelope::new("s-1", 0, Message::MatchDeclined), 5);
        assert_eq!(
            effects,
            vec![QueueEffect::MatchLost {
                session_id: "s-1".to_string()
            }]
        );
        assert_eq!(*client.state(), QueueState::Idle);
    }
}
