use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;

use super::protocol::{DisputeOutcome, Envelope, MatchOffer, Message, MessageFamily, QueueTicket};
use super::stats::{LinkSimulation, LinkStats};
use super::transport::{Transport, TransportError, TransportEvent};
use crate::session::model::{GameMode, PlayerInfo, Role, SessionConfig, SessionId};

pub type LinkId = u64;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub accept_timeout_ms: u64,
    /// Expected wait per match ahead in the queue, for `QUEUE_STATUS`.
    pub match_interval_secs: u32,
    pub min_activity: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            accept_timeout_ms: 15_000,
            match_interval_secs: 30,
            min_activity: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct QueueKey {
    game_type: String,
    mode: GameMode,
    stake_micros: u64,
    duration_ms: u64,
}

impl QueueKey {
    fn of(ticket: &QueueTicket) -> Self {
        Self {
            game_type: ticket.game_type.clone(),
            mode: ticket.mode,
            stake_micros: ticket.stake.micros(),
            duration_ms: ticket.duration_ms,
        }
    }
}

/// Waiting players for one game type, mode and stake. Oldest first.
#[derive(Debug, Default)]
pub struct MatchQueue {
    players: VecDeque<(LinkId, QueueTicket, Instant)>,
}

impl MatchQueue {
    pub fn enqueue(&mut self, link: LinkId, ticket: QueueTicket) -> bool {
        if self.players.iter().any(|(id, _, _)| *id == link) {
            return false;
        }
        self.players.push_back((link, ticket, Instant::now()));
        true
    }

    pub fn dequeue(&mut self, link: LinkId) -> bool {
        if let Some(pos) = self.players.iter().position(|(id, _, _)| *id == link) {
            self.players.remove(pos);
            true
        } else {
            false
        }
    }

    pub fn position(&self, link: LinkId) -> Option<u32> {
        self.players
            .iter()
            .position(|(id, _, _)| *id == link)
            .map(|p| p as u32 + 1)
    }

    pub fn estimated_wait_secs(&self, link: LinkId, match_interval_secs: u32) -> Option<u32> {
        self.position(link)
            .map(|pos| (pos.saturating_sub(1) / 2) * match_interval_secs)
    }

    pub fn pop_pair(&mut self) -> Option<[(LinkId, QueueTicket); 2]> {
        if self.players.len() < 2 {
            return None;
        }
        let (first, first_ticket, _) = self.players.pop_front()?;
        let (second, second_ticket, _) = self.players.pop_front()?;
        Some([(first, first_ticket), (second, second_ticket)])
    }

    pub fn links(&self) -> Vec<LinkId> {
        self.players.iter().map(|(id, _, _)| *id).collect()
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }
}

enum Delivery {
    Envelope { release_at: Instant, bytes: Vec<u8> },
    Event(TransportEvent),
}

struct LinkEntry {
    connected: bool,
    forward: mpsc::UnboundedSender<Delivery>,
    simulation: LinkSimulation,
    stats: LinkStats,
    last_release: Instant,
}

struct PendingMatch {
    host: LinkId,
    guest: LinkId,
    accepted: Vec<LinkId>,
}

#[derive(Default)]
struct RelayState {
    links: HashMap<LinkId, LinkEntry>,
    queues: HashMap<QueueKey, MatchQueue>,
    queued: HashMap<LinkId, QueueKey>,
    pending: HashMap<SessionId, PendingMatch>,
    sessions: HashMap<SessionId, (LinkId, LinkId)>,
    next_link: LinkId,
    next_session: u64,
}

impl RelayState {
    fn deliver(&mut self, to: LinkId, envelope: &Envelope) {
        let Some(link) = self.links.get_mut(&to) else {
            return;
        };
        if !link.connected || link.simulation.should_drop() {
            link.stats.envelopes_dropped += 1;
            log::debug!("relay: dropped {} for link {}", envelope.kind(), to);
            return;
        }
        let bytes = match envelope.encode() {
            Ok(bytes) => bytes,
            Err(err) => {
                log::warn!("relay: cannot encode {}: {}", envelope.kind(), err);
                return;
            }
        };

        let delay = Duration::from_millis(link.simulation.delay_ms() as u64);
        let release_at = (Instant::now() + delay).max(link.last_release);
        link.last_release = release_at;
        link.stats.envelopes_sent += 1;
        link.stats.bytes_sent += bytes.len() as u64;
        let _ = link.forward.send(Delivery::Envelope { release_at, bytes });
    }

    fn notify(&mut self, to: LinkId, event: TransportEvent) {
        if let Some(link) = self.links.get(&to) {
            let _ = link.forward.send(Delivery::Event(event));
        }
    }

    fn peer(&self, session_id: &str, link: LinkId) -> Option<LinkId> {
        let (host, guest) = self.sessions.get(session_id)?;
        if *host == link {
            Some(*guest)
        } else if *guest == link {
            Some(*host)
        } else {
            None
        }
    }

    fn reject(&mut self, to: LinkId, session_id: &str, message: String) {
        log::debug!("relay: link {}: {}", to, message);
        let envelope = Envelope::new(session_id, 0, Message::Error { message });
        self.deliver(to, &envelope);
    }

    fn send_queue_status(&mut self, key: &QueueKey, match_interval_secs: u32) {
        let Some(queue) = self.queues.get(key) else {
            return;
        };
        let statuses: Vec<_> = queue
            .links()
            .into_iter()
            .filter_map(|link| {
                let position = queue.position(link)?;
                let wait = queue.estimated_wait_secs(link, match_interval_secs)?;
                Some((link, position, wait))
            })
            .collect();
        for (link, position, estimated_wait_secs) in statuses {
            let envelope = Envelope::unbound(
                0,
                Message::QueueStatus {
                    position,
                    estimated_wait_secs,
                },
            );
            self.deliver(link, &envelope);
        }
    }

    fn leave_queue(&mut self, link: LinkId) -> Option<QueueKey> {
        let key = self.queued.remove(&link)?;
        if let Some(queue) = self.queues.get_mut(&key) {
            queue.dequeue(link);
        }
        Some(key)
    }

    fn abandon_pending(&mut self, session_id: &str, notify: &[LinkId]) {
        if self.pending.remove(session_id).is_none() {
            return;
        }
        for link in notify {
            let envelope = Envelope::new(session_id, 0, Message::MatchDeclined);
            self.deliver(*link, &envelope);
        }
    }
}

/// In-process relay server. It pairs queued players, runs the accept
/// handshake and forwards session traffic between the two links of each
/// match, applying per-link loss and latency.
#[derive(Clone)]
pub struct LocalRelay {
    config: RelayConfig,
    state: Arc<Mutex<RelayState>>,
}

impl LocalRelay {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(RelayState::default())),
        }
    }

    /// Opens a new player link. Must be called inside a tokio runtime.
    pub async fn connect_player(&self) -> (RelayLink, mpsc::UnboundedReceiver<TransportEvent>) {
        let (forward_tx, forward_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(forward(forward_rx, event_tx));

        let mut state = self.state.lock().await;
        state.next_link += 1;
        let id = state.next_link;
        state.links.insert(
            id,
            LinkEntry {
                connected: true,
                forward: forward_tx,
                simulation: LinkSimulation::default(),
                stats: LinkStats::default(),
                last_release: Instant::now(),
            },
        );
        log::debug!("relay: link {} opened", id);

        (
            RelayLink {
                id,
                relay: self.clone(),
            },
            event_rx,
        )
    }

    pub async fn set_simulation(&self, link: LinkId, simulation: LinkSimulation) {
        if let Some(entry) = self.state.lock().await.links.get_mut(&link) {
            entry.simulation = simulation;
        }
    }

    pub async fn stats(&self, link: LinkId) -> Option<LinkStats> {
        self.state
            .lock()
            .await
            .links
            .get(&link)
            .map(|entry| entry.stats.clone())
    }

    pub async fn queued_players(&self) -> usize {
        self.state.lock().await.queued.len()
    }

    /// Drops the link as if the network failed.
    pub async fn disconnect(&self, link: LinkId) {
        let mut state = self.state.lock().await;
        let Some(entry) = state.links.get_mut(&link) else {
            return;
        };
        if !entry.connected {
            return;
        }
        entry.connected = false;
        log::info!("relay: link {} disconnected", link);

        state.leave_queue(link);
        let pending: Vec<(SessionId, LinkId)> = state
            .pending
            .iter()
            .filter(|(_, m)| m.host == link || m.guest == link)
            .map(|(id, m)| (id.clone(), if m.host == link { m.guest } else { m.host }))
            .collect();
        for (session_id, other) in pending {
            state.abandon_pending(&session_id, &[other]);
        }

        let peers: Vec<(SessionId, LinkId)> = state
            .sessions
            .keys()
            .filter_map(|id| state.peer(id, link).map(|peer| (id.clone(), peer)))
            .collect();
        for (session_id, peer) in peers {
            state.deliver(peer, &Envelope::new(session_id, 0, Message::OpponentDisconnected));
        }

        state.notify(
            link,
            TransportEvent::Disconnected {
                reason: "connection lost".to_string(),
            },
        );
    }

    async fn reconnect(&self, link: LinkId) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        let entry = state
            .links
            .get_mut(&link)
            .ok_or(TransportError::NotConnected)?;
        if entry.connected {
            return Ok(());
        }
        entry.connected = true;
        log::info!("relay: link {} reconnected", link);

        state.notify(link, TransportEvent::Connected);
        let peers: Vec<(SessionId, LinkId)> = state
            .sessions
            .keys()
            .filter_map(|id| state.peer(id, link).map(|peer| (id.clone(), peer)))
            .collect();
        for (session_id, peer) in peers {
            state.deliver(
                peer,
                &Envelope::new(session_id, 0, Message::OpponentState { connected: true }),
            );
        }
        Ok(())
    }

    /// Arbitration hook: tells both players how a dispute ended.
    pub async fn resolve_dispute(&self, session_id: &str, outcome: DisputeOutcome) -> bool {
        let mut state = self.state.lock().await;
        let Some((host, guest)) = state.sessions.get(session_id).copied() else {
            return false;
        };
        log::info!("relay: resolving dispute for session {}", session_id);
        let envelope = Envelope::new(session_id, 0, Message::DisputeResolved(outcome));
        state.deliver(host, &envelope);
        state.deliver(guest, &envelope);
        true
    }

    async fn receive(&self, from: LinkId, bytes: &[u8]) -> Result<(), TransportError> {
        let envelope =
            Envelope::decode(bytes).map_err(|err| TransportError::Send(err.to_string()))?;

        let mut state = self.state.lock().await;
        let entry = state
            .links
            .get_mut(&from)
            .ok_or(TransportError::NotConnected)?;
        if !entry.connected {
            return Err(TransportError::NotConnected);
        }
        entry.stats.envelopes_received += 1;
        entry.stats.bytes_received += bytes.len() as u64;

        let kind = envelope.kind();
        if kind.is_relay_authored() {
            state.reject(
                from,
                &envelope.session_id,
                format!("{} may only come from the relay", kind),
            );
            return Ok(());
        }

        if kind.family() == MessageFamily::Matchmaking {
            self.handle_matchmaking(&mut state, from, envelope);
            return Ok(());
        }

        match state.peer(&envelope.session_id, from) {
            Some(peer) => state.deliver(peer, &envelope),
            None => {
                let message = format!("unknown session {}", envelope.session_id);
                state.reject(from, &envelope.session_id, message);
            }
        }
        Ok(())
    }

    fn handle_matchmaking(&self, state: &mut RelayState, from: LinkId, envelope: Envelope) {
        match envelope.message {
            Message::QueueJoin(ticket) => {
                if state.queued.contains_key(&from) {
                    return;
                }
                let key = QueueKey::of(&ticket);
                log::info!(
                    "relay: {} queued for {} ({}, stake {})",
                    ticket.player.display_name,
                    ticket.game_type,
                    ticket.mode.as_str(),
                    ticket.stake
                );
                state.queues.entry(key.clone()).or_default().enqueue(from, ticket);
                state.queued.insert(from, key.clone());
                self.try_match(state, &key);
                state.send_queue_status(&key, self.config.match_interval_secs);
            }
            Message::QueueLeave => {
                if let Some(key) = state.leave_queue(from) {
                    state.send_queue_status(&key, self.config.match_interval_secs);
                }
            }
            Message::MatchAccepted => {
                let session_id = envelope.session_id;
                let Some(pending) = state.pending.get_mut(&session_id) else {
                    return;
                };
                if from != pending.host && from != pending.guest {
                    return;
                }
                if !pending.accepted.contains(&from) {
                    pending.accepted.push(from);
                }
                if pending.accepted.len() < 2 {
                    return;
                }
                let (host, guest) = (pending.host, pending.guest);
                state.pending.remove(&session_id);
                state.sessions.insert(session_id.clone(), (host, guest));
                log::info!("relay: session {} confirmed", session_id);
                let confirmed = Envelope::new(session_id, 0, Message::MatchConfirmed);
                state.deliver(host, &confirmed);
                state.deliver(guest, &confirmed);
            }
            Message::MatchDeclined => {
                let session_id = envelope.session_id;
                let Some(pending) = state.pending.get(&session_id) else {
                    return;
                };
                let other = if pending.host == from {
                    pending.guest
                } else {
                    pending.host
                };
                log::info!("relay: match {} declined", session_id);
                state.abandon_pending(&session_id, &[other]);
            }
            other => {
                let message = format!("{} is not accepted by the relay", other.kind());
                state.reject(from, &envelope.session_id, message);
            }
        }
    }

    fn try_match(&self, state: &mut RelayState, key: &QueueKey) {
        let Some([(host, host_ticket), (guest, guest_ticket)]) =
            state.queues.get_mut(key).and_then(|q| q.pop_pair())
        else {
            return;
        };
        state.queued.remove(&host);
        state.queued.remove(&guest);

        state.next_session += 1;
        let session_id = format!("s-{:04}", state.next_session);
        let config = SessionConfig {
            game_type: host_ticket.game_type.clone(),
            mode: host_ticket.mode,
            stake: host_ticket.stake,
            duration_ms: host_ticket.duration_ms,
            min_activity: self.config.min_activity,
            spectators_allowed: host_ticket.mode == GameMode::Friendly,
        };
        log::info!(
            "relay: matched {} (host) with {} as {}",
            host_ticket.player.display_name,
            guest_ticket.player.display_name,
            session_id
        );

        let offers = [
            (host, Role::Host, guest_ticket.player.clone()),
            (guest, Role::Guest, host_ticket.player.clone()),
        ];
        for (link, role, opponent) in offers {
            let offer = MatchOffer {
                opponent,
                role,
                config: config.clone(),
                accept_timeout_ms: self.config.accept_timeout_ms,
            };
            state.deliver(link, &Envelope::new(session_id.clone(), 0, Message::MatchFound(offer)));
        }
        state.pending.insert(
            session_id.clone(),
            PendingMatch {
                host,
                guest,
                accepted: Vec::new(),
            },
        );

        let relay = self.clone();
        let timeout = Duration::from_millis(self.config.accept_timeout_ms);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let mut state = relay.state.lock().await;
            if state.pending.contains_key(&session_id) {
                log::info!("relay: match {} expired", session_id);
                state.abandon_pending(&session_id, &[host, guest]);
            }
        });
    }
}

async fn forward(
    mut deliveries: mpsc::UnboundedReceiver<Delivery>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    while let Some(delivery) = deliveries.recv().await {
        let event = match delivery {
            Delivery::Envelope { release_at, bytes } => {
                tokio::time::sleep_until(release_at).await;
                match Envelope::decode(&bytes) {
                    Ok(envelope) => TransportEvent::Received(envelope),
                    Err(err) => TransportEvent::Error {
                        message: err.to_string(),
                    },
                }
            }
            Delivery::Event(event) => event,
        };
        if events.send(event).is_err() {
            break;
        }
    }
}

/// One player's connection to a [`LocalRelay`].
#[derive(Clone)]
pub struct RelayLink {
    id: LinkId,
    relay: LocalRelay,
}

impl RelayLink {
    pub fn id(&self) -> LinkId {
        self.id
    }

    pub async fn disconnect(&self) {
        self.relay.disconnect(self.id).await;
    }
}

#[async_trait]
impl Transport for RelayLink {
    async fn connect(&self) -> Result<(), TransportError> {
        self.relay.reconnect(self.id).await
    }

    async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        let bytes = envelope.encode()?;
        self.relay.receive(self.id, &bytes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::model::Amount;

    fn ticket(name: &str, stake: f64) -> QueueTicket {
        QueueTicket {
            player: PlayerInfo::new(format!("p-{}", name), name, &format!("0x{}", name)),
            game_type: "sprint".to_string(),
            mode: GameMode::Wagered,
            stake: Amount::from_units(stake),
            duration_ms: 60_000,
        }
    }

    async fn next_message(events: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Envelope {
        loop {
            match events.recv().await {
                Some(TransportEvent::Received(envelope)) => return envelope,
                Some(_) => continue,
                None => panic!("link closed"),
            }
        }
    }

    async fn next_of(
        events: &mut mpsc::UnboundedReceiver<TransportEvent>,
        pred: impl Fn(&Message) -> bool,
    ) -> Envelope {
        loop {
            let envelope = next_message(events).await;
            if pred(&envelope.message) {
                return envelope;
            }
        }
    }

    #[test]
    fn test_match_queue() {
        let mut queue = MatchQueue::default();
        assert!(queue.enqueue(1, ticket("alice", 1.0)));
        assert!(!queue.enqueue(1, ticket("alice", 1.0)));
        assert!(queue.enqueue(2, ticket("bob", 1.0)));
        assert!(queue.enqueue(3, ticket("carol", 1.0)));

        assert_eq!(queue.position(3), Some(3));
        assert_eq!(queue.estimated_wait_secs(3, 30), Some(30));

        let [(first, _), (second, _)] = queue.pop_pair().unwrap();
        assert_eq!((first, second), (1, 2));
        assert_eq!(queue.len(), 1);
        assert!(queue.pop_pair().is_none());
        assert!(queue.dequeue(3));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_pairs_only_matching_stakes() {
        let relay = LocalRelay::new(RelayConfig::default());
        let (alice, mut alice_rx) = relay.connect_player().await;
        let (bob, _bob_rx) = relay.connect_player().await;
        let (carol, mut carol_rx) = relay.connect_player().await;

        alice
            .send(Envelope::unbound(0, Message::QueueJoin(ticket("alice", 5.0))))
            .await
            .unwrap();
        bob.send(Envelope::unbound(0, Message::QueueJoin(ticket("bob", 10.0))))
            .await
            .unwrap();
        carol
            .send(Envelope::unbound(0, Message::QueueJoin(ticket("carol", 5.0))))
            .await
            .unwrap();

        let found = next_of(&mut alice_rx, |m| matches!(m, Message::MatchFound(_))).await;
        match found.message {
            Message::MatchFound(offer) => {
                assert_eq!(offer.role, Role::Host);
                assert_eq!(offer.opponent.display_name, "carol");
            }
            _ => unreachable!(),
        }
        let found = next_of(&mut carol_rx, |m| matches!(m, Message::MatchFound(_))).await;
        assert!(matches!(found.message, Message::MatchFound(MatchOffer { role: Role::Guest, .. })));
        assert_eq!(relay.queued_players().await, 1);
    }

    #[tokio::test]
    async fn test_confirm_then_route_session_traffic() {
        let relay = LocalRelay::new(RelayConfig::default());
        let (alice, mut alice_rx) = relay.connect_player().await;
        let (bob, mut bob_rx) = relay.connect_player().await;

        alice
            .send(Envelope::unbound(0, Message::QueueJoin(ticket("alice", 1.0))))
            .await
            .unwrap();
        bob.send(Envelope::unbound(0, Message::QueueJoin(ticket("bob", 1.0))))
            .await
            .unwrap();
        let session_id = next_of(&mut alice_rx, |m| matches!(m, Message::MatchFound(_)))
            .await
            .session_id;

        alice
            .send(Envelope::new(session_id.clone(), 0, Message::MatchAccepted))
            .await
            .unwrap();
        bob.send(Envelope::new(session_id.clone(), 0, Message::MatchAccepted))
            .await
            .unwrap();
        next_of(&mut alice_rx, |m| matches!(m, Message::MatchConfirmed)).await;
        next_of(&mut bob_rx, |m| matches!(m, Message::MatchConfirmed)).await;

        alice
            .send(Envelope::new(session_id.clone(), 1, Message::Ready))
            .await
            .unwrap();
        alice
            .send(Envelope::new(session_id.clone(), 2, Message::Heartbeat))
            .await
            .unwrap();
        let first = next_of(&mut bob_rx, |m| !matches!(m, Message::QueueStatus { .. })).await;
        let second = next_message(&mut bob_rx).await;
        assert_eq!(first.message, Message::Ready);
        assert_eq!(second.message, Message::Heartbeat);
    }

    #[tokio::test]
    async fn test_players_cannot_forge_relay_messages() {
        let relay = LocalRelay::new(RelayConfig::default());
        let (alice, mut alice_rx) = relay.connect_player().await;

        alice
            .send(Envelope::new("s-0001", 0, Message::OpponentDisconnected))
            .await
            .unwrap();
        let reply = next_message(&mut alice_rx).await;
        assert!(matches!(reply.message, Message::Error { .. }));
    }

    #[tokio::test]
    async fn test_disconnected_link_cannot_send() {
        let relay = LocalRelay::new(RelayConfig::default());
        let (alice, mut alice_rx) = relay.connect_player().await;

        alice.disconnect().await;
        assert!(matches!(
            alice_rx.recv().await,
            Some(TransportEvent::Disconnected { .. })
        ));
        assert_eq!(
            alice.send(Envelope::unbound(0, Message::QueueLeave)).await,
            Err(TransportError::NotConnected)
        );

        alice.connect().await.unwrap();
        assert!(matches!(alice_rx.recv().await, Some(TransportEvent::Connected)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_match_expires() {
        let relay = LocalRelay::new(RelayConfig::default());
        let (alice, mut alice_rx) = relay.connect_player().await;
        let (bob, _bob_rx) = relay.connect_player().await;

        alice
            .send(Envelope::unbound(0, Message::QueueJoin(ticket("alice", 1.0))))
            .await
            .unwrap();
        bob.send(Envelope::unbound(0, Message::QueueJoin(ticket("bob", 1.0))))
            .await
            .unwrap();
        let session_id = next_of(&mut alice_rx, |m| matches!(m, Message::MatchFound(_)))
            .await
            .session_id;

        let declined = next_of(&mut alice_rx, |m| matches!(m, Message::MatchDeclined)).await;
        assert_eq!(declined.session_id, session_id);
    }
}
