use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};

use crate::config::ProtocolConfig;
use crate::error::{ClientError, MatchmakingError};
use crate::matchmaking::{QueueClient, QueueEffect, QueueState};
use crate::net::protocol::{Envelope, MatchOffer, Message};
use crate::net::relay::{LocalRelay, RelayLink};
use crate::net::transport::{LinkState, Transport, TransportEvent};
use crate::session::actor::{SessionHandle, spawn_session};
use crate::session::machine::SessionMachine;
use crate::session::model::{Amount, GameMode, GameSession, PlayerInfo, SessionId};
use crate::session::timer::Clock;
use crate::wallet::Wallet;

#[derive(Debug, Clone)]
pub enum ClientEvent {
    QueueStatus {
        position: u32,
        estimated_wait_secs: u32,
    },
    MatchFound {
        session_id: SessionId,
        offer: MatchOffer,
    },
    MatchLost {
        session_id: SessionId,
    },
    SessionStarted(SessionHandle),
    SessionClosed {
        session_id: SessionId,
    },
    LinkChanged {
        connected: bool,
    },
    Error {
        message: String,
    },
}

enum ClientRequest {
    JoinQueue {
        game_type: String,
        mode: GameMode,
        stake: Amount,
        duration_ms: u64,
        reply: oneshot::Sender<Result<(), MatchmakingError>>,
    },
    LeaveQueue,
    RespondToMatch {
        accept: bool,
        reply: oneshot::Sender<Result<(), MatchmakingError>>,
    },
    Session {
        session_id: SessionId,
        reply: oneshot::Sender<Option<SessionHandle>>,
    },
}

/// One player's view of the relay: the matchmaking queue plus every session
/// it was matched into. Inbound envelopes are routed by session id.
#[derive(Clone)]
pub struct WagerClient {
    player: PlayerInfo,
    transport: Arc<dyn Transport>,
    requests: mpsc::UnboundedSender<ClientRequest>,
    queue: watch::Receiver<QueueState>,
}

impl WagerClient {
    /// Spawns the dispatcher. Must be called inside a tokio runtime.
    pub fn start(
        player: PlayerInfo,
        transport: Arc<dyn Transport>,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        wallet: Arc<dyn Wallet>,
        config: ProtocolConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        if *wallet.address() != player.wallet {
            log::warn!(
                "{}: announces wallet {} but signs with {}",
                player.display_name,
                player.wallet,
                wallet.address()
            );
        }
        let (requests, requests_rx) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let (queue_tx, queue_rx) = watch::channel(QueueState::Idle);
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();

        let dispatcher = Dispatcher {
            queue: QueueClient::new(player.clone()),
            queue_state: queue_tx,
            sessions: HashMap::new(),
            transport: transport.clone(),
            wallet,
            config,
            clock: Clock::new(),
            events,
            accept_timeouts: accept_tx,
            closed: closed_tx,
        };
        tokio::spawn(dispatcher.run(requests_rx, transport_events, accept_rx, closed_rx));

        (
            Self {
                player,
                transport,
                requests,
                queue: queue_rx,
            },
            events_rx,
        )
    }

    /// Opens a link on `relay` and starts a client over it. The link is
    /// returned so callers can drop it to simulate a network failure.
    pub async fn connect_local(
        relay: &LocalRelay,
        player: PlayerInfo,
        wallet: Arc<dyn Wallet>,
        config: ProtocolConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ClientEvent>, RelayLink) {
        let (link, link_events) = relay.connect_player().await;
        let (client, events) =
            Self::start(player, Arc::new(link.clone()), link_events, wallet, config);
        (client, events, link)
    }

    pub fn player(&self) -> &PlayerInfo {
        &self.player
    }

    pub fn queue_state(&self) -> QueueState {
        self.queue.borrow().clone()
    }

    pub async fn join_queue(
        &self,
        game_type: impl Into<String>,
        mode: GameMode,
        stake: Amount,
        duration_ms: u64,
    ) -> Result<(), ClientError> {
        let (reply, response) = oneshot::channel();
        self.request(ClientRequest::JoinQueue {
            game_type: game_type.into(),
            mode,
            stake,
            duration_ms,
            reply,
        })?;
        Ok(response.await.map_err(|_| ClientError::Closed)??)
    }

    pub fn leave_queue(&self) -> Result<(), ClientError> {
        self.request(ClientRequest::LeaveQueue)
    }

    pub async fn respond_to_match(&self, accept: bool) -> Result<(), ClientError> {
        let (reply, response) = oneshot::channel();
        self.request(ClientRequest::RespondToMatch { accept, reply })?;
        Ok(response.await.map_err(|_| ClientError::Closed)??)
    }

    pub async fn session(&self, session_id: &str) -> Option<SessionHandle> {
        let (reply, response) = oneshot::channel();
        self.request(ClientRequest::Session {
            session_id: session_id.to_string(),
            reply,
        })
        .ok()?;
        response.await.ok().flatten()
    }

    /// Re-opens the link after a failure. Queued players rejoin the queue and
    /// live sessions send a rejoin to their opponent once the link is back.
    pub async fn reconnect(&self) -> Result<(), ClientError> {
        self.transport.connect().await?;
        Ok(())
    }

    fn request(&self, request: ClientRequest) -> Result<(), ClientError> {
        self.requests.send(request).map_err(|_| ClientError::Closed)
    }
}

struct Dispatcher {
    queue: QueueClient,
    queue_state: watch::Sender<QueueState>,
    sessions: HashMap<SessionId, SessionHandle>,
    transport: Arc<dyn Transport>,
    wallet: Arc<dyn Wallet>,
    config: ProtocolConfig,
    clock: Clock,
    events: mpsc::UnboundedSender<ClientEvent>,
    accept_timeouts: mpsc::UnboundedSender<u64>,
    closed: mpsc::UnboundedSender<SessionId>,
}

impl Dispatcher {
    async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<ClientRequest>,
        mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        mut accept_timeouts: mpsc::UnboundedReceiver<u64>,
        mut closed: mpsc::UnboundedReceiver<SessionId>,
    ) {
        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(request) => self.on_request(request).await,
                    None => break,
                },
                event = transport_events.recv() => match event {
                    Some(event) => self.on_transport(event).await,
                    None => {
                        log::warn!("{}: transport closed", self.queue.player().display_name);
                        break;
                    }
                },
                Some(generation) = accept_timeouts.recv() => {
                    let effects = self.queue.on_accept_timeout(generation, self.clock.now_ms());
                    self.apply(effects).await;
                }
                Some(session_id) = closed.recv() => {
                    self.sessions.remove(&session_id);
                    self.queue.session_ended(&session_id);
                    self.emit(ClientEvent::SessionClosed { session_id });
                }
            }
            self.publish_queue();
        }
    }

    fn publish_queue(&self) {
        self.queue_state.send_if_modified(|state| {
            if state != self.queue.state() {
                *state = self.queue.state().clone();
                return true;
            }
            false
        });
    }

    async fn on_request(&mut self, request: ClientRequest) {
        let now = self.clock.now_ms();
        match request {
            ClientRequest::JoinQueue {
                game_type,
                mode,
                stake,
                duration_ms,
                reply,
            } => match self.queue.join_queue(&game_type, mode, stake, duration_ms, now) {
                Ok(effects) => {
                    self.apply(effects).await;
                    let _ = reply.send(Ok(()));
                }
                Err(err) => {
                    let _ = reply.send(Err(err));
                }
            },
            ClientRequest::LeaveQueue => {
                let effects = self.queue.leave_queue(now);
                self.apply(effects).await;
            }
            ClientRequest::RespondToMatch { accept, reply } => {
                match self.queue.respond_to_match(accept, now) {
                    Ok(effects) => {
                        self.apply(effects).await;
                        let _ = reply.send(Ok(()));
                    }
                    Err(err) => {
                        let _ = reply.send(Err(err));
                    }
                }
            }
            ClientRequest::Session { session_id, reply } => {
                let _ = reply.send(self.sessions.get(&session_id).cloned());
            }
        }
    }

    async fn on_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Received(envelope) => self.route(envelope).await,
            TransportEvent::Connected => {
                log::info!("{}: link restored", self.queue.player().display_name);
                for session in self.sessions.values() {
                    session.link_changed(LinkState::Connected);
                }
                let effects = self.queue.on_reconnect(self.clock.now_ms());
                self.apply(effects).await;
                self.emit(ClientEvent::LinkChanged { connected: true });
            }
            TransportEvent::Disconnected { reason } => {
                log::warn!("{}: link lost: {}", self.queue.player().display_name, reason);
                for session in self.sessions.values() {
                    session.link_changed(LinkState::Disconnected);
                }
                self.emit(ClientEvent::LinkChanged { connected: false });
            }
            TransportEvent::Error { message } => self.emit(ClientEvent::Error { message }),
        }
    }

    async fn route(&mut self, envelope: Envelope) {
        if let Some(session) = self.sessions.get(&envelope.session_id) {
            session.deliver(envelope);
            return;
        }
        match &envelope.message {
            Message::Error { message } => {
                log::warn!("{}: relay error: {}", self.queue.player().display_name, message);
                self.emit(ClientEvent::Error {
                    message: message.clone(),
                });
            }
            Message::QueueStatus {
                position,
                estimated_wait_secs,
            } => self.emit(ClientEvent::QueueStatus {
                position: *position,
                estimated_wait_secs: *estimated_wait_secs,
            }),
            _ => {}
        }
        let effects = self.queue.on_envelope(envelope, self.clock.now_ms());
        self.apply(effects).await;
    }

    async fn apply(&mut self, effects: Vec<QueueEffect>) {
        for effect in effects {
            match effect {
                QueueEffect::Send(envelope) => {
                    let kind = envelope.kind();
                    if let Err(err) = self.transport.send(envelope).await {
                        log::warn!(
                            "{}: failed to send {}: {}",
                            self.queue.player().display_name,
                            kind,
                            err
                        );
                    }
                }
                QueueEffect::ArmAcceptTimer {
                    after_ms,
                    generation,
                } => {
                    let timeouts = self.accept_timeouts.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(after_ms)).await;
                        let _ = timeouts.send(generation);
                    });
                }
                QueueEffect::MatchFound { session_id, offer } => {
                    self.emit(ClientEvent::MatchFound { session_id, offer });
                }
                QueueEffect::MatchLost { session_id } => {
                    self.emit(ClientEvent::MatchLost { session_id });
                }
                QueueEffect::Confirmed { session_id, offer } => {
                    self.start_session(session_id, offer);
                }
            }
        }
    }

    fn start_session(&mut self, session_id: SessionId, offer: MatchOffer) {
        let session = GameSession::new(
            session_id.clone(),
            offer.role,
            self.queue.player().clone(),
            offer.opponent,
            offer.config,
        );
        let machine = SessionMachine::new(session, self.config.clone());
        let handle = spawn_session(
            machine,
            self.transport.clone(),
            self.wallet.clone(),
            self.clock,
            Some(self.closed.clone()),
        );
        self.sessions.insert(session_id, handle.clone());
        self.emit(ClientEvent::SessionStarted(handle));
    }

    fn emit(&self, event: ClientEvent) {
        self.publish_queue();
        // The embedding application may not listen.
        let _ = self.events.send(event);
    }
}
