use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::error::SessionError;
use crate::event::SessionEvent;
use crate::net::protocol::{DisputeOutcome, Envelope, Evidence, Metric};
use crate::net::transport::{LinkState, Transport};
use crate::wallet::{Wallet, WalletError};

use super::machine::{Command, Effect, Input, SessionMachine, WalletOutcome};
use super::model::{Amount, GameSession, SessionId};
use super::timer::{Clock, TimerKind, TimerRequest};

const EVENT_CAPACITY: usize = 256;
const RETRY_BACKOFF_MS: u64 = 1_000;

struct Request {
    input: Input,
    reply: Option<oneshot::Sender<Result<(), SessionError>>>,
}

/// Cheap handle to a running session. Dropping every handle stops the session.
#[derive(Clone)]
pub struct SessionHandle {
    id: SessionId,
    requests: mpsc::UnboundedSender<Request>,
    state: watch::Receiver<GameSession>,
    events: broadcast::Sender<SessionEvent>,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn snapshot(&self) -> GameSession {
        self.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<GameSession> {
        self.state.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// False once the session was acknowledged or its task stopped.
    pub fn is_running(&self) -> bool {
        !self.requests.is_closed()
    }

    /// Resolves with the first published session state matching `pred`.
    pub async fn wait_for(
        &self,
        pred: impl Fn(&GameSession) -> bool,
    ) -> Result<GameSession, SessionError> {
        let mut state = self.state.clone();
        let session = state
            .wait_for(|s| pred(s))
            .await
            .map_err(|_| SessionError::SessionClosed)?;
        Ok(session.clone())
    }

    pub async fn propose_stake(&self, amount: Amount) -> Result<(), SessionError> {
        self.command(Command::ProposeStake { amount }).await
    }

    pub async fn respond_to_stake(&self, accept: bool) -> Result<(), SessionError> {
        self.command(Command::RespondToStake { accept }).await
    }

    pub async fn set_ready(&self) -> Result<(), SessionError> {
        self.command(Command::SetReady).await
    }

    pub async fn update_local_state(
        &self,
        score: u32,
        metrics: Vec<Metric>,
        position: Option<f32>,
    ) -> Result<(), SessionError> {
        self.command(Command::UpdateLocalState {
            score,
            metrics,
            position,
        })
        .await
    }

    pub async fn finish_game(&self) -> Result<(), SessionError> {
        self.command(Command::FinishGame).await
    }

    pub async fn raise_dispute(
        &self,
        reason: impl Into<String>,
        evidence: Evidence,
    ) -> Result<(), SessionError> {
        self.command(Command::RaiseDispute {
            reason: reason.into(),
            evidence,
        })
        .await
    }

    pub async fn submit_evidence(&self, evidence: Evidence) -> Result<(), SessionError> {
        self.command(Command::SubmitEvidence(evidence)).await
    }

    pub async fn resolve_dispute(&self, outcome: DisputeOutcome) -> Result<(), SessionError> {
        self.command(Command::ResolveDispute(outcome)).await
    }

    pub async fn cancel(&self) -> Result<(), SessionError> {
        self.command(Command::Cancel).await
    }

    pub async fn acknowledge(&self) -> Result<(), SessionError> {
        self.command(Command::Acknowledge).await
    }

    async fn command(&self, command: Command) -> Result<(), SessionError> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(Request {
                input: Input::Command(command),
                reply: Some(reply),
            })
            .map_err(|_| SessionError::SessionClosed)?;
        response.await.map_err(|_| SessionError::SessionClosed)?
    }

    pub(crate) fn deliver(&self, envelope: Envelope) {
        self.push(Input::Envelope(envelope));
    }

    pub(crate) fn link_changed(&self, state: LinkState) {
        self.push(Input::Link(state));
    }

    fn push(&self, input: Input) {
        if self.requests.send(Request { input, reply: None }).is_err() {
            log::debug!("session {}: dropped input, session has stopped", self.id);
        }
    }
}

/// Runs `machine` on its own task. `on_close` receives the session id once
/// the session is acknowledged and the task exits.
pub fn spawn_session(
    machine: SessionMachine,
    transport: Arc<dyn Transport>,
    wallet: Arc<dyn Wallet>,
    clock: Clock,
    on_close: Option<mpsc::UnboundedSender<SessionId>>,
) -> SessionHandle {
    let id = machine.session().id.clone();
    let (requests, requests_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(machine.session().clone());
    let (events, _) = broadcast::channel(EVENT_CAPACITY);

    let actor = SessionActor {
        machine,
        transport,
        wallet,
        clock,
        requests: requests.downgrade(),
        timers: HashMap::new(),
        state: state_tx,
        events: events.clone(),
    };
    tokio::spawn(actor.run(requests_rx, on_close));

    SessionHandle {
        id,
        requests,
        state: state_rx,
        events,
    }
}

struct SessionActor {
    machine: SessionMachine,
    transport: Arc<dyn Transport>,
    wallet: Arc<dyn Wallet>,
    clock: Clock,
    requests: mpsc::WeakUnboundedSender<Request>,
    timers: HashMap<TimerKind, JoinHandle<()>>,
    state: watch::Sender<GameSession>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionActor {
    async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<Request>,
        on_close: Option<mpsc::UnboundedSender<SessionId>>,
    ) {
        let effects = self.machine.start();
        self.execute(effects).await;
        self.publish();

        while let Some(Request { input, reply }) = requests.recv().await {
            let now = self.clock.now_ms();
            let result = match self.machine.handle(input, now) {
                Ok(effects) => {
                    self.execute(effects).await;
                    Ok(())
                }
                Err(err) => Err(err),
            };
            self.publish();
            if let Some(reply) = reply {
                let _ = reply.send(result);
            }
            if self.machine.is_closed() {
                break;
            }
        }

        let id = self.machine.session().id.clone();
        log::debug!("session {}: stopped", id);
        for (_, timer) in self.timers.drain() {
            timer.abort();
        }
        if let Some(on_close) = on_close {
            let _ = on_close.send(id);
        }
    }

    fn publish(&mut self) {
        self.state.send_replace(self.machine.session().clone());
        for event in self.machine.drain_events() {
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
    }

    async fn execute(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Send(message) => {
                    let envelope = Envelope::new(
                        self.machine.session().id.clone(),
                        self.clock.now_ms(),
                        message,
                    );
                    let kind = envelope.kind();
                    if let Err(err) = self.transport.send(envelope).await {
                        log::warn!(
                            "session {}: failed to send {}: {}",
                            self.machine.session().id,
                            kind,
                            err
                        );
                    }
                }
                Effect::LockStake { amount, attempt } => self.lock_stake(amount, attempt),
                Effect::SubmitPayout { payout, attempt } => {
                    let wallet = self.wallet.clone();
                    let session_id = self.machine.session().id.clone();
                    let limit = self.wallet_call_limit();
                    log::info!(
                        "session {}: payout attempt {} from {}",
                        session_id,
                        attempt,
                        wallet.address()
                    );
                    self.spawn_wallet_call(attempt, async move {
                        let result = tokio::time::timeout(
                            limit,
                            wallet.submit_settlement(&session_id, &payout),
                        )
                        .await
                        .unwrap_or(Err(WalletError::Timeout));
                        WalletOutcome::Settlement { attempt, result }
                    });
                }
                Effect::ArmTimer(request) => self.arm(request),
                Effect::CancelTimer(kind) => {
                    if let Some(timer) = self.timers.remove(&kind) {
                        timer.abort();
                    }
                }
                Effect::CancelAllTimers => {
                    for (_, timer) in self.timers.drain() {
                        timer.abort();
                    }
                }
            }
        }
    }

    fn lock_stake(&mut self, amount: Amount, attempt: u32) {
        let wallet = self.wallet.clone();
        let session_id = self.machine.session().id.clone();
        let limit = self.wallet_call_limit();
        self.spawn_wallet_call(attempt, async move {
            let result = tokio::time::timeout(limit, wallet.submit_stake_lock(&session_id, amount))
                .await
                .unwrap_or(Err(WalletError::Timeout));
            WalletOutcome::StakeLock { attempt, result }
        });
    }

    fn wallet_call_limit(&self) -> Duration {
        Duration::from_millis(self.machine.config().timeouts.wallet_call_ms)
    }

    fn spawn_wallet_call(
        &self,
        attempt: u32,
        call: impl Future<Output = WalletOutcome> + Send + 'static,
    ) {
        let requests = self.requests.clone();
        tokio::spawn(async move {
            if attempt > 1 {
                let backoff = RETRY_BACKOFF_MS * (attempt as u64 - 1);
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }
            let outcome = call.await;
            if let Some(requests) = requests.upgrade() {
                let _ = requests.send(Request {
                    input: Input::Wallet(outcome),
                    reply: None,
                });
            }
        });
    }

    fn arm(&mut self, request: TimerRequest) {
        let TimerRequest {
            kind,
            after_ms,
            generation,
        } = request;
        let requests = self.requests.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(after_ms)).await;
            if let Some(requests) = requests.upgrade() {
                let _ = requests.send(Request {
                    input: Input::Timer { kind, generation },
                    reply: None,
                });
            }
        });
        if let Some(previous) = self.timers.insert(kind, timer) {
            previous.abort();
        }
    }
}
