pub mod client;
pub mod config;
pub mod dispute;
pub mod error;
pub mod event;
pub mod matchmaking;
pub mod net;
pub mod session;
pub mod settlement;
pub mod stake;
pub mod sync;
pub mod wallet;

pub use client::{ClientEvent, WagerClient};
pub use config::{FeePolicy, ProtocolConfig, RetryPolicy, Timeouts};
pub use dispute::{dispute_deadline, window_open};
pub use error::{ClientError, MatchmakingError, SessionError};
pub use event::{CancelReason, DisputeReason, SessionEvent};
pub use matchmaking::{QueueClient, QueueEffect, QueueState};
pub use net::{
    DisputeOutcome, Envelope, Evidence, LinkSimulation, LinkState, LocalRelay, Message,
    MessageKind, Metric, RelayConfig, RelayLink, Transport, TransportError, TransportEvent,
};
pub use session::{
    Amount, Clock, GameMode, GameSession, Phase, PhaseKind, PlayerInfo, Role, SessionConfig,
    SessionHandle, SessionMachine, TxHash, WalletAddress,
};
pub use settlement::{Payout, Transfer, compute_payout};
pub use stake::StakeNegotiation;
pub use sync::{GameplaySync, Reconciliation, decide_winner, integrity_hash, reconcile};
pub use wallet::{SimulatedWallet, Wallet, WalletError, WalletFaults};
