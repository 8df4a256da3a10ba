pub mod actor;
pub mod machine;
pub mod model;
pub mod timer;

pub use actor::{SessionHandle, spawn_session};
pub use machine::{Command, Effect, Input, SessionMachine, WalletOutcome};
pub use model::{
    Amount, GameMode, GameOverReason, GameSession, Phase, PhaseKind, Player, PlayerId, PlayerInfo,
    Role, SessionConfig, SessionId, TxHash, WalletAddress,
};
pub use timer::{Clock, TimerKind, TimerRequest};
