use serde::{Deserialize, Serialize};

use crate::session::model::{PhaseKind, Role, SessionId};
use crate::session::timer::TimerKind;

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    PhaseChanged {
        session_id: SessionId,
        from: PhaseKind,
        to: PhaseKind,
    },
    Rejected {
        session_id: SessionId,
        message: String,
    },
    TimedOut {
        session_id: SessionId,
        timer: TimerKind,
    },
    OpponentSilent {
        session_id: SessionId,
        since_ms: u64,
    },
    LinkChanged {
        session_id: SessionId,
        connected: bool,
    },
    Finalized {
        session_id: SessionId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelReason {
    UserCancelled,
    OpponentCancelled,
    OpponentDisconnected,
    Disconnected,
    StakeRejected,
    StakeResponseTimeout,
    StakeLockTimeout,
    StakeLockFailed,
    ReadyTimeout,
    StartTimeout,
    DisputeVoided,
}

impl CancelReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelReason::UserCancelled => "cancelled by player",
            CancelReason::OpponentCancelled => "cancelled by opponent",
            CancelReason::OpponentDisconnected => "opponent disconnected",
            CancelReason::Disconnected => "connection lost",
            CancelReason::StakeRejected => "stake rejected",
            CancelReason::StakeResponseTimeout => "no response to stake proposal",
            CancelReason::StakeLockTimeout => "stake lock not confirmed in time",
            CancelReason::StakeLockFailed => "stake lock failed",
            CancelReason::ReadyTimeout => "players did not ready up in time",
            CancelReason::StartTimeout => "game start signal never arrived",
            CancelReason::DisputeVoided => "dispute voided the session",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisputeReason {
    ScoreMismatch,
    MissingResult,
    SettlementFailed,
    SettlementUnconfirmed,
    Raised { by: Role, reason: String },
}

impl DisputeReason {
    pub fn as_str(&self) -> &str {
        match self {
            DisputeReason::ScoreMismatch => "game results disagree",
            DisputeReason::MissingResult => "opponent never reported a result",
            DisputeReason::SettlementFailed => "payout transaction failed",
            DisputeReason::SettlementUnconfirmed => "payout was never confirmed",
            DisputeReason::Raised { reason, .. } => reason,
        }
    }
}
