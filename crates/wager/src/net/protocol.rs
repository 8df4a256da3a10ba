use std::fmt;

use rkyv::{Archive, Deserialize, Serialize, rancor};
use serde::{Deserialize as SerdeDeserialize, Serialize as SerdeSerialize};

use crate::session::model::{
    Amount, GameMode, PlayerId, PlayerInfo, Role, SessionConfig, SessionId, TxHash, WalletAddress,
};

pub const MAX_ENVELOPE_SIZE: usize = 64 * 1024;
pub const PROTOCOL_VERSION: u32 = 1;
pub const PROTOCOL_MAGIC: u32 = 0x5747_4552;

#[derive(
    Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize,
)]
#[rkyv(derive(Debug))]
pub struct StakeProposal {
    pub amount: Amount,
    pub game_type: String,
    pub duration_ms: u64,
}

#[derive(
    Debug, Clone, PartialEq, Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize,
)]
#[rkyv(derive(Debug))]
pub struct Metric {
    pub name: String,
    pub value: f32,
}

impl Metric {
    pub fn new(name: impl Into<String>, value: f32) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

#[derive(
    Debug, Clone, PartialEq, Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize,
)]
#[rkyv(derive(Debug))]
pub struct GameSnapshot {
    pub sequence: u32,
    pub elapsed_ms: u64,
    pub score: u32,
    pub metrics: Vec<Metric>,
    pub position: Option<f32>,
}

#[derive(
    Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize,
)]
#[rkyv(derive(Debug))]
pub struct GameEndReport {
    pub final_score: u32,
    pub opponent_score: u32,
    pub declared_winner: Option<WalletAddress>,
    pub integrity_hash: String,
}

#[derive(
    Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize,
)]
#[rkyv(derive(Debug))]
pub struct Evidence {
    pub description: String,
    pub integrity_hash: Option<String>,
    pub attachment: Vec<u8>,
}

impl Evidence {
    pub fn note(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            integrity_hash: None,
            attachment: Vec::new(),
        }
    }
}

#[derive(
    Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize,
)]
#[rkyv(derive(Debug))]
pub enum DisputeOutcome {
    Upheld {
        winner: Option<WalletAddress>,
        tx_hash: Option<TxHash>,
    },
    Voided,
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct QueueTicket {
    pub player: PlayerInfo,
    pub game_type: String,
    pub mode: GameMode,
    pub stake: Amount,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct MatchOffer {
    pub opponent: PlayerInfo,
    pub role: Role,
    pub config: SessionConfig,
    pub accept_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum Message {
    Hello { player: PlayerInfo },
    Rejoin { player_id: PlayerId },
    Heartbeat,
    Cancel { reason: String },
    Error { message: String },

    StakeProposal(StakeProposal),
    StakeAccepted,
    StakeRejected { reason: String },
    StakeLocked { tx_hash: TxHash },
    StakeLockFailed { reason: String },

    Ready,
    CountdownStart { seconds: u8 },
    GameStart { started_at_ms: u64 },
    GameState(GameSnapshot),
    GameEnd(GameEndReport),

    SettlementConfirmed { tx_hash: TxHash },
    SettlementFailed { reason: String },
    DisputeRaise { reason: String, evidence: Evidence },
    DisputeEvidence(Evidence),
    DisputeResolved(DisputeOutcome),

    QueueJoin(QueueTicket),
    QueueLeave,
    QueueStatus { position: u32, estimated_wait_secs: u32 },
    MatchFound(MatchOffer),
    MatchAccepted,
    MatchDeclined,
    MatchConfirmed,
    OpponentState { connected: bool },
    OpponentDisconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Hello,
    Rejoin,
    Heartbeat,
    Cancel,
    Error,
    StakeProposal,
    StakeAccepted,
    StakeRejected,
    StakeLocked,
    StakeLockFailed,
    Ready,
    CountdownStart,
    GameStart,
    GameState,
    GameEnd,
    SettlementConfirmed,
    SettlementFailed,
    DisputeRaise,
    DisputeEvidence,
    DisputeResolved,
    QueueJoin,
    QueueLeave,
    QueueStatus,
    MatchFound,
    MatchAccepted,
    MatchDeclined,
    MatchConfirmed,
    OpponentState,
    OpponentDisconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageFamily {
    Connection,
    Stake,
    GameControl,
    Settlement,
    Matchmaking,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Hello => "HELLO",
            MessageKind::Rejoin => "REJOIN",
            MessageKind::Heartbeat => "HEARTBEAT",
            MessageKind::Cancel => "CANCEL",
            MessageKind::Error => "ERROR",
            MessageKind::StakeProposal => "STAKE_PROPOSAL",
            MessageKind::StakeAccepted => "STAKE_ACCEPTED",
            MessageKind::StakeRejected => "STAKE_REJECTED",
            MessageKind::StakeLocked => "STAKE_LOCKED",
            MessageKind::StakeLockFailed => "STAKE_LOCK_FAILED",
            MessageKind::Ready => "READY",
            MessageKind::CountdownStart => "COUNTDOWN_START",
            MessageKind::GameStart => "GAME_START",
            MessageKind::GameState => "GAME_STATE",
            MessageKind::GameEnd => "GAME_END",
            MessageKind::SettlementConfirmed => "SETTLEMENT_CONFIRMED",
            MessageKind::SettlementFailed => "SETTLEMENT_FAILED",
            MessageKind::DisputeRaise => "DISPUTE_RAISE",
            MessageKind::DisputeEvidence => "DISPUTE_EVIDENCE",
            MessageKind::DisputeResolved => "DISPUTE_RESOLVED",
            MessageKind::QueueJoin => "QUEUE_JOIN",
            MessageKind::QueueLeave => "QUEUE_LEAVE",
            MessageKind::QueueStatus => "QUEUE_STATUS",
            MessageKind::MatchFound => "MATCH_FOUND",
            MessageKind::MatchAccepted => "MATCH_ACCEPTED",
            MessageKind::MatchDeclined => "MATCH_DECLINED",
            MessageKind::MatchConfirmed => "MATCH_CONFIRMED",
            MessageKind::OpponentState => "OPPONENT_STATE",
            MessageKind::OpponentDisconnected => "OPPONENT_DISCONNECTED",
        }
    }

    pub fn family(&self) -> MessageFamily {
        use MessageKind::*;
        match self {
            Hello | Rejoin | Heartbeat | Cancel | Error => MessageFamily::Connection,
            StakeProposal | StakeAccepted | StakeRejected | StakeLocked | StakeLockFailed => {
                MessageFamily::Stake
            }
            Ready | CountdownStart | GameStart | GameState | GameEnd => MessageFamily::GameControl,
            SettlementConfirmed | SettlementFailed | DisputeRaise | DisputeEvidence
            | DisputeResolved => MessageFamily::Settlement,
            QueueJoin | QueueLeave | QueueStatus | MatchFound | MatchAccepted | MatchDeclined
            | MatchConfirmed | OpponentState | OpponentDisconnected => MessageFamily::Matchmaking,
        }
    }

    /// Kinds that only the relay itself may originate.
    pub fn is_relay_authored(&self) -> bool {
        matches!(
            self,
            MessageKind::QueueStatus
                | MessageKind::MatchFound
                | MessageKind::MatchConfirmed
                | MessageKind::OpponentState
                | MessageKind::OpponentDisconnected
                | MessageKind::DisputeResolved
        )
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Hello { .. } => MessageKind::Hello,
            Message::Rejoin { .. } => MessageKind::Rejoin,
            Message::Heartbeat => MessageKind::Heartbeat,
            Message::Cancel { .. } => MessageKind::Cancel,
            Message::Error { .. } => MessageKind::Error,
            Message::StakeProposal(_) => MessageKind::StakeProposal,
            Message::StakeAccepted => MessageKind::StakeAccepted,
            Message::StakeRejected { .. } => MessageKind::StakeRejected,
            Message::StakeLocked { .. } => MessageKind::StakeLocked,
            Message::StakeLockFailed { .. } => MessageKind::StakeLockFailed,
            Message::Ready => MessageKind::Ready,
            Message::CountdownStart { .. } => MessageKind::CountdownStart,
            Message::GameStart { .. } => MessageKind::GameStart,
            Message::GameState(_) => MessageKind::GameState,
            Message::GameEnd(_) => MessageKind::GameEnd,
            Message::SettlementConfirmed { .. } => MessageKind::SettlementConfirmed,
            Message::SettlementFailed { .. } => MessageKind::SettlementFailed,
            Message::DisputeRaise { .. } => MessageKind::DisputeRaise,
            Message::DisputeEvidence(_) => MessageKind::DisputeEvidence,
            Message::DisputeResolved(_) => MessageKind::DisputeResolved,
            Message::QueueJoin(_) => MessageKind::QueueJoin,
            Message::QueueLeave => MessageKind::QueueLeave,
            Message::QueueStatus { .. } => MessageKind::QueueStatus,
            Message::MatchFound(_) => MessageKind::MatchFound,
            Message::MatchAccepted => MessageKind::MatchAccepted,
            Message::MatchDeclined => MessageKind::MatchDeclined,
            Message::MatchConfirmed => MessageKind::MatchConfirmed,
            Message::OpponentState { .. } => MessageKind::OpponentState,
            Message::OpponentDisconnected => MessageKind::OpponentDisconnected,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct Envelope {
    pub magic: u32,
    pub version: u32,
    pub session_id: SessionId,
    pub timestamp_ms: u64,
    pub message: Message,
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("serialization failed: {0}")]
    Serialize(rancor::Error),
    #[error("deserialization failed: {0}")]
    Deserialize(rancor::Error),
    #[error("envelope of {0} bytes exceeds the size limit")]
    TooLarge(usize),
    #[error("bad protocol magic {0:#x}")]
    BadMagic(u32),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u32),
}

impl Envelope {
    pub fn new(session_id: impl Into<SessionId>, timestamp_ms: u64, message: Message) -> Self {
        Self {
            magic: PROTOCOL_MAGIC,
            version: PROTOCOL_VERSION,
            session_id: session_id.into(),
            timestamp_ms,
            message,
        }
    }

    /// Envelope that belongs to no session (queue traffic before a match).
    pub fn unbound(timestamp_ms: u64, message: Message) -> Self {
        Self::new(String::new(), timestamp_ms, message)
    }

    pub fn kind(&self) -> MessageKind {
        self.message.kind()
    }

    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        let bytes = rkyv::to_bytes::<rancor::Error>(self)
            .map(|aligned| aligned.into_vec())
            .map_err(EnvelopeError::Serialize)?;
        if bytes.len() > MAX_ENVELOPE_SIZE {
            return Err(EnvelopeError::TooLarge(bytes.len()));
        }
        Ok(bytes)
    }

    pub fn decode(data: &[u8]) -> Result<Self, EnvelopeError> {
        if data.len() > MAX_ENVELOPE_SIZE {
            return Err(EnvelopeError::TooLarge(data.len()));
        }
        let envelope =
            rkyv::from_bytes::<Self, rancor::Error>(data).map_err(EnvelopeError::Deserialize)?;
        if envelope.magic != PROTOCOL_MAGIC {
            return Err(EnvelopeError::BadMagic(envelope.magic));
        }
        if envelope.version != PROTOCOL_VERSION {
            return Err(EnvelopeError::UnsupportedVersion(envelope.version));
        }
        Ok(envelope)
    }
}
