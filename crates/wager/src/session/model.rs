use std::fmt;

use rkyv::{Archive, Deserialize as ArchiveDeserialize, Serialize as ArchiveSerialize};
use serde::{Deserialize, Serialize};

use crate::event::{CancelReason, DisputeReason};
use crate::net::protocol::{Evidence, GameEndReport, Metric};
use crate::stake::StakeNegotiation;

pub type SessionId = String;
pub type PlayerId = String;

/// Stake amount in micro-units (1 unit = 1_000_000 micro-units).
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Archive,
    ArchiveSerialize,
    ArchiveDeserialize,
    Serialize,
    Deserialize,
)]
#[rkyv(derive(Debug))]
pub struct Amount(u64);

impl Amount {
    pub const ZERO: Amount = Amount(0);
    pub const MICROS_PER_UNIT: u64 = 1_000_000;

    pub const fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    pub fn from_units(units: f64) -> Self {
        if !units.is_finite() || units <= 0.0 {
            return Self::ZERO;
        }
        Self((units * Self::MICROS_PER_UNIT as f64).round() as u64)
    }

    pub const fn micros(self) -> u64 {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn saturating_add(self, other: Amount) -> Amount {
        Amount(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(self, other: Amount) -> Amount {
        Amount(self.0.saturating_sub(other.0))
    }

    /// Portion of this amount expressed in basis points, rounded down.
    pub fn basis_points(self, bps: u32) -> Amount {
        Amount(((self.0 as u128 * bps as u128) / 10_000) as u64)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / Self::MICROS_PER_UNIT;
        let frac = self.0 % Self::MICROS_PER_UNIT;
        if frac == 0 {
            write!(f, "{}.0", whole)
        } else {
            let digits = format!("{:06}", frac);
            write!(f, "{}.{}", whole, digits.trim_end_matches('0'))
        }
    }
}

#[derive(
    Debug,
    Clone,
    Default,
    PartialEq,
    Eq,
    Hash,
    Archive,
    ArchiveSerialize,
    ArchiveDeserialize,
    Serialize,
    Deserialize,
)]
#[rkyv(derive(Debug))]
pub struct WalletAddress(pub String);

impl WalletAddress {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for WalletAddress {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for WalletAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    Archive,
    ArchiveSerialize,
    ArchiveDeserialize,
    Serialize,
    Deserialize,
)]
#[rkyv(derive(Debug))]
pub struct TxHash(pub String);

impl TxHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TxHash {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Archive,
    ArchiveSerialize,
    ArchiveDeserialize,
    Serialize,
    Deserialize,
)]
#[rkyv(derive(Debug))]
pub enum GameMode {
    Wagered,
    Friendly,
}

impl GameMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            GameMode::Wagered => "wagered",
            GameMode::Friendly => "friendly",
        }
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Archive,
    ArchiveSerialize,
    ArchiveDeserialize,
    Serialize,
    Deserialize,
)]
#[rkyv(derive(Debug))]
pub enum Role {
    Host,
    Guest,
}

impl Role {
    pub fn opposite(self) -> Role {
        match self {
            Role::Host => Role::Guest,
            Role::Guest => Role::Host,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Host => f.write_str("host"),
            Role::Guest => f.write_str("guest"),
        }
    }
}

#[derive(
    Debug, Clone, PartialEq, Eq, Archive, ArchiveSerialize, ArchiveDeserialize, Serialize, Deserialize,
)]
#[rkyv(derive(Debug))]
pub struct SessionConfig {
    pub game_type: String,
    pub mode: GameMode,
    pub stake: Amount,
    pub duration_ms: u64,
    pub min_activity: u32,
    pub spectators_allowed: bool,
}

impl SessionConfig {
    pub fn friendly(game_type: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            game_type: game_type.into(),
            mode: GameMode::Friendly,
            stake: Amount::ZERO,
            duration_ms,
            min_activity: 0,
            spectators_allowed: true,
        }
    }

    pub fn wagered(game_type: impl Into<String>, stake: Amount, duration_ms: u64) -> Self {
        Self {
            game_type: game_type.into(),
            mode: GameMode::Wagered,
            stake,
            duration_ms,
            min_activity: 0,
            spectators_allowed: false,
        }
    }

    pub fn is_wagered(&self) -> bool {
        self.mode == GameMode::Wagered
    }
}

/// Identity of a participant as announced on the wire.
#[derive(
    Debug, Clone, PartialEq, Eq, Archive, ArchiveSerialize, ArchiveDeserialize, Serialize, Deserialize,
)]
#[rkyv(derive(Debug))]
pub struct PlayerInfo {
    pub id: PlayerId,
    pub display_name: String,
    pub wallet: WalletAddress,
}

impl PlayerInfo {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>, wallet: &str) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            wallet: WalletAddress::from(wallet),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Player {
    pub id: PlayerId,
    pub display_name: String,
    pub wallet: WalletAddress,
    pub is_ready: bool,
    pub has_approved_stake: bool,
}

impl Player {
    pub fn info(&self) -> PlayerInfo {
        PlayerInfo {
            id: self.id.clone(),
            display_name: self.display_name.clone(),
            wallet: self.wallet.clone(),
        }
    }
}

impl From<PlayerInfo> for Player {
    fn from(info: PlayerInfo) -> Self {
        Self {
            id: info.id,
            display_name: info.display_name,
            wallet: info.wallet,
            is_ready: false,
            has_approved_stake: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PhaseKind {
    Lobby,
    StakePending,
    StakeLocked,
    Countdown,
    Playing,
    GameOver,
    Settling,
    Settled,
    Disputed,
    Cancelled,
}

impl PhaseKind {
    pub const ALL: [PhaseKind; 10] = [
        PhaseKind::Lobby,
        PhaseKind::StakePending,
        PhaseKind::StakeLocked,
        PhaseKind::Countdown,
        PhaseKind::Playing,
        PhaseKind::GameOver,
        PhaseKind::Settling,
        PhaseKind::Settled,
        PhaseKind::Disputed,
        PhaseKind::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseKind::Lobby => "LOBBY",
            PhaseKind::StakePending => "STAKE_PENDING",
            PhaseKind::StakeLocked => "STAKE_LOCKED",
            PhaseKind::Countdown => "COUNTDOWN",
            PhaseKind::Playing => "PLAYING",
            PhaseKind::GameOver => "GAME_OVER",
            PhaseKind::Settling => "SETTLING",
            PhaseKind::Settled => "SETTLED",
            PhaseKind::Disputed => "DISPUTED",
            PhaseKind::Cancelled => "CANCELLED",
        }
    }

    /// The transition table. Every phase change goes through this check.
    pub fn can_transition_to(self, next: PhaseKind) -> bool {
        use PhaseKind::*;
        matches!(
            (self, next),
            (Lobby, StakePending)
                | (Lobby, Countdown)
                | (Lobby, Cancelled)
                | (StakePending, StakeLocked)
                | (StakePending, Cancelled)
                | (StakeLocked, Countdown)
                | (StakeLocked, Cancelled)
                | (Countdown, Playing)
                | (Countdown, Cancelled)
                | (Playing, GameOver)
                | (Playing, Cancelled)
                | (GameOver, Settling)
                | (GameOver, Disputed)
                | (GameOver, Cancelled)
                | (Settling, Settled)
                | (Settling, Disputed)
                | (Settling, Cancelled)
                | (Settled, Disputed)
                | (Disputed, Settled)
                | (Disputed, Cancelled)
        )
    }

    pub fn is_pre_play(self) -> bool {
        matches!(
            self,
            PhaseKind::Lobby | PhaseKind::StakePending | PhaseKind::StakeLocked | PhaseKind::Countdown
        )
    }

    /// Every phase short of `SETTLED` and `CANCELLED`. An open dispute window
    /// belongs to a settled session and is left through a dispute instead.
    pub fn is_cancellable(self) -> bool {
        !matches!(self, PhaseKind::Settled | PhaseKind::Cancelled)
    }
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GameOverReason {
    DurationElapsed,
    Finished,
    OpponentFinished,
    Forfeit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Phase {
    Lobby,
    StakePending(StakeNegotiation),
    StakeLocked,
    Countdown {
        ends_at_ms: u64,
    },
    Playing {
        ends_at_ms: u64,
        silent_since_ms: Option<u64>,
    },
    GameOver {
        reason: GameOverReason,
        local_report: GameEndReport,
        opponent_report: Option<GameEndReport>,
    },
    Settling {
        winner: Option<WalletAddress>,
        attempts: u32,
    },
    Settled {
        settled_at_ms: u64,
    },
    Disputed {
        reason: DisputeReason,
        evidence: Vec<Evidence>,
    },
    Cancelled {
        reason: CancelReason,
    },
}

impl Phase {
    pub fn kind(&self) -> PhaseKind {
        match self {
            Phase::Lobby => PhaseKind::Lobby,
            Phase::StakePending(_) => PhaseKind::StakePending,
            Phase::StakeLocked => PhaseKind::StakeLocked,
            Phase::Countdown { .. } => PhaseKind::Countdown,
            Phase::Playing { .. } => PhaseKind::Playing,
            Phase::GameOver { .. } => PhaseKind::GameOver,
            Phase::Settling { .. } => PhaseKind::Settling,
            Phase::Settled { .. } => PhaseKind::Settled,
            Phase::Disputed { .. } => PhaseKind::Disputed,
            Phase::Cancelled { .. } => PhaseKind::Cancelled,
        }
    }
}

/// Aggregate root for one matched session, as seen by the local participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameSession {
    pub id: SessionId,
    pub phase: Phase,
    pub role: Role,
    pub local: Player,
    pub opponent: Option<Player>,
    pub config: SessionConfig,
    pub agreed_stake: Amount,
    pub started_at_ms: u64,
    pub local_score: u32,
    pub opponent_score: u32,
    /// Latest live metrics and position the opponent reported while playing.
    pub opponent_metrics: Vec<Metric>,
    pub opponent_position: Option<f32>,
    pub winner: Option<WalletAddress>,
    pub stake_lock_tx: Option<TxHash>,
    pub settle_tx: Option<TxHash>,
    pub dispute_deadline_ms: u64,
    pub last_error: Option<String>,
    pub generation: u64,
    pub finalized: bool,
}

impl GameSession {
    pub fn new(
        id: impl Into<SessionId>,
        role: Role,
        local: PlayerInfo,
        opponent: PlayerInfo,
        config: SessionConfig,
    ) -> Self {
        Self {
            id: id.into(),
            phase: Phase::Lobby,
            role,
            local: Player::from(local),
            opponent: Some(Player::from(opponent)),
            config,
            agreed_stake: Amount::ZERO,
            started_at_ms: 0,
            local_score: 0,
            opponent_score: 0,
            opponent_metrics: Vec::new(),
            opponent_position: None,
            winner: None,
            stake_lock_tx: None,
            settle_tx: None,
            dispute_deadline_ms: 0,
            last_error: None,
            generation: 0,
            finalized: false,
        }
    }

    pub fn phase_kind(&self) -> PhaseKind {
        self.phase.kind()
    }

    /// `SETTLED` after its dispute window closed (or after a resolved
    /// dispute), or `CANCELLED`. Nothing changes a terminal session.
    pub fn is_terminal(&self) -> bool {
        match self.phase {
            Phase::Cancelled { .. } => true,
            Phase::Settled { .. } => self.finalized,
            _ => false,
        }
    }

    pub fn host(&self) -> Option<&Player> {
        match self.role {
            Role::Host => Some(&self.local),
            Role::Guest => self.opponent.as_ref(),
        }
    }

    pub fn guest(&self) -> Option<&Player> {
        match self.role {
            Role::Host => self.opponent.as_ref(),
            Role::Guest => Some(&self.local),
        }
    }

    pub fn both_ready(&self) -> bool {
        self.local.is_ready && self.opponent.as_ref().is_some_and(|o| o.is_ready)
    }

    pub fn both_approved_stake(&self) -> bool {
        self.local.has_approved_stake
            && self.opponent.as_ref().is_some_and(|o| o.has_approved_stake)
    }

    pub fn opponent_wallet(&self) -> Option<&WalletAddress> {
        self.opponent.as_ref().map(|o| &o.wallet)
    }
}
