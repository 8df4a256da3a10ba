use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

use super::model::PhaseKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    StakeResponse,
    StakeLock,
    Ready,
    Countdown,
    Duration,
    Heartbeat,
    Liveness,
    ForfeitGrace,
    GameEnd,
    Settlement,
    DisputeWindow,
    Reconnect,
    OpponentReturn,
}

impl TimerKind {
    /// Phase the timer belongs to. `None` for timers that span phases.
    pub fn phase(&self) -> Option<PhaseKind> {
        match self {
            TimerKind::StakeResponse | TimerKind::StakeLock => Some(PhaseKind::StakePending),
            TimerKind::Ready => Some(PhaseKind::StakeLocked),
            TimerKind::Countdown => Some(PhaseKind::Countdown),
            TimerKind::Duration
            | TimerKind::Heartbeat
            | TimerKind::Liveness
            | TimerKind::ForfeitGrace => Some(PhaseKind::Playing),
            TimerKind::GameEnd => Some(PhaseKind::GameOver),
            TimerKind::Settlement => Some(PhaseKind::Settling),
            TimerKind::DisputeWindow => Some(PhaseKind::Settled),
            TimerKind::Reconnect | TimerKind::OpponentReturn => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TimerKind::StakeResponse => "stake response",
            TimerKind::StakeLock => "stake lock",
            TimerKind::Ready => "ready",
            TimerKind::Countdown => "countdown",
            TimerKind::Duration => "game duration",
            TimerKind::Heartbeat => "heartbeat",
            TimerKind::Liveness => "liveness",
            TimerKind::ForfeitGrace => "forfeit grace",
            TimerKind::GameEnd => "game end",
            TimerKind::Settlement => "settlement",
            TimerKind::DisputeWindow => "dispute window",
            TimerKind::Reconnect => "reconnect",
            TimerKind::OpponentReturn => "opponent return",
        }
    }
}

impl fmt::Display for TimerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A timer armed against one phase generation. Firing after the session has
/// moved to another generation has no effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerRequest {
    pub kind: TimerKind,
    pub after_ms: u64,
    pub generation: u64,
}

/// Millisecond wall clock driven by the tokio clock, so paused test time
/// advances it too.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin: Instant,
    origin_ms: u64,
}

impl Clock {
    pub fn new() -> Self {
        let origin_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self {
            origin: Instant::now(),
            origin_ms,
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.origin_ms + self.origin.elapsed().as_millis() as u64
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
