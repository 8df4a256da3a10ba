use serde::{Deserialize, Serialize};

use crate::session::model::WalletAddress;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timeouts {
    pub stake_response_ms: u64,
    pub stake_lock_ms: u64,
    pub ready_ms: u64,
    pub start_grace_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub liveness_ms: u64,
    pub forfeit_grace_ms: u64,
    pub game_end_ms: u64,
    pub settlement_ms: u64,
    /// Upper bound on a single wallet request before it counts as failed.
    pub wallet_call_ms: u64,
    pub dispute_window_ms: u64,
    pub reconnect_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            stake_response_ms: 30_000,
            stake_lock_ms: 120_000,
            ready_ms: 60_000,
            start_grace_ms: 5_000,
            heartbeat_interval_ms: 1_000,
            liveness_ms: 10_000,
            forfeit_grace_ms: 5_000,
            game_end_ms: 15_000,
            settlement_ms: 180_000,
            wallet_call_ms: 30_000,
            dispute_window_ms: 24 * 60 * 60 * 1000,
            reconnect_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub stake_lock_attempts: u32,
    pub settlement_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            stake_lock_attempts: 3,
            settlement_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeePolicy {
    /// House fee as a percentage of the pot, in basis points (250 = 2.5%).
    pub house_fee_bps: u32,
    pub house_wallet: WalletAddress,
}

impl Default for FeePolicy {
    fn default() -> Self {
        Self {
            house_fee_bps: 250,
            house_wallet: WalletAddress::from("0xhouse"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    pub countdown_secs: u8,
    pub timeouts: Timeouts,
    pub retry: RetryPolicy,
    pub fees: FeePolicy,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            countdown_secs: 3,
            timeouts: Timeouts::default(),
            retry: RetryPolicy::default(),
            fees: FeePolicy::default(),
        }
    }
}

impl ProtocolConfig {
    pub fn countdown_ms(&self) -> u64 {
        self.countdown_secs as u64 * 1000
    }
}
