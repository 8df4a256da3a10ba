use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::session::model::{Amount, SessionId, TxHash, WalletAddress};
use crate::settlement::Payout;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WalletError {
    #[error("transaction rejected: {0}")]
    Rejected(String),
    #[error("wallet unavailable: {0}")]
    Unavailable(String),
    #[error("transaction timed out")]
    Timeout,
}

/// On-chain collaborator. Both calls are idempotent per session id: repeating
/// a request returns the original transaction.
#[async_trait]
pub trait Wallet: Send + Sync + 'static {
    fn address(&self) -> &WalletAddress;

    async fn submit_stake_lock(
        &self,
        session_id: &str,
        amount: Amount,
    ) -> Result<TxHash, WalletError>;

    async fn submit_settlement(
        &self,
        session_id: &str,
        payout: &Payout,
    ) -> Result<TxHash, WalletError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletCall {
    StakeLock { session_id: SessionId, amount: Amount },
    Settlement { session_id: SessionId, payout: Payout },
}

/// Failure injection for [`SimulatedWallet`]. Counters are consumed one call
/// at a time.
#[derive(Debug, Clone, Default)]
pub struct WalletFaults {
    pub failing_stake_locks: u32,
    pub failing_settlements: u32,
    /// Settlement requests are recorded but never answered.
    pub hang_settlements: bool,
    pub reject_all: bool,
    pub latency_ms: u64,
}

#[derive(Debug, Default)]
struct Ledger {
    faults: WalletFaults,
    calls: Vec<WalletCall>,
    locks: HashMap<SessionId, TxHash>,
    settlements: HashMap<SessionId, (Payout, TxHash)>,
    next_tx: u64,
}

impl Ledger {
    fn next_tx(&mut self, prefix: &str) -> TxHash {
        self.next_tx += 1;
        TxHash(format!("0x{}{:06x}", prefix, self.next_tx))
    }
}

pub struct SimulatedWallet {
    address: WalletAddress,
    ledger: Mutex<Ledger>,
}

impl SimulatedWallet {
    pub fn new(address: impl Into<String>) -> Self {
        Self::with_faults(address, WalletFaults::default())
    }

    pub fn with_faults(address: impl Into<String>, faults: WalletFaults) -> Self {
        Self {
            address: WalletAddress(address.into()),
            ledger: Mutex::new(Ledger {
                faults,
                ..Ledger::default()
            }),
        }
    }

    pub async fn set_faults(&self, faults: WalletFaults) {
        self.ledger.lock().await.faults = faults;
    }

    pub async fn calls(&self) -> Vec<WalletCall> {
        self.ledger.lock().await.calls.clone()
    }

    pub async fn stake_lock_calls(&self) -> usize {
        self.ledger
            .lock()
            .await
            .calls
            .iter()
            .filter(|c| matches!(c, WalletCall::StakeLock { .. }))
            .count()
    }

    pub async fn settlement_calls(&self) -> usize {
        self.ledger
            .lock()
            .await
            .calls
            .iter()
            .filter(|c| matches!(c, WalletCall::Settlement { .. }))
            .count()
    }

    async fn delay(&self) {
        let latency_ms = self.ledger.lock().await.faults.latency_ms;
        if latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(latency_ms)).await;
        }
    }
}

#[async_trait]
impl Wallet for SimulatedWallet {
    fn address(&self) -> &WalletAddress {
        &self.address
    }

    async fn submit_stake_lock(
        &self,
        session_id: &str,
        amount: Amount,
    ) -> Result<TxHash, WalletError> {
        self.delay().await;

        let mut ledger = self.ledger.lock().await;
        ledger.calls.push(WalletCall::StakeLock {
            session_id: session_id.to_string(),
            amount,
        });
        if let Some(tx_hash) = ledger.locks.get(session_id) {
            return Ok(tx_hash.clone());
        }
        if ledger.faults.reject_all {
            return Err(WalletError::Rejected("wallet refused to sign".into()));
        }
        if ledger.faults.failing_stake_locks > 0 {
            ledger.faults.failing_stake_locks -= 1;
            return Err(WalletError::Unavailable("node unreachable".into()));
        }

        let tx_hash = ledger.next_tx("10c");
        log::debug!(
            "{}: locked {} for session {} in {}",
            self.address,
            amount,
            session_id,
            tx_hash
        );
        ledger.locks.insert(session_id.to_string(), tx_hash.clone());
        Ok(tx_hash)
    }

    async fn submit_settlement(
        &self,
        session_id: &str,
        payout: &Payout,
    ) -> Result<TxHash, WalletError> {
        self.delay().await;

        let mut ledger = self.ledger.lock().await;
        ledger.calls.push(WalletCall::Settlement {
            session_id: session_id.to_string(),
            payout: payout.clone(),
        });
        if ledger.faults.hang_settlements {
            drop(ledger);
            return std::future::pending().await;
        }
        if let Some((settled, tx_hash)) = ledger.settlements.get(session_id) {
            if settled == payout {
                return Ok(tx_hash.clone());
            }
            return Err(WalletError::Rejected(format!(
                "session {} already settled in {}",
                session_id, tx_hash
            )));
        }
        if ledger.faults.reject_all {
            return Err(WalletError::Rejected("wallet refused to sign".into()));
        }
        if ledger.faults.failing_settlements > 0 {
            ledger.faults.failing_settlements -= 1;
            return Err(WalletError::Timeout);
        }

        let tx_hash = ledger.next_tx("5e7");
        log::debug!(
            "{}: paid out {} for session {} in {}",
            self.address,
            payout.pot.saturating_sub(payout.fee),
            session_id,
            tx_hash
        );
        ledger
            .settlements
            .insert(session_id.to_string(), (payout.clone(), tx_hash.clone()));
        Ok(tx_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FeePolicy;
    use crate::settlement::compute_payout;

    fn payout(winner: &str) -> Payout {
        compute_payout(
            Amount::from_units(5.0),
            Some(&WalletAddress::from(winner)),
            &WalletAddress::from("0xalice"),
            &WalletAddress::from("0xbob"),
            &FeePolicy::default(),
        )
    }

    #[tokio::test]
    async fn test_stake_lock_is_idempotent_per_session() {
        let wallet = SimulatedWallet::new("0xalice");
        let first = wallet
            .submit_stake_lock("s-1", Amount::from_units(5.0))
            .await
            .unwrap();
        let again = wallet
            .submit_stake_lock("s-1", Amount::from_units(5.0))
            .await
            .unwrap();
        let other = wallet
            .submit_stake_lock("s-2", Amount::from_units(5.0))
            .await
            .unwrap();

        assert_eq!(first, again);
        assert_ne!(first, other);
        assert_eq!(wallet.stake_lock_calls().await, 3);
    }

    #[tokio::test]
    async fn test_second_different_payout_rejected() {
        let wallet = SimulatedWallet::new("0xalice");
        let tx = wallet
            .submit_settlement("s-1", &payout("0xalice"))
            .await
            .unwrap();

        assert_eq!(
            wallet.submit_settlement("s-1", &payout("0xalice")).await,
            Ok(tx)
        );
        assert!(matches!(
            wallet.submit_settlement("s-1", &payout("0xbob")).await,
            Err(WalletError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let wallet = SimulatedWallet::with_faults(
            "0xalice",
            WalletFaults {
                failing_stake_locks: 1,
                ..WalletFaults::default()
            },
        );

        assert!(
            wallet
                .submit_stake_lock("s-1", Amount::from_units(1.0))
                .await
                .is_err()
        );
        assert!(
            wallet
                .submit_stake_lock("s-1", Amount::from_units(1.0))
                .await
                .is_ok()
        );
    }
}
