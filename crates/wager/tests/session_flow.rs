use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use wager::{
    Amount, CancelReason, ClientEvent, DisputeOutcome, DisputeReason, Evidence, GameMode,
    GameSession, LocalRelay, Metric, Phase, PhaseKind, PlayerInfo, ProtocolConfig, QueueState,
    RelayConfig, RelayLink, SessionHandle, SimulatedWallet, WagerClient, WalletAddress,
    WalletFaults,
};

const DURATION_MS: u64 = 60_000;

struct TestPlayer {
    client: WagerClient,
    events: mpsc::UnboundedReceiver<ClientEvent>,
    link: RelayLink,
    wallet: Arc<SimulatedWallet>,
}

async fn join(relay: &LocalRelay, name: &str, faults: WalletFaults) -> TestPlayer {
    let address = format!("0x{}", name.to_lowercase());
    let wallet = Arc::new(SimulatedWallet::with_faults(address.clone(), faults));
    let player = PlayerInfo::new(format!("p-{}", name.to_lowercase()), name, &address);
    let (client, events, link) =
        WagerClient::connect_local(relay, player, wallet.clone(), ProtocolConfig::default())
            .await;
    TestPlayer {
        client,
        events,
        link,
        wallet,
    }
}

async fn next_event(
    events: &mut mpsc::UnboundedReceiver<ClientEvent>,
    pred: impl Fn(&ClientEvent) -> bool,
) -> ClientEvent {
    loop {
        let event = events.recv().await.expect("client stopped");
        if pred(&event) {
            return event;
        }
    }
}

async fn started(player: &mut TestPlayer) -> SessionHandle {
    match next_event(&mut player.events, |e| matches!(e, ClientEvent::SessionStarted(_))).await {
        ClientEvent::SessionStarted(handle) => handle,
        _ => unreachable!(),
    }
}

async fn in_phase(handle: &SessionHandle, phase: PhaseKind) -> GameSession {
    handle
        .wait_for(|s| s.phase_kind() == phase)
        .await
        .unwrap()
}

/// Alice queues first and hosts.
async fn matched(
    mode: GameMode,
    stake: f64,
    alice_faults: WalletFaults,
) -> (LocalRelay, TestPlayer, SessionHandle, TestPlayer, SessionHandle) {
    let relay = LocalRelay::new(RelayConfig::default());
    let mut alice = join(&relay, "Alice", alice_faults).await;
    let mut bob = join(&relay, "Bob", WalletFaults::default()).await;

    let stake = Amount::from_units(stake);
    alice
        .client
        .join_queue("sprint", mode, stake, DURATION_MS)
        .await
        .unwrap();
    bob.client
        .join_queue("sprint", mode, stake, DURATION_MS)
        .await
        .unwrap();

    for player in [&mut alice, &mut bob] {
        next_event(&mut player.events, |e| matches!(e, ClientEvent::MatchFound { .. })).await;
        player.client.respond_to_match(true).await.unwrap();
    }
    let host = started(&mut alice).await;
    let guest = started(&mut bob).await;
    assert_eq!(host.id(), guest.id());
    (relay, alice, host, bob, guest)
}

async fn lock_stake(host: &SessionHandle, guest: &SessionHandle, amount: f64) {
    host.propose_stake(Amount::from_units(amount)).await.unwrap();
    in_phase(guest, PhaseKind::StakePending).await;
    guest.respond_to_stake(true).await.unwrap();
    in_phase(host, PhaseKind::StakeLocked).await;
    in_phase(guest, PhaseKind::StakeLocked).await;
}

async fn play(host: &SessionHandle, guest: &SessionHandle, host_score: u32, guest_score: u32) {
    host.set_ready().await.unwrap();
    guest.set_ready().await.unwrap();
    in_phase(host, PhaseKind::Playing).await;
    in_phase(guest, PhaseKind::Playing).await;
    host.update_local_state(host_score, Vec::new(), None)
        .await
        .unwrap();
    guest
        .update_local_state(guest_score, Vec::new(), None)
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_wagered_game_settles_to_the_winner() {
    let (_relay, alice, host, bob, guest) =
        matched(GameMode::Wagered, 10.0, WalletFaults::default()).await;

    lock_stake(&host, &guest, 10.0).await;
    let locked = host.snapshot();
    assert_eq!(locked.agreed_stake, Amount::from_units(10.0));
    assert!(locked.stake_lock_tx.is_some());

    play(&host, &guest, 120, 80).await;

    let host_view = in_phase(&host, PhaseKind::Settled).await;
    let guest_view = in_phase(&guest, PhaseKind::Settled).await;
    assert_eq!(host_view.winner, Some(WalletAddress::from("0xalice")));
    assert_eq!(guest_view.winner, host_view.winner);
    assert!(host_view.settle_tx.is_some());
    assert_eq!(guest_view.settle_tx, host_view.settle_tx);
    assert!(host_view.dispute_deadline_ms > 0);

    // Only the host pays out.
    assert_eq!(alice.wallet.settlement_calls().await, 1);
    assert_eq!(bob.wallet.settlement_calls().await, 0);
    assert_eq!(alice.wallet.stake_lock_calls().await, 1);
    assert_eq!(bob.wallet.stake_lock_calls().await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_lead_change_after_last_snapshot_settles() {
    let (_relay, alice, host, bob, guest) =
        matched(GameMode::Wagered, 10.0, WalletFaults::default()).await;
    lock_stake(&host, &guest, 10.0).await;
    play(&host, &guest, 120, 95).await;
    guest
        .update_local_state(95, vec![Metric::new("laps", 2.0)], Some(0.4))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    let seen = host.snapshot();
    assert_eq!(seen.opponent_score, 95);
    assert_eq!(seen.opponent_metrics, vec![Metric::new("laps", 2.0)]);
    assert_eq!(seen.opponent_position, Some(0.4));

    // Bob overtakes and Alice ends the game before the next snapshot.
    guest.update_local_state(130, Vec::new(), None).await.unwrap();
    host.finish_game().await.unwrap();

    let host_view = in_phase(&host, PhaseKind::Settled).await;
    let guest_view = in_phase(&guest, PhaseKind::Settled).await;
    assert_eq!(host_view.opponent_score, 130);
    assert_eq!(host_view.winner, Some(WalletAddress::from("0xbob")));
    assert_eq!(guest_view.winner, host_view.winner);
    assert_eq!(guest_view.settle_tx, host_view.settle_tx);
    assert_eq!(alice.wallet.settlement_calls().await, 1);
    assert_eq!(bob.wallet.settlement_calls().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_payout_disputes_and_can_be_abandoned() {
    let faults = WalletFaults {
        hang_settlements: true,
        ..WalletFaults::default()
    };
    let (_relay, alice, host, _bob, guest) = matched(GameMode::Wagered, 10.0, faults).await;
    lock_stake(&host, &guest, 10.0).await;
    play(&host, &guest, 120, 80).await;

    in_phase(&host, PhaseKind::Settling).await;
    for handle in [&host, &guest] {
        let session = in_phase(handle, PhaseKind::Disputed).await;
        assert_eq!(
            session.phase,
            Phase::Disputed {
                reason: DisputeReason::SettlementFailed,
                evidence: vec![]
            }
        );
        assert!(session.settle_tx.is_none());
    }
    assert_eq!(alice.wallet.settlement_calls().await, 3);

    guest.cancel().await.unwrap();
    let session = in_phase(&host, PhaseKind::Cancelled).await;
    assert_eq!(
        session.phase,
        Phase::Cancelled {
            reason: CancelReason::OpponentCancelled
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_friendly_game_never_touches_the_wallet() {
    let (_relay, alice, host, bob, guest) =
        matched(GameMode::Friendly, 0.0, WalletFaults::default()).await;

    play(&host, &guest, 10, 30).await;

    let settled = host.wait_for(|s| s.is_terminal()).await.unwrap();
    assert_eq!(settled.phase_kind(), PhaseKind::Settled);
    assert_eq!(settled.winner, Some(WalletAddress::from("0xbob")));
    assert!(settled.settle_tx.is_none());
    guest.wait_for(|s| s.is_terminal()).await.unwrap();

    assert!(alice.wallet.calls().await.is_empty());
    assert!(bob.wallet.calls().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stake_lock_retry_recovers() {
    let faults = WalletFaults {
        failing_stake_locks: 1,
        ..WalletFaults::default()
    };
    let (_relay, alice, host, _bob, guest) = matched(GameMode::Wagered, 5.0, faults).await;

    lock_stake(&host, &guest, 5.0).await;
    assert_eq!(alice.wallet.stake_lock_calls().await, 2);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_stake_cancels_both_sides() {
    let (_relay, _alice, host, _bob, guest) =
        matched(GameMode::Wagered, 5.0, WalletFaults::default()).await;

    host.propose_stake(Amount::from_units(5.0)).await.unwrap();
    in_phase(&guest, PhaseKind::StakePending).await;
    guest.respond_to_stake(false).await.unwrap();

    for handle in [&host, &guest] {
        let session = in_phase(handle, PhaseKind::Cancelled).await;
        assert_eq!(
            session.phase,
            Phase::Cancelled {
                reason: CancelReason::StakeRejected
            }
        );
        assert!(session.stake_lock_tx.is_none());
    }
}

#[tokio::test(start_paused = true)]
async fn test_silent_opponent_forfeits() {
    let (_relay, alice, host, bob, guest) =
        matched(GameMode::Wagered, 10.0, WalletFaults::default()).await;
    lock_stake(&host, &guest, 10.0).await;
    play(&host, &guest, 5, 50).await;

    bob.link.disconnect().await;

    let settled = in_phase(&host, PhaseKind::Settled).await;
    assert_eq!(settled.winner, Some(WalletAddress::from("0xalice")));
    assert_eq!(alice.wallet.settlement_calls().await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_then_acknowledge_frees_the_queue() {
    let (_relay, mut alice, host, _bob, guest) =
        matched(GameMode::Friendly, 0.0, WalletFaults::default()).await;

    host.cancel().await.unwrap();
    let session = in_phase(&guest, PhaseKind::Cancelled).await;
    assert_eq!(
        session.phase,
        Phase::Cancelled {
            reason: CancelReason::OpponentCancelled
        }
    );
    assert!(host.set_ready().await.is_err());

    host.acknowledge().await.unwrap();
    next_event(&mut alice.events, |e| matches!(e, ClientEvent::SessionClosed { .. })).await;
    assert_eq!(alice.client.queue_state(), QueueState::Idle);
    alice
        .client
        .join_queue("sprint", GameMode::Friendly, Amount::ZERO, DURATION_MS)
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_keeps_the_session_alive() {
    let (_relay, mut alice, host, _bob, guest) =
        matched(GameMode::Wagered, 5.0, WalletFaults::default()).await;

    alice.link.disconnect().await;
    next_event(&mut alice.events, |e| {
        matches!(e, ClientEvent::LinkChanged { connected: false })
    })
    .await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    alice.client.reconnect().await.unwrap();
    next_event(&mut alice.events, |e| {
        matches!(e, ClientEvent::LinkChanged { connected: true })
    })
    .await;

    // Well past both reconnect windows.
    tokio::time::sleep(Duration::from_secs(40)).await;
    assert_eq!(host.snapshot().phase_kind(), PhaseKind::Lobby);
    assert_eq!(guest.snapshot().phase_kind(), PhaseKind::Lobby);

    lock_stake(&host, &guest, 5.0).await;
}

#[tokio::test(start_paused = true)]
async fn test_lost_link_before_play_cancels() {
    let (_relay, alice, host, _bob, guest) =
        matched(GameMode::Wagered, 5.0, WalletFaults::default()).await;

    alice.link.disconnect().await;

    let session = in_phase(&host, PhaseKind::Cancelled).await;
    assert_eq!(
        session.phase,
        Phase::Cancelled {
            reason: CancelReason::Disconnected
        }
    );
    let session = in_phase(&guest, PhaseKind::Cancelled).await;
    assert_eq!(
        session.phase,
        Phase::Cancelled {
            reason: CancelReason::OpponentDisconnected
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_relay_arbitrates_a_dispute() {
    let (relay, _alice, host, _bob, guest) =
        matched(GameMode::Wagered, 10.0, WalletFaults::default()).await;
    lock_stake(&host, &guest, 10.0).await;
    play(&host, &guest, 120, 80).await;
    in_phase(&host, PhaseKind::Settled).await;
    in_phase(&guest, PhaseKind::Settled).await;

    guest
        .raise_dispute("score looked wrong", Evidence::note("screen recording"))
        .await
        .unwrap();
    let disputed = in_phase(&host, PhaseKind::Disputed).await;
    assert!(matches!(
        disputed.phase,
        Phase::Disputed {
            reason: DisputeReason::Raised { .. },
            ..
        }
    ));

    assert!(
        relay
            .resolve_dispute(
                host.id(),
                DisputeOutcome::Upheld {
                    winner: Some(WalletAddress::from("0xalice")),
                    tx_hash: None,
                },
            )
            .await
    );
    for handle in [&host, &guest] {
        let session = handle.wait_for(|s| s.is_terminal()).await.unwrap();
        assert_eq!(session.phase_kind(), PhaseKind::Settled);
        assert_eq!(session.winner, Some(WalletAddress::from("0xalice")));
    }
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_match_expires() {
    let relay = LocalRelay::new(RelayConfig::default());
    let mut alice = join(&relay, "Alice", WalletFaults::default()).await;
    let mut bob = join(&relay, "Bob", WalletFaults::default()).await;

    let stake = Amount::from_units(1.0);
    alice
        .client
        .join_queue("sprint", GameMode::Wagered, stake, DURATION_MS)
        .await
        .unwrap();
    bob.client
        .join_queue("sprint", GameMode::Wagered, stake, DURATION_MS)
        .await
        .unwrap();
    next_event(&mut alice.events, |e| matches!(e, ClientEvent::MatchFound { .. })).await;
    next_event(&mut bob.events, |e| matches!(e, ClientEvent::MatchFound { .. })).await;
    alice.client.respond_to_match(true).await.unwrap();

    next_event(&mut alice.events, |e| matches!(e, ClientEvent::MatchLost { .. })).await;
    next_event(&mut bob.events, |e| matches!(e, ClientEvent::MatchLost { .. })).await;
    assert_eq!(alice.client.queue_state(), QueueState::Idle);
    assert_eq!(bob.client.queue_state(), QueueState::Idle);
}
