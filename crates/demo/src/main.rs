use std::sync::Arc;

use anyhow::{Result, bail};
use clap::Parser;
use tokio::sync::mpsc;

use wager::{
    Amount, ClientEvent, DisputeOutcome, Evidence, GameMode, LinkSimulation, LocalRelay,
    PhaseKind, PlayerInfo, ProtocolConfig, RelayConfig, SessionEvent, SessionHandle,
    SimulatedWallet, WagerClient, WalletFaults,
};

#[derive(Parser)]
#[command(name = "wager-demo")]
#[command(about = "Two players matched, staked, played and settled over an in-process relay")]
struct Args {
    #[arg(long, default_value = "sprint")]
    game_type: String,

    #[arg(long, default_value_t = 10.0, help = "Stake per player, 0 for a friendly game")]
    stake: f64,

    #[arg(long, default_value_t = 10)]
    duration_secs: u64,

    #[arg(long, default_value_t = 120)]
    host_score: u32,

    #[arg(long, default_value_t = 80)]
    guest_score: u32,

    #[arg(long, default_value_t = 10)]
    dispute_window_secs: u64,

    #[arg(long, help = "Guest disputes the settled result")]
    dispute: bool,

    #[arg(long, default_value_t = 0, help = "Stake locks the host wallet fails first")]
    failing_locks: u32,

    #[arg(long, default_value_t = 0.0, help = "Packet loss percentage (0-100)")]
    loss_percent: f32,

    #[arg(long, default_value_t = 0, help = "Minimum latency in ms")]
    min_latency: u32,

    #[arg(long, default_value_t = 0, help = "Maximum latency in ms")]
    max_latency: u32,
}

struct Seat {
    client: WagerClient,
    events: mpsc::UnboundedReceiver<ClientEvent>,
}

impl Seat {
    async fn next(&mut self, pred: impl Fn(&ClientEvent) -> bool) -> Result<ClientEvent> {
        while let Some(event) = self.events.recv().await {
            if let ClientEvent::Error { message } = &event {
                log::warn!("{}: {}", self.client.player().display_name, message);
            }
            if pred(&event) {
                return Ok(event);
            }
        }
        bail!("{} stopped", self.client.player().display_name)
    }

    async fn session(&mut self) -> Result<SessionHandle> {
        self.next(|e| matches!(e, ClientEvent::MatchFound { .. }))
            .await?;
        self.client.respond_to_match(true).await?;
        match self
            .next(|e| matches!(e, ClientEvent::SessionStarted(_) | ClientEvent::MatchLost { .. }))
            .await?
        {
            ClientEvent::SessionStarted(handle) => Ok(handle),
            _ => bail!("match fell through"),
        }
    }
}

fn print_phases(name: &'static str, handle: &SessionHandle) {
    let mut events = handle.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SessionEvent::PhaseChanged { from, to, .. } => {
                    println!("[{:>5}] {} -> {}", name, from, to);
                }
                SessionEvent::Rejected { message, .. } => {
                    println!("[{:>5}] rejected: {}", name, message);
                }
                SessionEvent::TimedOut { timer, .. } => {
                    println!("[{:>5}] {} timed out", name, timer);
                }
                _ => {}
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let stake = Amount::from_units(args.stake);
    let mode = if stake.is_zero() {
        GameMode::Friendly
    } else {
        GameMode::Wagered
    };
    let mut config = ProtocolConfig::default();
    config.timeouts.dispute_window_ms = args.dispute_window_secs * 1000;

    let relay = LocalRelay::new(RelayConfig::default());
    let alice_wallet = Arc::new(SimulatedWallet::with_faults(
        "0xalice",
        WalletFaults {
            failing_stake_locks: args.failing_locks,
            ..WalletFaults::default()
        },
    ));
    let bob_wallet = Arc::new(SimulatedWallet::new("0xbob"));

    let (alice, alice_events, alice_link) = WagerClient::connect_local(
        &relay,
        PlayerInfo::new("p-alice", "Alice", "0xalice"),
        alice_wallet.clone(),
        config.clone(),
    )
    .await;
    let (bob, bob_events, bob_link) = WagerClient::connect_local(
        &relay,
        PlayerInfo::new("p-bob", "Bob", "0xbob"),
        bob_wallet.clone(),
        config,
    )
    .await;

    if args.loss_percent > 0.0 || args.max_latency > 0 {
        let simulation = LinkSimulation {
            enabled: true,
            loss_percent: args.loss_percent,
            min_latency_ms: args.min_latency,
            max_latency_ms: args.max_latency,
            jitter_ms: 0,
        };
        relay.set_simulation(alice_link.id(), simulation.clone()).await;
        relay.set_simulation(bob_link.id(), simulation).await;
    }

    let mut alice = Seat {
        client: alice,
        events: alice_events,
    };
    let mut bob = Seat {
        client: bob,
        events: bob_events,
    };

    let duration_ms = args.duration_secs * 1000;
    alice
        .client
        .join_queue(args.game_type.as_str(), mode, stake, duration_ms)
        .await?;
    bob.client
        .join_queue(args.game_type.as_str(), mode, stake, duration_ms)
        .await?;

    let host = alice.session().await?;
    let guest = bob.session().await?;
    println!("matched into session {} ({}, stake {})", host.id(), mode.as_str(), stake);
    print_phases("Alice", &host);
    print_phases("Bob", &guest);

    if mode == GameMode::Wagered {
        host.propose_stake(stake).await?;
        guest
            .wait_for(|s| s.phase_kind() == PhaseKind::StakePending)
            .await?;
        guest.respond_to_stake(true).await?;
        host.wait_for(|s| s.phase_kind() != PhaseKind::StakePending && s.phase_kind() != PhaseKind::Lobby)
            .await?;
    }

    host.set_ready().await?;
    guest.set_ready().await?;
    for handle in [&host, &guest] {
        let session = handle
            .wait_for(|s| s.phase_kind() == PhaseKind::Playing || s.is_terminal())
            .await?;
        if session.is_terminal() {
            bail!("session ended before play: {:?}", session.last_error);
        }
    }

    host.update_local_state(args.host_score, Vec::new(), None)
        .await?;
    guest
        .update_local_state(args.guest_score, Vec::new(), None)
        .await?;

    let settled = host
        .wait_for(|s| {
            matches!(
                s.phase_kind(),
                PhaseKind::Settled | PhaseKind::Disputed | PhaseKind::Cancelled
            )
        })
        .await?;
    if settled.phase_kind() == PhaseKind::Settled && args.dispute {
        guest
            .wait_for(|s| s.phase_kind() == PhaseKind::Settled)
            .await?;
        guest
            .raise_dispute("result looks wrong", Evidence::note("demo dispute"))
            .await?;
        host.wait_for(|s| s.phase_kind() == PhaseKind::Disputed)
            .await?;
    }

    let current = host.snapshot();
    if current.phase_kind() == PhaseKind::Disputed {
        println!("arbitrating dispute for session {}", current.id);
        relay
            .resolve_dispute(
                &current.id,
                DisputeOutcome::Upheld {
                    winner: current.winner.clone(),
                    tx_hash: None,
                },
            )
            .await;
    }

    let last = host.wait_for(|s| s.is_terminal()).await?;
    println!(
        "session {} ended {} | score {}:{} | winner {} | payout {}",
        last.id,
        last.phase_kind(),
        last.local_score,
        last.opponent_score,
        last.winner
            .as_ref()
            .map(|w| w.to_string())
            .unwrap_or_else(|| "none".to_string()),
        last.settle_tx
            .as_ref()
            .map(|t| t.to_string())
            .unwrap_or_else(|| "none".to_string()),
    );
    log::info!(
        "wallet calls: alice {}, bob {}",
        alice_wallet.calls().await.len(),
        bob_wallet.calls().await.len()
    );

    host.acknowledge().await?;
    guest.wait_for(|s| s.is_terminal()).await?;
    guest.acknowledge().await?;
    Ok(())
}
