//! Multi-round simulation harness.
//!
//! Runs many rounds through the auto-fulfilling coordinator with entries,
//! keeper polls and deliveries interleaved, then checks that every unit
//! credited to the pool left it through exactly one payout.

use chrono::Duration;
use futures::future::join_all;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;

use lottery::clock::ManualClock;
use lottery::keeper::{FulfillmentListener, Keeper, ListenerReport, TickOutcome};
use lottery::ledger::memory::InMemoryLedger;
use lottery::ledger::Ledger;
use lottery::lottery::{Lottery, RoundConfig};
use lottery::oracle::fulfillment_channel;
use lottery::oracle::mock::VrfCoordinatorMock;
use lottery::types::{LotteryError, PlayerId, RandomnessRequest, RoundState};

const FEE: Decimal = dec!(0.5);
const INTERVAL_SECS: i64 = 30;

struct Sim {
    lottery: Arc<Lottery>,
    ledger: Arc<InMemoryLedger>,
    clock: Arc<ManualClock>,
    coordinator: Arc<VrfCoordinatorMock>,
    subscription_id: u64,
    stop: watch::Sender<bool>,
    listener: tokio::task::JoinHandle<ListenerReport>,
}

async fn start() -> Sim {
    let (tx, rx) = fulfillment_channel();
    let coordinator = Arc::new(
        VrfCoordinatorMock::with_default_fees(tx).auto_fulfill_after(std::time::Duration::from_millis(1)),
    );
    let subscription_id = coordinator.create_subscription().await;
    coordinator.fund_subscription(subscription_id, dec!(20)).await.unwrap();

    let ledger = Arc::new(InMemoryLedger::new());
    let clock = Arc::new(ManualClock::at_epoch());
    let lottery = Arc::new(Lottery::new(
        RoundConfig::new(FEE, Duration::seconds(INTERVAL_SECS)).unwrap(),
        RandomnessRequest {
            key_hash: "0xsim".into(),
            subscription_id,
            request_confirmations: 3,
            callback_gas_limit: 500_000,
            num_words: 1,
        },
        ledger.clone(),
        coordinator.clone(),
        clock.clone(),
    ));

    let (stop, stop_rx) = watch::channel(false);
    let listener = tokio::spawn(FulfillmentListener::new(lottery.clone(), rx).run(stop_rx));

    Sim { lottery, ledger, clock, coordinator, subscription_id, stop, listener }
}

async fn wait_for_open(lottery: &Lottery) {
    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while lottery.state().await != RoundState::Open {
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("round did not settle");
}

fn players(round: usize, count: usize) -> Vec<PlayerId> {
    (0..count).map(|i| PlayerId::new(format!("r{round}-p{i}"))).collect()
}

#[tokio::test]
async fn test_twelve_rounds_conserve_funds() {
    let sim = start().await;
    let keeper = Keeper::new(sim.lottery.clone(), "sim-keeper", std::time::Duration::from_secs(1));

    let mut total_in = Decimal::ZERO;
    let mut round_entrants: Vec<HashSet<PlayerId>> = Vec::new();

    for round in 0..12 {
        let entrants = players(round, 1 + round % 5);
        let results = join_all(
            entrants
                .iter()
                .map(|p| sim.lottery.enter_round(p.clone(), FEE)),
        )
        .await;
        assert!(results.iter().all(|r| r.is_ok()), "round {round}: {results:?}");
        total_in += FEE * Decimal::from(entrants.len());

        // Gate stays closed until the interval elapses.
        sim.clock.advance(Duration::seconds(INTERVAL_SECS - 1));
        assert!(matches!(keeper.tick().await.unwrap(), TickOutcome::Idle(_)));

        sim.clock.advance(Duration::seconds(1));
        assert!(matches!(keeper.tick().await.unwrap(), TickOutcome::Triggered(_)));
        wait_for_open(&sim.lottery).await;

        round_entrants.push(entrants.into_iter().collect());
    }

    sim.stop.send(true).unwrap();
    let report = sim.listener.await.unwrap();
    assert_eq!(report.settled, 12);
    assert_eq!(report.rejected, 0);

    let receipts = sim.ledger.receipts().await;
    assert_eq!(receipts.len(), 12);
    for (receipt, entrants) in receipts.iter().zip(&round_entrants) {
        assert!(entrants.contains(&receipt.to), "{} was not in its round", receipt.to);
    }
    let total_out: Decimal = receipts.iter().map(|r| r.amount).sum();
    assert_eq!(total_out, total_in);
    assert_eq!(sim.ledger.balance().await, Decimal::ZERO);

    let round = sim.lottery.snapshot().await;
    assert_eq!(round.rounds_completed, 12);
    assert!(round.entrants.is_empty());
    assert!(round.pending.is_none());

    // 12 fulfillments at 0.25 + 1e-9 * 500_000 LINK each.
    assert_eq!(
        sim.coordinator.subscription_balance(sim.subscription_id).await.unwrap(),
        dec!(20) - dec!(0.2505) * dec!(12)
    );
    assert!(sim.coordinator.pending_requests().await.is_empty());
}

#[tokio::test]
async fn test_concurrent_entries_all_counted() {
    let sim = start().await;
    let entrants = players(0, 50);

    let results = join_all(entrants.iter().map(|p| sim.lottery.enter_round(p.clone(), FEE))).await;

    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(sim.lottery.number_of_players().await, 50);
    assert_eq!(sim.lottery.balance().await, FEE * dec!(50));
    assert_eq!(sim.ledger.balance().await, FEE * dec!(50));
    let status = sim.lottery.check_upkeep().await;
    assert_eq!(status.num_players, 50);
    assert_eq!(status.balance, FEE * dec!(50));
}

#[tokio::test]
async fn test_racing_keepers_trigger_once() {
    let sim = start().await;
    sim.lottery.enter_round(PlayerId::new("solo"), FEE).await.unwrap();
    sim.clock.advance(Duration::seconds(INTERVAL_SECS));

    let keepers: Vec<Keeper> = (0..5)
        .map(|i| Keeper::new(sim.lottery.clone(), format!("keeper-{i}"), std::time::Duration::from_secs(1)))
        .collect();
    let outcomes = join_all(keepers.iter().map(|k| k.tick())).await;

    let triggered = outcomes
        .iter()
        .filter(|o| matches!(o, Ok(TickOutcome::Triggered(_))))
        .count();
    assert_eq!(triggered, 1, "{outcomes:?}");
    assert!(outcomes.iter().all(|o| o.is_ok()));

    wait_for_open(&sim.lottery).await;
    assert_eq!(sim.ledger.paid_to(&PlayerId::new("solo")).await, FEE);
}

#[tokio::test]
async fn test_entries_during_calculation_are_refused() {
    let (tx, _rx) = fulfillment_channel();
    let coordinator = Arc::new(VrfCoordinatorMock::with_default_fees(tx));
    let sub = coordinator.create_subscription().await;
    let ledger = Arc::new(InMemoryLedger::new());
    let clock = Arc::new(ManualClock::at_epoch());
    let lottery = Arc::new(Lottery::new(
        RoundConfig::new(FEE, Duration::seconds(INTERVAL_SECS)).unwrap(),
        RandomnessRequest {
            key_hash: "0xsim".into(),
            subscription_id: sub,
            request_confirmations: 3,
            callback_gas_limit: 500_000,
            num_words: 1,
        },
        ledger.clone(),
        coordinator.clone(),
        clock.clone(),
    ));

    lottery.enter_round(PlayerId::new("first"), FEE).await.unwrap();
    clock.advance(Duration::seconds(INTERVAL_SECS));
    let request_id = lottery.perform_upkeep("sim-keeper").await.unwrap();

    let late = players(1, 10);
    let results = join_all(late.iter().map(|p| lottery.enter_round(p.clone(), FEE))).await;
    assert!(results
        .iter()
        .all(|r| matches!(r, Err(LotteryError::RoundNotOpen { state: RoundState::Calculating }))));
    assert_eq!(ledger.balance().await, FEE);

    // Duplicate deliveries race; only one settles.
    let settled = join_all([
        lottery.fulfill_random_words(request_id, &[1]),
        lottery.fulfill_random_words(request_id, &[2]),
    ])
    .await;
    assert_eq!(settled.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(settled.iter().any(|r| r == &Err(LotteryError::UnknownRequest)));
    assert_eq!(ledger.receipts().await.len(), 1);
    assert_eq!(lottery.state().await, RoundState::Open);
}
