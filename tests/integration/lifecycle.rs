//! Round lifecycle scenarios driven through the keeper, the local VRF
//! coordinator and the fulfillment listener.

use chrono::Duration;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use lottery::clock::ManualClock;
use lottery::dashboard::{build_router, routes::DashboardState};
use lottery::keeper::{FulfillmentListener, Keeper, TickOutcome};
use lottery::lottery::{Lottery, RoundConfig};
use lottery::oracle::fulfillment_channel;
use lottery::oracle::mock::VrfCoordinatorMock;
use lottery::types::{
    Fulfillment, LedgerError, LotteryError, LotteryEvent, PlayerId, RandomnessRequest, RequestId,
    RoundState,
};

use crate::mock_ledger::MockLedger;

struct World {
    lottery: Arc<Lottery>,
    ledger: MockLedger,
    clock: Arc<ManualClock>,
    coordinator: Arc<VrfCoordinatorMock>,
    keeper: Keeper,
    listener: FulfillmentListener,
}

async fn world(fee: Decimal, interval_secs: i64) -> World {
    let (tx, rx) = fulfillment_channel();
    let coordinator = Arc::new(VrfCoordinatorMock::with_default_fees(tx));
    let sub = coordinator.create_subscription().await;
    coordinator.fund_subscription(sub, dec!(5)).await.unwrap();

    let ledger = MockLedger::new();
    let clock = Arc::new(ManualClock::at_epoch());
    let lottery = Arc::new(Lottery::new(
        RoundConfig::new(fee, Duration::seconds(interval_secs)).unwrap(),
        RandomnessRequest {
            key_hash: "0xlane".into(),
            subscription_id: sub,
            request_confirmations: 3,
            callback_gas_limit: 500_000,
            num_words: 1,
        },
        Arc::new(ledger.clone()),
        coordinator.clone(),
        clock.clone(),
    ));
    let keeper = Keeper::new(lottery.clone(), "keeper-it", std::time::Duration::from_secs(1));
    let listener = FulfillmentListener::new(lottery.clone(), rx);

    World { lottery, ledger, clock, coordinator, keeper, listener }
}

fn p(name: &str) -> PlayerId {
    PlayerId::new(name)
}

/// fee=1, interval=100s: enter at t=0, check at t=50 and t=101, settle
/// with word 7.
#[tokio::test]
async fn test_single_player_round() {
    let w = world(dec!(1), 100).await;

    w.lottery.enter_round(p("A"), dec!(1)).await.unwrap();
    assert_eq!(w.lottery.number_of_players().await, 1);
    assert_eq!(w.lottery.balance().await, dec!(1));

    w.clock.advance(Duration::seconds(50));
    assert!(!w.lottery.check_upkeep().await.upkeep_needed());
    assert!(matches!(w.keeper.tick().await.unwrap(), TickOutcome::Idle(_)));

    w.clock.advance(Duration::seconds(51));
    assert!(w.lottery.check_upkeep().await.upkeep_needed());
    let request_id = match w.keeper.tick().await.unwrap() {
        TickOutcome::Triggered(id) => id,
        other => panic!("expected trigger, got {other:?}"),
    };
    assert_eq!(w.lottery.state().await, RoundState::Calculating);

    let winner = w
        .listener
        .handle(&Fulfillment { request_id, random_words: vec![7] })
        .await
        .unwrap();
    assert_eq!(winner, p("A"));

    let transfers = w.ledger.transfers();
    assert_eq!(transfers.len(), 1);
    assert_eq!(transfers[0].to, p("A"));
    assert_eq!(transfers[0].amount, dec!(1));

    let round = w.lottery.snapshot().await;
    assert!(round.entrants.is_empty());
    assert_eq!(round.balance, Decimal::ZERO);
    assert_eq!(round.state, RoundState::Open);
    assert_eq!(round.last_trigger_time.timestamp(), 101);
    assert_eq!(w.lottery.recent_winner().await, Some(p("A")));
}

/// Two players, word 3 picks index 1.
#[tokio::test]
async fn test_two_players_word_three_picks_second() {
    let w = world(dec!(1), 100).await;
    w.lottery.enter_round(p("A"), dec!(1)).await.unwrap();
    w.lottery.enter_round(p("B"), dec!(1)).await.unwrap();
    w.clock.advance(Duration::seconds(100));

    let request_id = w.lottery.perform_upkeep("keeper-it").await.unwrap();
    let winner = w.lottery.fulfill_random_words(request_id, &[3]).await.unwrap();

    assert_eq!(winner, p("B"));
    assert_eq!(w.ledger.transfers()[0].amount, dec!(2));
}

/// A bogus id while R1 is pending changes nothing.
#[tokio::test]
async fn test_bogus_fulfillment_is_rejected() {
    let w = world(dec!(1), 100).await;
    w.lottery.enter_round(p("A"), dec!(1)).await.unwrap();
    w.clock.advance(Duration::seconds(101));
    let r1 = w.lottery.perform_upkeep("keeper-it").await.unwrap();
    let before = w.lottery.snapshot().await;

    let err = w
        .listener
        .handle(&Fulfillment { request_id: RequestId(r1.0 + 41), random_words: vec![5] })
        .await
        .unwrap_err();

    assert_eq!(err, LotteryError::UnknownRequest);
    assert_eq!(w.lottery.snapshot().await, before);
    assert_eq!(w.lottery.state().await, RoundState::Calculating);
    assert!(w.ledger.transfers().is_empty());
}

/// Words delivered by the coordinator settle the round through the listener.
#[tokio::test]
async fn test_coordinator_delivery_settles_round() {
    let w = world(dec!(1), 10).await;
    let mut events = w.lottery.subscribe();
    for name in ["A", "B", "C"] {
        w.lottery.enter_round(p(name), dec!(1)).await.unwrap();
    }
    w.clock.advance(Duration::seconds(10));
    let request_id = w.lottery.perform_upkeep("keeper-it").await.unwrap();

    let payment = w.coordinator.fulfill_random_words(request_id, vec![5]).await.unwrap();
    assert_eq!(payment, dec!(0.2505));

    let report_handle = {
        let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
        let World { listener, .. } = w;
        let handle = tokio::spawn(listener.run(stop_rx));

        // EnteredRound x3, UpkeepTriggered, then WinnerPicked.
        let mut winner = None;
        while winner.is_none() {
            if let LotteryEvent::WinnerPicked { winner: picked, amount, .. } = events.recv().await.unwrap() {
                assert_eq!(amount, dec!(3));
                winner = Some(picked);
            }
        }
        assert_eq!(winner, Some(p("C")));
        stop_tx.send(true).unwrap();
        handle
    };
    let report = report_handle.await.unwrap();
    assert_eq!(report.settled, 1);
}

/// A payout the recipient refuses leaves the round retryable.
#[tokio::test]
async fn test_failed_payout_then_retry() {
    let w = world(dec!(1), 100).await;
    w.lottery.enter_round(p("A"), dec!(1)).await.unwrap();
    w.clock.advance(Duration::seconds(100));
    let request_id = w.lottery.perform_upkeep("keeper-it").await.unwrap();

    w.ledger.set_error(LedgerError::RecipientRejected(p("A")));
    let delivery = Fulfillment { request_id, random_words: vec![0] };
    let err = w.listener.handle(&delivery).await.unwrap_err();
    assert!(matches!(err, LotteryError::TransferFailure { .. }));
    assert_eq!(w.lottery.state().await, RoundState::Calculating);
    assert_eq!(w.lottery.pending_request().await, Some(request_id));
    assert_eq!(w.ledger.pool(), dec!(1));

    assert_eq!(w.listener.parked().request_ids().await, vec![request_id]);

    w.ledger.clear_error();
    assert_eq!(w.listener.handle(&delivery).await.unwrap(), p("A"));
    assert!(w.listener.parked().request_ids().await.is_empty());
    assert_eq!(w.lottery.state().await, RoundState::Open);

    // The same delivery a third time is stale.
    assert_eq!(w.listener.handle(&delivery).await.unwrap_err(), LotteryError::UnknownRequest);
}

/// A refused payout delivered by the coordinator is settled later through
/// the dashboard retry route.
#[tokio::test]
async fn test_parked_payout_retried_over_http() {
    let w = world(dec!(1), 10).await;
    w.lottery.enter_round(p("A"), dec!(1)).await.unwrap();
    w.lottery.enter_round(p("B"), dec!(1)).await.unwrap();
    w.clock.advance(Duration::seconds(10));
    let request_id = w.lottery.perform_upkeep("keeper-it").await.unwrap();

    w.ledger.set_error(LedgerError::RecipientRejected(p("B")));
    w.coordinator.fulfill_random_words(request_id, vec![1]).await.unwrap();

    let World { lottery, ledger, listener, .. } = w;
    let payouts = listener.parked();
    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let listener = tokio::spawn(listener.run(stop_rx));

    tokio::time::timeout(std::time::Duration::from_secs(2), async {
        while payouts.request_ids().await.is_empty() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(lottery.state().await, RoundState::Calculating);

    ledger.clear_error();
    let app = build_router(Arc::new(DashboardState::new("it", lottery.clone(), payouts.clone())));
    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/payout/retry")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["winner"], "B");
    assert_eq!(json["request_id"], request_id.0);

    assert_eq!(lottery.state().await, RoundState::Open);
    assert_eq!(ledger.transfers()[0].amount, dec!(2));
    assert!(payouts.request_ids().await.is_empty());

    stop_tx.send(true).unwrap();
    let report = listener.await.unwrap();
    assert_eq!(report.parked, 1);
}

/// An entry that would overflow the pot is refused and changes nothing.
#[tokio::test]
async fn test_overflowing_entry_is_refused() {
    let w = world(dec!(1), 100).await;
    w.lottery.enter_round(p("whale"), Decimal::MAX).await.unwrap();
    let before = w.lottery.snapshot().await;

    let err = w.lottery.enter_round(p("A"), dec!(1)).await.unwrap_err();

    assert!(matches!(err, LotteryError::BalanceOverflow { .. }));
    assert_eq!(w.lottery.snapshot().await, before);
    assert_eq!(w.ledger.pool(), Decimal::MAX);
    assert_eq!(w.ledger.credits().len(), 1);
}

/// The cycle repeats with a fresh request id each round.
#[tokio::test]
async fn test_consecutive_rounds() {
    let w = world(dec!(1), 60).await;
    let mut ids = Vec::new();

    for round in 0..3u64 {
        w.lottery.enter_round(p("A"), dec!(1)).await.unwrap();
        w.lottery.enter_round(p("B"), dec!(2)).await.unwrap();
        w.clock.advance(Duration::seconds(60));

        let request_id = match w.keeper.tick().await.unwrap() {
            TickOutcome::Triggered(id) => id,
            other => panic!("round {round}: expected trigger, got {other:?}"),
        };
        w.lottery.fulfill_random_words(request_id, &[round]).await.unwrap();
        ids.push(request_id);
    }

    assert_eq!(ids, vec![RequestId(1), RequestId(2), RequestId(3)]);
    assert_eq!(w.lottery.snapshot().await.rounds_completed, 3);
    // Winners alternate A, B, A for words 0, 1, 2.
    let winners: Vec<PlayerId> = w.ledger.transfers().into_iter().map(|r| r.to).collect();
    assert_eq!(winners, vec![p("A"), p("B"), p("A")]);
    assert_eq!(w.ledger.pool(), Decimal::ZERO);
    assert_eq!(w.ledger.credits().len(), 6);
}
