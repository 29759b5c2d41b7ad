//! LOTTERY: timed raffle rounds settled by verifiable randomness
//!
//! Entry point. Loads configuration, initialises structured logging,
//! restores the round from disk (or opens a fresh one), wires the local
//! VRF coordinator, and runs the keeper and fulfillment loops until Ctrl+C.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};

use lottery::clock::SystemClock;
use lottery::config;
use lottery::dashboard::{self, routes::DashboardState};
use lottery::keeper::{FulfillmentListener, Keeper};
use lottery::ledger::memory::InMemoryLedger;
use lottery::lottery::Lottery;
use lottery::oracle::fulfillment_channel;
use lottery::oracle::mock::VrfCoordinatorMock;
use lottery::storage::RoundStore;
use lottery::types::LotteryEvent;

const BANNER: &str = r#"
 _     ___ _____ _____ _____ ______   __
| |   / _ \_   _|_   _| ____|  _ \ \ / /
| |  | | | || |   | | |  _| | |_) \ V /
| |__| |_| || |   | | | |___|  _ < | |
|_____\___/ |_|   |_| |_____|_| \_\|_|

  Automated raffle rounds with verifiable randomness
  v0.1.0
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let config_path = std::env::var("LOTTERY_CONFIG").unwrap_or_else(|_| "config.toml".into());
    let cfg = config::AppConfig::load(&config_path)?;

    init_logging();

    println!("{BANNER}");
    info!(
        name = %cfg.lottery.name,
        entrance_fee = %cfg.lottery.entrance_fee,
        interval_secs = cfg.lottery.interval_secs,
        "LOTTERY starting up"
    );

    // -- Oracle ----------------------------------------------------------

    let (fulfill_tx, fulfill_rx) = fulfillment_channel();
    let mut coordinator = VrfCoordinatorMock::new(cfg.oracle.base_fee, cfg.oracle.gas_price_link, fulfill_tx);
    if let Some(ms) = cfg.oracle.auto_fulfill_delay_ms {
        coordinator = coordinator.auto_fulfill_after(Duration::from_millis(ms));
    }
    let coordinator = Arc::new(coordinator);

    let subscription_id = match cfg.oracle.subscription_id {
        Some(id) => {
            coordinator.register_subscription(id).await;
            id
        }
        None => coordinator.create_subscription().await,
    };
    if !cfg.oracle.subscription_fund.is_zero() {
        coordinator
            .fund_subscription(subscription_id, cfg.oracle.subscription_fund)
            .await?;
    }

    // -- Round -------------------------------------------------------------

    let round_config = cfg.round_config()?;
    let request = cfg.randomness_request(subscription_id)?;
    let store = RoundStore::new(&cfg.storage.state_file);

    let lottery = match store.load()? {
        Some(round) => {
            if let Some(pending) = &round.pending {
                warn!(
                    request_id = %pending.request_id,
                    "Restored round awaits a request issued before restart; it settles only if the oracle delivers it"
                );
            }
            let ledger = Arc::new(InMemoryLedger::with_pool(round.balance));
            Lottery::restore(round_config, request, round, ledger, coordinator.clone(), Arc::new(SystemClock))
                .context("Saved round is inconsistent")?
        }
        None => {
            let ledger = Arc::new(InMemoryLedger::new());
            info!("Fresh round opened");
            Lottery::new(round_config, request, ledger, coordinator.clone(), Arc::new(SystemClock))
        }
    };
    let lottery = Arc::new(lottery);

    // -- Background tasks ------------------------------------------------

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listener = FulfillmentListener::new(lottery.clone(), fulfill_rx);
    let payouts = listener.parked();

    if cfg.dashboard.enabled {
        let state = Arc::new(DashboardState::new(cfg.lottery.name.clone(), lottery.clone(), payouts));
        dashboard::spawn_recorder(state.clone(), lottery.subscribe());
        let server = dashboard::spawn_dashboard(state, cfg.dashboard.port);
        tokio::spawn(async move {
            match server.await {
                Ok(Err(e)) => error!(error = %e, "Dashboard stopped"),
                Err(e) => error!(error = %e, "Dashboard task panicked"),
                Ok(Ok(())) => {}
            }
        });
    }

    let persister = spawn_persister(lottery.clone(), lottery.subscribe(), store.clone());

    let listener = tokio::spawn(listener.run(shutdown_rx.clone()));
    let keeper = tokio::spawn(
        Keeper::new(
            lottery.clone(),
            cfg.keeper.name.clone(),
            Duration::from_secs(cfg.keeper.poll_interval_secs),
        )
        .run(shutdown_rx),
    );

    info!(
        poll_secs = cfg.keeper.poll_interval_secs,
        subscription_id,
        "Entering main loop. Press Ctrl+C to stop."
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received.");

    let _ = shutdown_tx.send(true);
    if let Err(e) = keeper.await {
        error!(error = %e, "Keeper task panicked");
    }
    match listener.await {
        Ok(report) => info!(
            settled = report.settled,
            rejected = report.rejected,
            parked = report.parked,
            "Listener finished"
        ),
        Err(e) => error!(error = %e, "Listener task panicked"),
    }
    persister.abort();

    let round = lottery.snapshot().await;
    store.save(&round)?;
    info!(
        state = %round.state,
        players = round.entrants.len(),
        balance = %round.balance,
        rounds_completed = round.rounds_completed,
        "LOTTERY shut down cleanly."
    );

    Ok(())
}

/// Save the round after every transition.
fn spawn_persister(
    lottery: Arc<Lottery>,
    mut events: broadcast::Receiver<LotteryEvent>,
    store: RoundStore,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                    let round = lottery.snapshot().await;
                    if let Err(e) = store.save(&round) {
                        error!(error = %e, "Failed to save round");
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("lottery=info"));

    let json_logging = std::env::var("LOTTERY_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt().with_env_filter(env_filter).with_target(true).init();
    }
}
