//! Automation loops around the state machine.
//!
//! `Keeper` is the periodic caller: it polls `check_upkeep` and triggers
//! `perform_upkeep` when the gate opens. `FulfillmentListener` drains the
//! oracle's fulfillment channel and settles rounds. Neither retries a failed
//! call on its own. A delivery whose payout failed is parked in
//! `ParkedPayouts` until a caller asks for it to be applied again.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::lottery::Lottery;
use crate::oracle::FulfillmentReceiver;
use crate::types::{Fulfillment, LotteryError, PlayerId, RequestId, UpkeepStatus};

// ---------------------------------------------------------------------------
// Keeper
// ---------------------------------------------------------------------------

/// Result of one keeper poll.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Gate closed; nothing done.
    Idle(UpkeepStatus),
    /// Randomness requested.
    Triggered(RequestId),
}

pub struct Keeper {
    lottery: Arc<Lottery>,
    name: String,
    poll_interval: Duration,
}

impl Keeper {
    pub fn new(lottery: Arc<Lottery>, name: impl Into<String>, poll_interval: Duration) -> Self {
        Self {
            lottery,
            name: name.into(),
            poll_interval,
        }
    }

    /// Probe the gate once and trigger upkeep if it is open.
    ///
    /// Losing a race to another caller between the check and the trigger
    /// shows up as `UpkeepNotNeeded` and is reported as idle.
    pub async fn tick(&self) -> Result<TickOutcome, LotteryError> {
        let status = self.lottery.check_upkeep().await;
        if !status.upkeep_needed() {
            debug!(keeper = %self.name, %status, "Upkeep not needed");
            return Ok(TickOutcome::Idle(status));
        }

        match self.lottery.perform_upkeep(&self.name).await {
            Ok(request_id) => Ok(TickOutcome::Triggered(request_id)),
            Err(LotteryError::UpkeepNotNeeded(status)) => Ok(TickOutcome::Idle(status)),
            Err(e) => Err(e),
        }
    }

    /// Poll until `shutdown` flips to true or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            keeper = %self.name,
            poll_secs = self.poll_interval.as_secs_f64(),
            "Keeper started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick().await {
                        Ok(TickOutcome::Triggered(request_id)) => {
                            info!(keeper = %self.name, %request_id, "Keeper triggered upkeep");
                        }
                        Ok(TickOutcome::Idle(_)) => {}
                        Err(e) => {
                            error!(keeper = %self.name, error = %e, "Keeper tick failed, continuing");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(keeper = %self.name, "Keeper stopping");
                        break;
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Parked payouts
// ---------------------------------------------------------------------------

/// Outcome of a successful payout retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetriedPayout {
    pub request_id: RequestId,
    pub winner: PlayerId,
}

/// Deliveries whose winner payout failed, keyed by request id.
///
/// The oracle forgets a request once it has delivered, so these are the only
/// copies of the words that can still settle the round.
#[derive(Debug, Clone, Default)]
pub struct ParkedPayouts {
    inner: Arc<Mutex<HashMap<RequestId, Fulfillment>>>,
}

impl ParkedPayouts {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn park(&self, fulfillment: Fulfillment) {
        let request_id = fulfillment.request_id;
        self.inner.lock().await.insert(request_id, fulfillment);
        info!(%request_id, "Payout parked for retry");
    }

    pub async fn release(&self, request_id: RequestId) {
        self.inner.lock().await.remove(&request_id);
    }

    /// Parked request ids, ascending.
    pub async fn request_ids(&self) -> Vec<RequestId> {
        let mut ids: Vec<RequestId> = self.inner.lock().await.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Apply the parked delivery for the lottery's pending request again.
    ///
    /// Entries for any other request are stale and dropped. A retry that
    /// fails on the payout again is parked again.
    pub async fn retry(&self, lottery: &Lottery) -> Result<RetriedPayout, LotteryError> {
        let pending = lottery.pending_request().await;
        let fulfillment = {
            let mut parked = self.inner.lock().await;
            parked.retain(|id, _| Some(*id) == pending);
            pending.and_then(|id| parked.remove(&id))
        };
        let Some(fulfillment) = fulfillment else {
            return Err(LotteryError::NoParkedPayout);
        };

        let request_id = fulfillment.request_id;
        match lottery
            .fulfill_random_words(request_id, &fulfillment.random_words)
            .await
        {
            Ok(winner) => {
                info!(%request_id, %winner, "Parked payout settled");
                Ok(RetriedPayout { request_id, winner })
            }
            Err(e @ LotteryError::TransferFailure { .. }) => {
                warn!(%request_id, error = %e, "Payout retry failed");
                self.park(fulfillment).await;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Fulfillment listener
// ---------------------------------------------------------------------------

/// Counts of deliveries handled by a listener run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerReport {
    pub settled: u64,
    pub rejected: u64,
    /// Rejected deliveries kept for a payout retry.
    pub parked: u64,
}

pub struct FulfillmentListener {
    lottery: Arc<Lottery>,
    fulfillments: FulfillmentReceiver,
    parked: ParkedPayouts,
}

impl FulfillmentListener {
    pub fn new(lottery: Arc<Lottery>, fulfillments: FulfillmentReceiver) -> Self {
        Self {
            lottery,
            fulfillments,
            parked: ParkedPayouts::new(),
        }
    }

    /// Handle to the deliveries this listener parks.
    pub fn parked(&self) -> ParkedPayouts {
        self.parked.clone()
    }

    /// Apply one delivery to the lottery, parking it if the payout fails.
    pub async fn handle(&self, fulfillment: &Fulfillment) -> Result<PlayerId, LotteryError> {
        let result = self
            .lottery
            .fulfill_random_words(fulfillment.request_id, &fulfillment.random_words)
            .await;
        match &result {
            Ok(_) => self.parked.release(fulfillment.request_id).await,
            Err(LotteryError::TransferFailure { .. }) => self.parked.park(fulfillment.clone()).await,
            Err(_) => {}
        }
        result
    }

    /// Drain deliveries until the oracle side closes or `shutdown` fires.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> ListenerReport {
        let mut report = ListenerReport::default();
        loop {
            tokio::select! {
                delivery = self.fulfillments.recv() => {
                    let Some(fulfillment) = delivery else {
                        info!("Fulfillment channel closed");
                        break;
                    };
                    match self.handle(&fulfillment).await {
                        Ok(winner) => {
                            report.settled += 1;
                            info!(request_id = %fulfillment.request_id, %winner, "Round settled");
                        }
                        Err(e) => {
                            report.rejected += 1;
                            if matches!(e, LotteryError::TransferFailure { .. }) {
                                report.parked += 1;
                            }
                            warn!(request_id = %fulfillment.request_id, error = %e, "Fulfillment not applied");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Fulfillment listener stopping");
                        break;
                    }
                }
            }
        }
        report
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
