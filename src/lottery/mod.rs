//! Round state machine.
//!
//! `Lottery` owns the live `Round` behind a single `RwLock`. Every mutating
//! operation holds the write guard for its full duration, including the
//! awaited ledger or oracle call, so transitions never interleave and a
//! reader never sees a half-applied one. `check_upkeep` and the accessors
//! take the read guard and see a consistent snapshot.
//!
//! Cycle: OPEN --perform_upkeep--> CALCULATING --fulfill_random_words--> OPEN.

pub mod round;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::ledger::Ledger;
use crate::oracle::RandomnessOracle;
use crate::types::{
    EntryReceipt, LotteryError, LotteryEvent, PlayerId, RandomnessRequest, RequestId, RoundState,
    UpkeepStatus,
};

pub use round::{PendingRequest, Round, RoundConfig};

/// Capacity of the observer channel; slow observers lag rather than block.
const EVENT_CAPACITY: usize = 256;

pub struct Lottery {
    config: RoundConfig,
    request: RandomnessRequest,
    round: RwLock<Round>,
    ledger: Arc<dyn Ledger>,
    oracle: Arc<dyn RandomnessOracle>,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<LotteryEvent>,
}

impl Lottery {
    /// Start a fresh OPEN round at `clock.now()`.
    pub fn new(
        config: RoundConfig,
        request: RandomnessRequest,
        ledger: Arc<dyn Ledger>,
        oracle: Arc<dyn RandomnessOracle>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let round = Round::new(clock.now());
        Self::with_round(config, request, round, ledger, oracle, clock)
    }

    /// Resume from a persisted round after checking its invariants.
    pub fn restore(
        config: RoundConfig,
        request: RandomnessRequest,
        round: Round,
        ledger: Arc<dyn Ledger>,
        oracle: Arc<dyn RandomnessOracle>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, LotteryError> {
        round.validate()?;
        info!(
            state = %round.state,
            players = round.entrants.len(),
            balance = %round.balance,
            pending = ?round.pending.as_ref().map(|p| p.request_id),
            "Round restored"
        );
        Ok(Self::with_round(config, request, round, ledger, oracle, clock))
    }

    fn with_round(
        config: RoundConfig,
        request: RandomnessRequest,
        round: Round,
        ledger: Arc<dyn Ledger>,
        oracle: Arc<dyn RandomnessOracle>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            request,
            round: RwLock::new(round),
            ledger,
            oracle,
            clock,
            events,
        }
    }

    /// Receive every event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<LotteryEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: LotteryEvent) {
        debug!(%event, "Emitting event");
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// Add `caller` to the current round for `paid`.
    ///
    /// The returned receipt reflects the round as this entry left it, before
    /// any later caller can take the lock.
    pub async fn enter_round(&self, caller: PlayerId, paid: Decimal) -> Result<EntryReceipt, LotteryError> {
        let required = self.config.entrance_fee();
        if paid < required {
            warn!(player = %caller, %paid, %required, "Entry rejected: fee too low");
            return Err(LotteryError::InsufficientFee { paid, required });
        }

        let mut round = self.round.write().await;
        if round.state != RoundState::Open {
            warn!(player = %caller, state = %round.state, "Entry rejected: round not open");
            return Err(LotteryError::RoundNotOpen { state: round.state });
        }
        let Some(balance) = round.balance.checked_add(paid) else {
            warn!(player = %caller, %paid, balance = %round.balance, "Entry rejected: balance overflow");
            return Err(LotteryError::BalanceOverflow { balance: round.balance, paid });
        };

        self.ledger.credit(&caller, paid).await?;
        round.entrants.push(caller.clone());
        round.balance = balance;

        let receipt = EntryReceipt {
            player: caller.clone(),
            position: round.entrants.len() - 1,
            players: round.entrants.len(),
            balance,
        };
        info!(
            player = %caller,
            amount = %paid,
            players = receipt.players,
            balance = %balance,
            "Entered round"
        );
        self.emit(LotteryEvent::EnteredRound { player: caller, amount: paid });
        Ok(receipt)
    }

    /// Read-only automation check.
    pub async fn check_upkeep(&self) -> UpkeepStatus {
        let round = self.round.read().await;
        let status = round.upkeep_status(self.clock.now(), self.config.interval());
        debug!(%status, "Upkeep checked");
        status
    }

    /// Close entries and request randomness. Fails with `UpkeepNotNeeded`
    /// unless every automation condition holds; the oracle is only called
    /// after the gate passes and the round changes only if it succeeds.
    pub async fn perform_upkeep(&self, caller: &str) -> Result<RequestId, LotteryError> {
        let mut round = self.round.write().await;
        let now = self.clock.now();
        let status = round.upkeep_status(now, self.config.interval());
        if !status.upkeep_needed() {
            warn!(caller, %status, "Upkeep rejected");
            return Err(LotteryError::UpkeepNotNeeded(status));
        }

        let request_id = self.oracle.request_randomness(&self.request).await?;

        round.state = RoundState::Calculating;
        round.pending = Some(PendingRequest { request_id, requested_at: now });

        info!(
            caller,
            %request_id,
            players = round.entrants.len(),
            balance = %round.balance,
            "Upkeep performed, randomness requested"
        );
        self.emit(LotteryEvent::UpkeepTriggered { request_id });
        Ok(request_id)
    }

    /// Settle the round with the oracle's words and pay the winner.
    ///
    /// The ledger transfer happens before any field of the round changes; if
    /// it fails the round stays CALCULATING with its pending request, so the
    /// same fulfillment can be retried.
    pub async fn fulfill_random_words(
        &self,
        request_id: RequestId,
        random_words: &[u64],
    ) -> Result<PlayerId, LotteryError> {
        let mut round = self.round.write().await;

        let matches_pending = round.state == RoundState::Calculating
            && round.pending.as_ref().map(|p| p.request_id) == Some(request_id);
        if !matches_pending {
            warn!(%request_id, "Fulfillment rejected: unknown request");
            return Err(LotteryError::UnknownRequest);
        }

        let word = *random_words.first().ok_or(LotteryError::MissingRandomWords)?;
        let index = Round::winner_index(word, round.entrants.len()).ok_or_else(|| {
            LotteryError::InvalidConfig("pending request has no entrants".into())
        })?;
        let winner = round.entrants[index].clone();
        let amount = round.balance;

        if let Err(reason) = self.ledger.transfer(&winner, amount).await {
            warn!(%request_id, %winner, %amount, error = %reason, "Winner payout failed");
            return Err(LotteryError::TransferFailure { winner, amount, reason });
        }

        round.pending = None;
        round.entrants.clear();
        round.balance = Decimal::ZERO;
        round.last_trigger_time = self.clock.now();
        round.state = RoundState::Open;
        round.recent_winner = Some(winner.clone());
        round.rounds_completed += 1;

        info!(
            %request_id,
            %winner,
            winner_index = index,
            %amount,
            round = round.rounds_completed,
            "Winner picked"
        );
        self.emit(LotteryEvent::WinnerPicked {
            winner: winner.clone(),
            amount,
            request_id,
        });
        Ok(winner)
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn entrance_fee(&self) -> Decimal {
        self.config.entrance_fee()
    }

    pub fn interval(&self) -> Duration {
        self.config.interval()
    }

    pub fn num_words(&self) -> u32 {
        self.request.num_words
    }

    pub fn request_confirmations(&self) -> u16 {
        self.request.request_confirmations
    }

    pub async fn state(&self) -> RoundState {
        self.round.read().await.state
    }

    pub async fn player(&self, index: usize) -> Option<PlayerId> {
        self.round.read().await.entrants.get(index).cloned()
    }

    pub async fn number_of_players(&self) -> usize {
        self.round.read().await.entrants.len()
    }

    pub async fn balance(&self) -> Decimal {
        self.round.read().await.balance
    }

    pub async fn recent_winner(&self) -> Option<PlayerId> {
        self.round.read().await.recent_winner.clone()
    }

    pub async fn last_trigger_time(&self) -> DateTime<Utc> {
        self.round.read().await.last_trigger_time
    }

    pub async fn pending_request(&self) -> Option<RequestId> {
        self.round.read().await.pending.as_ref().map(|p| p.request_id)
    }

    /// Copy of the whole round, taken under one read guard.
    pub async fn snapshot(&self) -> Round {
        self.round.read().await.clone()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
