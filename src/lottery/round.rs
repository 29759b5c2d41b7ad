//! Round data and the pure upkeep predicate.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::{LotteryError, PlayerId, RequestId, RoundState, UpkeepStatus};

/// Immutable per-lottery settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundConfig {
    entrance_fee: Decimal,
    interval: Duration,
}

impl RoundConfig {
    /// Both values must be strictly positive.
    pub fn new(entrance_fee: Decimal, interval: Duration) -> Result<Self, LotteryError> {
        if entrance_fee <= Decimal::ZERO {
            return Err(LotteryError::InvalidConfig(format!(
                "entrance fee must be positive, got {entrance_fee}"
            )));
        }
        if interval <= Duration::zero() {
            return Err(LotteryError::InvalidConfig(format!(
                "interval must be positive, got {}s",
                interval.num_seconds()
            )));
        }
        Ok(Self { entrance_fee, interval })
    }

    pub fn entrance_fee(&self) -> Decimal {
        self.entrance_fee
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

/// The single outstanding randomness request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRequest {
    pub request_id: RequestId,
    pub requested_at: DateTime<Utc>,
}

/// Live round. Persisted as-is by the storage layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Round {
    pub state: RoundState,
    pub entrants: Vec<PlayerId>,
    pub balance: Decimal,
    pub last_trigger_time: DateTime<Utc>,
    pub pending: Option<PendingRequest>,
    pub recent_winner: Option<PlayerId>,
    pub rounds_completed: u64,
}

impl Round {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            state: RoundState::Open,
            entrants: Vec::new(),
            balance: Decimal::ZERO,
            last_trigger_time: started_at,
            pending: None,
            recent_winner: None,
            rounds_completed: 0,
        }
    }

    /// Evaluate the automation gate at `now`. No side effects.
    pub fn upkeep_status(&self, now: DateTime<Utc>, interval: Duration) -> UpkeepStatus {
        UpkeepStatus {
            is_open: self.state == RoundState::Open,
            time_passed: now - self.last_trigger_time >= interval,
            has_balance: self.balance > Decimal::ZERO,
            has_players: !self.entrants.is_empty(),
            state: self.state,
            balance: self.balance,
            num_players: self.entrants.len(),
        }
    }

    /// `random_word mod players`, or `None` for an empty round.
    pub fn winner_index(random_word: u64, players: usize) -> Option<usize> {
        if players == 0 {
            return None;
        }
        Some((random_word % players as u64) as usize)
    }

    /// Check the structural invariants of a round loaded from storage.
    pub fn validate(&self) -> Result<(), LotteryError> {
        if self.balance < Decimal::ZERO {
            return Err(LotteryError::InvalidConfig("negative round balance".into()));
        }
        match (self.state, &self.pending) {
            (RoundState::Open, Some(p)) => Err(LotteryError::InvalidConfig(format!(
                "open round carries pending request {}",
                p.request_id
            ))),
            (RoundState::Calculating, None) => Err(LotteryError::InvalidConfig(
                "calculating round has no pending request".into(),
            )),
            (RoundState::Calculating, Some(_)) if self.entrants.is_empty() => Err(
                LotteryError::InvalidConfig("calculating round has no entrants".into()),
            ),
            _ => Ok(()),
        }
    }
}
