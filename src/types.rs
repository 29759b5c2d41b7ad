//! Shared types for the lottery service.
//!
//! These types form the data model used across all modules.
//! They are kept free of collaborator details so the ledger, oracle,
//! keeper and dashboard modules can depend on them without cycles.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// A raffle participant (wallet address, account name, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(pub String);

impl PlayerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PlayerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Opaque correlation token returned by the randomness oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Round state
// ---------------------------------------------------------------------------

/// Lifecycle state of the raffle round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoundState {
    /// Accepting entries.
    Open,
    /// Waiting on the oracle; entries are refused.
    Calculating,
}

impl fmt::Display for RoundState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoundState::Open => write!(f, "OPEN"),
            RoundState::Calculating => write!(f, "CALCULATING"),
        }
    }
}

/// The four automation conditions, evaluated against one consistent snapshot
/// of the round. Returned by `check_upkeep` and carried by `UpkeepNotNeeded`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpkeepStatus {
    pub is_open: bool,
    pub time_passed: bool,
    pub has_balance: bool,
    pub has_players: bool,
    pub state: RoundState,
    pub balance: Decimal,
    pub num_players: usize,
}

impl UpkeepStatus {
    /// True only when every condition holds.
    pub fn upkeep_needed(&self) -> bool {
        self.is_open && self.time_passed && self.has_balance && self.has_players
    }
}

impl fmt::Display for UpkeepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "open={} time_passed={} has_balance={} has_players={} (state={}, balance={}, players={})",
            self.is_open,
            self.time_passed,
            self.has_balance,
            self.has_players,
            self.state,
            self.balance,
            self.num_players,
        )
    }
}

// ---------------------------------------------------------------------------
// Collaborator payloads
// ---------------------------------------------------------------------------

/// Parameters of a single randomness request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RandomnessRequest {
    /// Gas lane / key hash selecting the oracle's proving key.
    pub key_hash: String,
    pub subscription_id: u64,
    pub request_confirmations: u16,
    pub callback_gas_limit: u32,
    pub num_words: u32,
}

/// Delivery of random words for a previously issued request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fulfillment {
    pub request_id: RequestId,
    pub random_words: Vec<u64>,
}

/// Round totals right after an accepted entry, read under the same lock
/// that admitted it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryReceipt {
    pub player: PlayerId,
    /// Zero-based slot of this entry in the round.
    pub position: usize,
    pub players: usize,
    pub balance: Decimal,
}

/// Proof of a completed ledger payout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferReceipt {
    pub transfer_id: String,
    pub to: PlayerId,
    pub amount: Decimal,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Notifications emitted by the round state machine for observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum LotteryEvent {
    EnteredRound {
        player: PlayerId,
        amount: Decimal,
    },
    UpkeepTriggered {
        request_id: RequestId,
    },
    WinnerPicked {
        winner: PlayerId,
        amount: Decimal,
        request_id: RequestId,
    },
}

impl fmt::Display for LotteryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LotteryEvent::EnteredRound { player, amount } => {
                write!(f, "EnteredRound({player}, {amount})")
            }
            LotteryEvent::UpkeepTriggered { request_id } => {
                write!(f, "UpkeepTriggered({request_id})")
            }
            LotteryEvent::WinnerPicked { winner, amount, .. } => {
                write!(f, "WinnerPicked({winner}, {amount})")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Failures reported by a `Ledger`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LedgerError {
    #[error("Recipient {0} cannot accept funds")]
    RecipientRejected(PlayerId),

    #[error("Insufficient funds: need {needed}, have {available}")]
    InsufficientFunds { needed: Decimal, available: Decimal },

    #[error("Invalid amount: {0}")]
    InvalidAmount(Decimal),

    #[error("Crediting {amount} would overflow held funds of {held}")]
    Overflow { held: Decimal, amount: Decimal },
}

/// Failures reported by a `RandomnessOracle`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OracleError {
    #[error("Invalid subscription: {0}")]
    InvalidSubscription(u64),

    #[error("Nonexistent request: {0}")]
    NonexistentRequest(RequestId),

    #[error("Insufficient subscription balance: need {needed}, have {available}")]
    InsufficientBalance { needed: Decimal, available: Decimal },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Consumer channel closed")]
    ConsumerGone,
}

/// Errors surfaced by the round state machine.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LotteryError {
    #[error("Insufficient entrance fee: paid {paid}, required {required}")]
    InsufficientFee { paid: Decimal, required: Decimal },

    #[error("Round not open (state {state})")]
    RoundNotOpen { state: RoundState },

    #[error("Entry of {paid} would overflow the round balance of {balance}")]
    BalanceOverflow { balance: Decimal, paid: Decimal },

    #[error("Upkeep not needed: {0}")]
    UpkeepNotNeeded(UpkeepStatus),

    /// Never-issued and already-consumed ids share this variant.
    #[error("Unknown randomness request")]
    UnknownRequest,

    #[error("Fulfillment carried no random words")]
    MissingRandomWords,

    #[error("Transfer of {amount} to {winner} failed: {reason}")]
    TransferFailure {
        winner: PlayerId,
        amount: Decimal,
        reason: LedgerError,
    },

    #[error("No failed payout is waiting for a retry")]
    NoParkedPayout,

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Oracle error: {0}")]
    Oracle(#[from] OracleError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
