//! Fund custody for entry fees.
//!
//! Defines the `Ledger` trait consumed by the round state machine and an
//! in-memory implementation used by the service binary and tests.

pub mod memory;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::types::{LedgerError, PlayerId, TransferReceipt};

/// Abstraction over whatever holds the staked entry fees.
///
/// The state machine calls `credit` once per accepted entry and `transfer`
/// exactly once per successful fulfillment. A failed transfer must leave
/// the held funds untouched.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Record receipt of `amount` from `from`.
    async fn credit(&self, from: &PlayerId, amount: Decimal) -> Result<(), LedgerError>;

    /// Move `amount` out of the held funds to `to`.
    async fn transfer(&self, to: &PlayerId, amount: Decimal) -> Result<TransferReceipt, LedgerError>;

    /// Funds currently held.
    async fn balance(&self) -> Decimal;
}
