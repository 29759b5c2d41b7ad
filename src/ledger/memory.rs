//! In-memory ledger.
//!
//! Holds the prize pool and per-player payout totals behind a single async
//! mutex. Recipients can be marked as rejecting to reproduce a payee that
//! cannot accept funds.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::Ledger;
use crate::types::{LedgerError, PlayerId, TransferReceipt};

#[derive(Debug, Default)]
struct Books {
    pool: Decimal,
    deposits: HashMap<PlayerId, Decimal>,
    payouts: HashMap<PlayerId, Decimal>,
    rejecting: HashSet<PlayerId>,
    receipts: Vec<TransferReceipt>,
}

#[derive(Debug, Default)]
pub struct InMemoryLedger {
    books: Mutex<Books>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with funds already held, e.g. when restoring a persisted round.
    pub fn with_pool(pool: Decimal) -> Self {
        Self {
            books: Mutex::new(Books { pool, ..Books::default() }),
        }
    }

    /// Make every future transfer to `player` fail.
    pub async fn reject_payments_to(&self, player: &PlayerId) {
        self.books.lock().await.rejecting.insert(player.clone());
    }

    pub async fn accept_payments_to(&self, player: &PlayerId) {
        self.books.lock().await.rejecting.remove(player);
    }

    /// Total paid out to `player` so far.
    pub async fn paid_to(&self, player: &PlayerId) -> Decimal {
        self.books
            .lock()
            .await
            .payouts
            .get(player)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    /// Total deposited by `player` so far.
    pub async fn deposited_by(&self, player: &PlayerId) -> Decimal {
        self.books
            .lock()
            .await
            .deposits
            .get(player)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    pub async fn receipts(&self) -> Vec<TransferReceipt> {
        self.books.lock().await.receipts.clone()
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn credit(&self, from: &PlayerId, amount: Decimal) -> Result<(), LedgerError> {
        if amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount(amount));
        }
        let mut books = self.books.lock().await;
        let deposited = books.deposits.get(from).copied().unwrap_or(Decimal::ZERO);
        let (Some(pool), Some(deposited)) =
            (books.pool.checked_add(amount), deposited.checked_add(amount))
        else {
            warn!(player = %from, %amount, pool = %books.pool, "Credit rejected: overflow");
            return Err(LedgerError::Overflow { held: books.pool, amount });
        };
        books.pool = pool;
        books.deposits.insert(from.clone(), deposited);
        debug!(player = %from, %amount, %pool, "Ledger credited");
        Ok(())
    }

    async fn transfer(&self, to: &PlayerId, amount: Decimal) -> Result<TransferReceipt, LedgerError> {
        if amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount(amount));
        }
        let mut books = self.books.lock().await;
        if books.rejecting.contains(to) {
            warn!(player = %to, %amount, "Recipient rejected transfer");
            return Err(LedgerError::RecipientRejected(to.clone()));
        }
        if books.pool < amount {
            return Err(LedgerError::InsufficientFunds {
                needed: amount,
                available: books.pool,
            });
        }

        books.pool -= amount;
        *books.payouts.entry(to.clone()).or_insert(Decimal::ZERO) += amount;

        let receipt = TransferReceipt {
            transfer_id: format!("tx-{}", uuid::Uuid::new_v4()),
            to: to.clone(),
            amount,
            timestamp: Utc::now(),
        };
        books.receipts.push(receipt.clone());

        info!(player = %to, %amount, pool = %books.pool, "Ledger transfer complete");
        Ok(receipt)
    }

    async fn balance(&self) -> Decimal {
        self.books.lock().await.pool
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
