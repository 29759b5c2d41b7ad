//! Local VRF coordinator.
//!
//! Stands in for the on-chain coordinator on development networks: manages
//! funded subscriptions, hands out sequential request ids, and charges each
//! fulfillment `base_fee + gas_price_link * callback_gas_limit` before
//! delivering the words to the consumer channel. Fulfillment is manual unless
//! an auto-fulfill delay is configured.

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{FulfillmentSender, RandomnessOracle};
use crate::types::{Fulfillment, OracleError, RandomnessRequest, RequestId};

/// Flat LINK premium per request on the reference network.
pub const DEFAULT_BASE_FEE: Decimal = dec!(0.25);
/// LINK per unit of gas (1e9 juels).
pub const DEFAULT_GAS_PRICE_LINK: Decimal = dec!(0.000000001);

const MAX_REQUEST_CONFIRMATIONS: u16 = 200;
const MAX_NUM_WORDS: u32 = 500;

#[derive(Debug, Clone)]
struct PendingOracleRequest {
    subscription_id: u64,
    callback_gas_limit: u32,
    num_words: u32,
}

#[derive(Debug, Default)]
struct CoordinatorState {
    next_request_id: u64,
    next_subscription_id: u64,
    subscriptions: HashMap<u64, Decimal>,
    pending: HashMap<RequestId, PendingOracleRequest>,
}

struct Shared {
    base_fee: Decimal,
    gas_price_link: Decimal,
    consumer: FulfillmentSender,
    state: Mutex<CoordinatorState>,
}

impl Shared {
    async fn fulfill(&self, request_id: RequestId, words: Vec<u64>) -> Result<Decimal, OracleError> {
        let mut state = self.state.lock().await;
        let pending = state
            .pending
            .get(&request_id)
            .cloned()
            .ok_or(OracleError::NonexistentRequest(request_id))?;

        let words = if words.is_empty() {
            derive_words(request_id, pending.num_words)
        } else if words.len() != pending.num_words as usize {
            return Err(OracleError::InvalidRequest(format!(
                "expected {} random words, got {}",
                pending.num_words,
                words.len()
            )));
        } else {
            words
        };

        let payment = self.base_fee + self.gas_price_link * Decimal::from(pending.callback_gas_limit);
        let available = state
            .subscriptions
            .get(&pending.subscription_id)
            .copied()
            .ok_or(OracleError::InvalidSubscription(pending.subscription_id))?;
        if available < payment {
            return Err(OracleError::InsufficientBalance { needed: payment, available });
        }

        state.subscriptions.insert(pending.subscription_id, available - payment);
        state.pending.remove(&request_id);
        drop(state);

        info!(%request_id, %payment, words = words.len(), "Fulfilling randomness request");
        self.consumer
            .send(Fulfillment { request_id, random_words: words })
            .map_err(|_| OracleError::ConsumerGone)?;

        Ok(payment)
    }
}

/// In-process coordinator implementing `RandomnessOracle`.
pub struct VrfCoordinatorMock {
    shared: Arc<Shared>,
    auto_fulfill: Option<Duration>,
}

impl VrfCoordinatorMock {
    pub fn new(base_fee: Decimal, gas_price_link: Decimal, consumer: FulfillmentSender) -> Self {
        Self {
            shared: Arc::new(Shared {
                base_fee,
                gas_price_link,
                consumer,
                state: Mutex::new(CoordinatorState {
                    next_request_id: 1,
                    next_subscription_id: 1,
                    ..CoordinatorState::default()
                }),
            }),
            auto_fulfill: None,
        }
    }

    /// Coordinator with the reference network's fee constants.
    pub fn with_default_fees(consumer: FulfillmentSender) -> Self {
        Self::new(DEFAULT_BASE_FEE, DEFAULT_GAS_PRICE_LINK, consumer)
    }

    /// Fulfill every request with generated words after `delay`.
    pub fn auto_fulfill_after(mut self, delay: Duration) -> Self {
        self.auto_fulfill = Some(delay);
        self
    }

    pub async fn create_subscription(&self) -> u64 {
        let mut state = self.shared.state.lock().await;
        let id = state.next_subscription_id;
        state.next_subscription_id += 1;
        state.subscriptions.insert(id, Decimal::ZERO);
        info!(subscription_id = id, "Subscription created");
        id
    }

    /// Make a subscription created elsewhere known to this coordinator.
    pub async fn register_subscription(&self, subscription_id: u64) {
        let mut state = self.shared.state.lock().await;
        state.subscriptions.entry(subscription_id).or_insert(Decimal::ZERO);
        state.next_subscription_id = state.next_subscription_id.max(subscription_id + 1);
        info!(subscription_id, "Subscription registered");
    }

    pub async fn fund_subscription(&self, subscription_id: u64, amount: Decimal) -> Result<Decimal, OracleError> {
        let mut state = self.shared.state.lock().await;
        let balance = state
            .subscriptions
            .get_mut(&subscription_id)
            .ok_or(OracleError::InvalidSubscription(subscription_id))?;
        *balance += amount;
        let funded = *balance;
        debug!(subscription_id, %amount, balance = %funded, "Subscription funded");
        Ok(funded)
    }

    pub async fn subscription_balance(&self, subscription_id: u64) -> Result<Decimal, OracleError> {
        self.shared
            .state
            .lock()
            .await
            .subscriptions
            .get(&subscription_id)
            .copied()
            .ok_or(OracleError::InvalidSubscription(subscription_id))
    }

    /// Ids of requests not yet fulfilled, ascending.
    pub async fn pending_requests(&self) -> Vec<RequestId> {
        let state = self.shared.state.lock().await;
        let mut ids: Vec<RequestId> = state.pending.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Deliver `words` for `request_id`. An empty `words` derives the words
    /// from the request id. Returns the LINK charged to the subscription.
    pub async fn fulfill_random_words(&self, request_id: RequestId, words: Vec<u64>) -> Result<Decimal, OracleError> {
        self.shared.fulfill(request_id, words).await
    }

    /// Deliver freshly generated random words for `request_id`.
    pub async fn fulfill_with_random(&self, request_id: RequestId) -> Result<Decimal, OracleError> {
        let num_words = self
            .shared
            .state
            .lock()
            .await
            .pending
            .get(&request_id)
            .map(|p| p.num_words)
            .ok_or(OracleError::NonexistentRequest(request_id))?;
        self.shared.fulfill(request_id, random_words(num_words)).await
    }
}

#[async_trait]
impl RandomnessOracle for VrfCoordinatorMock {
    async fn request_randomness(&self, request: &RandomnessRequest) -> Result<RequestId, OracleError> {
        if request.request_confirmations > MAX_REQUEST_CONFIRMATIONS {
            return Err(OracleError::InvalidRequest(format!(
                "request_confirmations {} exceeds {MAX_REQUEST_CONFIRMATIONS}",
                request.request_confirmations
            )));
        }
        if request.num_words == 0 || request.num_words > MAX_NUM_WORDS {
            return Err(OracleError::InvalidRequest(format!(
                "num_words must be 1..={MAX_NUM_WORDS}, got {}",
                request.num_words
            )));
        }

        let request_id = {
            let mut state = self.shared.state.lock().await;
            if !state.subscriptions.contains_key(&request.subscription_id) {
                return Err(OracleError::InvalidSubscription(request.subscription_id));
            }
            let request_id = RequestId(state.next_request_id);
            state.next_request_id += 1;
            state.pending.insert(
                request_id,
                PendingOracleRequest {
                    subscription_id: request.subscription_id,
                    callback_gas_limit: request.callback_gas_limit,
                    num_words: request.num_words,
                },
            );
            request_id
        };

        info!(
            %request_id,
            subscription_id = request.subscription_id,
            key_hash = %request.key_hash,
            num_words = request.num_words,
            "Randomness requested"
        );

        if let Some(delay) = self.auto_fulfill {
            let shared = Arc::clone(&self.shared);
            let num_words = request.num_words;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Err(e) = shared.fulfill(request_id, random_words(num_words)).await {
                    warn!(%request_id, error = %e, "Auto-fulfillment failed");
                }
            });
        }

        Ok(request_id)
    }
}

fn random_words(n: u32) -> Vec<u64> {
    (0..n).map(|_| uuid::Uuid::new_v4().as_u128() as u64).collect()
}

/// Deterministic words for a request (splitmix64 over id and index).
fn derive_words(request_id: RequestId, n: u32) -> Vec<u64> {
    (0..n as u64)
        .map(|i| {
            let mut z = request_id.0.wrapping_mul(0x9E37_79B9_7F4A_7C15).wrapping_add(i);
            z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
            z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
            z ^ (z >> 31)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
