//! Verifiable randomness integration.
//!
//! Defines the `RandomnessOracle` trait and the fulfillment channel the
//! oracle uses to deliver random words back to the lottery. Requests return
//! only a correlation id; the words arrive later as a `Fulfillment`.

pub mod mock;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::types::{Fulfillment, OracleError, RandomnessRequest, RequestId};

/// Abstraction over randomness providers.
///
/// `request_randomness` must not block on fulfillment. Implementors deliver
/// the result at most once per request id through a `FulfillmentSender`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RandomnessOracle: Send + Sync {
    async fn request_randomness(&self, request: &RandomnessRequest) -> Result<RequestId, OracleError>;
}

pub type FulfillmentSender = mpsc::UnboundedSender<Fulfillment>;
pub type FulfillmentReceiver = mpsc::UnboundedReceiver<Fulfillment>;

/// Channel connecting an oracle to its consumer.
pub fn fulfillment_channel() -> (FulfillmentSender, FulfillmentReceiver) {
    mpsc::unbounded_channel()
}
