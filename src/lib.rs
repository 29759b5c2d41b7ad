//! LOTTERY: timed raffle rounds settled by verifiable randomness
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod clock;
pub mod config;
pub mod dashboard;
pub mod keeper;
pub mod ledger;
pub mod lottery;
pub mod oracle;
pub mod storage;
pub mod types;
