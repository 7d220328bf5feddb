//! Cross-protocol arbitrage pipeline.
//!
//! A scan loop fetches prices for configured asset pairs from several DeFi
//! protocols, detects cross-protocol differentials, hands the best ones to an
//! external broadcaster, and attributes portfolio value changes to funding or
//! trading profit. A supervisor keeps the loop alive.

pub mod adapter;
pub mod arbitrage;
pub mod config;
pub mod errors;
pub mod execution;
pub mod health;
pub mod models;
pub mod pool;
pub mod scanner;
pub mod store;
pub mod tracker;
pub mod utils;

#[cfg(test)]
mod test_support;
