//! CADENCE: crash-resumable BUY-BUY-SELL-SELL DEX session engine.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod api;
pub mod config;
pub mod engine;
pub mod gateway;
pub mod storage;
pub mod strategy;
pub mod types;
