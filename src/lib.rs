//! # Circles Indexer
//!
//! Staged, reorg-aware indexer for Circles UBI transactions on Gnosis chain,
//! built on [Alloy](https://github.com/alloy-rs/alloy) and SQLite.
//!
//! Every transaction is classified (ERC20 transfer, Circles signup, trust,
//! hub transfer, plain and Safe ETH transfers, ...), its details are
//! extracted into typed rows, and everything is written exactly once, in
//! block order, surviving reorgs, RPC failures and restarts.
//!
//! ## Architecture
//!
//! 1. **Config** ([`config`]) - environment configuration
//! 2. **Chain** ([`chain`], [`rpc`]) - chain data model and JSON-RPC client
//! 3. **Classification** ([`classify`], [`events`]) - transaction classes
//! 4. **Extraction** ([`extract`]) - typed detail rows per class
//! 5. **Storage** ([`db`]) - staging tables, import procedure, reorg purge
//! 6. **Pipeline** ([`indexer`]) - block sources, stages, round controller
//! 7. **Reorgs** ([`reorg`]) - background hash comparison
//! 8. **Health** ([`health`], [`api`]) - health evaluation, `/health`, `/stream`
//!
//! ## Quick Start
//!
//! ```bash
//! export CONNECTION_STRING=sqlite:./indexer.db
//! export RPC_URL=https://rpc.gnosischain.com
//! cargo run --release
//! ```
//!
//! ## Error Handling
//!
//! All operations return [`error::IndexerResult<T>`](error::IndexerResult):
//!
//! ```rust
//! use circles_indexer::error::{IndexerError, IndexerResult};
//!
//! fn example() -> IndexerResult<()> {
//!     Ok(())
//! }
//! ```
//!
//! ## Testing
//!
//! ```bash
//! # All tests
//! cargo test
//!
//! # Integration tests
//! cargo test --test '*'
//! ```

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod api;
pub mod app_state;
pub mod chain;
pub mod classify;
pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod extract;
pub mod health;
pub mod indexer;
pub mod observability;
pub mod reorg;
pub mod rpc;
