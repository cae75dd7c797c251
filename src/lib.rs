//! Lend relay library surface.
//!
//! The primary operator workflow is the relay daemon (`src/main.rs`): an HTTP
//! intake for lending tasks, a worker pool that executes them through the
//! enclave signer, and a settlement processor that turns daily leaderboard
//! snapshots into point ledger rows (`src/bin/settle_points.rs` runs the
//! settlement step standalone).

pub mod api;
pub mod enclave;
pub mod error;
pub mod runtime;
pub mod settlement;
pub mod storage;
pub mod submission;
pub mod utils;
pub mod worker;
