//! drift-core - Core library for Drift
//!
//! This crate contains the mirror store, the incremental sync
//! orchestrator, the concurrent downloader, and the progress telemetry
//! used by every Drift interface.

pub mod cancel;
pub mod db;
pub mod download;
pub mod error;
pub mod models;
pub mod progress;
pub mod remote;
pub mod sync;

#[cfg(test)]
mod testing;

pub use cancel::CancelToken;
pub use error::{Error, Result};
pub use models::{MirrorRecord, SyncOutcome};
