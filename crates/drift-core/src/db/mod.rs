//! Database layer for Drift

mod connection;
mod migrations;
mod mirror_store;

pub use connection::Database;
pub use mirror_store::MirrorStore;
