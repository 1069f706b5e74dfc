//! DeSci chain-to-store synchronization node
//!
//! Reads platform contract logs from a JSON-RPC endpoint, projects them into
//! a RocksDB read model with durable per-listener checkpoints, and serves the
//! projected records, content-hash verification and sync health over HTTP.

pub mod api;
pub mod chain;
pub mod config;
pub mod demo;
pub mod error;
pub mod listener;
pub mod metrics;
pub mod projector;
pub mod storage;
pub mod verify;

pub use error::{Result, SyncError};
