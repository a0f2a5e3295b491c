//! filesync library
//!
//! Client/server remote file store: a SQLite namespace of files and folders,
//! chunked hash-verified transfers, and a commit protocol that keeps the
//! content tree and the namespace in agreement.

pub mod checksum;
pub mod cli;
pub mod client;
pub mod commit;
pub mod config;
pub mod error;
pub mod namespace;
pub mod paths;
pub mod progress;
pub mod protocol;
pub mod protocol_core;
pub mod reconcile;
pub mod server;
pub mod session;
pub mod transfer;
pub mod transport;
pub mod wire;

pub use error::{ErrorKind, Result, SyncError};
