// ABOUTME: Library root for table-relay
// ABOUTME: Incremental table sync from a source PostgreSQL table to a remote target over TCP/TLS

pub mod commands;
pub mod config;
pub mod error;
pub mod postgres;
pub mod sync;
pub mod transport;
pub mod utils;

pub use error::SyncError;
pub use relay_protocol as protocol;
