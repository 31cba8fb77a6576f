//! Crate-wide error taxonomy.
//!
//! Each module boundary owns a `thiserror`-derived enum; this module composes
//! them into a single type `main` can report and exit on. Background loops
//! (replay, discovery, monitor polling) never propagate these upward — they
//! observe, count, alert, and continue, per the storage façade's design.

use thiserror::Error;

use crate::breaker::BreakerError;
use crate::cache::CacheError;
use crate::config::ConfigError;
use crate::scanner::DiscoveryError;
use crate::storage::StorageError;

/// Top-level error type for fatal, non-recoverable conditions.
#[derive(Debug, Error)]
pub enum PowerlogdError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("circuit breaker error: {0}")]
    Breaker(#[from] BreakerError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP server error: {0}")]
    Http(String),
}
