#![forbid(unsafe_code)]
//! Error type for the block cache.
//!
//! # Error Taxonomy
//!
//! | Variant | Class | Raised by |
//! |---------|-------|-----------|
//! | `InvalidBlockNumber` | caller error | cache engine, before any state is touched |
//! | `BufferSize` | caller error | cache engine and block devices |
//! | `InvalidConfig` | caller error | cache / device construction |
//! | `Io` | disk failure | file-backed byte devices |
//! | `Device` | disk failure | block devices (range, alignment) |
//! | `PermissionDenied` | disk failure | writes to a read-only image |
//! | `DaemonSpawn` | runtime | flush daemon start |
//! | `DaemonAlreadyRunning` | caller error | flush daemon start on a cache that has one |
//!
//! A disk failure is fatal to the operation that hit it. The cache never
//! retries on its own and never leaves a slot half swapped: either the new
//! block is fully installed or the previous occupant stays intact (still
//! dirty if its write-back was the step that failed).
//!
//! A cache whose every slot is locked by the flush daemon is not an error;
//! callers block until a slot frees up.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    /// Block number outside the device's addressable range.
    #[error("invalid block number {block} (device has {block_count} blocks)")]
    InvalidBlockNumber { block: u64, block_count: u64 },

    /// A payload or destination buffer does not match the block size.
    #[error("buffer size mismatch: got {got} bytes, expected {expected}")]
    BufferSize { got: usize, expected: usize },

    /// Rejected cache or device configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The backing store refused the request (out of range, misaligned image).
    #[error("device error: {0}")]
    Device(String),

    /// Write attempted against a device opened read-only.
    #[error("permission denied")]
    PermissionDenied,

    /// The background flush thread could not be started.
    #[error("failed to spawn flush daemon: {0}")]
    DaemonSpawn(#[source] std::io::Error),

    /// A cache runs at most one flush daemon at a time.
    #[error("flush daemon already running for this cache")]
    DaemonAlreadyRunning,
}

impl CacheError {
    /// True for failures reported by the disk adapter.
    #[must_use]
    pub fn is_disk_failure(&self) -> bool {
        match self {
            Self::Io(_) | Self::Device(_) | Self::PermissionDenied => true,
            Self::InvalidBlockNumber { .. }
            | Self::BufferSize { .. }
            | Self::InvalidConfig(_)
            | Self::DaemonSpawn(_)
            | Self::DaemonAlreadyRunning => false,
        }
    }
}

/// Result alias using `CacheError`.
pub type Result<T> = std::result::Result<T, CacheError>;
