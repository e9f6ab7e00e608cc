#![forbid(unsafe_code)]
//! Shared vocabulary for the block cache crates.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Bytes per block on the simulated disk.
pub const BLOCK_SIZE: u32 = 4096;

/// Number of addressable blocks on the simulated disk.
pub const TOTAL_BLOCKS: u64 = 1000;

/// Slots managed by a cache unless configured otherwise.
pub const DEFAULT_CACHE_CAPACITY: usize = 10;

/// Pause between two flush daemon sweeps.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Upper bound on a single wait for a locked eviction victim before
/// victim selection is re-run.
pub const DEFAULT_EVICTION_WAIT: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for BlockNumber {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Index of a slot in a cache's fixed slot table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotIndex(pub usize);

/// Replacement policy used to pick an eviction victim.
///
/// FIFO and LRU share the recency list; only LRU reorders it on a hit.
/// LFU ignores the list and scans access counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplacementPolicy {
    Fifo,
    #[default]
    Lru,
    Lfu,
}

impl ReplacementPolicy {
    pub const ALL: [Self; 3] = [Self::Fifo, Self::Lru, Self::Lfu];

    /// Whether the policy keeps slots on the recency list.
    #[must_use]
    pub fn uses_recency_list(self) -> bool {
        matches!(self, Self::Fifo | Self::Lru)
    }

    /// Whether a hit moves the slot to the head of the recency list.
    #[must_use]
    pub fn promotes_on_hit(self) -> bool {
        matches!(self, Self::Lru)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fifo => "fifo",
            Self::Lru => "lru",
            Self::Lfu => "lfu",
        }
    }
}

impl fmt::Display for ReplacementPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown replacement policy {input:?} (expected fifo, lru or lfu)")]
pub struct ParsePolicyError {
    pub input: String,
}

impl FromStr for ReplacementPolicy {
    type Err = ParsePolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fifo" | "0" => Ok(Self::Fifo),
            "lru" | "1" => Ok(Self::Lru),
            "lfu" | "2" => Ok(Self::Lfu),
            _ => Err(ParsePolicyError {
                input: s.to_owned(),
            }),
        }
    }
}
