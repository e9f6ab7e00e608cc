//! Cache plus running flush daemon, managed as one unit.

use crate::{BlockCache, BlockDevice, CacheConfig, CacheMetrics, FlushDaemon, FlushDaemonConfig};
use bcache_error::{CacheError, Result};
use bcache_types::BlockNumber;
use std::sync::Arc;
use tracing::info;

/// A [`BlockCache`] whose flush daemon lives exactly as long as the session.
///
/// `open` builds the cache and starts the daemon; `close` stops the daemon
/// and reports the final counters. Dirty blocks not yet written back by
/// then stay in memory only: closing does not flush.
#[derive(Debug)]
pub struct CacheSession<D: BlockDevice + 'static> {
    cache: Arc<BlockCache<D>>,
    daemon: Option<FlushDaemon>,
}

impl<D: BlockDevice + 'static> CacheSession<D> {
    pub fn open(device: D, config: CacheConfig, flush: FlushDaemonConfig) -> Result<Self> {
        let cache = Arc::new(BlockCache::new(device, config)?);
        let daemon = cache.start_flush_daemon(flush)?;
        info!(capacity = config.capacity, policy = %config.policy, "cache session opened");
        Ok(Self {
            cache,
            daemon: Some(daemon),
        })
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<BlockCache<D>> {
        &self.cache
    }

    /// Copy block `block` into `out`, which must be exactly one block long.
    pub fn read_into(&self, block: BlockNumber, out: &mut [u8]) -> Result<()> {
        let expected = usize::try_from(self.cache.block_size())
            .map_err(|_| CacheError::InvalidConfig("block size does not fit usize".to_owned()))?;
        if out.len() != expected {
            return Err(CacheError::BufferSize {
                got: out.len(),
                expected,
            });
        }
        self.cache
            .read_block_with(block, |bytes| out.copy_from_slice(bytes))
    }

    pub fn write(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        self.cache.write_block(block, data)
    }

    /// Stop the flush daemon and return the final metrics.
    #[must_use]
    pub fn close(mut self) -> CacheMetrics {
        if let Some(daemon) = self.daemon.take() {
            daemon.shutdown();
        }
        let metrics = self.cache.metrics();
        info!(
            hits = metrics.hits,
            misses = metrics.misses,
            dirty = metrics.dirty_blocks,
            "cache session closed"
        );
        metrics
    }
}
