//! Hierarchical slot pooling for transfer buffers.
//!
//! Three tiers share one arena: the [`GlobalPool`] mints chunks of
//! resources under a ceiling, a [`LocalPool`] claims whole blocks from it
//! and lends loose slots, and a [`CoteriePool`] caches slots for a single
//! download. Resources are reached only through a [`Lease`].

mod block;
mod coterie;
mod global;
mod local;
mod metric;
mod slot;

pub use block::{Block, BlockList, Link};
pub use coterie::{ClaimSizer, CoteriePool, NoHooks, SlotHooks, doubling_sizer};
pub use global::{Chunk, GlobalPool};
pub use local::LocalPool;
pub use metric::{PoolMetric, PoolMetricSnapshot};
pub use slot::{Lease, Slot};

use bytes::BytesMut;
use std::sync::Arc;
use thiserror::Error;

use crate::config::EngineConfig;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("pool exhausted: all {max_chunks} chunks are in use")]
    Exhausted { max_chunks: usize },

    #[error("slot {slot} does not name a minted chunk")]
    UnknownSlot { slot: Slot },
}

/// Coterie of transfer buffers.
pub type BufferCoterie = CoteriePool<BytesMut>;
/// Leased transfer buffer.
pub type BufferLease = Lease<BytesMut>;

/// Keeps pooled buffers sized for one transfer chunk.
#[derive(Debug, Clone, Copy)]
pub struct BufferHooks {
    capacity: usize,
}

impl BufferHooks {
    pub fn new(capacity: usize) -> Self {
        Self { capacity }
    }
}

impl SlotHooks<BytesMut> for BufferHooks {
    fn activate(&self, buffer: &mut BytesMut) {
        buffer.clear();
        buffer.reserve(self.capacity);
    }

    fn passivate(&self, buffer: &mut BytesMut) {
        buffer.clear();
    }
}

/// Engine-wide buffer pool handing out one coterie per download.
#[derive(Clone)]
pub struct BufferPool {
    local: Arc<LocalPool<BytesMut>>,
    hooks: Arc<BufferHooks>,
}

impl BufferPool {
    pub fn new(config: &EngineConfig) -> Self {
        // Buffers are allocated lazily by the activate hook.
        let global = GlobalPool::new(config.pool.clone(), BytesMut::new);
        Self {
            local: LocalPool::new(global),
            hooks: Arc::new(BufferHooks::new(config.buffer_size)),
        }
    }

    pub fn coterie(&self) -> BufferCoterie {
        CoteriePool::with_parts(
            Arc::clone(&self.local),
            doubling_sizer(),
            self.hooks.clone(),
        )
    }

    pub fn min_allocation(&self) -> usize {
        self.local.min_allocation()
    }

    pub fn local(&self) -> &Arc<LocalPool<BytesMut>> {
        &self.local
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("lent", &self.local.lent())
            .field("capacity", &self.local.capacity())
            .finish()
    }
}
