use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::debug;

use super::PoolError;
use super::block::{Block, BlockList};
use super::metric::PoolMetric;
use crate::config::PoolConfig;

/// Dense array of resources minted together.
pub struct Chunk<T> {
    cells: Box<[Mutex<T>]>,
}

impl<T> Chunk<T> {
    fn new(len: usize, factory: &(dyn Fn() -> T + Send + Sync)) -> Self {
        Self {
            cells: (0..len).map(|_| Mutex::new(factory())).collect(),
        }
    }

    pub(crate) fn cell(&self, index: usize) -> &Mutex<T> {
        &self.cells[index]
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

/// Top tier: owns the arena and mints chunks on demand under a ceiling.
pub struct GlobalPool<T> {
    config: PoolConfig,
    factory: Box<dyn Fn() -> T + Send + Sync>,
    chunks: RwLock<Vec<Arc<Chunk<T>>>>,
    free_blocks: Mutex<BlockList>,
    metric: PoolMetric,
}

impl<T: Send + 'static> GlobalPool<T> {
    pub fn new(config: PoolConfig, factory: impl Fn() -> T + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            config,
            factory: Box::new(factory),
            chunks: RwLock::new(Vec::new()),
            free_blocks: Mutex::new(BlockList::new()),
            metric: PoolMetric::new(),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Smallest number of slots a local tier receives per claim.
    pub fn min_allocation(&self) -> usize {
        self.config.slots_per_block
    }

    /// Claim up to `count` blocks, minting chunks while under the ceiling.
    ///
    /// Returns fewer blocks (possibly none) once the ceiling is reached.
    pub fn claim_blocks(&self, count: usize) -> Vec<Block> {
        let mut free = self.free_blocks.lock();
        while free.len() < count {
            match self.mint_chunk() {
                Ok(blocks) => free.extend(blocks),
                Err(err) => {
                    debug!(error = %err, requested = count, available = free.len(), "Global pool cannot grow");
                    break;
                }
            }
        }
        let blocks = free.take(count);
        drop(free);

        if !blocks.is_empty() {
            self.metric.record_blocks_claimed(blocks.len());
            self.metric
                .record_claim(blocks.iter().map(Block::len).sum());
        }
        blocks
    }

    pub fn release_blocks(&self, blocks: impl IntoIterator<Item = Block>) {
        let mut free = self.free_blocks.lock();
        let before = free.len();
        free.extend(blocks);
        let released = free.len() - before;
        drop(free);

        self.metric.record_blocks_released(released);
    }

    fn mint_chunk(&self) -> Result<Vec<Block>, PoolError> {
        let mut chunks = self.chunks.write();
        if chunks.len() >= self.config.max_chunks {
            return Err(PoolError::Exhausted {
                max_chunks: self.config.max_chunks,
            });
        }

        let chunk_index = chunks.len();
        let spb = self.config.slots_per_block;
        chunks.push(Arc::new(Chunk::new(
            self.config.slots_per_chunk(),
            self.factory.as_ref(),
        )));
        self.metric.record_chunk_minted();
        debug!(
            chunk = chunk_index,
            slots = self.config.slots_per_chunk(),
            "Minted pool chunk"
        );

        Ok((0..self.config.blocks_per_chunk)
            .map(|b| Block::new(chunk_index, b * spb, spb))
            .collect())
    }

    pub fn chunk(&self, index: usize) -> Option<Arc<Chunk<T>>> {
        self.chunks.read().get(index).cloned()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.read().len()
    }

    pub fn free_block_count(&self) -> usize {
        self.free_blocks.lock().len()
    }

    pub fn metric(&self) -> &PoolMetric {
        &self.metric
    }
}
