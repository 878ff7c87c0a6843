use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Advisory counters of one pool tier.
///
/// Nothing in the pool reads these back for decisions.
#[derive(Debug, Default)]
pub struct PoolMetric {
    /// Claims served by the parent tier
    pub claims: AtomicU64,
    /// Slots received from the parent tier
    pub claimed_slots: AtomicU64,
    /// Slots handed back to the parent tier
    pub released_slots: AtomicU64,
    pub blocks_claimed: AtomicU64,
    pub blocks_released: AtomicU64,
    pub chunks_minted: AtomicU64,
    /// Allocations served from the tier's own free-list
    pub hits: AtomicU64,
    /// Allocations that needed a claim from the parent tier
    pub misses: AtomicU64,
}

/// Point-in-time copy of a [`PoolMetric`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolMetricSnapshot {
    pub claims: u64,
    pub claimed_slots: u64,
    pub released_slots: u64,
    pub blocks_claimed: u64,
    pub blocks_released: u64,
    pub chunks_minted: u64,
    pub hits: u64,
    pub misses: u64,
}

impl PoolMetric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_claim(&self, slots: usize) {
        self.claims.fetch_add(1, Ordering::Relaxed);
        self.claimed_slots.fetch_add(slots as u64, Ordering::Relaxed);
    }

    pub fn record_release(&self, slots: usize) {
        self.released_slots
            .fetch_add(slots as u64, Ordering::Relaxed);
    }

    pub fn record_blocks_claimed(&self, blocks: usize) {
        self.blocks_claimed
            .fetch_add(blocks as u64, Ordering::Relaxed);
    }

    pub fn record_blocks_released(&self, blocks: usize) {
        self.blocks_released
            .fetch_add(blocks as u64, Ordering::Relaxed);
    }

    pub fn record_chunk_minted(&self) {
        self.chunks_minted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PoolMetricSnapshot {
        PoolMetricSnapshot {
            claims: self.claims.load(Ordering::Relaxed),
            claimed_slots: self.claimed_slots.load(Ordering::Relaxed),
            released_slots: self.released_slots.load(Ordering::Relaxed),
            blocks_claimed: self.blocks_claimed.load(Ordering::Relaxed),
            blocks_released: self.blocks_released.load(Ordering::Relaxed),
            chunks_minted: self.chunks_minted.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    pub fn log_summary(&self, tier: &'static str) {
        let s = self.snapshot();
        debug!(
            tier,
            claims = s.claims,
            claimed_slots = s.claimed_slots,
            released_slots = s.released_slots,
            blocks_claimed = s.blocks_claimed,
            blocks_released = s.blocks_released,
            chunks_minted = s.chunks_minted,
            hits = s.hits,
            misses = s.misses,
            "Pool tier statistics"
        );
    }
}

impl PoolMetricSnapshot {
    /// Fraction of allocations served without going to the parent tier.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
