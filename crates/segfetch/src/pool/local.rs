use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};

use super::block::{BlockList, Link};
use super::global::GlobalPool;
use super::metric::PoolMetric;
use super::slot::Slot;

#[derive(Debug, Default)]
struct LocalState {
    /// Blocks claimed from the global tier
    owned: BlockList,
    /// Slots not currently lent to a coterie
    free: Link,
    lent: usize,
}

/// Middle tier: claims whole blocks from the global tier and lends loose slots.
pub struct LocalPool<T: Send + 'static> {
    global: Arc<GlobalPool<T>>,
    state: Mutex<LocalState>,
    metric: PoolMetric,
}

impl<T: Send + 'static> LocalPool<T> {
    pub fn new(global: Arc<GlobalPool<T>>) -> Arc<Self> {
        Arc::new(Self {
            global,
            state: Mutex::new(LocalState::default()),
            metric: PoolMetric::new(),
        })
    }

    pub fn global(&self) -> &Arc<GlobalPool<T>> {
        &self.global
    }

    pub fn min_allocation(&self) -> usize {
        self.global.min_allocation()
    }

    /// Lend up to `count` slots, growing from the global tier when short.
    pub fn claim(&self, count: usize) -> Vec<Slot> {
        if count == 0 {
            return Vec::new();
        }

        let mut state = self.state.lock();
        if state.free.len() < count {
            let missing = count - state.free.len();
            let blocks = self
                .global
                .claim_blocks(missing.div_ceil(self.global.min_allocation()));
            if !blocks.is_empty() {
                debug!(
                    blocks = blocks.len(),
                    missing, "Local pool grew from global pool"
                );
                self.metric.record_blocks_claimed(blocks.len());
            }
            for block in blocks {
                state.free.extend(block.slots());
                state.owned.push(block);
            }
        }

        let slots = state.free.take(count);
        state.lent += slots.len();
        drop(state);

        if !slots.is_empty() {
            self.metric.record_claim(slots.len());
        }
        slots
    }

    pub fn release(&self, slots: impl IntoIterator<Item = Slot>) {
        let mut state = self.state.lock();
        let mut released = 0;
        for slot in slots {
            debug_assert!(
                state.owned.iter().any(|b| b.contains(slot)),
                "slot {slot} does not belong to this pool"
            );
            state.free.push_front(slot);
            released += 1;
        }
        state.lent = state.lent.saturating_sub(released);
        drop(state);

        self.metric.record_release(released);
    }

    /// Return every owned block to the global tier when nothing is lent.
    ///
    /// Returns the number of blocks handed back.
    pub fn shrink(&self) -> usize {
        let mut state = self.state.lock();
        if state.lent > 0 {
            return 0;
        }
        let blocks = state.owned.drain();
        state.free.drain();
        drop(state);

        let count = blocks.len();
        if count > 0 {
            self.global.release_blocks(blocks);
            self.metric.record_blocks_released(count);
        }
        count
    }

    pub fn lent(&self) -> usize {
        self.state.lock().lent
    }

    pub fn free_count(&self) -> usize {
        self.state.lock().free.len()
    }

    /// Slots this tier received from the global tier and still owns.
    pub fn capacity(&self) -> usize {
        self.state.lock().owned.slot_count()
    }

    pub fn metric(&self) -> &PoolMetric {
        &self.metric
    }
}

impl<T: Send + 'static> Drop for LocalPool<T> {
    fn drop(&mut self) {
        let lent = self.state.lock().lent;
        if lent > 0 {
            warn!(lent, "Local pool dropped with slots still lent");
            return;
        }
        self.shrink();
        self.metric.log_summary("local");
    }
}
