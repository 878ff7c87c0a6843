use parking_lot::MutexGuard;
use std::fmt;
use std::sync::Arc;

use super::coterie::CoterieShared;
use super::global::Chunk;

/// Index of one pooled resource inside the global arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Slot {
    chunk: u32,
    index: u32,
}

impl Slot {
    pub(crate) fn new(chunk: usize, index: usize) -> Self {
        Self {
            chunk: chunk as u32,
            index: index as u32,
        }
    }

    pub fn chunk(&self) -> usize {
        self.chunk as usize
    }

    pub fn index(&self) -> usize {
        self.index as usize
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.chunk, self.index)
    }
}

/// Exclusive loan of one slot from a [`CoteriePool`](super::CoteriePool).
///
/// Dropping the lease passivates the resource and pushes the slot back to
/// the front of its coterie's free-list.
pub struct Lease<T: Send + 'static> {
    slot: Slot,
    chunk: Arc<Chunk<T>>,
    owner: Option<Arc<CoterieShared<T>>>,
}

impl<T: Send + 'static> Lease<T> {
    pub(crate) fn new(slot: Slot, chunk: Arc<Chunk<T>>, owner: Arc<CoterieShared<T>>) -> Self {
        Self {
            slot,
            chunk,
            owner: Some(owner),
        }
    }

    pub fn slot(&self) -> Slot {
        self.slot
    }

    /// Access the leased resource.
    ///
    /// The lock is uncontended: no other lease can name this slot.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.chunk.cell(self.slot.index()).lock()
    }
}

impl<T: Send + 'static> fmt::Debug for Lease<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease").field("slot", &self.slot).finish()
    }
}

impl<T: Send + 'static> Drop for Lease<T> {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.take() {
            owner.recycle(self.slot, &self.chunk);
        }
    }
}
