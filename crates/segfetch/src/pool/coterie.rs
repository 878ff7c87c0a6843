use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use super::PoolError;
use super::global::Chunk;
use super::local::LocalPool;
use super::metric::PoolMetric;
use super::slot::{Lease, Slot};

/// Lifecycle callbacks run on a resource as it enters and leaves a lease.
pub trait SlotHooks<T>: Send + Sync {
    /// Runs on every allocation, before the lease is handed out.
    fn activate(&self, _resource: &mut T) {}

    /// Runs on every deallocation, before the slot is recycled.
    fn passivate(&self, _resource: &mut T) {}
}

/// Hooks that leave the resource untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl<T> SlotHooks<T> for NoHooks {}

/// Maps the 1-based claim counter to how many slots to claim on a miss.
pub type ClaimSizer = Arc<dyn Fn(u64) -> usize + Send + Sync>;

/// Doubles the claim size on every miss, up to 64 slots.
pub fn doubling_sizer() -> ClaimSizer {
    Arc::new(|claims: u64| 1usize << claims.min(6))
}

pub(crate) struct CoterieShared<T: Send + 'static> {
    local: Arc<LocalPool<T>>,
    free: Mutex<Vec<Slot>>,
    claims: AtomicU64,
    claimed: AtomicU64,
    allocated: AtomicU64,
    deallocated: AtomicU64,
    sizer: ClaimSizer,
    hooks: Arc<dyn SlotHooks<T>>,
    metric: PoolMetric,
}

impl<T: Send + 'static> CoterieShared<T> {
    pub(crate) fn recycle(&self, slot: Slot, chunk: &Arc<Chunk<T>>) {
        self.hooks.passivate(&mut chunk.cell(slot.index()).lock());
        self.free.lock().push(slot);
        self.deallocated.fetch_add(1, Ordering::Relaxed);
    }

    fn next_slot(&self) -> Result<Slot, PoolError> {
        if let Some(slot) = self.free.lock().pop() {
            self.metric.record_hit();
            return Ok(slot);
        }

        self.metric.record_miss();
        let claim = self.claims.fetch_add(1, Ordering::Relaxed) + 1;
        let wanted = (self.sizer)(claim).max(1);
        let mut slots = self.local.claim(wanted);
        if slots.is_empty() {
            return Err(PoolError::Exhausted {
                max_chunks: self.local.global().config().max_chunks,
            });
        }

        debug!(claim, wanted, received = slots.len(), "Coterie claimed slots");
        self.metric.record_claim(slots.len());
        self.claimed
            .fetch_add(slots.len() as u64, Ordering::Relaxed);

        // Claimed slots are handed out front to back.
        let first = slots.remove(0);
        let mut free = self.free.lock();
        free.extend(slots.into_iter().rev());
        Ok(first)
    }
}

impl<T: Send + 'static> Drop for CoterieShared<T> {
    fn drop(&mut self) {
        let slots = std::mem::take(self.free.get_mut());
        let count = slots.len();
        self.local.release(slots);
        self.metric.record_release(count);
        debug!(
            released = count,
            allocated = self.allocated.load(Ordering::Relaxed),
            "Coterie destroyed"
        );
        self.metric.log_summary("coterie");
    }
}

/// Per-download cache of pooled resources.
///
/// Cloning is cheap and shares the same free-list. The coterie is destroyed
/// once the last handle and the last outstanding lease are dropped; its
/// slots then return to the local tier.
pub struct CoteriePool<T: Send + 'static> {
    shared: Arc<CoterieShared<T>>,
}

impl<T: Send + 'static> Clone for CoteriePool<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + 'static> fmt::Debug for CoteriePool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoteriePool")
            .field("free", &self.free_count())
            .field("claimed", &self.claimed())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

impl<T: Send + 'static> CoteriePool<T> {
    pub fn new(local: Arc<LocalPool<T>>) -> Self {
        Self::with_parts(local, doubling_sizer(), Arc::new(NoHooks))
    }

    pub fn with_parts(
        local: Arc<LocalPool<T>>,
        sizer: ClaimSizer,
        hooks: Arc<dyn SlotHooks<T>>,
    ) -> Self {
        Self {
            shared: Arc::new(CoterieShared {
                local,
                free: Mutex::new(Vec::new()),
                claims: AtomicU64::new(0),
                claimed: AtomicU64::new(0),
                allocated: AtomicU64::new(0),
                deallocated: AtomicU64::new(0),
                sizer,
                hooks,
                metric: PoolMetric::new(),
            }),
        }
    }

    /// Lease one resource, claiming more slots from the local tier on a miss.
    pub fn allocate(&self) -> Result<Lease<T>, PoolError> {
        let shared = &self.shared;
        let slot = shared.next_slot()?;
        let Some(chunk) = shared.local.global().chunk(slot.chunk()) else {
            shared.free.lock().push(slot);
            return Err(PoolError::UnknownSlot { slot });
        };

        shared.hooks.activate(&mut chunk.cell(slot.index()).lock());
        shared.allocated.fetch_add(1, Ordering::Relaxed);
        Ok(Lease::new(slot, chunk, Arc::clone(shared)))
    }

    /// Return a lease early. Equivalent to dropping it.
    pub fn deallocate(&self, lease: Lease<T>) {
        drop(lease);
    }

    pub fn free_count(&self) -> usize {
        self.shared.free.lock().len()
    }

    /// Total slots received from the local tier.
    pub fn claimed(&self) -> u64 {
        self.shared.claimed.load(Ordering::Relaxed)
    }

    /// Leases handed out and not yet returned.
    pub fn outstanding(&self) -> u64 {
        self.shared.allocated.load(Ordering::Relaxed)
            - self.shared.deallocated.load(Ordering::Relaxed)
    }

    pub fn claims(&self) -> u64 {
        self.shared.claims.load(Ordering::Relaxed)
    }

    pub fn metric(&self) -> &PoolMetric {
        &self.shared.metric
    }
}
