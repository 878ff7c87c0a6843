//! Per-download choice of sink mode and buffer pooling.
//!
//! Both choices are upgrades: once a batch decides an async sink or pooled
//! buffers are worth it, every later download of the batch gets them too.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::consumer::SinkMode;
use crate::segment::{MediaDownload, Route};

/// Connections per thread at which the runtime counts as busy.
pub const BUSY_CONNECTIONS_PER_THREAD: usize = 16;
/// Queued disk writes, in multiples of the per-route ceiling, that justify an async sink.
pub const DISK_QUEUE_FACTOR: usize = 10;
/// Remaining downloads per remaining route needed before earlier downloads pool buffers.
pub const MIN_DOWNLOADS_PER_ROUTE: usize = 2;

/// Options chosen for one download.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferOptions {
    pub use_async_sink: bool,
    pub use_buffer_pool: bool,
}

impl TransferOptions {
    pub fn sink_mode(&self) -> SinkMode {
        if self.use_async_sink {
            SinkMode::Channel
        } else {
            SinkMode::Direct
        }
    }
}

#[derive(Debug, Default)]
struct RouteGroups {
    /// Downloads not yet finished, per route
    remaining: HashMap<Route, usize>,
    remaining_downloads: usize,
}

impl RouteGroups {
    fn remaining_routes(&self) -> usize {
        self.remaining.len()
    }

    fn largest_group(&self) -> usize {
        self.remaining.values().copied().max().unwrap_or(0)
    }
}

/// Decision state shared by every download of a batch.
#[derive(Debug, Default)]
pub struct OptionsSnapshot {
    async_sink: AtomicBool,
    use_buffer: AtomicBool,
    groups: Mutex<RouteGroups>,
    /// Segments currently streaming
    instant_reading: AtomicUsize,
    /// Segments queued or streaming, not yet finished
    instant_remaining: AtomicUsize,
}

impl OptionsSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn async_sink(&self) -> bool {
        self.async_sink.load(Ordering::Acquire)
    }

    pub fn use_buffer(&self) -> bool {
        self.use_buffer.load(Ordering::Acquire)
    }

    pub fn instant_reading(&self) -> usize {
        self.instant_reading.load(Ordering::Acquire)
    }

    pub fn instant_remaining(&self) -> usize {
        self.instant_remaining.load(Ordering::Acquire)
    }

    pub fn remaining_downloads(&self) -> usize {
        self.groups.lock().remaining_downloads
    }

    pub fn remaining_routes(&self) -> usize {
        self.groups.lock().remaining_routes()
    }

    fn register(&self, route: Route) {
        let mut groups = self.groups.lock();
        *groups.remaining.entry(route).or_insert(0) += 1;
        groups.remaining_downloads += 1;
    }

    pub fn segments_queued(&self, count: usize) {
        self.instant_remaining.fetch_add(count, Ordering::AcqRel);
    }

    pub fn segment_started(&self) {
        self.instant_reading.fetch_add(1, Ordering::AcqRel);
    }

    /// A segment finished, whatever its outcome. `started` tells whether
    /// [`segment_started`](Self::segment_started) was called for it.
    pub fn segment_finished(&self, started: bool) {
        if started {
            let _ = self.instant_reading.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(1))
            });
        }
        let _ = self
            .instant_remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(1))
            });
    }
}

/// Chooses options from a batch registered up front.
#[derive(Debug)]
pub struct FixedNumberOptionsSelector {
    snapshot: OptionsSnapshot,
    max_connections_per_route: usize,
    /// `ceil(max_connections_per_route / io_threads)`
    connections_per_thread: usize,
    min_allocation: usize,
}

impl FixedNumberOptionsSelector {
    /// `min_allocation` is the buffer pool's smallest claim from the global tier.
    pub fn new(downloads: &[MediaDownload], config: &EngineConfig, min_allocation: usize) -> Self {
        let snapshot = OptionsSnapshot::new();
        for download in downloads {
            match download.route() {
                Ok(route) => snapshot.register(route),
                Err(e) => debug!(download = %download.id, error = %e, "Download has no route"),
            }
        }
        Self {
            snapshot,
            max_connections_per_route: config.max_connections_per_route,
            connections_per_thread: config.connections_per_thread(),
            min_allocation,
        }
    }

    pub fn snapshot(&self) -> &OptionsSnapshot {
        &self.snapshot
    }

    /// Options for `download`, which still has `pending` segments to fetch.
    pub fn decide(&self, download: &MediaDownload, pending: usize) -> TransferOptions {
        let snapshot = &self.snapshot;
        if snapshot.async_sink() && snapshot.use_buffer() {
            return TransferOptions {
                use_async_sink: true,
                use_buffer_pool: true,
            };
        }

        let groups = snapshot.groups.lock();
        if !snapshot.async_sink() && self.worth_async_sink(&groups, pending) {
            snapshot.async_sink.store(true, Ordering::Release);
            info!(download = %download.id, pending, "Batch switched to async sinks");
        }
        if !snapshot.use_buffer() && self.worth_use_buffer(&groups, download.segment_count()) {
            snapshot.use_buffer.store(true, Ordering::Release);
            info!(download = %download.id, segments = download.segment_count(), "Batch switched to pooled buffers");
        }

        TransferOptions {
            use_async_sink: snapshot.async_sink(),
            use_buffer_pool: snapshot.use_buffer(),
        }
    }

    fn worth_async_sink(&self, groups: &RouteGroups, pending: usize) -> bool {
        let busy =
            groups.remaining_routes() * self.connections_per_thread >= BUSY_CONNECTIONS_PER_THREAD;
        let queued = pending + self.snapshot.instant_remaining();
        busy || queued >= DISK_QUEUE_FACTOR * self.max_connections_per_route
    }

    fn worth_use_buffer(&self, groups: &RouteGroups, segments: usize) -> bool {
        if groups.remaining_downloads <= 1 {
            return segments > self.max_connections_per_route && segments > self.min_allocation;
        }
        let routes = groups.remaining_routes();
        if routes == 0 {
            return false;
        }
        (segments > self.max_connections_per_route || groups.largest_group() > 1)
            && groups.remaining_downloads / routes >= MIN_DOWNLOADS_PER_ROUTE
    }

    /// Remove a finished download from the remaining route groups.
    pub fn finish(&self, download: &MediaDownload) {
        let Ok(route) = download.route() else {
            return;
        };
        let mut groups = self.snapshot.groups.lock();
        let Some(count) = groups.remaining.get_mut(&route) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            groups.remaining.remove(&route);
        }
        groups.remaining_downloads = groups.remaining_downloads.saturating_sub(1);
    }
}
