//! Segment download engine
//!
//! Fetches many small HTTP segments concurrently, resumes partial files,
//! decrypts AES-128 segments while writing and reuses transfer buffers
//! through a tiered slot pool.
//!
//! ## Component Overview
//!
//! - `transfer`: the [`TransferManager`] with `fetch_bytes` and `download_file`
//! - `retry`: request-level retry strategy and transfer-level backoff
//! - `decryption`: streaming AES-128-CBC decryption
//! - `consumer`: in-memory and file response consumers
//! - `pool`: global, local and coterie pool tiers
//! - `options`: per-download choice of sink mode and buffer pooling
//! - `coordinator`: batch orchestration and cancellation

pub mod builder;
pub mod config;
pub mod consumer;
pub mod coordinator;
pub mod decryption;
pub mod error;
pub mod events;
pub mod metrics;
pub mod options;
pub mod pool;
pub mod retry;
pub mod segment;
pub mod transfer;

pub use builder::EngineConfigBuilder;
pub use config::{EngineConfig, PoolConfig};
pub use consumer::SinkMode;
pub use coordinator::{BatchReport, BatchStatus, DownloadCoordinator, DownloadReport, supervise};
pub use decryption::{DecryptionKey, SegmentCipher};
pub use error::{DownloadError, ErrorKind};
pub use events::{BatchReporter, NoopListener, TracingReporter, TransferListener};
pub use metrics::{TransferMetrics, TransferMetricsSnapshot};
pub use options::{FixedNumberOptionsSelector, OptionsSnapshot, TransferOptions};
pub use pool::{BufferPool, CoteriePool, GlobalPool, LocalPool, PoolError};
pub use retry::{Backoff, RetryStrategy};
pub use segment::{MediaDownload, RequestConfig, Route, SegmentDescriptor};
pub use transfer::{TransferManager, TransferStrategy};
