use std::time::Duration;

use reqwest::header::HeaderMap;

use crate::builder::EngineConfigBuilder;
use crate::error::DownloadError;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Geometry of the transfer buffer pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Slots per block; also the minimum allocation the pool hands to a local tier.
    pub slots_per_block: usize,
    /// Blocks minted together as one chunk by the global tier.
    pub blocks_per_chunk: usize,
    /// Ceiling on the number of chunks the global tier may mint.
    pub max_chunks: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            slots_per_block: 16,
            blocks_per_chunk: 4,
            max_chunks: 32,
        }
    }
}

impl PoolConfig {
    pub fn slots_per_chunk(&self) -> usize {
        self.slots_per_block * self.blocks_per_chunk
    }

    pub fn max_slots(&self) -> usize {
        self.slots_per_chunk() * self.max_chunks
    }
}

/// Configuration of the segment download engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Runtime worker threads used for network I/O
    pub io_threads: usize,

    /// Concurrent downloads (playlists) processed by one batch
    pub executor_threads: usize,

    // --- Connection ceilings ---
    /// Total concurrent requests across all routes
    pub max_connections: usize,
    /// Concurrent requests per route (scheme, host, port)
    pub max_connections_per_route: usize,

    // --- Retry ---
    /// Default whole-transfer retries when a request does not override it
    pub max_retries: u32,
    /// Base delay of the exponential backoff between transfer attempts
    pub retry_interval: Duration,
    /// Request-level retries applied by the retry strategy before an attempt fails
    pub client_retries: u32,

    // --- Timeouts ---
    pub connect_timeout: Duration,
    /// Maximum time between two successful reads on a socket
    pub socket_timeout: Duration,
    /// Whole request timeout, `None` disables it (segment bodies are streamed)
    pub request_timeout: Option<Duration>,
    /// Idle connections are evicted after this duration
    pub max_idle_time: Duration,

    pub user_agent: String,
    pub headers: HeaderMap,

    // --- Buffers ---
    /// Capacity of one transfer buffer, also the write granularity of file sinks
    pub buffer_size: usize,
    /// Upper bound for bodies collected in memory by `fetch_bytes`
    pub max_in_memory_body: usize,
    pub pool: PoolConfig,

    /// Time allowed for in-flight transfers to finish during shutdown
    pub shutdown_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let io_threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            io_threads,
            executor_threads: 4,
            max_connections: 64,
            max_connections_per_route: 8,
            max_retries: 5,
            retry_interval: Duration::from_millis(500),
            client_retries: 1,
            connect_timeout: Duration::from_secs(10),
            socket_timeout: Duration::from_secs(30),
            request_timeout: None,
            max_idle_time: Duration::from_secs(30),
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: HeaderMap::new(),
            buffer_size: 64 * 1024,
            max_in_memory_body: 16 * 1024 * 1024,
            pool: PoolConfig::default(),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }

    /// Check every numeric constraint of the configuration.
    pub fn validate(&self) -> Result<(), DownloadError> {
        fn positive(name: &str, value: usize) -> Result<(), DownloadError> {
            if value == 0 {
                return Err(DownloadError::configuration(format!(
                    "{name} must be greater than zero"
                )));
            }
            Ok(())
        }

        positive("io_threads", self.io_threads)?;
        positive("executor_threads", self.executor_threads)?;
        positive("max_connections", self.max_connections)?;
        positive("max_connections_per_route", self.max_connections_per_route)?;
        positive("buffer_size", self.buffer_size)?;
        positive("max_in_memory_body", self.max_in_memory_body)?;
        positive("pool.slots_per_block", self.pool.slots_per_block)?;
        positive("pool.blocks_per_chunk", self.pool.blocks_per_chunk)?;
        positive("pool.max_chunks", self.pool.max_chunks)?;

        if self.max_connections_per_route > self.max_connections {
            return Err(DownloadError::configuration(format!(
                "max_connections_per_route ({}) exceeds max_connections ({})",
                self.max_connections_per_route, self.max_connections
            )));
        }
        if self.retry_interval.is_zero() {
            return Err(DownloadError::configuration(
                "retry_interval must be greater than zero",
            ));
        }
        if self.connect_timeout.is_zero() || self.socket_timeout.is_zero() {
            return Err(DownloadError::configuration(
                "connect_timeout and socket_timeout must be greater than zero",
            ));
        }
        if self.request_timeout.is_some_and(|t| t.is_zero()) {
            return Err(DownloadError::configuration(
                "request_timeout must be greater than zero when set",
            ));
        }
        if self.user_agent.trim().is_empty() {
            return Err(DownloadError::configuration("user_agent must not be empty"));
        }
        Ok(())
    }

    /// Per-thread connection pressure: `ceil(max_connections_per_route / io_threads)`.
    pub fn connections_per_thread(&self) -> usize {
        self.max_connections_per_route.div_ceil(self.io_threads.max(1))
    }
}
