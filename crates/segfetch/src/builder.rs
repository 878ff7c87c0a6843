use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::config::{EngineConfig, PoolConfig};
use crate::error::DownloadError;

/// Fluent builder for [`EngineConfig`]; `build` validates the result.
#[derive(Debug, Clone, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn io_threads(mut self, threads: usize) -> Self {
        self.config.io_threads = threads;
        self
    }

    pub fn executor_threads(mut self, threads: usize) -> Self {
        self.config.executor_threads = threads;
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.max_connections = max;
        self
    }

    pub fn max_connections_per_route(mut self, max: usize) -> Self {
        self.config.max_connections_per_route = max;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.config.retry_interval = interval;
        self
    }

    pub fn client_retries(mut self, retries: u32) -> Self {
        self.config.client_retries = retries;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn socket_timeout(mut self, timeout: Duration) -> Self {
        self.config.socket_timeout = timeout;
        self
    }

    pub fn request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn max_idle_time(mut self, idle: Duration) -> Self {
        self.config.max_idle_time = idle;
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    /// Add a default header sent with every request.
    pub fn header(mut self, name: &str, value: &str) -> Result<Self, DownloadError> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| DownloadError::configuration(format!("invalid header name `{name}`: {e}")))?;
        let value = HeaderValue::from_str(value).map_err(|e| {
            DownloadError::configuration(format!("invalid value for header `{name}`: {e}"))
        })?;
        self.config.headers.insert(name, value);
        Ok(self)
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.config.headers.extend(headers);
        self
    }

    pub fn buffer_size(mut self, size: usize) -> Self {
        self.config.buffer_size = size;
        self
    }

    pub fn max_in_memory_body(mut self, size: usize) -> Self {
        self.config.max_in_memory_body = size;
        self
    }

    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.config.pool = pool;
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.config.shutdown_grace = grace;
        self
    }

    pub fn build(self) -> Result<EngineConfig, DownloadError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
