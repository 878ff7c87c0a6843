//! Optional TOML configuration, overridden by command-line flags.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use segfetch_engine::EngineConfig;

use crate::cli::Args;
use crate::error::{AppError, Result};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub io_threads: Option<usize>,
    pub max_connections: Option<usize>,
    pub max_connections_per_route: Option<usize>,
    pub max_retries: Option<u32>,
    pub client_retries: Option<u32>,
    pub retry_interval_ms: Option<u64>,
    pub connect_timeout_secs: Option<u64>,
    pub socket_timeout_secs: Option<u64>,
    pub buffer_size: Option<usize>,
    pub user_agent: Option<String>,
    pub headers: BTreeMap<String, String>,
}

impl AppConfig {
    /// Load `path`, or the defaults when no file is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply command-line flags on top of the file values.
    pub fn merge_args(&mut self, args: &Args) -> Result<()> {
        if let Some(v) = args.connections {
            self.max_connections = Some(v);
        }
        if let Some(v) = args.connections_per_host {
            self.max_connections_per_route = Some(v);
        }
        if let Some(v) = args.retries {
            self.max_retries = Some(v);
        }
        if let Some(v) = args.retry_interval_ms {
            self.retry_interval_ms = Some(v);
        }
        if let Some(v) = args.connect_timeout {
            self.connect_timeout_secs = Some(v);
        }
        if let Some(v) = args.timeout {
            self.socket_timeout_secs = Some(v);
        }
        if let Some(v) = &args.user_agent {
            self.user_agent = Some(v.clone());
        }
        for header in &args.headers {
            let (name, value) = parse_header(header)?;
            self.headers.insert(name.to_owned(), value.to_owned());
        }
        Ok(())
    }

    pub fn engine_config(&self) -> Result<EngineConfig> {
        let mut builder = EngineConfig::builder();
        if let Some(v) = self.io_threads {
            builder = builder.io_threads(v);
        }
        if let Some(v) = self.max_connections {
            builder = builder.max_connections(v);
        }
        if let Some(v) = self.max_connections_per_route {
            builder = builder.max_connections_per_route(v);
        }
        if let Some(v) = self.max_retries {
            builder = builder.max_retries(v);
        }
        if let Some(v) = self.client_retries {
            builder = builder.client_retries(v);
        }
        if let Some(v) = self.retry_interval_ms {
            builder = builder.retry_interval(Duration::from_millis(v));
        }
        if let Some(v) = self.connect_timeout_secs {
            builder = builder.connect_timeout(Duration::from_secs(v));
        }
        if let Some(v) = self.socket_timeout_secs {
            builder = builder.socket_timeout(Duration::from_secs(v));
        }
        if let Some(v) = self.buffer_size {
            builder = builder.buffer_size(v);
        }
        if let Some(v) = &self.user_agent {
            builder = builder.user_agent(v.clone());
        }
        for (name, value) in &self.headers {
            builder = builder.header(name, value)?;
        }
        Ok(builder.build()?)
    }
}

/// Split `Name: Value`.
fn parse_header(header: &str) -> Result<(&str, &str)> {
    let (name, value) = header
        .split_once(':')
        .ok_or_else(|| AppError::InvalidInput(format!("header `{header}` is not `Name: Value`")))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(AppError::InvalidInput(format!(
            "header `{header}` has an empty name"
        )));
    }
    Ok((name, value.trim()))
}
