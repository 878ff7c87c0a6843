use reqwest::Client;
use tracing::debug;

use crate::config::EngineConfig;
use crate::error::DownloadError;

/// Create the HTTP client shared by every transfer of a manager.
///
/// Compression stays off so that `Range` offsets and lengths refer to the
/// bytes stored on disk.
pub fn create_client(config: &EngineConfig) -> Result<Client, DownloadError> {
    let mut builder = Client::builder()
        .user_agent(&config.user_agent)
        .default_headers(config.headers.clone())
        .connect_timeout(config.connect_timeout)
        .read_timeout(config.socket_timeout)
        .pool_max_idle_per_host(config.max_connections_per_route)
        .pool_idle_timeout(config.max_idle_time)
        .redirect(reqwest::redirect::Policy::limited(10));

    if let Some(timeout) = config.request_timeout {
        builder = builder.timeout(timeout);
    }

    debug!(
        user_agent = %config.user_agent,
        connect_timeout_ms = config.connect_timeout.as_millis() as u64,
        socket_timeout_ms = config.socket_timeout.as_millis() as u64,
        "Creating HTTP client"
    );

    builder.build().map_err(DownloadError::from)
}
