use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::header::RANGE;
use reqwest::{Client, Method, Response, StatusCode};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};
use url::Url;

use super::client::create_client;
use super::range::{ContentRange, content_length, range_header, remote_length};
use crate::config::EngineConfig;
use crate::consumer::{BytesConsumer, FileConsumer, SinkMode, StagingBuffer};
use crate::decryption::DecryptionKey;
use crate::error::DownloadError;
use crate::events::TransferListener;
use crate::metrics::TransferMetrics;
use crate::pool::BufferCoterie;
use crate::retry::{Backoff, RetryStrategy, sleep_or_cancel};
use crate::segment::{RequestConfig, Route};

const RUNNING: u8 = 0;
const DRAINING: u8 = 1;
const TERMINATED: u8 = 2;

/// How a single file transfer stores its body.
#[derive(Debug, Clone, Default)]
pub struct TransferStrategy {
    pub sink: SinkMode,
    /// Coterie to lease the staging buffer from; an owned buffer is used when absent
    pub buffers: Option<BufferCoterie>,
    pub token: CancellationToken,
}

impl TransferStrategy {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            ..Self::default()
        }
    }

    pub fn with_sink(mut self, sink: SinkMode) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_buffers(mut self, buffers: BufferCoterie) -> Self {
        self.buffers = Some(buffers);
        self
    }
}

/// Connection permits held for the lifetime of one request.
struct Permits {
    _route: OwnedSemaphorePermit,
    _total: OwnedSemaphorePermit,
}

/// Decrements the in-flight count on drop.
struct InFlight<'a> {
    manager: &'a TransferManager,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.manager.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.manager.idle.notify_waiters();
        }
    }
}

/// Where a file attempt starts writing.
struct Resume {
    offset: u64,
    append: bool,
}

/// Resumable HTTP transfers with retry, backoff and connection ceilings.
pub struct TransferManager {
    client: Client,
    config: Arc<EngineConfig>,
    strategy: RetryStrategy,
    backoff: Backoff,
    connections: Arc<Semaphore>,
    routes: Mutex<HashMap<Route, Arc<Semaphore>>>,
    state: AtomicU8,
    in_flight: AtomicUsize,
    idle: Notify,
    shutdown_token: CancellationToken,
    metrics: Arc<TransferMetrics>,
}

impl TransferManager {
    pub fn new(config: EngineConfig) -> Result<Self, DownloadError> {
        config.validate()?;
        let client = create_client(&config)?;
        Ok(Self::with_client(client, config))
    }

    /// Build a manager around an existing client. The configuration is
    /// assumed to be valid.
    pub fn with_client(client: Client, config: EngineConfig) -> Self {
        Self {
            client,
            strategy: RetryStrategy::new(config.client_retries, config.retry_interval),
            backoff: Backoff::new(config.retry_interval),
            connections: Arc::new(Semaphore::new(config.max_connections)),
            routes: Mutex::new(HashMap::new()),
            state: AtomicU8::new(RUNNING),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
            shutdown_token: CancellationToken::new(),
            metrics: Arc::new(TransferMetrics::new()),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &Arc<EngineConfig> {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<TransferMetrics> {
        &self.metrics
    }

    pub fn is_shut_down(&self) -> bool {
        self.state.load(Ordering::Acquire) != RUNNING
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Fetch a whole body into memory.
    ///
    /// Returns `Ok(None)` when the manager is shut down before an attempt.
    #[instrument(skip(self, request), fields(url = %uri), level = "debug")]
    pub async fn fetch_bytes(
        &self,
        uri: &Url,
        request: &RequestConfig,
    ) -> Result<Option<Bytes>, DownloadError> {
        let Some(_guard) = self.enter() else {
            return Ok(None);
        };
        let token = self.shutdown_token.child_token();
        let retries = request.retry_count.unwrap_or(self.config.max_retries);

        let mut attempt = 0;
        loop {
            if self.is_shut_down() {
                return Ok(None);
            }
            match self.fetch_once(uri, request, &token).await {
                Ok(bytes) => return Ok(Some(bytes)),
                Err(DownloadError::Cancelled) if self.is_shut_down() => return Ok(None),
                Err(e) if e.is_retryable() && attempt < retries => {
                    let delay = self.backoff.delay(attempt);
                    warn!(
                        url = %uri,
                        attempt = attempt + 1,
                        max_retries = retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Fetch failed, retrying"
                    );
                    self.metrics.record_transfer_retry();
                    if sleep_or_cancel(delay, &token).await.is_err() {
                        return Ok(None);
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fetch_once(
        &self,
        uri: &Url,
        request: &RequestConfig,
        token: &CancellationToken,
    ) -> Result<Bytes, DownloadError> {
        let route = Route::from_url(uri)?;
        let _permits = self.acquire(&route, token).await?;
        let response = self.send(Method::GET, uri, request, None, token).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::http_status(status, uri.as_str(), "GET"));
        }

        let mut consumer =
            BytesConsumer::new(self.config.max_in_memory_body, response.content_length())?;
        let mut stream = response.bytes_stream();
        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(DownloadError::Cancelled),
                next = stream.next() => next,
            };
            match next {
                Some(Ok(chunk)) => {
                    self.metrics.record_bytes_received(chunk.len() as u64);
                    consumer.consume(&chunk)?;
                }
                Some(Err(e)) => return Err(e.into()),
                None => break,
            }
        }
        Ok(consumer.finish())
    }

    /// Download `uri` into `dest`, resuming a partial file when possible.
    ///
    /// Returns `Ok(None)` when the manager is shut down before the transfer starts.
    pub async fn download_file(
        &self,
        uri: &Url,
        dest: &Path,
        key: Option<&DecryptionKey>,
        request: &RequestConfig,
        listener: &dyn TransferListener,
    ) -> Result<Option<PathBuf>, DownloadError> {
        self.download_file_with(
            uri,
            dest,
            key,
            request,
            listener,
            &TransferStrategy::default(),
        )
        .await
    }

    #[instrument(skip(self, key, request, listener, strategy), fields(url = %uri, dest = %dest.display()))]
    pub async fn download_file_with(
        &self,
        uri: &Url,
        dest: &Path,
        key: Option<&DecryptionKey>,
        request: &RequestConfig,
        listener: &dyn TransferListener,
        strategy: &TransferStrategy,
    ) -> Result<Option<PathBuf>, DownloadError> {
        let Some(_guard) = self.enter() else {
            return Ok(None);
        };
        let started = Instant::now();

        let result = self
            .with_cancellation(&strategy.token, |token| {
                self.download_with_retries(uri, dest, key, request, listener, strategy, token)
            })
            .await;

        match result {
            Ok(bytes) => {
                let elapsed = started.elapsed();
                self.metrics
                    .record_completed(bytes, elapsed.as_millis() as u64);
                debug!(bytes, elapsed_ms = elapsed.as_millis() as u64, "Transfer completed");
                listener.on_completed(uri, dest, bytes);
                Ok(Some(dest.to_path_buf()))
            }
            Err(DownloadError::Cancelled | DownloadError::Shutdown) => {
                self.metrics.record_cancelled();
                if strategy.token.is_cancelled() || !self.is_shut_down() {
                    Err(DownloadError::Cancelled)
                } else {
                    Err(DownloadError::Shutdown)
                }
            }
            Err(e) => {
                self.metrics.record_failed();
                listener.on_failed(uri, &e);
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn download_with_retries(
        &self,
        uri: &Url,
        dest: &Path,
        key: Option<&DecryptionKey>,
        request: &RequestConfig,
        listener: &dyn TransferListener,
        strategy: &TransferStrategy,
        token: CancellationToken,
    ) -> Result<u64, DownloadError> {
        let route = Route::from_url(uri)?;
        let retries = request.retry_count.unwrap_or(self.config.max_retries);

        let mut attempt = 0;
        loop {
            let result = self
                .attempt_download(uri, dest, key, request, listener, strategy, &route, &token)
                .await;
            let error = match result {
                Ok(bytes) => return Ok(bytes),
                Err(e @ (DownloadError::Cancelled | DownloadError::Shutdown)) => return Err(e),
                Err(e) => e,
            };

            if error.is_retryable() && attempt < retries {
                if self.is_shut_down() {
                    return Err(DownloadError::Shutdown);
                }
                let delay = self.backoff.delay(attempt);
                warn!(
                    url = %uri,
                    attempt = attempt + 1,
                    max_retries = retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Transfer attempt failed, retrying"
                );
                self.metrics.record_transfer_retry();
                sleep_or_cancel(delay, &token).await?;
                attempt += 1;
                continue;
            }

            warn!(url = %uri, attempts = attempt + 1, error = %error, "Transfer failed");
            remove_partial(dest).await;
            return Err(error);
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt_download(
        &self,
        uri: &Url,
        dest: &Path,
        key: Option<&DecryptionKey>,
        request: &RequestConfig,
        listener: &dyn TransferListener,
        strategy: &TransferStrategy,
        route: &Route,
        token: &CancellationToken,
    ) -> Result<u64, DownloadError> {
        // The local file holds plaintext, so an encrypted transfer always restarts.
        let decrypting = key.is_some();
        let local_size = if decrypting { 0 } else { local_size(dest).await };
        let remote_size = if decrypting || local_size == 0 {
            None
        } else {
            self.probe_size(uri, request, route, token).await?
        };

        if let Some(remote) = remote_size
            && remote == local_size
        {
            debug!(size = local_size, "Local file already complete");
            self.metrics.record_skipped();
            return Ok(local_size);
        }
        let offset = match remote_size {
            Some(remote) if local_size > remote => 0,
            _ => local_size,
        };

        let _permits = self.acquire(route, token).await?;
        let response = self
            .send(Method::GET, uri, request, (offset > 0).then_some(offset), token)
            .await?;
        let status = response.status();

        if status == StatusCode::RANGE_NOT_SATISFIABLE && offset > 0 {
            let total = ContentRange::from_headers(response.headers()).and_then(|r| r.total());
            if total == Some(offset) {
                debug!(size = offset, "Range not satisfiable, local file already complete");
                self.metrics.record_skipped();
                return Ok(offset);
            }
        }
        if !status.is_success() {
            return Err(DownloadError::http_status(status, uri.as_str(), "GET"));
        }

        let resume = self.resume_point(&response, offset)?;
        let total = remote_length(status, response.headers(), resume.offset);
        listener.on_started(uri, resume.offset, total);

        let staging = self.staging_buffer(strategy.buffers.as_ref());
        let sink = strategy
            .sink
            .open(dest, resume.append, self.config.buffer_size)
            .await?;
        let mut consumer = FileConsumer::new(
            sink,
            key.map(DecryptionKey::cipher),
            staging,
            self.config.buffer_size,
        );

        let mut received = resume.offset;
        let mut stream = response.bytes_stream();
        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    consumer.abort().await;
                    return Err(DownloadError::Cancelled);
                }
                next = stream.next() => next,
            };
            match next {
                Some(Ok(chunk)) => {
                    received += chunk.len() as u64;
                    self.metrics.record_bytes_received(chunk.len() as u64);
                    if let Err(e) = consumer.consume(&chunk).await {
                        consumer.abort().await;
                        return Err(e);
                    }
                    listener.on_progress(uri, received, total);
                }
                Some(Err(e)) => {
                    consumer.abort().await;
                    return Err(e.into());
                }
                None => break,
            }
        }

        if let Some(expected) = total
            && received < expected
        {
            consumer.abort().await;
            return Err(DownloadError::PartialTransfer {
                url: uri.to_string(),
                expected,
                received,
            });
        }

        let written = consumer.finish().await?;
        trace!(received, written, "Body stored");
        Ok(if decrypting {
            written
        } else {
            resume.offset + written
        })
    }

    /// Decide whether the body continues the local file or replaces it.
    fn resume_point(&self, response: &Response, offset: u64) -> Result<Resume, DownloadError> {
        if offset == 0 {
            return Ok(Resume {
                offset: 0,
                append: false,
            });
        }
        if response.status() != StatusCode::PARTIAL_CONTENT {
            debug!(offset, "Server ignored the range request, restarting");
            self.metrics.record_restart();
            return Ok(Resume {
                offset: 0,
                append: false,
            });
        }
        match ContentRange::from_headers(response.headers()) {
            Some(ContentRange::Bytes { start, .. }) if start == 0 => {
                self.metrics.record_restart();
                Ok(Resume {
                    offset: 0,
                    append: false,
                })
            }
            Some(ContentRange::Bytes { start, .. }) if start != offset => {
                Err(DownloadError::Internal {
                    reason: format!("server resumed at byte {start}, expected {offset}"),
                })
            }
            _ => {
                debug!(offset, "Resuming partial file");
                self.metrics.record_resume();
                Ok(Resume {
                    offset,
                    append: true,
                })
            }
        }
    }

    /// Learn the remote size with HEAD. Failures other than cancellation yield `None`.
    async fn probe_size(
        &self,
        uri: &Url,
        request: &RequestConfig,
        route: &Route,
        token: &CancellationToken,
    ) -> Result<Option<u64>, DownloadError> {
        let _permits = self.acquire(route, token).await?;
        match self.send(Method::HEAD, uri, request, None, token).await {
            Ok(response) if response.status().is_success() => {
                Ok(content_length(response.headers()))
            }
            Ok(response) => {
                debug!(status = %response.status(), "HEAD rejected, size unknown");
                Ok(None)
            }
            Err(DownloadError::Cancelled) => Err(DownloadError::Cancelled),
            Err(e) => {
                debug!(error = %e, "HEAD failed, size unknown");
                Ok(None)
            }
        }
    }

    fn staging_buffer(&self, buffers: Option<&BufferCoterie>) -> StagingBuffer {
        let staging = match buffers.map(BufferCoterie::allocate) {
            Some(Ok(lease)) => StagingBuffer::Pooled(lease),
            Some(Err(e)) => {
                debug!(error = %e, "Buffer pool unavailable, using an owned buffer");
                StagingBuffer::owned(self.config.buffer_size)
            }
            None => StagingBuffer::owned(self.config.buffer_size),
        };
        self.metrics.record_buffer(staging.is_pooled());
        staging
    }

    /// Send one request, applying the client-level retry strategy.
    async fn send(
        &self,
        method: Method,
        uri: &Url,
        request: &RequestConfig,
        range_from: Option<u64>,
        token: &CancellationToken,
    ) -> Result<Response, DownloadError> {
        let mut exec_count = 0u32;
        loop {
            exec_count += 1;
            let mut builder = self
                .client
                .request(method.clone(), uri.clone())
                .headers(request.headers.clone());
            if let Some(offset) = range_from {
                builder = builder.header(RANGE, range_header(offset));
            }
            if let Some(timeout) = request.timeout {
                builder = builder.timeout(timeout);
            }

            self.metrics.record_request();
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(DownloadError::Cancelled),
                result = builder.send() => result,
            };

            let delay = match result {
                Ok(response) => {
                    if !self.strategy.should_retry_on_response(
                        &method,
                        response.status(),
                        response.headers(),
                        exec_count,
                    ) {
                        return Ok(response);
                    }
                    let delay = self.strategy.retry_interval(
                        Some(response.headers()),
                        exec_count,
                        request.retry_interval,
                    );
                    warn!(
                        url = %uri,
                        %method,
                        status = %response.status(),
                        exec_count,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying request after response"
                    );
                    delay
                }
                Err(e) => {
                    let error = DownloadError::from(e);
                    if !self
                        .strategy
                        .should_retry_on_error(&method, &error, exec_count)
                    {
                        return Err(error);
                    }
                    let delay = self
                        .strategy
                        .retry_interval(None, exec_count, request.retry_interval);
                    warn!(
                        url = %uri,
                        %method,
                        exec_count,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Retrying request after error"
                    );
                    delay
                }
            };
            self.metrics.record_request_retry();
            sleep_or_cancel(delay, token).await?;
        }
    }

    async fn acquire(
        &self,
        route: &Route,
        token: &CancellationToken,
    ) -> Result<Permits, DownloadError> {
        let route_limit = self.route_limit(route);
        let acquire = async {
            let route = route_limit
                .acquire_owned()
                .await
                .map_err(|_| DownloadError::Shutdown)?;
            let total = Arc::clone(&self.connections)
                .acquire_owned()
                .await
                .map_err(|_| DownloadError::Shutdown)?;
            Ok(Permits {
                _route: route,
                _total: total,
            })
        };
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(DownloadError::Cancelled),
            permits = acquire => permits,
        }
    }

    fn route_limit(&self, route: &Route) -> Arc<Semaphore> {
        let mut routes = self.routes.lock();
        Arc::clone(routes.entry(route.clone()).or_insert_with(|| {
            Arc::new(Semaphore::new(self.config.max_connections_per_route))
        }))
    }

    fn enter(&self) -> Option<InFlight<'_>> {
        if self.is_shut_down() {
            return None;
        }
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        Some(InFlight { manager: self })
    }

    /// Run `work` with a token that fires on either the caller's token or shutdown.
    async fn with_cancellation<F, T>(
        &self,
        caller: &CancellationToken,
        work: impl FnOnce(CancellationToken) -> F,
    ) -> T
    where
        F: Future<Output = T>,
    {
        let token = self.shutdown_token.child_token();
        let work = work(token.clone());
        tokio::pin!(work);
        tokio::select! {
            biased;
            out = &mut work => out,
            _ = caller.cancelled() => {
                token.cancel();
                work.await
            }
        }
    }

    /// Stop accepting work, wait up to `grace` for in-flight transfers, then
    /// cancel whatever is left. Calling it again is a no-op.
    pub async fn shutdown(&self, grace: Duration) {
        if self
            .state
            .compare_exchange(RUNNING, DRAINING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Transfer manager already shut down");
            return;
        }
        info!(
            in_flight = self.in_flight(),
            grace_ms = grace.as_millis() as u64,
            "Shutting down transfer manager"
        );

        let drained = tokio::time::timeout(grace, async {
            loop {
                let notified = self.idle.notified();
                if self.in_flight() == 0 {
                    break;
                }
                notified.await;
            }
        })
        .await
        .is_ok();
        if !drained {
            warn!(
                in_flight = self.in_flight(),
                "Grace period elapsed, cancelling in-flight transfers"
            );
        }

        self.shutdown_token.cancel();
        self.state.store(TERMINATED, Ordering::Release);
        self.metrics.log_summary();
    }
}

impl std::fmt::Debug for TransferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferManager")
            .field("state", &self.state.load(Ordering::Relaxed))
            .field("in_flight", &self.in_flight())
            .field("available_connections", &self.connections.available_permits())
            .finish()
    }
}

async fn local_size(path: &Path) -> u64 {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => meta.len(),
        _ => 0,
    }
}

async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed partial file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove partial file"),
    }
}
