//! Scriptable HTTP server for transfer tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockEncryptMut, KeyIvInit};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use url::Url;

/// What the server answers for each path.
#[derive(Default)]
pub struct Script {
    files: HashMap<String, Bytes>,
    failures: HashMap<String, u32>,
    throttles: HashMap<String, u32>,
    truncations: HashMap<String, (u32, usize)>,
    ignore_range: HashSet<String>,
    no_head: HashSet<String>,
    delays: HashMap<String, Duration>,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file(mut self, path: &str, body: impl Into<Bytes>) -> Self {
        self.files.insert(path.to_owned(), body.into());
        self
    }

    /// Answer the first `count` requests for `path` with 503.
    pub fn failing(mut self, path: &str, count: u32) -> Self {
        self.failures.insert(path.to_owned(), count);
        self
    }

    /// Answer the first `count` requests for `path` with 429 and `Retry-After: 1`.
    pub fn throttled(mut self, path: &str, count: u32) -> Self {
        self.throttles.insert(path.to_owned(), count);
        self
    }

    /// Cut the body of the first `count` GETs for `path` short by `missing`
    /// bytes while still announcing the full length.
    pub fn truncated(mut self, path: &str, count: u32, missing: usize) -> Self {
        self.truncations.insert(path.to_owned(), (count, missing));
        self
    }

    /// Serve the whole body with 200 even when a range is requested.
    pub fn ignoring_range(mut self, path: &str) -> Self {
        self.ignore_range.insert(path.to_owned());
        self
    }

    /// Reject HEAD for `path` with 405.
    pub fn without_head(mut self, path: &str) -> Self {
        self.no_head.insert(path.to_owned());
        self
    }

    /// Sleep before answering any request for `path`.
    pub fn delayed(mut self, path: &str, delay: Duration) -> Self {
        self.delays.insert(path.to_owned(), delay);
        self
    }
}

#[derive(Default)]
struct Counters {
    gets: HashMap<String, usize>,
    heads: HashMap<String, usize>,
}

struct ServerState {
    script: Script,
    remaining_failures: Mutex<HashMap<String, u32>>,
    remaining_throttles: Mutex<HashMap<String, u32>>,
    remaining_truncations: Mutex<HashMap<String, (u32, usize)>>,
    counters: Mutex<Counters>,
    total: AtomicUsize,
}

pub struct TestServer {
    base_url: Url,
    state: Arc<ServerState>,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl TestServer {
    pub async fn start(script: Script) -> Self {
        let state = Arc::new(ServerState {
            remaining_failures: Mutex::new(script.failures.clone()),
            remaining_throttles: Mutex::new(script.throttles.clone()),
            remaining_truncations: Mutex::new(script.truncations.clone()),
            script,
            counters: Mutex::new(Counters::default()),
            total: AtomicUsize::new(0),
        });
        let router = Router::new()
            .fallback(serve)
            .with_state(Arc::clone(&state));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        let server = axum::serve(listener, router).with_graceful_shutdown(async {
            shutdown_rx.await.ok();
        });
        tokio::spawn(async move {
            server.await.unwrap();
        });

        Self {
            base_url: Url::parse(&format!("http://{addr}")).unwrap(),
            state,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    pub fn url(&self, path: &str) -> Url {
        self.base_url.join(path).unwrap()
    }

    pub fn gets(&self, path: &str) -> usize {
        self.state.counters.lock().gets.get(path).copied().unwrap_or(0)
    }

    pub fn heads(&self, path: &str) -> usize {
        self.state.counters.lock().heads.get(path).copied().unwrap_or(0)
    }

    pub fn total_requests(&self) -> usize {
        self.state.total.load(Ordering::SeqCst)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
    }
}

async fn serve(
    State(state): State<Arc<ServerState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let path = uri.path().to_owned();
    state.total.fetch_add(1, Ordering::SeqCst);
    {
        let mut counters = state.counters.lock();
        let counter = if method == Method::HEAD {
            &mut counters.heads
        } else {
            &mut counters.gets
        };
        *counter.entry(path.clone()).or_insert(0) += 1;
    }

    if let Some(delay) = state.script.delays.get(&path) {
        tokio::time::sleep(*delay).await;
    }

    if take_one(&state.remaining_failures, &path) {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    if take_one(&state.remaining_throttles, &path) {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            [(header::RETRY_AFTER, "1")],
        )
            .into_response();
    }

    let Some(body) = state.script.files.get(&path).cloned() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let len = body.len() as u64;

    if method == Method::HEAD {
        if state.script.no_head.contains(&path) {
            return StatusCode::METHOD_NOT_ALLOWED.into_response();
        }
        return (
            StatusCode::OK,
            [(header::CONTENT_LENGTH, len.to_string())],
            body,
        )
            .into_response();
    }

    if let Some(missing) = take_truncation(&state.remaining_truncations, &path) {
        // Chunked, so the short body ends cleanly on the wire.
        let cut = body.len().saturating_sub(missing);
        let chunks = [body.slice(..cut / 2), body.slice(cut / 2..cut)]
            .into_iter()
            .map(Ok::<_, std::io::Error>);
        return Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_RANGE, format!("bytes 0-{}/{len}", len - 1))
            .body(Body::from_stream(futures::stream::iter(chunks)))
            .unwrap();
    }

    let range_start = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("bytes="))
        .and_then(|v| v.strip_suffix('-'))
        .and_then(|v| v.parse::<u64>().ok());

    match range_start {
        Some(start) if !state.script.ignore_range.contains(&path) => {
            if start >= len {
                return Response::builder()
                    .status(StatusCode::RANGE_NOT_SATISFIABLE)
                    .header(header::CONTENT_RANGE, format!("bytes */{len}"))
                    .body(Body::empty())
                    .unwrap();
            }
            Response::builder()
                .status(StatusCode::PARTIAL_CONTENT)
                .header(
                    header::CONTENT_RANGE,
                    format!("bytes {start}-{}/{len}", len - 1),
                )
                .body(Body::from(body.slice(start as usize..)))
                .unwrap()
        }
        _ => (StatusCode::OK, body).into_response(),
    }
}

fn take_one(remaining: &Mutex<HashMap<String, u32>>, path: &str) -> bool {
    let mut remaining = remaining.lock();
    match remaining.get_mut(path) {
        Some(left) if *left > 0 => {
            *left -= 1;
            true
        }
        _ => false,
    }
}

fn take_truncation(remaining: &Mutex<HashMap<String, (u32, usize)>>, path: &str) -> Option<usize> {
    let mut remaining = remaining.lock();
    match remaining.get_mut(path) {
        Some((left, missing)) if *left > 0 => {
            *left -= 1;
            Some(*missing)
        }
        _ => None,
    }
}

/// Deterministic, non-repeating test payload.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

pub fn encrypt(plaintext: &[u8], key: &[u8; 16], iv: &[u8; 16]) -> Vec<u8> {
    let cipher = cbc::Encryptor::<aes::Aes128>::new_from_slices(key, iv).unwrap();
    let mut buffer = vec![0u8; (plaintext.len() / 16 + 1) * 16];
    buffer[..plaintext.len()].copy_from_slice(plaintext);
    cipher
        .encrypt_padded_mut::<Pkcs7>(&mut buffer, plaintext.len())
        .unwrap()
        .to_vec()
}
