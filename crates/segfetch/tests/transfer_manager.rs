mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Script, TestServer, encrypt, payload};
use segfetch_engine::{
    BufferPool, DecryptionKey, DownloadError, EngineConfig, NoopListener, RequestConfig, SinkMode,
    TransferManager, TransferStrategy,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn config() -> EngineConfig {
    EngineConfig {
        retry_interval: Duration::from_millis(10),
        buffer_size: 1024,
        ..EngineConfig::default()
    }
}

fn manager() -> TransferManager {
    TransferManager::new(config()).unwrap()
}

async fn download(
    manager: &TransferManager,
    server: &TestServer,
    path: &str,
    dest: &std::path::Path,
) -> Result<Option<std::path::PathBuf>, DownloadError> {
    manager
        .download_file(
            &server.url(path),
            dest,
            None,
            &RequestConfig::default(),
            &NoopListener,
        )
        .await
}

#[tokio::test]
async fn fresh_download_skips_head() {
    let body = payload(5000);
    let server = TestServer::start(Script::new().file("/seg.ts", body.clone())).await;
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("nested/seg.ts");

    let manager = manager();
    let path = download(&manager, &server, "/seg.ts", &dest).await.unwrap();

    assert_eq!(path.as_deref(), Some(dest.as_path()));
    assert_eq!(std::fs::read(&dest).unwrap(), body);
    assert_eq!(server.heads("/seg.ts"), 0);
    assert_eq!(server.gets("/seg.ts"), 1);

    let metrics = manager.metrics().snapshot();
    assert_eq!(metrics.completed, 1);
    assert_eq!(metrics.bytes_written, 5000);
}

#[tokio::test]
async fn complete_local_file_is_not_fetched_again() {
    let body = payload(4096);
    let server = TestServer::start(Script::new().file("/seg.ts", body.clone())).await;
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("seg.ts");
    std::fs::write(&dest, &body).unwrap();

    let manager = manager();
    download(&manager, &server, "/seg.ts", &dest).await.unwrap();

    assert_eq!(server.heads("/seg.ts"), 1);
    assert_eq!(server.gets("/seg.ts"), 0);
    assert_eq!(manager.metrics().snapshot().skipped, 1);
    assert_eq!(std::fs::read(&dest).unwrap(), body);
}

#[tokio::test]
async fn partial_file_is_resumed() {
    let body = payload(5000);
    let server = TestServer::start(Script::new().file("/seg.ts", body.clone())).await;
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("seg.ts");
    std::fs::write(&dest, &body[..1000]).unwrap();

    let manager = manager();
    download(&manager, &server, "/seg.ts", &dest).await.unwrap();

    assert_eq!(std::fs::read(&dest).unwrap(), body);
    let metrics = manager.metrics().snapshot();
    assert_eq!(metrics.resumes, 1);
    assert_eq!(metrics.bytes_received, 4000);
}

#[tokio::test]
async fn ignored_range_restarts_from_zero() {
    let body = payload(3000);
    let server = TestServer::start(
        Script::new()
            .file("/seg.ts", body.clone())
            .ignoring_range("/seg.ts"),
    )
    .await;
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("seg.ts");
    std::fs::write(&dest, &body[..700]).unwrap();

    let manager = manager();
    download(&manager, &server, "/seg.ts", &dest).await.unwrap();

    assert_eq!(std::fs::read(&dest).unwrap(), body);
    assert_eq!(manager.metrics().snapshot().restarts, 1);
}

#[tokio::test]
async fn oversized_local_file_is_replaced() {
    let body = payload(2000);
    let server = TestServer::start(Script::new().file("/seg.ts", body.clone())).await;
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("seg.ts");
    std::fs::write(&dest, vec![0xAAu8; 2500]).unwrap();

    download(&manager(), &server, "/seg.ts", &dest)
        .await
        .unwrap();

    assert_eq!(std::fs::read(&dest).unwrap(), body);
}

#[tokio::test]
async fn unsatisfiable_range_at_full_size_counts_as_complete() {
    let body = payload(1500);
    let server = TestServer::start(
        Script::new()
            .file("/seg.ts", body.clone())
            .without_head("/seg.ts"),
    )
    .await;
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("seg.ts");
    std::fs::write(&dest, &body).unwrap();

    let manager = manager();
    let path = download(&manager, &server, "/seg.ts", &dest).await.unwrap();

    assert!(path.is_some());
    assert_eq!(server.gets("/seg.ts"), 1);
    assert_eq!(manager.metrics().snapshot().skipped, 1);
    assert_eq!(std::fs::read(&dest).unwrap(), body);
}

#[tokio::test]
async fn encrypted_segment_is_decrypted_from_scratch() {
    let key = [7u8; 16];
    let iv = DecryptionKey::iv_from_sequence(42);
    let plaintext = payload(10_000);
    let server = TestServer::start(
        Script::new().file("/enc.ts", encrypt(&plaintext, &key, &iv)),
    )
    .await;
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("enc.ts");
    // A stale partial plaintext file must never be appended to.
    std::fs::write(&dest, &plaintext[..512]).unwrap();

    let manager = manager();
    let decryption = DecryptionKey::aes128(key, iv);
    manager
        .download_file(
            &server.url("/enc.ts"),
            &dest,
            Some(&decryption),
            &RequestConfig::default(),
            &NoopListener,
        )
        .await
        .unwrap();

    assert_eq!(std::fs::read(&dest).unwrap(), plaintext);
    assert_eq!(server.heads("/enc.ts"), 0);
    assert_eq!(manager.metrics().snapshot().resumes, 0);
}

#[tokio::test]
async fn server_errors_are_retried_until_success() {
    let body = payload(800);
    let server = TestServer::start(
        Script::new()
            .file("/flaky.ts", body.clone())
            .failing("/flaky.ts", 2),
    )
    .await;
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("flaky.ts");

    let manager = manager();
    download(&manager, &server, "/flaky.ts", &dest)
        .await
        .unwrap();

    assert_eq!(std::fs::read(&dest).unwrap(), body);
    assert_eq!(server.gets("/flaky.ts"), 3);
    assert_eq!(manager.metrics().snapshot().transfer_retries, 2);
}

#[tokio::test]
async fn retries_are_bounded_by_request_config() {
    let server = TestServer::start(
        Script::new()
            .file("/down.ts", payload(10))
            .failing("/down.ts", 100),
    )
    .await;
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("down.ts");

    let manager = manager();
    let result = manager
        .download_file(
            &server.url("/down.ts"),
            &dest,
            None,
            &RequestConfig::default().with_retry_count(1),
            &NoopListener,
        )
        .await;

    assert!(matches!(
        result,
        Err(DownloadError::HttpStatus { status, .. }) if status.as_u16() == 503
    ));
    assert_eq!(server.gets("/down.ts"), 2);
    assert_eq!(manager.metrics().snapshot().failed, 1);
}

#[tokio::test]
async fn throttled_request_is_retried_after_retry_after() {
    let body = payload(600);
    let server = TestServer::start(
        Script::new()
            .file("/busy.ts", body.clone())
            .throttled("/busy.ts", 1),
    )
    .await;
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("busy.ts");

    let manager = manager();
    let started = std::time::Instant::now();
    download(&manager, &server, "/busy.ts", &dest).await.unwrap();

    assert!(started.elapsed() >= Duration::from_millis(900));
    assert_eq!(std::fs::read(&dest).unwrap(), body);
    assert_eq!(server.gets("/busy.ts"), 2);
    let metrics = manager.metrics().snapshot();
    assert_eq!(metrics.request_retries, 1);
    assert_eq!(metrics.transfer_retries, 0);
    assert_eq!(metrics.completed, 1);
}

#[tokio::test]
async fn short_body_is_resumed_on_retry() {
    let body = payload(6000);
    let server = TestServer::start(
        Script::new()
            .file("/short.ts", body.clone())
            .truncated("/short.ts", 1, 32),
    )
    .await;
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("short.ts");

    let manager = manager();
    download(&manager, &server, "/short.ts", &dest).await.unwrap();

    assert_eq!(std::fs::read(&dest).unwrap(), body);
    assert_eq!(server.gets("/short.ts"), 2);
    let metrics = manager.metrics().snapshot();
    assert_eq!(metrics.transfer_retries, 1);
    assert_eq!(metrics.resumes, 1);
}

#[tokio::test]
async fn short_body_without_retries_is_partial_transfer() {
    let server = TestServer::start(
        Script::new()
            .file("/short.ts", payload(6000))
            .truncated("/short.ts", 1, 32),
    )
    .await;
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("short.ts");

    let result = manager()
        .download_file(
            &server.url("/short.ts"),
            &dest,
            None,
            &RequestConfig::default().with_retry_count(0),
            &NoopListener,
        )
        .await;

    assert!(matches!(
        result,
        Err(DownloadError::PartialTransfer { expected: 6000, received: 5968, .. })
    ));
    assert!(!dest.exists());
}

#[tokio::test]
async fn short_encrypted_body_is_retried() {
    let key = [3u8; 16];
    let iv = DecryptionKey::iv_from_sequence(7);
    let plaintext = payload(10_000);
    let server = TestServer::start(
        Script::new()
            .file("/enc.ts", encrypt(&plaintext, &key, &iv))
            .truncated("/enc.ts", 1, 32),
    )
    .await;
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("enc.ts");

    let manager = manager();
    let decryption = DecryptionKey::aes128(key, iv);
    manager
        .download_file(
            &server.url("/enc.ts"),
            &dest,
            Some(&decryption),
            &RequestConfig::default(),
            &NoopListener,
        )
        .await
        .unwrap();

    assert_eq!(std::fs::read(&dest).unwrap(), plaintext);
    assert_eq!(server.gets("/enc.ts"), 2);
    assert_eq!(server.heads("/enc.ts"), 0);
    assert_eq!(manager.metrics().snapshot().transfer_retries, 1);
}

#[tokio::test]
async fn not_found_fails_and_removes_partial_file() {
    let server = TestServer::start(Script::new()).await;
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("missing.ts");
    std::fs::write(&dest, b"stale").unwrap();

    let result = download(&manager(), &server, "/missing.ts", &dest).await;

    assert!(matches!(
        result,
        Err(DownloadError::HttpStatus { status, .. }) if status.as_u16() == 404
    ));
    assert!(!dest.exists());
    assert_eq!(server.gets("/missing.ts"), 1);
}

#[tokio::test]
async fn shut_down_manager_returns_none() {
    let server = TestServer::start(Script::new().file("/seg.ts", payload(10))).await;
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("seg.ts");

    let manager = manager();
    manager.shutdown(Duration::from_millis(10)).await;

    let result = download(&manager, &server, "/seg.ts", &dest).await.unwrap();
    assert!(result.is_none());
    assert_eq!(server.total_requests(), 0);
}

#[tokio::test]
async fn cancelled_transfer_keeps_partial_file() {
    let server = TestServer::start(
        Script::new()
            .file("/slow.ts", payload(100))
            .delayed("/slow.ts", Duration::from_secs(5)),
    )
    .await;
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("slow.ts");
    std::fs::write(&dest, b"partial").unwrap();

    let manager = manager();
    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });

    let result = tokio::time::timeout(
        Duration::from_secs(3),
        manager.download_file_with(
            &server.url("/slow.ts"),
            &dest,
            None,
            &RequestConfig::default(),
            &NoopListener,
            &TransferStrategy::new(token),
        ),
    )
    .await
    .expect("cancellation must interrupt the transfer");

    assert!(matches!(result, Err(DownloadError::Cancelled)));
    assert!(dest.exists());
    assert_eq!(manager.metrics().snapshot().cancelled, 1);
}

#[tokio::test]
async fn shutdown_interrupts_in_flight_transfer() {
    let server = TestServer::start(
        Script::new()
            .file("/slow.ts", payload(100))
            .delayed("/slow.ts", Duration::from_secs(5)),
    )
    .await;
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("slow.ts");

    let manager = Arc::new(manager());
    let worker = {
        let manager = Arc::clone(&manager);
        let url = server.url("/slow.ts");
        let dest = dest.clone();
        tokio::spawn(async move {
            manager
                .download_file(&url, &dest, None, &RequestConfig::default(), &NoopListener)
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(manager.in_flight(), 1);
    manager.shutdown(Duration::from_millis(50)).await;

    let result = worker.await.unwrap();
    assert!(matches!(result, Err(DownloadError::Shutdown)));
    assert_eq!(manager.in_flight(), 0);
}

#[tokio::test]
async fn failure_while_draining_reports_shutdown() {
    let server = TestServer::start(
        Script::new()
            .file("/down.ts", payload(10))
            .failing("/down.ts", 100)
            .delayed("/down.ts", Duration::from_millis(200)),
    )
    .await;
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("down.ts");

    let manager = Arc::new(manager());
    let worker = {
        let manager = Arc::clone(&manager);
        let url = server.url("/down.ts");
        let dest = dest.clone();
        tokio::spawn(async move {
            manager
                .download_file(&url, &dest, None, &RequestConfig::default(), &NoopListener)
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    manager.shutdown(Duration::from_secs(5)).await;

    let result = worker.await.unwrap();
    assert!(matches!(result, Err(DownloadError::Shutdown)));
    assert_eq!(server.gets("/down.ts"), 1);
}

#[tokio::test]
async fn channel_sink_with_pooled_buffer() {
    let body = payload(20_000);
    let server = TestServer::start(Script::new().file("/big.ts", body.clone())).await;
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("big.ts");

    let manager = manager();
    let pool = BufferPool::new(manager.config());
    let coterie = pool.coterie();
    let strategy = TransferStrategy::new(CancellationToken::new())
        .with_sink(SinkMode::Channel)
        .with_buffers(coterie.clone());

    manager
        .download_file_with(
            &server.url("/big.ts"),
            &dest,
            None,
            &RequestConfig::default(),
            &NoopListener,
            &strategy,
        )
        .await
        .unwrap();

    assert_eq!(std::fs::read(&dest).unwrap(), body);
    assert_eq!(manager.metrics().snapshot().pooled_buffers, 1);
    assert_eq!(coterie.outstanding(), 0);
}

#[tokio::test]
async fn fetch_bytes_collects_body() {
    let server = TestServer::start(Script::new().file("/key.bin", vec![9u8; 16])).await;
    let bytes = manager()
        .fetch_bytes(&server.url("/key.bin"), &RequestConfig::default())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(bytes.as_ref(), &[9u8; 16]);
}

#[tokio::test]
async fn fetch_bytes_enforces_body_limit() {
    let server = TestServer::start(Script::new().file("/big.bin", payload(4096))).await;
    let manager = TransferManager::new(EngineConfig {
        max_in_memory_body: 1024,
        ..config()
    })
    .unwrap();

    let result = manager
        .fetch_bytes(&server.url("/big.bin"), &RequestConfig::default())
        .await;
    assert!(matches!(result, Err(DownloadError::BodyTooLarge { limit: 1024 })));
}
