//! Integration tests for the sync session and upload queue.

use driftsync_client::{
    ConnectionMethod, CrudEntry, Frame, LocalStorage, MemoryQueueStore, MemoryStorage,
    MockConnector, QueueStore, RetryConfig, StreamHandle, SyncClient, SyncConnector, SyncError,
    SyncOptions, SyncResult,
};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

const WAIT_TIMEOUT: Duration = Duration::from_secs(3);

/// Polls a condition until it holds or the wait window expires.
async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for: {what}");
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

fn test_options() -> SyncOptions {
    SyncOptions::new()
        .with_crud_upload_throttle(Duration::ZERO)
        .with_retry(RetryConfig::immediate())
}

struct Harness {
    client: SyncClient<MemoryStorage>,
    storage: Arc<MemoryStorage>,
    connector: Arc<MockConnector>,
}

fn make_harness() -> Harness {
    let storage = Arc::new(MemoryStorage::new());
    let client = SyncClient::new(
        Arc::clone(&storage),
        Arc::new(MemoryQueueStore::new()) as Arc<dyn QueueStore>,
    )
    .unwrap();

    Harness {
        client,
        storage,
        connector: Arc::new(MockConnector::new()),
    }
}

async fn connect(harness: &Harness) {
    harness
        .client
        .connect(Arc::clone(&harness.connector), test_options())
        .await;
    harness.client.wait_for_status(|s| s.connected).await;
}

#[tokio::test]
async fn connect_establishes_stream_and_applies_frames() {
    let harness = make_harness();
    connect(&harness).await;

    assert_eq!(harness.connector.stream_requests(), 1);
    assert!(harness.client.current_status().connected);

    let stream = harness.connector.current_stream().unwrap();
    assert!(stream.send(Frame::data(vec![1u8, 2, 3])).await);
    assert!(stream.send(Frame::keepalive()).await);

    harness
        .client
        .wait_for_status(|s| s.last_synced_at.is_some())
        .await;

    // Keepalives are liveness only; just the data frame reached storage.
    assert_eq!(harness.storage.applied_frame_count(), 1);

    harness.client.disconnect().await;
    assert!(!harness.client.current_status().connected);
}

#[tokio::test]
async fn reconnects_on_closed_stream() {
    let harness = make_harness();
    connect(&harness).await;

    // Close the stream; a new one must be requested without any caller
    // involvement, and connected must come back.
    harness.connector.close_stream();
    harness.connector.wait_for_stream_requests(2).await;
    harness.client.wait_for_status(|s| s.connected).await;

    assert!(harness.client.connection_state().is_active());
    harness.client.disconnect().await;
}

#[tokio::test]
async fn second_connect_call_forces_reconnect() {
    let harness = make_harness();
    connect(&harness).await;

    // Connect again with a fresh connector; a new stream is requested
    // from it and the old session is torn down.
    let replacement = Arc::new(MockConnector::new());
    harness
        .client
        .connect(Arc::clone(&replacement), test_options())
        .await;

    replacement.wait_for_stream_requests(1).await;
    harness.client.wait_for_status(|s| s.connected).await;
    assert_eq!(harness.connector.stream_requests(), 1);

    harness.client.disconnect().await;
}

#[tokio::test]
async fn upload_triggered_by_local_write_while_connected() {
    let harness = make_harness();
    connect(&harness).await;

    harness
        .client
        .execute(
            "INSERT INTO users (id, name) VALUES (?, ?)",
            &[json!("row-1"), json!("alice")],
        )
        .unwrap();

    let connector = Arc::clone(&harness.connector);
    let queue = Arc::clone(harness.client.queue());
    wait_until("the single upload to happen", || {
        connector.upload_calls() == 1 && queue.is_empty()
    })
    .await;

    // Nothing further to upload; the call count must not move.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(harness.connector.upload_calls(), 1);

    harness.client.disconnect().await;
}

#[tokio::test]
async fn failed_uploads_retry_until_success() {
    let harness = make_harness();
    connect(&harness).await;

    // Two failures, then the default complete-the-head behavior.
    harness.connector.fail_uploads(2);

    harness
        .client
        .execute("INSERT INTO users (id) VALUES (?)", &[json!("row-1")])
        .unwrap();

    let connector = Arc::clone(&harness.connector);
    let queue = Arc::clone(harness.client.queue());
    wait_until("three upload attempts", || {
        connector.upload_calls() == 3 && queue.is_empty()
    })
    .await;

    let status = harness.client.current_status();
    assert!(status.upload_error.is_none());
    assert!(!status.data_flow.uploading);

    harness.client.disconnect().await;
}

#[tokio::test]
async fn upload_error_is_published_while_retrying() {
    let harness = make_harness();
    connect(&harness).await;

    harness.connector.fail_uploads(1);
    harness
        .client
        .execute("INSERT INTO users (id) VALUES (?)", &[json!("row-1")])
        .unwrap();

    harness
        .client
        .wait_for_status(|s| s.upload_error.is_some())
        .await;

    // The retry succeeds and the error clears.
    harness
        .client
        .wait_for_status(|s| s.upload_error.is_none())
        .await;
    let queue = Arc::clone(harness.client.queue());
    wait_until("queue drained", || queue.is_empty()).await;

    harness.client.disconnect().await;
}

#[tokio::test]
async fn transactions_upload_strictly_in_order() {
    let harness = make_harness();
    connect(&harness).await;

    harness.connector.fail_uploads(2);
    harness
        .client
        .execute("INSERT INTO users (id) VALUES (?)", &[json!("a")])
        .unwrap();
    harness
        .client
        .execute("INSERT INTO users (id) VALUES (?)", &[json!("b")])
        .unwrap();

    // Two failed attempts on the head, then one success per transaction.
    let connector = Arc::clone(&harness.connector);
    let queue = Arc::clone(harness.client.queue());
    wait_until("both transactions drained", || {
        connector.upload_calls() == 4 && queue.is_empty()
    })
    .await;

    harness.client.disconnect().await;
}

#[tokio::test]
async fn uploads_resume_after_reconnecting() {
    let harness = make_harness();
    connect(&harness).await;
    harness.client.disconnect().await;

    // Offline write: enqueued, not uploaded.
    harness
        .client
        .execute("INSERT INTO users (id) VALUES (?)", &[json!("row-1")])
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(harness.connector.upload_calls(), 0);
    assert_eq!(harness.client.queue().len(), 1);

    connect(&harness).await;

    let connector = Arc::clone(&harness.connector);
    let queue = Arc::clone(harness.client.queue());
    wait_until("the offline write to upload", || {
        connector.upload_calls() == 1 && queue.is_empty()
    })
    .await;

    harness.client.disconnect().await;
}

/// A connector whose upload blocks until the test releases it, to pin
/// down the `uploading` flag mid-attempt.
struct GatedConnector {
    inner: MockConnector,
    started: Notify,
    release: Notify,
}

impl GatedConnector {
    fn new() -> Self {
        Self {
            inner: MockConnector::new(),
            started: Notify::new(),
            release: Notify::new(),
        }
    }
}

impl SyncConnector for GatedConnector {
    fn open_stream(
        &self,
        method: ConnectionMethod,
    ) -> impl Future<Output = SyncResult<StreamHandle>> + Send {
        self.inner.open_stream(method)
    }

    fn upload_data(
        &self,
        queue: Arc<driftsync_client::CrudQueue>,
    ) -> impl Future<Output = SyncResult<()>> + Send {
        async move {
            self.started.notify_one();
            self.release.notified().await;
            self.inner.upload_data(queue).await
        }
    }
}

#[tokio::test]
async fn uploading_flag_spans_exactly_one_attempt() {
    let storage = Arc::new(MemoryStorage::new());
    let client = SyncClient::new(
        Arc::clone(&storage),
        Arc::new(MemoryQueueStore::new()) as Arc<dyn QueueStore>,
    )
    .unwrap();
    let connector = Arc::new(GatedConnector::new());

    client.connect(Arc::clone(&connector), test_options()).await;
    client.wait_for_status(|s| s.connected).await;
    assert!(!client.current_status().data_flow.uploading);

    client
        .execute("INSERT INTO users (id) VALUES (?)", &[json!("row-1")])
        .unwrap();

    // The attempt has started but not resolved: uploading must be true.
    connector.started.notified().await;
    assert!(client.current_status().data_flow.uploading);

    connector.release.notify_one();
    client
        .wait_for_status(|s| !s.data_flow.uploading)
        .await;
    let queue = Arc::clone(client.queue());
    wait_until("queue drained", || queue.is_empty()).await;

    client.disconnect().await;
}

#[tokio::test]
async fn fatal_download_error_is_not_retried_in_a_loop() {
    let harness = make_harness();
    harness.connector.set_fatal_download_errors(true);
    harness.connector.fail_stream_opens(1);

    harness
        .client
        .connect(Arc::clone(&harness.connector), test_options())
        .await;

    harness
        .client
        .wait_for_status(|s| s.download_error.is_some())
        .await;

    // The session parks on connector readiness instead of hammering the
    // connector with open requests.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.connector.stream_requests(), 1);
    assert!(!harness.client.current_status().connected);

    harness.client.disconnect().await;
}

#[tokio::test]
async fn transient_open_failures_retry_with_backoff() {
    let harness = make_harness();
    harness.connector.fail_stream_opens(2);

    harness
        .client
        .connect(Arc::clone(&harness.connector), test_options())
        .await;
    harness.client.wait_for_status(|s| s.connected).await;

    // Two failed requests plus the successful one.
    assert_eq!(harness.connector.stream_requests(), 3);
    assert!(harness.client.current_status().download_error.is_none());

    harness.client.disconnect().await;
}

/// Storage that rejects every frame and write.
struct FailingStorage;

impl LocalStorage for FailingStorage {
    fn apply_frame(&self, _frame: &Frame) -> SyncResult<()> {
        Err(SyncError::storage("apply failed"))
    }

    fn execute(
        &self,
        _sql: &str,
        _params: &[serde_json::Value],
    ) -> SyncResult<Vec<CrudEntry>> {
        Err(SyncError::storage("write failed"))
    }

    fn clear(&self) -> SyncResult<()> {
        Ok(())
    }
}

/// A connector that pushes one data frame as soon as a stream opens, so
/// every reconnect immediately re-delivers a frame.
struct FrameOnOpenConnector {
    inner: MockConnector,
}

impl FrameOnOpenConnector {
    fn new() -> Self {
        Self {
            inner: MockConnector::new(),
        }
    }

    fn stream_requests(&self) -> u64 {
        self.inner.stream_requests()
    }
}

impl SyncConnector for FrameOnOpenConnector {
    fn open_stream(
        &self,
        method: ConnectionMethod,
    ) -> impl Future<Output = SyncResult<StreamHandle>> + Send {
        async move {
            let handle = self.inner.open_stream(method).await?;
            if let Some(stream) = self.inner.current_stream() {
                let _ = stream.send(Frame::data(vec![0u8])).await;
            }
            Ok(handle)
        }
    }

    fn upload_data(
        &self,
        queue: Arc<driftsync_client::CrudQueue>,
    ) -> impl Future<Output = SyncResult<()>> + Send {
        self.inner.upload_data(queue)
    }
}

#[tokio::test]
async fn recurring_apply_failure_reconnects_with_backoff() {
    let client = SyncClient::new(
        Arc::new(FailingStorage),
        Arc::new(MemoryQueueStore::new()) as Arc<dyn QueueStore>,
    )
    .unwrap();
    let connector = Arc::new(FrameOnOpenConnector::new());

    let retry = RetryConfig {
        initial_delay: Duration::from_millis(200),
        max_delay: Duration::from_secs(1),
        backoff_multiplier: 2.0,
        add_jitter: false,
    };
    client
        .connect(
            Arc::clone(&connector),
            SyncOptions::new()
                .with_crud_upload_throttle(Duration::ZERO)
                .with_retry(retry),
        )
        .await;

    client
        .wait_for_status(|s| s.download_error.is_some())
        .await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    // The frame fails to apply on every new stream; reconnects must be
    // spaced by backoff, not requested in a tight loop.
    assert!(
        connector.stream_requests() <= 4,
        "opened {} streams",
        connector.stream_requests()
    );

    client.disconnect().await;
}

#[tokio::test]
async fn first_upload_is_not_delayed_by_throttle() {
    let harness = make_harness();
    harness
        .client
        .connect(
            Arc::clone(&harness.connector),
            SyncOptions::new()
                .with_crud_upload_throttle(Duration::from_secs(1))
                .with_retry(RetryConfig::immediate()),
        )
        .await;
    harness.client.wait_for_status(|s| s.connected).await;

    let started = std::time::Instant::now();
    harness
        .client
        .execute("INSERT INTO users (id) VALUES (?)", &[json!("row-1")])
        .unwrap();

    let connector = Arc::clone(&harness.connector);
    wait_until("the first upload", || connector.upload_calls() == 1).await;

    // Throttle only spaces attempts; the first one is prompt.
    assert!(started.elapsed() < Duration::from_millis(500));

    harness.client.disconnect().await;
}

#[tokio::test]
async fn disconnect_keeps_a_running_clear_guard_in_place() {
    let storage = Arc::new(MemoryStorage::new());
    let client = Arc::new(
        SyncClient::new(
            Arc::clone(&storage),
            Arc::new(MemoryQueueStore::new()) as Arc<dyn QueueStore>,
        )
        .unwrap(),
    );
    let connector = Arc::new(GatedConnector::new());

    client.connect(Arc::clone(&connector), test_options()).await;
    client.wait_for_status(|s| s.connected).await;

    client
        .execute("INSERT INTO users (id) VALUES (?)", &[json!("row-1")])
        .unwrap();
    connector.started.notified().await;

    // disconnect_and_clear parks in teardown behind the in-flight
    // upload attempt, holding its guard.
    let clearing = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.disconnect_and_clear().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // This disconnect finds no session handle and returns quickly; it
    // must not release the guard it did not take.
    client.disconnect().await;
    assert!(matches!(
        client.disconnect_and_clear().await,
        Err(SyncError::InvalidState(_))
    ));

    connector.release.notify_one();
    clearing.await.unwrap().unwrap();
    assert!(client.queue().is_empty());
}

#[tokio::test]
async fn disconnect_and_clear_resets_local_state() {
    let harness = make_harness();
    connect(&harness).await;

    let stream = harness.connector.current_stream().unwrap();
    assert!(stream.send(Frame::data(vec![7u8])).await);
    harness
        .client
        .wait_for_status(|s| s.last_synced_at.is_some())
        .await;

    harness.client.disconnect().await;
    harness
        .client
        .execute("INSERT INTO users (id) VALUES (?)", &[json!("row-1")])
        .unwrap();
    assert_eq!(harness.client.queue().len(), 1);

    harness.client.disconnect_and_clear().await.unwrap();

    assert!(harness.client.queue().is_empty());
    assert_eq!(harness.storage.applied_frame_count(), 0);
    assert!(!harness.client.connection_state().is_active());
}

#[tokio::test]
async fn queue_survives_restart_and_uploads_after_connect() {
    let store = Arc::new(MemoryQueueStore::new());

    // First "process": write offline, never connect.
    {
        let storage = Arc::new(MemoryStorage::new());
        let client = SyncClient::new(
            Arc::clone(&storage),
            Arc::clone(&store) as Arc<dyn QueueStore>,
        )
        .unwrap();
        client
            .execute("INSERT INTO users (id) VALUES (?)", &[json!("row-1")])
            .unwrap();
        assert_eq!(store.len(), 1);
    }

    // Second "process": the recovered transaction uploads on connect.
    let storage = Arc::new(MemoryStorage::new());
    let client =
        SyncClient::new(storage, Arc::clone(&store) as Arc<dyn QueueStore>).unwrap();
    assert_eq!(client.queue().len(), 1);

    let connector = Arc::new(MockConnector::new());
    client.connect(Arc::clone(&connector), test_options()).await;
    client.wait_for_status(|s| s.connected).await;

    let queue = Arc::clone(client.queue());
    let connector_probe = Arc::clone(&connector);
    wait_until("the recovered transaction to upload", || {
        connector_probe.upload_calls() == 1 && queue.is_empty()
    })
    .await;
    assert!(store.is_empty());

    client.disconnect().await;
}
