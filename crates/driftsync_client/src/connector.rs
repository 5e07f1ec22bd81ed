//! Connector collaborator: stream opening, uploads, and error hooks.

use crate::config::ConnectionMethod;
use crate::error::{SyncError, SyncResult};
use crate::queue::CrudQueue;
use driftsync_protocol::Frame;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// What the session should do after a download failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry with backoff. The default for transport-level failures.
    Retry,
    /// Do not retry until the connector signals readiness again
    /// (e.g. after a credential refresh).
    Fatal,
}

/// The receiving side of one physical connection attempt.
///
/// Owned exclusively by the sync session and replaced, never mutated,
/// on every reconnect. Dropping the paired [`StreamSender`] closes the
/// stream gracefully, which unblocks any pending `next_frame`.
pub struct StreamHandle {
    frames: mpsc::Receiver<SyncResult<Frame>>,
}

impl StreamHandle {
    /// Creates a connected sender/handle pair.
    pub fn channel(capacity: usize) -> (StreamSender, StreamHandle) {
        let (tx, rx) = mpsc::channel(capacity);
        (StreamSender { tx }, StreamHandle { frames: rx })
    }

    /// Waits for the next frame.
    ///
    /// Returns `None` on graceful close, `Some(Err(_))` on a stream
    /// error. Frames arrive in stream order.
    pub async fn next_frame(&mut self) -> Option<SyncResult<Frame>> {
        self.frames.recv().await
    }
}

/// The transport's side of a stream: pushes frames and signals errors.
#[derive(Clone)]
pub struct StreamSender {
    tx: mpsc::Sender<SyncResult<Frame>>,
}

impl StreamSender {
    /// Delivers a frame. Returns false if the session dropped the handle.
    pub async fn send(&self, frame: Frame) -> bool {
        self.tx.send(Ok(frame)).await.is_ok()
    }

    /// Signals a stream error. Returns false if the handle is gone.
    pub async fn error(&self, error: SyncError) -> bool {
        self.tx.send(Err(error)).await.is_ok()
    }

    /// Returns true if the session dropped its handle.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Supplies connections and the application's upload function.
///
/// Connectors own credentials and transport selection; the core only
/// asks for streams and invokes `upload_data` against the CRUD queue.
pub trait SyncConnector: Send + Sync + 'static {
    /// Opens one physical connection attempt.
    fn open_stream(
        &self,
        method: ConnectionMethod,
    ) -> impl Future<Output = SyncResult<StreamHandle>> + Send;

    /// Uploads the head CRUD transaction.
    ///
    /// The implementation reads the queue via `next_transaction` and is
    /// responsible for calling `complete` on what it processed. Returning
    /// an error leaves the head in place for a retry.
    fn upload_data(&self, queue: Arc<CrudQueue>) -> impl Future<Output = SyncResult<()>> + Send;

    /// Classifies a download failure. Defaults to retry-everything;
    /// override to stop retrying distinguished errors (e.g. a permanent
    /// object-not-found from the backend).
    fn on_download_error(&self, _error: &SyncError) -> RetryDecision {
        RetryDecision::Retry
    }

    /// Resolves when a connector that reported a fatal download error is
    /// ready to be retried. The default never resolves: recovery requires
    /// a fresh `connect` call.
    fn ready(&self) -> impl Future<Output = ()> + Send {
        std::future::pending()
    }
}

/// A scriptable connector for tests.
///
/// Streams are driven manually through the [`StreamSender`] of the most
/// recently opened stream; upload behavior defaults to completing the
/// head transaction and can be scripted to fail a number of times first.
pub struct MockConnector {
    current_stream: Mutex<Option<StreamSender>>,
    stream_requests: watch::Sender<u64>,
    upload_calls: AtomicUsize,
    upload_failures_left: AtomicUsize,
    open_failures_left: AtomicUsize,
    fatal_download_errors: Mutex<bool>,
}

impl MockConnector {
    /// Creates a connector that connects and uploads successfully.
    pub fn new() -> Self {
        Self {
            current_stream: Mutex::new(None),
            stream_requests: watch::channel(0).0,
            upload_calls: AtomicUsize::new(0),
            upload_failures_left: AtomicUsize::new(0),
            open_failures_left: AtomicUsize::new(0),
            fatal_download_errors: Mutex::new(false),
        }
    }

    /// Scripts the next `count` upload calls to fail.
    pub fn fail_uploads(&self, count: usize) {
        self.upload_failures_left.store(count, Ordering::SeqCst);
    }

    /// Scripts the next `count` stream opens to fail.
    pub fn fail_stream_opens(&self, count: usize) {
        self.open_failures_left.store(count, Ordering::SeqCst);
    }

    /// Makes `on_download_error` report `Fatal` for all errors.
    pub fn set_fatal_download_errors(&self, fatal: bool) {
        *self.fatal_download_errors.lock() = fatal;
    }

    /// Returns the number of `upload_data` calls so far.
    pub fn upload_calls(&self) -> usize {
        self.upload_calls.load(Ordering::SeqCst)
    }

    /// Returns the number of stream requests (open attempts) so far.
    pub fn stream_requests(&self) -> u64 {
        *self.stream_requests.borrow()
    }

    /// Returns the sender for the most recently opened stream.
    pub fn current_stream(&self) -> Option<StreamSender> {
        self.current_stream.lock().clone()
    }

    /// Closes the current stream gracefully by dropping its sender.
    pub fn close_stream(&self) {
        self.current_stream.lock().take();
    }

    /// Waits until at least `count` stream requests have been made.
    pub async fn wait_for_stream_requests(&self, count: u64) {
        let mut rx = self.stream_requests.subscribe();
        // Ignoring the error: the sender lives as long as self.
        let _ = rx.wait_for(|opened| *opened >= count).await;
    }
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncConnector for MockConnector {
    fn open_stream(
        &self,
        _method: ConnectionMethod,
    ) -> impl Future<Output = SyncResult<StreamHandle>> + Send {
        async move {
            if self.open_failures_left.load(Ordering::SeqCst) > 0 {
                self.open_failures_left.fetch_sub(1, Ordering::SeqCst);
                self.stream_requests.send_modify(|opened| *opened += 1);
                return Err(SyncError::transport_retryable("scripted open failure"));
            }

            let (sender, handle) = StreamHandle::channel(64);
            *self.current_stream.lock() = Some(sender);
            self.stream_requests.send_modify(|opened| *opened += 1);
            Ok(handle)
        }
    }

    fn upload_data(&self, queue: Arc<CrudQueue>) -> impl Future<Output = SyncResult<()>> + Send {
        async move {
            self.upload_calls.fetch_add(1, Ordering::SeqCst);

            if self.upload_failures_left.load(Ordering::SeqCst) > 0 {
                self.upload_failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(SyncError::Upload("scripted upload failure".into()));
            }

            if let Some(transaction) = queue.next_transaction() {
                queue.complete(transaction.id)?;
            }
            Ok(())
        }
    }

    fn on_download_error(&self, _error: &SyncError) -> RetryDecision {
        if *self.fatal_download_errors.lock() {
            RetryDecision::Fatal
        } else {
            RetryDecision::Retry
        }
    }
}
