//! The sync session: connection state machine and public client surface.

use crate::config::{Backoff, SyncOptions};
use crate::connector::{RetryDecision, StreamHandle, SyncConnector};
use crate::error::{SyncError, SyncResult};
use crate::queue::{CrudQueue, QueueStore};
use crate::status::{ListenerHandle, StatusTracker, SyncStatus};
use crate::storage::LocalStorage;
use crate::uploader::{run_upload_loop, UploaderContext};
use driftsync_protocol::{CrudTransaction, Frame, FrameKind};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// The connection state of the sync session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No session is running.
    #[default]
    Disconnected,
    /// A stream is being (re)established.
    Connecting,
    /// A stream is established and frames are flowing.
    Connected,
}

impl ConnectionState {
    /// Returns true if a session is running (connecting or connected).
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }
}

/// Handles for one running session's background tasks.
struct SessionHandle {
    shutdown: watch::Sender<bool>,
    download_task: JoinHandle<()>,
    upload_task: JoinHandle<()>,
}

/// The sync client: one local database's sync session and CRUD queue.
///
/// An explicit context object: construct it once with its storage and
/// queue-store collaborators and pass it to whoever needs it. Local
/// writes go through [`SyncClient::execute`]; connectivity is driven by
/// [`SyncClient::connect`] and observed through the status tracker.
pub struct SyncClient<S: LocalStorage> {
    storage: Arc<S>,
    queue: Arc<CrudQueue>,
    status: Arc<StatusTracker>,
    state: Arc<RwLock<ConnectionState>>,
    session: Mutex<Option<SessionHandle>>,
    disconnecting: AtomicBool,
}

impl<S: LocalStorage> SyncClient<S> {
    /// Creates a client, recovering any persisted CRUD transactions.
    pub fn new(storage: Arc<S>, queue_store: Arc<dyn QueueStore>) -> SyncResult<Self> {
        let queue = Arc::new(CrudQueue::new(queue_store)?);

        Ok(Self {
            storage,
            queue,
            status: Arc::new(StatusTracker::new()),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            session: Mutex::new(None),
            disconnecting: AtomicBool::new(false),
        })
    }

    /// Returns the CRUD queue.
    pub fn queue(&self) -> &Arc<CrudQueue> {
        &self.queue
    }

    /// Returns the current status snapshot.
    pub fn current_status(&self) -> SyncStatus {
        self.status.current()
    }

    /// Returns the current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Registers a status listener. The listener stays registered for as
    /// long as the returned handle is alive.
    pub fn register_listener(
        &self,
        listener: impl Fn(&SyncStatus) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.status.subscribe(listener)
    }

    /// Waits until the status satisfies a predicate.
    pub async fn wait_for_status(&self, predicate: impl Fn(&SyncStatus) -> bool) -> SyncStatus {
        self.status.wait_for(predicate).await
    }

    /// Returns the oldest incomplete CRUD transaction, if any.
    pub fn next_crud_transaction(&self) -> Option<CrudTransaction> {
        self.queue.next_transaction()
    }

    /// Executes a local write and enqueues its captured mutations as one
    /// CRUD transaction. Never blocks on network state.
    pub fn execute(&self, sql: &str, params: &[serde_json::Value]) -> SyncResult<()> {
        let entries = self.storage.execute(sql, params)?;
        if !entries.is_empty() {
            self.queue.enqueue(entries)?;
        }
        Ok(())
    }

    /// Starts (or restarts) a sync session with the given connector.
    ///
    /// If a session is already connecting or connected it is torn down
    /// first; calling `connect` again is the documented way to force a
    /// reconnect with a new connector or fresh credentials. Returns once
    /// the background tasks are spawned; use
    /// [`SyncClient::wait_for_status`] to observe connectivity.
    pub async fn connect<C: SyncConnector>(&self, connector: Arc<C>, options: SyncOptions) {
        self.teardown_session().await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (connected_tx, connected_rx) = watch::channel(false);

        *self.state.write() = ConnectionState::Connecting;

        let download = DownloadContext {
            connector: Arc::clone(&connector),
            storage: Arc::clone(&self.storage),
            status: Arc::clone(&self.status),
            state: Arc::clone(&self.state),
            options: options.clone(),
            connected: connected_tx,
            shutdown: shutdown_rx.clone(),
        };
        let download_task = tokio::spawn(run_download_loop(download));

        let uploader = UploaderContext {
            connector,
            queue: Arc::clone(&self.queue),
            status: Arc::clone(&self.status),
            options,
            connected: connected_rx,
            shutdown: shutdown_rx,
        };
        let upload_task = tokio::spawn(run_upload_loop(uploader));

        *self.session.lock() = Some(SessionHandle {
            shutdown: shutdown_tx,
            download_task,
            upload_task,
        });
    }

    /// Disconnects the session, leaving the CRUD queue intact.
    ///
    /// Shutdown is cooperative: at most one in-flight upload attempt may
    /// run to completion before the loops observe the flag and stop.
    pub async fn disconnect(&self) {
        // Clear the flag only if this call set it, so a concurrent
        // disconnect_and_clear keeps its guard.
        let owns_flag = self
            .disconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        self.teardown_session().await;
        if owns_flag {
            self.disconnecting.store(false, Ordering::SeqCst);
        }

        *self.state.write() = ConnectionState::Disconnected;
        self.status.update(|s| {
            s.connected = false;
            s.connecting = false;
            s.data_flow.uploading = false;
            s.data_flow.downloading = false;
        });
    }

    /// Disconnects and clears the CRUD queue and local storage.
    ///
    /// A destructive reset. Fails with `InvalidState` if a disconnect is
    /// already in progress; local state is untouched in that case.
    pub async fn disconnect_and_clear(&self) -> SyncResult<()> {
        if self
            .disconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SyncError::InvalidState(
                "a disconnect is already in progress".into(),
            ));
        }

        self.teardown_session().await;
        self.disconnecting.store(false, Ordering::SeqCst);

        *self.state.write() = ConnectionState::Disconnected;
        self.status.update(|s| {
            s.connected = false;
            s.connecting = false;
            s.data_flow.uploading = false;
            s.data_flow.downloading = false;
        });

        self.queue.clear()?;
        self.storage.clear()?;
        Ok(())
    }

    /// Signals shutdown to a running session and waits for its tasks.
    async fn teardown_session(&self) {
        let handle = self.session.lock().take();
        if let Some(handle) = handle {
            let _ = handle.shutdown.send(true);
            let _ = handle.download_task.await;
            let _ = handle.upload_task.await;
        }
    }
}

/// Everything the download loop needs.
struct DownloadContext<C, S> {
    connector: Arc<C>,
    storage: Arc<S>,
    status: Arc<StatusTracker>,
    state: Arc<RwLock<ConnectionState>>,
    options: SyncOptions,
    connected: watch::Sender<bool>,
    shutdown: watch::Receiver<bool>,
}

/// What to do after the current stream is gone.
enum StreamExit {
    /// Graceful close; reconnect immediately.
    Reconnect,
    /// Error; reconnect after a backoff delay.
    Retry,
    /// Stop the session.
    Shutdown,
}

/// The download loop: owns one stream handle at a time and replaces it
/// on every termination until shutdown is requested.
///
/// Frames are applied strictly in stream order. A graceful stream close
/// triggers an immediate replacement request. Open failures, stream
/// errors and frame-apply failures all retry through one backoff
/// cursor, which resets only once a frame has applied cleanly, so a
/// recurring failure never turns into a tight reconnect loop. A
/// connector reporting a fatal error parks the loop on the connector's
/// readiness signal instead.
async fn run_download_loop<C: SyncConnector, S: LocalStorage>(mut ctx: DownloadContext<C, S>) {
    let mut backoff = Backoff::new(ctx.options.retry.clone());
    let method = ctx.options.connection_method;

    loop {
        if *ctx.shutdown.borrow() {
            break;
        }

        *ctx.state.write() = ConnectionState::Connecting;
        ctx.status.update(|s| {
            s.connecting = true;
            s.connected = false;
        });

        let opened = tokio::select! {
            result = ctx.connector.open_stream(method) => result,
            _ = ctx.shutdown.wait_for(|s| *s) => break,
        };

        match opened {
            Ok(stream) => {
                info!("sync stream established");
                *ctx.state.write() = ConnectionState::Connected;
                let _ = ctx.connected.send(true);
                ctx.status.update(|s| {
                    s.connected = true;
                    s.connecting = false;
                    s.download_error = None;
                });

                let exit = read_stream(&mut ctx, &mut backoff, stream).await;

                let _ = ctx.connected.send(false);
                ctx.status.update(|s| {
                    s.connected = false;
                    s.data_flow.downloading = false;
                });

                match exit {
                    StreamExit::Reconnect => continue,
                    StreamExit::Retry => {
                        let delay = backoff.next_delay();
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = ctx.shutdown.wait_for(|s| *s) => break,
                        }
                    }
                    StreamExit::Shutdown => break,
                }
            }
            Err(error) => {
                warn!(%error, "failed to open sync stream");
                let decision = ctx.connector.on_download_error(&error);
                ctx.status.update(|s| s.download_error = Some(error));

                match decision {
                    RetryDecision::Retry => {
                        let delay = backoff.next_delay();
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = ctx.shutdown.wait_for(|s| *s) => break,
                        }
                    }
                    RetryDecision::Fatal => {
                        info!("non-retryable download error, waiting for connector readiness");
                        tokio::select! {
                            _ = ctx.connector.ready() => {}
                            _ = ctx.shutdown.wait_for(|s| *s) => break,
                        }
                    }
                }
            }
        }
    }

    let _ = ctx.connected.send(false);
    *ctx.state.write() = ConnectionState::Disconnected;
    ctx.status.update(|s| {
        s.connected = false;
        s.connecting = false;
        s.data_flow.downloading = false;
    });
    debug!("download loop stopped");
}

/// Reads frames from one stream until it terminates. The backoff cursor
/// is reset once a frame has applied cleanly, never at stream open.
async fn read_stream<C: SyncConnector, S: LocalStorage>(
    ctx: &mut DownloadContext<C, S>,
    backoff: &mut Backoff,
    mut stream: StreamHandle,
) -> StreamExit {
    loop {
        let next = tokio::select! {
            frame = stream.next_frame() => frame,
            _ = ctx.shutdown.wait_for(|s| *s) => return StreamExit::Shutdown,
        };

        match next {
            None => {
                info!("sync stream closed, requesting a new stream");
                return StreamExit::Reconnect;
            }
            Some(Ok(frame)) => match apply_frame(ctx, &frame) {
                Ok(()) => backoff.reset(),
                Err(error) => {
                    warn!(%error, "failed to apply downloaded frame");
                    let decision = ctx.connector.on_download_error(&error);
                    ctx.status.update(|s| s.download_error = Some(error));

                    if decision == RetryDecision::Fatal {
                        info!("non-retryable apply error, waiting for connector readiness");
                        tokio::select! {
                            _ = ctx.connector.ready() => {}
                            _ = ctx.shutdown.wait_for(|s| *s) => return StreamExit::Shutdown,
                        }
                        return StreamExit::Reconnect;
                    }
                    return StreamExit::Retry;
                }
            },
            Some(Err(error)) => {
                warn!(%error, "sync stream error");
                let decision = ctx.connector.on_download_error(&error);
                ctx.status.update(|s| s.download_error = Some(error));

                if decision == RetryDecision::Fatal {
                    info!("non-retryable stream error, waiting for connector readiness");
                    tokio::select! {
                        _ = ctx.connector.ready() => {}
                        _ = ctx.shutdown.wait_for(|s| *s) => return StreamExit::Shutdown,
                    }
                    return StreamExit::Reconnect;
                }
                return StreamExit::Retry;
            }
        }
    }
}

/// Applies one frame to local storage and advances `last_synced_at`.
fn apply_frame<C, S: LocalStorage>(
    ctx: &DownloadContext<C, S>,
    frame: &Frame,
) -> SyncResult<()> {
    if frame.kind == FrameKind::Keepalive {
        debug!("keepalive frame");
        return Ok(());
    }

    ctx.status.update(|s| s.data_flow.downloading = true);
    let result = ctx.storage.apply_frame(frame);
    ctx.status.update(|s| {
        s.data_flow.downloading = false;
        if result.is_ok() {
            s.last_synced_at = Some(SystemTime::now());
        }
    });
    result
}
