//! Background task that drains the CRUD queue while connected.

use crate::config::{Backoff, SyncOptions};
use crate::connector::SyncConnector;
use crate::queue::CrudQueue;
use crate::status::StatusTracker;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Everything the upload loop needs, injected by the session.
pub(crate) struct UploaderContext<C> {
    pub connector: Arc<C>,
    pub queue: Arc<CrudQueue>,
    pub status: Arc<StatusTracker>,
    pub options: SyncOptions,
    pub connected: watch::Receiver<bool>,
    pub shutdown: watch::Receiver<bool>,
}

/// Drains the queue head-first, one transaction in flight at a time.
///
/// Uploads happen only while connected. Failures retry the same head
/// transaction with capped exponential backoff, indefinitely: a stuck
/// head blocks all later transactions, preserving sequence order. Only
/// the upload function's own `complete` call removes a transaction.
///
/// Shutdown is cooperative and bounded: an attempt that is already in
/// flight when shutdown is requested runs to completion, after which the
/// loop observes the flag and stops.
pub(crate) async fn run_upload_loop<C: SyncConnector>(ctx: UploaderContext<C>) {
    let mut connected = ctx.connected;
    let mut shutdown = ctx.shutdown;
    let mut backoff = Backoff::new(ctx.options.retry.clone());
    let throttle = ctx.options.crud_upload_throttle;
    let mut last_attempt: Option<Instant> = None;

    loop {
        if *shutdown.borrow() {
            break;
        }

        // Uploads only run while connected.
        if !*connected.borrow() {
            tokio::select! {
                result = connected.wait_for(|c| *c) => {
                    if result.is_err() {
                        break;
                    }
                }
                _ = shutdown.wait_for(|s| *s) => break,
            }
            continue;
        }

        let wakeup = ctx.queue.wait_for_change();
        let Some(transaction) = ctx.queue.next_transaction() else {
            // Queue drained; wait for an enqueue, a connectivity change,
            // or shutdown.
            tokio::select! {
                _ = wakeup => {}
                result = connected.wait_for(|c| !*c) => {
                    if result.is_err() {
                        break;
                    }
                }
                _ = shutdown.wait_for(|s| *s) => break,
            }
            continue;
        };

        // Throttle is spacing between attempts, never a delay before
        // the first one.
        if let Some(previous) = last_attempt {
            let elapsed = previous.elapsed();
            if elapsed < throttle {
                tokio::select! {
                    _ = tokio::time::sleep(throttle - elapsed) => {}
                    _ = shutdown.wait_for(|s| *s) => break,
                }
            }
        }

        debug!(transaction_id = transaction.id, "attempting CRUD upload");
        last_attempt = Some(Instant::now());
        ctx.status.update(|s| s.data_flow.uploading = true);
        let result = ctx.connector.upload_data(Arc::clone(&ctx.queue)).await;
        ctx.status.update(|s| s.data_flow.uploading = false);

        match result {
            Ok(()) => {
                backoff.reset();
                ctx.status.update(|s| s.upload_error = None);
            }
            Err(error) => {
                warn!(
                    transaction_id = transaction.id,
                    %error,
                    "CRUD upload failed, retrying head transaction"
                );
                ctx.status.update(|s| s.upload_error = Some(error));

                let delay = backoff.next_delay();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    result = connected.wait_for(|c| !*c) => {
                        if result.is_err() {
                            break;
                        }
                    }
                    _ = shutdown.wait_for(|s| *s) => break,
                }
            }
        }
    }

    ctx.status.update(|s| s.data_flow.uploading = false);
    debug!("upload loop stopped");
}
