//! Sync status snapshots and change notification.

use crate::error::SyncError;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

/// Direction-specific activity flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DataFlowStatus {
    /// A CRUD upload attempt is in flight.
    pub uploading: bool,
    /// A downloaded frame is being applied to local storage.
    pub downloading: bool,
}

/// An immutable snapshot of the sync session's connectivity and activity.
///
/// Connection fields are written only by the sync session; upload fields
/// only by the uploader. Snapshots are replaced, never mutated in place.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SyncStatus {
    /// A stream is established and frames can arrive.
    pub connected: bool,
    /// A stream is being (re)established.
    pub connecting: bool,
    /// Upload/download activity.
    pub data_flow: DataFlowStatus,
    /// Time the last frame was applied to local storage.
    pub last_synced_at: Option<SystemTime>,
    /// Last upload failure; cleared on the next successful upload.
    pub upload_error: Option<SyncError>,
    /// Last download/stream failure; cleared once a stream is established.
    pub download_error: Option<SyncError>,
}

type Listener = Arc<dyn Fn(&SyncStatus) + Send + Sync>;
type ListenerList = Arc<RwLock<Vec<(u64, Listener)>>>;

/// Tracks the current [`SyncStatus`] and notifies subscribers on change.
///
/// Updates go through a single serialized path: a notification lock is
/// held from snapshot commit through listener delivery, so listeners
/// observe snapshots in commit order even when the session and uploader
/// tasks update concurrently. Listeners are invoked in registration
/// order, outside the snapshot lock, and only when the snapshot actually
/// changed; they must not call back into `update`. The listener list is
/// captured per notification round, so unsubscribing from within a
/// callback never affects delivery to other listeners in that round.
pub struct StatusTracker {
    current: RwLock<SyncStatus>,
    notify_lock: Mutex<()>,
    listeners: ListenerList,
    next_listener_id: AtomicU64,
}

impl StatusTracker {
    /// Creates a tracker with an all-false initial snapshot.
    pub fn new() -> Self {
        Self {
            current: RwLock::new(SyncStatus::default()),
            notify_lock: Mutex::new(()),
            listeners: Arc::new(RwLock::new(Vec::new())),
            next_listener_id: AtomicU64::new(1),
        }
    }

    /// Returns a clone of the current snapshot.
    pub fn current(&self) -> SyncStatus {
        self.current.read().clone()
    }

    /// Applies a mutation to the snapshot and notifies listeners if it
    /// changed anything.
    pub fn update(&self, f: impl FnOnce(&mut SyncStatus)) {
        // Held through delivery so snapshots reach listeners in commit
        // order.
        let _round = self.notify_lock.lock();

        let snapshot = {
            let mut current = self.current.write();
            let before = current.clone();
            f(&mut current);
            if *current == before {
                return;
            }
            current.clone()
        };

        let round: Vec<Listener> = self
            .listeners
            .read()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();

        for listener in round {
            listener(&snapshot);
        }
    }

    /// Registers a listener for future snapshots.
    ///
    /// The listener stays registered for as long as the returned handle
    /// is alive; dropping (or explicitly unsubscribing) the handle
    /// removes it.
    pub fn subscribe(&self, listener: impl Fn(&SyncStatus) + Send + Sync + 'static) -> ListenerHandle {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.listeners.write().push((id, Arc::new(listener)));
        ListenerHandle {
            id,
            listeners: Arc::clone(&self.listeners),
        }
    }

    /// Returns the number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Waits until the status satisfies a predicate.
    ///
    /// Built on the subscription primitive: subscribes, then checks the
    /// current snapshot to avoid missing an update that has already
    /// happened. Returns the matching snapshot.
    pub async fn wait_for(&self, predicate: impl Fn(&SyncStatus) -> bool) -> SyncStatus {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _handle = self.subscribe(move |status: &SyncStatus| {
            let _ = tx.send(status.clone());
        });

        let current = self.current();
        if predicate(&current) {
            return current;
        }

        loop {
            match rx.recv().await {
                Some(status) if predicate(&status) => return status,
                Some(_) => continue,
                // Tracker gone; return the last known snapshot.
                None => return self.current(),
            }
        }
    }
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Unsubscribe token returned by [`StatusTracker::subscribe`].
pub struct ListenerHandle {
    id: u64,
    listeners: ListenerList,
}

impl ListenerHandle {
    /// Removes the listener. Equivalent to dropping the handle.
    pub fn unsubscribe(self) {}
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.listeners.write().retain(|(id, _)| *id != self.id);
    }
}
