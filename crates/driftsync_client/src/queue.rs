//! The CRUD upload queue: an ordered, durable log of pending local
//! mutations.

use crate::error::{SyncError, SyncResult};
use driftsync_protocol::{CrudEntry, CrudTransaction};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;

/// Durability collaborator for the CRUD queue.
///
/// Implementations persist transactions so the queue survives process
/// restart. A production adapter writes through the local database; the
/// in-memory implementation backs tests.
pub trait QueueStore: Send + Sync {
    /// Persists a newly enqueued transaction.
    fn append(&self, transaction: &CrudTransaction) -> SyncResult<()>;

    /// Removes a completed transaction.
    fn remove(&self, transaction_id: u64) -> SyncResult<()>;

    /// Loads all persisted transactions in enqueue order.
    fn load(&self) -> SyncResult<Vec<CrudTransaction>>;

    /// Removes all persisted transactions.
    fn clear(&self) -> SyncResult<()>;
}

/// An ordered queue of pending CRUD transactions.
///
/// Entries get monotonically increasing sequence ids at enqueue, never
/// reused. Transactions are drained strictly in id order: only the head
/// transaction may be completed. Enqueue never blocks on network state
/// and may run concurrently with the uploader's `next_transaction`/
/// `complete` calls.
pub struct CrudQueue {
    inner: Mutex<QueueInner>,
    store: Arc<dyn QueueStore>,
    notify: Notify,
}

struct QueueInner {
    transactions: VecDeque<CrudTransaction>,
    next_op_id: u64,
    next_tx_id: u64,
}

impl CrudQueue {
    /// Creates a queue, recovering any transactions persisted in the
    /// store. Id counters resume past the highest recovered ids.
    pub fn new(store: Arc<dyn QueueStore>) -> SyncResult<Self> {
        let recovered = store.load()?;

        let next_tx_id = recovered.iter().map(|t| t.id).max().unwrap_or(0) + 1;
        let next_op_id = recovered
            .iter()
            .filter_map(|t| t.last_op_id())
            .max()
            .unwrap_or(0)
            + 1;

        Ok(Self {
            inner: Mutex::new(QueueInner {
                transactions: recovered.into(),
                next_op_id,
                next_tx_id,
            }),
            store,
            notify: Notify::new(),
        })
    }

    /// Appends a new CRUD transaction.
    ///
    /// Assigns fresh sequence ids, persists through the store before
    /// returning, and wakes the uploader. Returns the transaction id.
    pub fn enqueue(&self, entries: Vec<CrudEntry>) -> SyncResult<u64> {
        if entries.is_empty() {
            return Err(SyncError::InvalidState(
                "cannot enqueue an empty CRUD transaction".into(),
            ));
        }

        let tx_id = {
            let mut inner = self.inner.lock();

            let mut assigned = entries;
            for entry in &mut assigned {
                entry.op_id = inner.next_op_id;
                inner.next_op_id += 1;
            }

            let transaction = CrudTransaction {
                id: inner.next_tx_id,
                entries: assigned,
            };
            inner.next_tx_id += 1;

            // Durable before the transaction becomes visible.
            self.store.append(&transaction)?;

            let tx_id = transaction.id;
            inner.transactions.push_back(transaction);
            tx_id
        };

        self.notify.notify_one();
        Ok(tx_id)
    }

    /// Returns the oldest incomplete transaction without removing it.
    pub fn next_transaction(&self) -> Option<CrudTransaction> {
        self.inner.lock().transactions.front().cloned()
    }

    /// Marks the head transaction as completed and removes it.
    ///
    /// Completion is exactly-once and head-only: completing a queued
    /// non-head transaction fails with `OutOfOrderCompletion`; an id that
    /// is not queued (including one already completed) fails with
    /// `TransactionNotFound`.
    pub fn complete(&self, transaction_id: u64) -> SyncResult<()> {
        let mut inner = self.inner.lock();

        let head_id = match inner.transactions.front() {
            Some(head) => head.id,
            None => return Err(SyncError::TransactionNotFound(transaction_id)),
        };

        if head_id != transaction_id {
            return if inner.transactions.iter().any(|t| t.id == transaction_id) {
                Err(SyncError::OutOfOrderCompletion {
                    expected: head_id,
                    got: transaction_id,
                })
            } else {
                Err(SyncError::TransactionNotFound(transaction_id))
            };
        }

        self.store.remove(transaction_id)?;
        inner.transactions.pop_front();
        Ok(())
    }

    /// Returns the number of pending transactions.
    pub fn len(&self) -> usize {
        self.inner.lock().transactions.len()
    }

    /// Returns the number of pending entries across all transactions.
    pub fn entry_count(&self) -> usize {
        self.inner.lock().transactions.iter().map(|t| t.len()).sum()
    }

    /// Returns true if no transactions are pending.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().transactions.is_empty()
    }

    /// Removes all pending transactions. Id counters are not reset:
    /// sequence ids are never reused.
    pub fn clear(&self) -> SyncResult<()> {
        let mut inner = self.inner.lock();
        self.store.clear()?;
        inner.transactions.clear();
        Ok(())
    }

    /// Waits until a transaction has been enqueued.
    ///
    /// An enqueue that happens between a failed `next_transaction` check
    /// and this call is not lost: the wakeup permit is stored.
    pub async fn wait_for_change(&self) {
        self.notify.notified().await;
    }
}

/// An in-memory queue store for tests and embedding.
#[derive(Default)]
pub struct MemoryQueueStore {
    transactions: Mutex<Vec<CrudTransaction>>,
}

impl MemoryQueueStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of persisted transactions.
    pub fn len(&self) -> usize {
        self.transactions.lock().len()
    }

    /// Returns true if nothing is persisted.
    pub fn is_empty(&self) -> bool {
        self.transactions.lock().is_empty()
    }
}

impl QueueStore for MemoryQueueStore {
    fn append(&self, transaction: &CrudTransaction) -> SyncResult<()> {
        self.transactions.lock().push(transaction.clone());
        Ok(())
    }

    fn remove(&self, transaction_id: u64) -> SyncResult<()> {
        self.transactions.lock().retain(|t| t.id != transaction_id);
        Ok(())
    }

    fn load(&self) -> SyncResult<Vec<CrudTransaction>> {
        Ok(self.transactions.lock().clone())
    }

    fn clear(&self) -> SyncResult<()> {
        self.transactions.lock().clear();
        Ok(())
    }
}
