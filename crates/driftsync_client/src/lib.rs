//! # DriftSync Client
//!
//! Sync session state machine and CRUD upload queue for DriftSync.
//!
//! This crate provides:
//! - `SyncClient`: connection/reconnect state machine over a long-lived
//!   change stream
//! - `CrudQueue`: ordered, durable log of pending local mutations
//! - An upload loop with indefinite head-transaction retry and capped
//!   exponential backoff
//! - `StatusTracker`: immutable status snapshots with change
//!   notification
//!
//! ## Architecture
//!
//! Downloads and uploads are independent pipelines sharing one status
//! tracker. The session owns exactly one stream handle at a time and
//! replaces it on every termination; the uploader drains the CRUD queue
//! strictly in sequence-id order, one transaction in flight at a time,
//! and only while connected.
//!
//! ## Key Invariants
//!
//! - Downloaded frames are applied in stream order, never reordered
//! - Transactions upload in sequence-id order; only the head may be
//!   completed
//! - No transaction is removed except by an explicit `complete`
//! - Stream termination triggers reconnection without caller action
//! - Background loops never panic out; failures land in the status
//!   snapshot and drive retry
//!
//! The embedded database engine, platform transports, and multi-process
//! coordination are external collaborators behind the `LocalStorage`,
//! `QueueStore`, and `SyncConnector` traits.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod connector;
mod error;
mod queue;
mod session;
mod status;
mod storage;
mod uploader;

pub use config::{Backoff, ConnectionMethod, RetryConfig, SyncOptions};
pub use connector::{MockConnector, RetryDecision, StreamHandle, StreamSender, SyncConnector};
pub use error::{SyncError, SyncResult};
pub use queue::{CrudQueue, MemoryQueueStore, QueueStore};
pub use session::{ConnectionState, SyncClient};
pub use status::{DataFlowStatus, ListenerHandle, StatusTracker, SyncStatus};
pub use storage::{LocalStorage, MemoryStorage};

pub use driftsync_protocol::{CrudEntry, CrudOp, CrudTransaction, Frame, FrameDecoder, FrameKind};
