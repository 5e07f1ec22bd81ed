//! Local storage collaborator.
//!
//! The embedded database engine is external to this core. The session
//! applies downloaded frames through this trait, and local writes go
//! through it before their captured mutations are enqueued for upload.

use crate::error::{SyncError, SyncResult};
use driftsync_protocol::{CrudEntry, CrudOp, Frame};
use parking_lot::Mutex;
use serde_json::Value;

/// The local storage engine, as seen by the sync core.
pub trait LocalStorage: Send + Sync + 'static {
    /// Applies one downloaded change frame.
    ///
    /// Frames are applied strictly in stream order; the implementation
    /// owns transactional semantics for the payload.
    fn apply_frame(&self, frame: &Frame) -> SyncResult<()>;

    /// Executes a local write statement and returns the mutations it
    /// captured, in statement order, ready to be enqueued.
    fn execute(&self, sql: &str, params: &[Value]) -> SyncResult<Vec<CrudEntry>>;

    /// Removes all local data. Used by `disconnect_and_clear`.
    fn clear(&self) -> SyncResult<()>;
}

/// An in-memory storage double for tests and embedding.
///
/// Records applied frames and captures mutations from a small SQL-shaped
/// surface: the statement's leading keyword selects the operation, the
/// word after `INTO`/`UPDATE`/`FROM` names the table, the first parameter
/// is the row id and the remaining parameters become the column payload.
/// Real adapters wrap an actual database instead.
#[derive(Default)]
pub struct MemoryStorage {
    applied_frames: Mutex<Vec<Frame>>,
    statements: Mutex<Vec<String>>,
}

impl MemoryStorage {
    /// Creates an empty storage double.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all frames applied so far, in stream order.
    pub fn applied_frames(&self) -> Vec<Frame> {
        self.applied_frames.lock().clone()
    }

    /// Returns the number of applied frames.
    pub fn applied_frame_count(&self) -> usize {
        self.applied_frames.lock().len()
    }

    /// Returns all executed statements.
    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().clone()
    }

    fn parse_statement(sql: &str, params: &[Value]) -> SyncResult<CrudEntry> {
        let mut words = sql.split_whitespace();
        let keyword = words
            .next()
            .ok_or_else(|| SyncError::storage("empty statement"))?
            .to_ascii_uppercase();

        let (op, table_marker) = match keyword.as_str() {
            "INSERT" => (CrudOp::Insert, "INTO"),
            "UPDATE" => (CrudOp::Update, "UPDATE"),
            "DELETE" => (CrudOp::Delete, "FROM"),
            other => {
                return Err(SyncError::storage(format!(
                    "unsupported statement: {other}"
                )))
            }
        };

        let table = if table_marker == "UPDATE" {
            words.next()
        } else {
            let mut found = None;
            let mut rest = words;
            while let Some(word) = rest.next() {
                if word.eq_ignore_ascii_case(table_marker) {
                    found = rest.next();
                    break;
                }
            }
            found
        }
        .ok_or_else(|| SyncError::storage("statement names no table"))?;

        let row_id = match params.first() {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => return Err(SyncError::storage("statement has no row id parameter")),
        };

        let data = if matches!(op, CrudOp::Delete) {
            Value::Null
        } else {
            Value::Array(params[1..].to_vec())
        };

        Ok(CrudEntry::new(table, op, row_id, data))
    }
}

impl LocalStorage for MemoryStorage {
    fn apply_frame(&self, frame: &Frame) -> SyncResult<()> {
        self.applied_frames.lock().push(frame.clone());
        Ok(())
    }

    fn execute(&self, sql: &str, params: &[Value]) -> SyncResult<Vec<CrudEntry>> {
        let entry = Self::parse_statement(sql, params)?;
        self.statements.lock().push(sql.to_string());
        Ok(vec![entry])
    }

    fn clear(&self) -> SyncResult<()> {
        self.applied_frames.lock().clear();
        self.statements.lock().clear();
        Ok(())
    }
}
