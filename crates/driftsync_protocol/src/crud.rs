//! CRUD records: pending local mutations awaiting upload.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Kind of local mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CrudOp {
    /// A row was inserted.
    Insert,
    /// A row was updated.
    Update,
    /// A row was deleted.
    Delete,
}

impl CrudOp {
    /// Converts to a numeric code for adapters that persist entries.
    #[must_use]
    pub const fn to_code(self) -> u8 {
        match self {
            CrudOp::Insert => 1,
            CrudOp::Update => 2,
            CrudOp::Delete => 3,
        }
    }

    /// Converts from a numeric code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(CrudOp::Insert),
            2 => Some(CrudOp::Update),
            3 => Some(CrudOp::Delete),
            _ => None,
        }
    }
}

/// One pending local mutation.
///
/// Entries are immutable once enqueued. The `op_id` is assigned by the
/// CRUD queue at enqueue time: monotonically increasing, never reused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrudEntry {
    /// Sequence id, assigned at enqueue.
    pub op_id: u64,
    /// Table the mutation applies to.
    pub table: String,
    /// Kind of mutation.
    pub op: CrudOp,
    /// Row identifier.
    pub row_id: String,
    /// Column/value payload. `Null` for deletes.
    pub data: serde_json::Value,
    /// Time the mutation was captured.
    pub created_at: SystemTime,
}

impl CrudEntry {
    /// Creates a new entry with an unassigned `op_id`.
    ///
    /// The queue assigns the real id when the entry is enqueued.
    pub fn new(
        table: impl Into<String>,
        op: CrudOp,
        row_id: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            op_id: 0,
            table: table.into(),
            op,
            row_id: row_id.into(),
            data,
            created_at: SystemTime::now(),
        }
    }
}

/// An ordered batch of CRUD entries uploaded as a unit.
///
/// One local database transaction produces one CRUD transaction. Entries
/// preserve enqueue order; transactions are processed strictly in id
/// order by the uploader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrudTransaction {
    /// Transaction id, assigned at enqueue. Strictly increasing.
    pub id: u64,
    /// Entries in enqueue order. Never empty.
    pub entries: Vec<CrudEntry>,
}

impl CrudTransaction {
    /// Returns the first entry's sequence id.
    pub fn first_op_id(&self) -> Option<u64> {
        self.entries.first().map(|e| e.op_id)
    }

    /// Returns the last entry's sequence id.
    pub fn last_op_id(&self) -> Option<u64> {
        self.entries.last().map(|e| e.op_id)
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the transaction has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn crud_op_codes() {
        assert_eq!(CrudOp::Insert.to_code(), 1);
        assert_eq!(CrudOp::Update.to_code(), 2);
        assert_eq!(CrudOp::Delete.to_code(), 3);

        assert_eq!(CrudOp::from_code(1), Some(CrudOp::Insert));
        assert_eq!(CrudOp::from_code(3), Some(CrudOp::Delete));
        assert_eq!(CrudOp::from_code(0), None);
    }

    #[test]
    fn new_entry_has_unassigned_id() {
        let entry = CrudEntry::new("users", CrudOp::Insert, "row-1", json!({"name": "a"}));
        assert_eq!(entry.op_id, 0);
        assert_eq!(entry.table, "users");
        assert_eq!(entry.op, CrudOp::Insert);
    }

    #[test]
    fn transaction_op_id_range() {
        let mut e1 = CrudEntry::new("users", CrudOp::Insert, "a", json!({}));
        e1.op_id = 5;
        let mut e2 = CrudEntry::new("users", CrudOp::Update, "a", json!({}));
        e2.op_id = 6;

        let tx = CrudTransaction {
            id: 3,
            entries: vec![e1, e2],
        };

        assert_eq!(tx.first_op_id(), Some(5));
        assert_eq!(tx.last_op_id(), Some(6));
        assert_eq!(tx.len(), 2);
        assert!(!tx.is_empty());
    }

    #[test]
    fn entry_serde_roundtrip() {
        let mut entry = CrudEntry::new("todos", CrudOp::Delete, "row-9", serde_json::Value::Null);
        entry.op_id = 12;

        let encoded = serde_json::to_string(&entry).unwrap();
        let decoded: CrudEntry = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, entry);
    }
}
