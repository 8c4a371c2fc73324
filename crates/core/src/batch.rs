//! Atomic storage batches
//!
//! Journal-scoped writes and commit registration are grouped into a
//! [`StorageBatch`] and applied with `PageStorage::execute`. A batch is
//! all-or-nothing: either every operation is applied or none is.

use crate::commit::Commit;
use crate::types::{Entry, JournalId, ObjectId};

/// One operation inside a batch
#[derive(Debug, Clone)]
pub enum BatchOp {
    /// Record `entry` as the journal's value for `entry.key`
    AddJournalEntry {
        /// Owning journal
        journal_id: JournalId,
        /// New binding
        entry: Entry,
    },
    /// Record a deletion of `key` in the journal
    RemoveJournalEntry {
        /// Owning journal
        journal_id: JournalId,
        /// Deleted key
        key: Vec<u8>,
    },
    /// Add `delta` to the live-reference counter of an untracked object
    AdjustValueCounter {
        /// Counted object
        object_id: ObjectId,
        /// Signed change, usually +1 or -1
        delta: i64,
    },
    /// Drop the journal and all its buffered entries
    RemoveJournal {
        /// Journal to drop
        journal_id: JournalId,
    },
    /// Register a new commit together with the objects it must retain
    AddCommit {
        /// Commit to add to the DAG
        commit: Commit,
        /// Tree nodes created for it plus untracked values it references
        objects: Vec<ObjectId>,
    },
}

/// Ordered group of operations applied atomically
#[derive(Debug, Clone, Default)]
pub struct StorageBatch {
    ops: Vec<BatchOp>,
}

impl StorageBatch {
    /// Create an empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an operation
    pub fn push(&mut self, op: BatchOp) -> &mut Self {
        self.ops.push(op);
        self
    }

    /// Operations in application order
    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    /// Consume the batch
    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }

    /// Number of operations
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether the batch has no operations
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}
