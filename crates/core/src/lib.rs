//! Core types and traits for the ledger
//!
//! This crate defines the foundational types used throughout the system:
//! - PageId / ObjectId / CommitId / JournalId: identifiers
//! - Entry / EntryChange: key bindings and mutations
//! - Commit: immutable DAG node
//! - Timestamp / MonotonicClock: tie-breaking time
//! - LedgerError: error taxonomy
//! - StorageBatch: atomic group of journal and commit writes
//! - Traits: storage collaborator contracts (PageStorage, LedgerStorage, CommitWatcher)

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod batch;
pub mod commit;
pub mod error;
pub mod timestamp;
pub mod traits;
pub mod types;

pub use batch::{BatchOp, StorageBatch};
pub use commit::{order_by_age, Commit};
pub use error::{LedgerError, LedgerResult};
pub use timestamp::{MonotonicClock, Timestamp};
pub use traits::{CommitBundle, CommitWatcher, LedgerStorage, PageStorage, TreeUpdate};
pub use types::{
    ChangeSource, CommitId, Entry, EntryChange, JournalId, KeyPriority, ObjectId, PageId, HASH_LEN,
};
