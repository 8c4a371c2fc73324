//! Journals for the ledger
//!
//! A [`Journal`] buffers key mutations against one base commit (simple) or
//! two (merge) and turns them into a new [`ledger_core::Commit`].
//! [`JournalStorageExt`] provides the validating constructors on page storage.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod ext;
pub mod journal;

pub use ext::JournalStorageExt;
pub use journal::{Journal, JournalKind, JournalState, JournalType};
