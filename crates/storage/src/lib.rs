//! In-memory storage backend for the ledger
//!
//! This crate implements the storage collaborator traits from `ledger-core`:
//! - InMemoryPageStorage: commit DAG, sorted head set, content trees,
//!   objects, and the journal DB of one page
//! - InMemoryLedgerStorage: creates, opens, and deletes page storages
//! - FaultInjector: armed failures for crash and retry tests

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod ledger;
pub mod page;
pub mod testing;
pub mod tree;

pub use ledger::InMemoryLedgerStorage;
pub use page::InMemoryPageStorage;
pub use testing::{FailPoint, FaultInjector};
