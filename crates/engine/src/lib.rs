//! Page lifecycle for the ledger
//!
//! This crate wires storage, journals, and merging into pages clients use:
//! - LedgerManager: opens pages on demand and releases them when unused
//! - PageManager: storage, merge resolver, and sync of one page
//! - PageHandle: a client's binding, with implicit writes and transactions
//! - LedgerConfig: `ledger.toml` settings
//! - PageSync / PageSyncFactory: hook for the external sync component

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod ledger_manager;
pub mod page_handle;
pub mod page_manager;
pub mod sync;

pub use config::{LedgerConfig, CONFIG_FILE_NAME};
pub use ledger_manager::{LedgerManager, PageDebugInfo, PageState};
pub use page_handle::PageHandle;
pub use page_manager::PageManager;
pub use sync::{PageSync, PageSyncFactory};
