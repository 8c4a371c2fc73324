//! LedgerDB - per-page versioned key-value store with automatic conflict resolution
//!
//! Every page is a DAG of immutable, content-addressed commits. Writers
//! append commits through journals; when concurrent writers (local or
//! remote) leave a page with several heads, the page's merge resolver folds
//! them back into one using the page's merge strategy.
//!
//! # Quick Start
//!
//! ```ignore
//! use ledgerdb::{InMemoryLedgerStorage, LedgerConfig, LedgerManager, PageId, PageState};
//! use std::sync::Arc;
//!
//! let ledger = LedgerManager::new(Arc::new(InMemoryLedgerStorage::new()), LedgerConfig::default())?;
//! let mut page = ledger.get_page(PageId::from("contacts"), PageState::Named).await?;
//! page.put("name", "Alice").await?;
//! assert_eq!(page.get(b"name").await?, Some(b"Alice".to_vec()));
//! ```
//!
//! # Architecture
//!
//! - `ledger-core`: identifiers, commits, errors, storage traits
//! - `ledger-storage`: in-memory page and ledger storage
//! - `ledger-journal`: journals producing commits
//! - `ledger-merge`: common ancestor, strategies, merge resolver
//! - `ledger-engine`: page lifecycle and client handles

pub use ledger_core::{
    ChangeSource, Commit, CommitBundle, CommitId, CommitWatcher, Entry, EntryChange, KeyPriority,
    LedgerError, LedgerResult, LedgerStorage, ObjectId, PageId, PageStorage, Timestamp,
};
pub use ledger_engine::{
    LedgerConfig, LedgerManager, PageDebugInfo, PageHandle, PageManager, PageState, PageSync,
    PageSyncFactory, CONFIG_FILE_NAME,
};
pub use ledger_journal::{Journal, JournalKind, JournalState, JournalStorageExt, JournalType};
pub use ledger_merge::{
    find_common_ancestor, AutomaticWithFallback, BackoffConfig, ConflictResolutionOutcome,
    ConflictResolver, ConflictResolverFactory, Custom, DelayPolicy, LastOneWins,
    LedgerMergeManager, MergePolicy, MergePolicyKind, MergeResolver, MergeStrategy, MergedValue,
    ResolverConfig, ResolverPhase, ValueDiff, ValueSource,
};
pub use ledger_storage::{FailPoint, FaultInjector, InMemoryLedgerStorage, InMemoryPageStorage};
