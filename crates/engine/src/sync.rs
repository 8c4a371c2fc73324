//! Sync hook
//!
//! The sync transport lives outside this workspace. A page manager starts
//! one [`PageSync`] per page when a factory is configured and
//! `sync_enabled` is set; the sync component pushes remote commits into the
//! page storage with `add_commits_from_sync`, which the merge resolver sees
//! as remote-origin commits.

use ledger_core::{LedgerResult, PageStorage};
use std::sync::Arc;

/// Sync component of one page
pub trait PageSync: Send + Sync {
    /// Begin exchanging commits with peers
    fn start(&self) -> LedgerResult<()>;

    /// Stop exchanging commits; called when the page is torn down
    fn stop(&self);
}

/// Creates the sync component of each page
pub trait PageSyncFactory: Send + Sync {
    /// Sync component for the page served by `storage`
    fn create_page_sync(&self, storage: Arc<dyn PageStorage>) -> LedgerResult<Arc<dyn PageSync>>;
}
