//! Storage collaborator traits
//!
//! The block store, B-tree encoding, and sync transport live outside this
//! workspace. The merge and lifecycle layers consume them only through the
//! traits below, so any backend implementing them can be plugged in.
//! `ledger-storage` provides the in-memory reference implementation.
//!
//! Thread safety: implementations must be `Send + Sync`; the resolver calls
//! them from its own task while clients call them from theirs.

use crate::batch::StorageBatch;
use crate::commit::Commit;
use crate::error::LedgerResult;
use crate::timestamp::Timestamp;
use crate::types::{ChangeSource, CommitId, Entry, EntryChange, JournalId, ObjectId, PageId};
use async_trait::async_trait;
use std::sync::Arc;

/// Receives commit-arrival notifications from a page storage
///
/// Called synchronously after the commits are durably recorded; must not block.
pub trait CommitWatcher: Send + Sync {
    /// New commits were added to the DAG
    fn on_new_commits(&self, commits: &[Commit], source: ChangeSource);
}

/// Result of applying changes to a content tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeUpdate {
    /// Root of the resulting tree
    pub root_id: ObjectId,
    /// Tree nodes not yet referenced by any commit
    pub new_nodes: Vec<ObjectId>,
}

/// Everything a peer needs to import one commit
#[derive(Debug, Clone)]
pub struct CommitBundle {
    /// The commit itself
    pub commit: Commit,
    /// Full content of the commit's tree
    pub entries: Vec<Entry>,
    /// Value objects referenced by `entries`
    pub objects: Vec<(ObjectId, Vec<u8>)>,
}

/// Per-page storage: commit DAG, head set, objects, trees, and journal DB
#[async_trait]
pub trait PageStorage: Send + Sync {
    /// Page served by this storage
    fn page_id(&self) -> &PageId;

    /// Next timestamp from the storage's monotonic clock
    fn next_timestamp(&self) -> Timestamp;

    // ---------------------------------------------------------------------
    // Commit DAG
    // ---------------------------------------------------------------------

    /// Ids of commits with no children, sorted by `(timestamp, id)`
    async fn get_head_commit_ids(&self) -> LedgerResult<Vec<CommitId>>;

    /// Look up a commit
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the commit is not in this storage.
    async fn get_commit(&self, id: &CommitId) -> LedgerResult<Commit>;

    /// Export a commit with its tree and values for a peer
    async fn get_commit_bundle(&self, id: &CommitId) -> LedgerResult<CommitBundle>;

    /// Import commits received from a peer, parents first
    ///
    /// Watchers are notified with [`ChangeSource::Remote`]. Commits already
    /// present are skipped. The import is all or nothing: if any bundle is
    /// invalid, no commit of the call is added.
    async fn add_commits_from_sync(&self, bundles: Vec<CommitBundle>) -> LedgerResult<()>;

    // ---------------------------------------------------------------------
    // Objects
    // ---------------------------------------------------------------------

    /// Store a value; new objects start untracked
    async fn add_object(&self, data: Vec<u8>) -> LedgerResult<ObjectId>;

    /// Read a value
    async fn get_object(&self, id: &ObjectId) -> LedgerResult<Vec<u8>>;

    /// Whether the object has not been confirmed synced yet
    async fn is_object_untracked(&self, id: &ObjectId) -> LedgerResult<bool>;

    /// Mark an object as synced; it is no longer reference counted
    async fn mark_object_synced(&self, id: &ObjectId) -> LedgerResult<()>;

    // ---------------------------------------------------------------------
    // Content trees
    // ---------------------------------------------------------------------

    /// Id of the empty tree
    fn empty_tree_id(&self) -> ObjectId;

    /// All entries of a tree, sorted by key
    async fn get_entries(&self, root_id: &ObjectId) -> LedgerResult<Vec<Entry>>;

    /// One entry of a tree
    async fn get_entry(&self, root_id: &ObjectId, key: &[u8]) -> LedgerResult<Option<Entry>>;

    /// Build a new tree from `base_root` with `changes` applied
    async fn apply_changes(
        &self,
        base_root: &ObjectId,
        changes: Vec<EntryChange>,
    ) -> LedgerResult<TreeUpdate>;

    // ---------------------------------------------------------------------
    // Journal DB
    // ---------------------------------------------------------------------

    /// Allocate an empty journal
    async fn create_journal(&self) -> LedgerResult<JournalId>;

    /// The journal's buffered change for `key`, if any
    async fn get_journal_value(
        &self,
        journal_id: JournalId,
        key: &[u8],
    ) -> LedgerResult<Option<EntryChange>>;

    /// All buffered changes of a journal, sorted by key
    async fn get_journal_entries(&self, journal_id: JournalId) -> LedgerResult<Vec<EntryChange>>;

    /// Number of live journal entries pointing at an untracked object
    async fn get_journal_value_counter(&self, object_id: &ObjectId) -> LedgerResult<i64>;

    /// Apply a batch atomically
    ///
    /// `AddCommit` operations notify watchers with [`ChangeSource::Local`]
    /// once the whole batch has been applied.
    async fn execute(&self, batch: StorageBatch) -> LedgerResult<()>;

    // ---------------------------------------------------------------------
    // Watchers
    // ---------------------------------------------------------------------

    /// Subscribe to commit-arrival notifications
    fn add_commit_watcher(&self, watcher: Arc<dyn CommitWatcher>);

    /// Unsubscribe a watcher previously added
    fn remove_commit_watcher(&self, watcher: &Arc<dyn CommitWatcher>);
}

/// Ledger-wide storage: creates, opens, and deletes page storages
#[async_trait]
pub trait LedgerStorage: Send + Sync {
    /// Create storage for a page that does not exist yet
    ///
    /// # Errors
    ///
    /// Returns `IllegalState` if the page already exists.
    async fn create_page_storage(&self, page_id: PageId) -> LedgerResult<Arc<dyn PageStorage>>;

    /// Open storage for an existing page; `None` if the page never existed
    async fn get_page_storage(&self, page_id: &PageId)
        -> LedgerResult<Option<Arc<dyn PageStorage>>>;

    /// Delete a page's storage
    ///
    /// # Errors
    ///
    /// Returns `PageNotFound` if the page does not exist.
    async fn delete_page_storage(&self, page_id: &PageId) -> LedgerResult<()>;

    /// Ids of every page in the ledger
    async fn list_pages(&self) -> LedgerResult<Vec<PageId>>;
}
