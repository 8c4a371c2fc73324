//! Per-page state: storage, merge resolver, optional sync
//!
//! A `PageManager` lives as long as the page has bound clients or
//! unfinished merges. When the last [`PageHandle`](crate::PageHandle) is
//! dropped it waits for the resolver to go idle and then reports itself
//! empty so the ledger manager can release it.

use crate::config::LedgerConfig;
use crate::sync::{PageSync, PageSyncFactory};
use ledger_core::{Commit, CommitId, KeyPriority, LedgerError, LedgerResult, PageId, PageStorage};
use ledger_journal::{JournalStorageExt, JournalType};
use ledger_merge::{LedgerMergeManager, MergeResolver};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

type EmptyCallback = Box<dyn Fn() + Send + Sync>;

/// Storage, resolver, and sync of one page
pub struct PageManager {
    page_id: PageId,
    storage: Arc<dyn PageStorage>,
    resolver: Arc<MergeResolver>,
    merge_manager: Arc<LedgerMergeManager>,
    sync: Option<Arc<dyn PageSync>>,
    bindings: AtomicUsize,
    on_empty: Mutex<Option<EmptyCallback>>,
}

impl PageManager {
    /// Wire a resolver (and sync, if configured) to a page storage
    ///
    /// Must be called within a tokio runtime.
    pub fn new(
        storage: Arc<dyn PageStorage>,
        config: &LedgerConfig,
        merge_manager: Arc<LedgerMergeManager>,
        sync_factory: Option<&Arc<dyn PageSyncFactory>>,
    ) -> LedgerResult<Arc<Self>> {
        let page_id = storage.page_id().clone();
        let sync = match sync_factory {
            Some(factory) if config.sync_enabled => {
                let sync = factory.create_page_sync(Arc::clone(&storage))?;
                sync.start()?;
                Some(sync)
            }
            _ => None,
        };

        let resolver = Arc::new(MergeResolver::new(
            Arc::clone(&storage),
            config.resolver_config(),
        ));
        merge_manager.register(&resolver);

        debug!(
            target: "ledger::page",
            page_id = %page_id,
            sync = sync.is_some(),
            "Page manager created"
        );
        Ok(Arc::new(Self {
            page_id,
            storage,
            resolver,
            merge_manager,
            sync,
            bindings: AtomicUsize::new(0),
            on_empty: Mutex::new(None),
        }))
    }

    /// Page served
    pub fn page_id(&self) -> &PageId {
        &self.page_id
    }

    /// Storage of the page
    pub fn storage(&self) -> &Arc<dyn PageStorage> {
        &self.storage
    }

    /// Merge resolver of the page
    pub fn resolver(&self) -> &Arc<MergeResolver> {
        &self.resolver
    }

    /// Ledger-wide merge configuration
    pub fn merge_manager(&self) -> &Arc<LedgerMergeManager> {
        &self.merge_manager
    }

    /// Number of live page handles
    pub fn bindings(&self) -> usize {
        self.bindings.load(Ordering::Acquire)
    }

    /// Whether the resolver still has work in flight
    pub fn has_unfinished_merges(&self) -> bool {
        self.resolver.has_unfinished_merges()
    }

    /// Register the callback run once the page is empty
    pub fn set_on_empty(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self.on_empty.lock() = Some(Box::new(callback));
    }

    pub(crate) fn bind(&self) {
        self.bindings.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn unbind(this: &Arc<Self>) {
        if this.bindings.fetch_sub(1, Ordering::AcqRel) == 1 {
            Self::check_empty(this);
        }
    }

    /// Report the page empty once unbound and idle
    pub fn check_empty(this: &Arc<Self>) {
        if this.bindings() > 0 {
            return;
        }
        let manager = Arc::clone(this);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    manager.resolver.wait_until_idle().await;
                    manager.notify_empty();
                });
            }
            Err(_) => manager.notify_empty(),
        }
    }

    fn notify_empty(&self) {
        if self.bindings() > 0 {
            return;
        }
        debug!(target: "ledger::page", page_id = %self.page_id, "Page manager empty");
        if let Some(callback) = self.on_empty.lock().as_ref() {
            callback();
        }
    }

    // ========================================================================
    // Content access
    // ========================================================================

    /// Newest head: the one with the greatest `(timestamp, id)`
    pub async fn newest_head(&self) -> LedgerResult<Commit> {
        let heads = self.storage.get_head_commit_ids().await?;
        let newest = heads
            .last()
            .ok_or_else(|| LedgerError::internal(format!("page {} has no head", self.page_id)))?;
        self.storage.get_commit(newest).await
    }

    /// Commit one write on top of the newest head
    pub async fn put(
        &self,
        key: impl Into<Vec<u8>>,
        value: Vec<u8>,
        priority: KeyPriority,
    ) -> LedgerResult<Commit> {
        let object_id = self.storage.add_object(value).await?;
        let base = self.newest_head().await?;
        let mut journal = self
            .storage
            .start_commit(base.id(), JournalType::Implicit)
            .await?;
        if let Err(e) = journal.put(key, object_id, priority).await {
            journal.rollback().await?;
            return Err(e);
        }
        self.storage.commit_journal(journal).await
    }

    /// Commit one delete on top of the newest head
    pub async fn delete(&self, key: impl Into<Vec<u8>>) -> LedgerResult<Commit> {
        let base = self.newest_head().await?;
        let mut journal = self
            .storage
            .start_commit(base.id(), JournalType::Implicit)
            .await?;
        if let Err(e) = journal.delete(key).await {
            journal.rollback().await?;
            return Err(e);
        }
        self.storage.commit_journal(journal).await
    }

    /// Value of `key` in a commit
    pub async fn get_at(&self, commit_id: &CommitId, key: &[u8]) -> LedgerResult<Option<Vec<u8>>> {
        let commit = self.storage.get_commit(commit_id).await?;
        match self.storage.get_entry(commit.root_id(), key).await? {
            Some(entry) => Ok(Some(self.storage.get_object(&entry.object_id).await?)),
            None => Ok(None),
        }
    }

    /// All key/value pairs of a commit, sorted by key
    pub async fn entries_at(&self, commit_id: &CommitId) -> LedgerResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let commit = self.storage.get_commit(commit_id).await?;
        let mut out = Vec::new();
        for entry in self.storage.get_entries(commit.root_id()).await? {
            let value = self.storage.get_object(&entry.object_id).await?;
            out.push((entry.key, value));
        }
        Ok(out)
    }
}

impl Drop for PageManager {
    fn drop(&mut self) {
        self.merge_manager.unregister(&self.resolver);
        if let Some(sync) = &self.sync {
            sync.stop();
        }
        if self.resolver.has_unfinished_merges() {
            warn!(
                target: "ledger::page",
                page_id = %self.page_id,
                "Page manager dropped with unfinished merges"
            );
        }
        debug!(target: "ledger::page", page_id = %self.page_id, "Page manager released");
    }
}
