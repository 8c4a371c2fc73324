//! Ledger-wide page lifecycle
//!
//! The ledger manager keeps one container per page in use. The first
//! request for a page creates the container and opens the page's storage in
//! the background; requests arriving meanwhile queue on the container and
//! are answered together, in arrival order, once the page manager exists or
//! opening failed. A container is released when its page manager reports
//! itself empty.
//!
//! Binding a handle and releasing a container both happen under the pages
//! lock, so a page is never released between a lookup and a bind.

use crate::config::LedgerConfig;
use crate::page_handle::PageHandle;
use crate::page_manager::PageManager;
use crate::sync::PageSyncFactory;
use ledger_core::{CommitId, LedgerError, LedgerResult, LedgerStorage, PageId};
use ledger_merge::{ConflictResolverFactory, LedgerMergeManager};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What a caller knows about the page it requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    /// Create the page if it does not exist
    Named,
    /// The page must already exist
    Existing,
}

/// Introspection snapshot of one page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageDebugInfo {
    /// Page described
    pub page_id: PageId,
    /// Current heads, oldest first
    pub heads: Vec<CommitId>,
    /// Whether the page's resolver has work in flight
    pub has_unfinished_merges: bool,
    /// Live handles on the page
    pub bindings: usize,
}

type PageWaiter = oneshot::Sender<LedgerResult<PageHandle>>;

struct PageManagerContainer {
    id: u64,
    page_manager: Option<Arc<PageManager>>,
    pending: Vec<PageWaiter>,
}

struct LedgerInner {
    storage: Arc<dyn LedgerStorage>,
    config: LedgerConfig,
    merge_manager: Arc<LedgerMergeManager>,
    sync_factory: RwLock<Option<Arc<dyn PageSyncFactory>>>,
    pages: Mutex<HashMap<PageId, PageManagerContainer>>,
    next_container_id: AtomicU64,
}

/// Entry point of a ledger: hands out page handles
///
/// Cheap to clone; clones share the same pages.
#[derive(Clone)]
pub struct LedgerManager {
    inner: Arc<LedgerInner>,
}

impl LedgerManager {
    /// Create a manager over a ledger storage
    ///
    /// # Errors
    ///
    /// `Config` if the configuration is invalid.
    pub fn new(storage: Arc<dyn LedgerStorage>, config: LedgerConfig) -> LedgerResult<Self> {
        config.validate()?;
        let merge_manager = Arc::new(LedgerMergeManager::new(
            config.merge_policy()?,
            config.custom_diff_chunk_size,
        ));
        debug!(
            target: "ledger::ledger",
            default_policy = %merge_manager.default_policy(),
            "Ledger manager created"
        );
        Ok(Self {
            inner: Arc::new(LedgerInner {
                storage,
                config,
                merge_manager,
                sync_factory: RwLock::new(None),
                pages: Mutex::new(HashMap::new()),
                next_container_id: AtomicU64::new(1),
            }),
        })
    }

    /// Configuration in effect
    pub fn config(&self) -> &LedgerConfig {
        &self.inner.config
    }

    /// Merge configuration shared by every page
    pub fn merge_manager(&self) -> &Arc<LedgerMergeManager> {
        &self.inner.merge_manager
    }

    /// Install the sync factory used by pages opened from now on
    pub fn set_sync_factory(&self, factory: Option<Arc<dyn PageSyncFactory>>) {
        *self.inner.sync_factory.write() = factory;
    }

    /// Replace the application's conflict resolver factory
    ///
    /// Every live page switches to the strategy the new factory (or the
    /// configured default, for `None`) selects.
    pub fn set_conflict_resolver_factory(&self, factory: Option<Arc<dyn ConflictResolverFactory>>) {
        self.inner.merge_manager.set_factory(factory);
    }

    /// Bind a handle to a page
    ///
    /// # Errors
    ///
    /// `PageNotFound` for an `Existing` page that does not exist; storage
    /// errors while opening the page are returned to every caller queued on
    /// it.
    pub async fn get_page(&self, page_id: PageId, state: PageState) -> LedgerResult<PageHandle> {
        let receiver = {
            let mut pages = self.inner.pages.lock();
            let (tx, rx) = oneshot::channel();
            match pages.get_mut(&page_id) {
                Some(container) => match &container.page_manager {
                    Some(manager) => return Ok(PageHandle::new(Arc::clone(manager))),
                    None => container.pending.push(tx),
                },
                None => {
                    let id = self.inner.next_container_id.fetch_add(1, Ordering::Relaxed);
                    pages.insert(
                        page_id.clone(),
                        PageManagerContainer {
                            id,
                            page_manager: None,
                            pending: vec![tx],
                        },
                    );
                    debug!(target: "ledger::ledger", page_id = %page_id, "Opening page");
                    tokio::spawn(LedgerInner::resolve_page(
                        Arc::clone(&self.inner),
                        page_id.clone(),
                        state,
                        id,
                    ));
                }
            }
            rx
        };
        receiver.await.map_err(|_| {
            LedgerError::internal(format!("page {} request dropped while opening", page_id))
        })?
    }

    /// Create a page with a fresh random id and bind a handle to it
    pub async fn new_page(&self) -> LedgerResult<PageHandle> {
        let page_id = PageId::from_bytes(Uuid::new_v4().as_bytes().to_vec());
        self.get_page(page_id, PageState::Named).await
    }

    /// Delete a page and its storage
    ///
    /// Requests still queued on the page fail with `PageNotFound`. Handles
    /// already bound keep working on the detached storage until dropped.
    ///
    /// # Errors
    ///
    /// `PageNotFound` if the page never existed.
    pub async fn delete_page(&self, page_id: &PageId) -> LedgerResult<()> {
        let removed = self.inner.pages.lock().remove(page_id);
        if let Some(container) = removed {
            for waiter in container.pending {
                let _ = waiter.send(Err(LedgerError::PageNotFound(page_id.clone())));
            }
        }
        self.inner.storage.delete_page_storage(page_id).await?;
        info!(target: "ledger::ledger", page_id = %page_id, "Page deleted");
        Ok(())
    }

    /// Ids of every page stored in the ledger
    pub async fn get_pages_list(&self) -> LedgerResult<Vec<PageId>> {
        self.inner.storage.list_pages().await
    }

    /// Ids of pages currently held in memory, sorted
    pub fn live_pages(&self) -> Vec<PageId> {
        let mut live: Vec<PageId> = self.inner.pages.lock().keys().cloned().collect();
        live.sort();
        live
    }

    /// Heads and lifecycle state of a page
    ///
    /// Does not load the page if it is not in memory.
    ///
    /// # Errors
    ///
    /// `PageNotFound` if the page does not exist.
    pub async fn debug_page(&self, page_id: &PageId) -> LedgerResult<PageDebugInfo> {
        let live = self
            .inner
            .pages
            .lock()
            .get(page_id)
            .and_then(|container| container.page_manager.clone());
        match live {
            Some(manager) => Ok(PageDebugInfo {
                page_id: page_id.clone(),
                heads: manager.storage().get_head_commit_ids().await?,
                has_unfinished_merges: manager.has_unfinished_merges(),
                bindings: manager.bindings(),
            }),
            None => {
                let storage = self
                    .inner
                    .storage
                    .get_page_storage(page_id)
                    .await?
                    .ok_or_else(|| LedgerError::PageNotFound(page_id.clone()))?;
                Ok(PageDebugInfo {
                    page_id: page_id.clone(),
                    heads: storage.get_head_commit_ids().await?,
                    has_unfinished_merges: false,
                    bindings: 0,
                })
            }
        }
    }
}

impl LedgerInner {
    async fn open_page(&self, page_id: &PageId, state: PageState) -> LedgerResult<Arc<PageManager>> {
        let storage = match self.storage.get_page_storage(page_id).await? {
            Some(storage) => storage,
            None => match state {
                PageState::Named => match self.storage.create_page_storage(page_id.clone()).await {
                    Ok(storage) => storage,
                    // Lost a race with a concurrent open of the same page.
                    Err(LedgerError::IllegalState(_)) => self
                        .storage
                        .get_page_storage(page_id)
                        .await?
                        .ok_or_else(|| LedgerError::PageNotFound(page_id.clone()))?,
                    Err(e) => return Err(e),
                },
                PageState::Existing => return Err(LedgerError::PageNotFound(page_id.clone())),
            },
        };
        let sync_factory = self.sync_factory.read().clone();
        PageManager::new(
            storage,
            &self.config,
            Arc::clone(&self.merge_manager),
            sync_factory.as_ref(),
        )
    }

    async fn resolve_page(this: Arc<Self>, page_id: PageId, state: PageState, container_id: u64) {
        let manager = match this.open_page(&page_id, state).await {
            Ok(manager) => manager,
            Err(e) => {
                this.fail_page(&page_id, container_id, e);
                return;
            }
        };

        let weak = Arc::downgrade(&this);
        let empty_page = page_id.clone();
        manager.set_on_empty(move || {
            if let Some(inner) = weak.upgrade() {
                inner.remove_if_empty(&empty_page, container_id);
            }
        });

        let answered: Option<Vec<(PageWaiter, PageHandle)>> = {
            let mut pages = this.pages.lock();
            match pages.get_mut(&page_id) {
                Some(container) if container.id == container_id => {
                    container.page_manager = Some(Arc::clone(&manager));
                    Some(
                        container
                            .pending
                            .drain(..)
                            .map(|waiter| (waiter, PageHandle::new(Arc::clone(&manager))))
                            .collect(),
                    )
                }
                _ => None,
            }
        };
        let Some(answered) = answered else {
            debug!(
                target: "ledger::ledger",
                page_id = %page_id,
                "Page deleted while opening, discarding page manager"
            );
            return;
        };

        info!(
            target: "ledger::ledger",
            page_id = %page_id,
            waiters = answered.len(),
            "Page opened"
        );
        for (waiter, handle) in answered {
            // A waiter that gave up drops its handle, which unbinds it.
            let _ = waiter.send(Ok(handle));
        }
        if manager.bindings() == 0 {
            PageManager::check_empty(&manager);
        }
    }

    fn fail_page(&self, page_id: &PageId, container_id: u64, error: LedgerError) {
        let removed = {
            let mut pages = self.pages.lock();
            match pages.get(page_id) {
                Some(container) if container.id == container_id => pages.remove(page_id),
                _ => None,
            }
        };
        let Some(container) = removed else {
            return;
        };
        warn!(
            target: "ledger::ledger",
            page_id = %page_id,
            waiters = container.pending.len(),
            error = %error,
            "Failed to open page"
        );
        for waiter in container.pending {
            let _ = waiter.send(Err(error.clone()));
        }
    }

    fn remove_if_empty(&self, page_id: &PageId, container_id: u64) {
        let removed = {
            let mut pages = self.pages.lock();
            let empty = pages.get(page_id).map_or(false, |container| {
                container.id == container_id
                    && container.pending.is_empty()
                    && container
                        .page_manager
                        .as_ref()
                        .map_or(false, |manager| manager.bindings() == 0)
            });
            if empty {
                pages.remove(page_id)
            } else {
                None
            }
        };
        if removed.is_some() {
            info!(target: "ledger::ledger", page_id = %page_id, "Page released");
        }
    }
}
