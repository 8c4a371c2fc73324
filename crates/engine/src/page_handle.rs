//! Client binding to a page
//!
//! Writes outside a transaction commit immediately on top of the newest
//! head. Inside a transaction they go to an explicit journal that commits
//! (or rolls back) as a unit; a failed write poisons the transaction, which
//! can then only be rolled back.

use crate::page_manager::PageManager;
use ledger_core::{Commit, EntryChange, KeyPriority, LedgerError, LedgerResult, PageId};
use ledger_journal::{Journal, JournalStorageExt, JournalType};
use ledger_merge::{ConflictResolutionOutcome, MergePolicy};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// A client's binding to one page
pub struct PageHandle {
    manager: Arc<PageManager>,
    transaction: Option<Journal>,
}

impl std::fmt::Debug for PageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageHandle")
            .field("page_id", self.page_id())
            .field("in_transaction", &self.in_transaction())
            .finish()
    }
}

impl PageHandle {
    pub(crate) fn new(manager: Arc<PageManager>) -> Self {
        manager.bind();
        Self {
            manager,
            transaction: None,
        }
    }

    /// Page this handle is bound to
    pub fn page_id(&self) -> &PageId {
        self.manager.page_id()
    }

    /// Manager of the bound page
    pub fn manager(&self) -> &Arc<PageManager> {
        &self.manager
    }

    /// Whether a transaction is open
    pub fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    /// Bind `key` to `value` with eager priority
    pub async fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> LedgerResult<()> {
        self.put_with_priority(key, value, KeyPriority::Eager).await
    }

    /// Bind `key` to `value`
    pub async fn put_with_priority(
        &mut self,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
        priority: KeyPriority,
    ) -> LedgerResult<()> {
        match &mut self.transaction {
            Some(journal) => {
                let object_id = self.manager.storage().add_object(value.into()).await?;
                journal.put(key, object_id, priority).await
            }
            None => {
                self.manager.put(key, value.into(), priority).await?;
                Ok(())
            }
        }
    }

    /// Remove `key`
    pub async fn delete(&mut self, key: impl Into<Vec<u8>>) -> LedgerResult<()> {
        match &mut self.transaction {
            Some(journal) => journal.delete(key).await,
            None => {
                self.manager.delete(key).await?;
                Ok(())
            }
        }
    }

    /// Value of `key`, including the open transaction's writes
    pub async fn get(&self, key: &[u8]) -> LedgerResult<Option<Vec<u8>>> {
        match &self.transaction {
            Some(journal) => match journal.get(key).await? {
                Some(entry) => Ok(Some(
                    self.manager.storage().get_object(&entry.object_id).await?,
                )),
                None => Ok(None),
            },
            None => {
                let head = self.manager.newest_head().await?;
                self.manager.get_at(head.id(), key).await
            }
        }
    }

    /// All key/value pairs, including the open transaction's writes
    pub async fn entries(&self) -> LedgerResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let Some(journal) = &self.transaction else {
            let head = self.manager.newest_head().await?;
            return self.manager.entries_at(head.id()).await;
        };
        let storage = self.manager.storage();
        let mut view: BTreeMap<Vec<u8>, Vec<u8>> = self
            .manager
            .entries_at(journal.kind().base())
            .await?
            .into_iter()
            .collect();
        for change in journal.changes().await? {
            match change {
                EntryChange::Put(entry) => {
                    let value = storage.get_object(&entry.object_id).await?;
                    view.insert(entry.key, value);
                }
                EntryChange::Delete(key) => {
                    view.remove(&key);
                }
            }
        }
        Ok(view.into_iter().collect())
    }

    /// Open a transaction on top of the newest head
    ///
    /// # Errors
    ///
    /// `IllegalState` if a transaction is already open.
    pub async fn start_transaction(&mut self) -> LedgerResult<()> {
        if self.transaction.is_some() {
            return Err(LedgerError::illegal_state(format!(
                "transaction already open on page {}",
                self.page_id()
            )));
        }
        let base = self.manager.newest_head().await?;
        let journal = self
            .manager
            .storage()
            .start_commit(base.id(), JournalType::Explicit)
            .await?;
        debug!(
            target: "ledger::page",
            page_id = %self.page_id(),
            base = %base.id().short(),
            "Transaction started"
        );
        self.transaction = Some(journal);
        Ok(())
    }

    /// Commit the open transaction
    ///
    /// The transaction is closed whether or not the commit succeeds.
    ///
    /// # Errors
    ///
    /// `IllegalState` if no transaction is open, or if one of its writes failed.
    pub async fn commit(&mut self) -> LedgerResult<Commit> {
        let journal = self.transaction.take().ok_or_else(|| {
            LedgerError::illegal_state(format!("no transaction open on page {}", self.page_id()))
        })?;
        self.manager.storage().commit_journal(journal).await
    }

    /// Discard the open transaction
    ///
    /// # Errors
    ///
    /// `IllegalState` if no transaction is open.
    pub async fn rollback(&mut self) -> LedgerResult<()> {
        let mut journal = self.transaction.take().ok_or_else(|| {
            LedgerError::illegal_state(format!("no transaction open on page {}", self.page_id()))
        })?;
        journal.rollback().await
    }

    /// Wait until the page is seen with a single head
    pub async fn wait_for_conflict_resolution(&self) -> LedgerResult<ConflictResolutionOutcome> {
        self.manager.resolver().wait_for_no_conflicts().await
    }

    /// Replace the page's merge strategy
    pub fn set_merge_policy(&self, policy: MergePolicy) {
        debug!(
            target: "ledger::page",
            page_id = %self.page_id(),
            policy = %policy.kind(),
            "Merge policy set by client"
        );
        let strategy = self.manager.merge_manager().strategy_from(policy);
        self.manager.resolver().set_merge_strategy(strategy);
    }
}

impl Drop for PageHandle {
    fn drop(&mut self) {
        if let Some(mut journal) = self.transaction.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(async move {
                        if let Err(e) = journal.rollback().await {
                            warn!(
                                target: "ledger::page",
                                error = %e,
                                "Failed to roll back transaction of dropped handle"
                            );
                        }
                    });
                }
                Err(_) => warn!(
                    target: "ledger::page",
                    page_id = %self.manager.page_id(),
                    "Handle dropped outside a runtime with an open transaction"
                ),
            }
        }
        PageManager::unbind(&self.manager);
    }
}
