//! In-memory ledger storage
//!
//! Owns one [`InMemoryPageStorage`] per page. Page storages are shared as
//! `Arc`s, so a deleted page stays usable by holders of an earlier handle
//! until they drop it.

use crate::page::InMemoryPageStorage;
use crate::testing::{FailPoint, FaultInjector};
use async_trait::async_trait;
use ledger_core::{LedgerError, LedgerResult, LedgerStorage, PageId, PageStorage};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// In-memory `LedgerStorage`
#[derive(Default)]
pub struct InMemoryLedgerStorage {
    pages: RwLock<BTreeMap<PageId, Arc<InMemoryPageStorage>>>,
    faults: FaultInjector,
}

impl InMemoryLedgerStorage {
    /// Create an empty ledger storage
    pub fn new() -> Self {
        Self::default()
    }

    /// Fault injector consulted when opening or creating pages
    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    /// Concrete storage of a page, for tests and tools that need its extras
    pub fn page(&self, page_id: &PageId) -> Option<Arc<InMemoryPageStorage>> {
        self.pages.read().get(page_id).cloned()
    }
}

#[async_trait]
impl LedgerStorage for InMemoryLedgerStorage {
    async fn create_page_storage(&self, page_id: PageId) -> LedgerResult<Arc<dyn PageStorage>> {
        self.faults.check(FailPoint::OpenPage)?;
        let mut pages = self.pages.write();
        if pages.contains_key(&page_id) {
            return Err(LedgerError::illegal_state(format!(
                "page {} already exists",
                page_id
            )));
        }
        let storage = Arc::new(InMemoryPageStorage::new(page_id.clone()));
        pages.insert(page_id.clone(), Arc::clone(&storage));
        debug!(target: "ledger::storage", page_id = %page_id, "Created page storage");
        Ok(storage)
    }

    async fn get_page_storage(
        &self,
        page_id: &PageId,
    ) -> LedgerResult<Option<Arc<dyn PageStorage>>> {
        self.faults.check(FailPoint::OpenPage)?;
        Ok(self
            .pages
            .read()
            .get(page_id)
            .map(|s| Arc::clone(s) as Arc<dyn PageStorage>))
    }

    async fn delete_page_storage(&self, page_id: &PageId) -> LedgerResult<()> {
        match self.pages.write().remove(page_id) {
            Some(_) => {
                debug!(target: "ledger::storage", page_id = %page_id, "Deleted page storage");
                Ok(())
            }
            None => Err(LedgerError::PageNotFound(page_id.clone())),
        }
    }

    async fn list_pages(&self) -> LedgerResult<Vec<PageId>> {
        Ok(self.pages.read().keys().cloned().collect())
    }
}
