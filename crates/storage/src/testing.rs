//! Fault injection for storage tests
//!
//! A [`FaultInjector`] arms failures at named [`FailPoint`]s. The in-memory
//! storages check it on entry to each corresponding operation and return a
//! transient `Storage` error without touching any state.
//!
//! ```ignore
//! let storage = InMemoryPageStorage::new(page_id);
//! storage.faults().fail_next(FailPoint::Execute, 1);
//! assert!(journal.commit().await.is_err()); // journal stays valid
//! ```

use ledger_core::{LedgerError, LedgerResult};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Operations at which a failure can be injected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    /// `PageStorage::execute`
    Execute,
    /// `PageStorage::get_head_commit_ids`
    GetHeads,
    /// `PageStorage::get_commit`
    GetCommit,
    /// `LedgerStorage::create_page_storage` / `get_page_storage`
    OpenPage,
}

/// Counts of armed failures per fail point
#[derive(Debug, Default)]
pub struct FaultInjector {
    armed: Mutex<HashMap<FailPoint, usize>>,
}

impl FaultInjector {
    /// Create an injector with nothing armed
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` calls at `point` fail
    pub fn fail_next(&self, point: FailPoint, times: usize) {
        *self.armed.lock().entry(point).or_insert(0) += times;
    }

    /// Disarm every fail point
    pub fn clear(&self) {
        self.armed.lock().clear();
    }

    /// Consume one armed failure at `point`, if any
    pub fn check(&self, point: FailPoint) -> LedgerResult<()> {
        let mut armed = self.armed.lock();
        match armed.get_mut(&point) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(LedgerError::storage(format!("injected failure at {:?}", point)))
            }
            _ => Ok(()),
        }
    }
}
