//! Journal constructors on page storage
//!
//! `JournalStorageExt` adds the journal entry points the resolver and the
//! page manager use to any `Arc<dyn PageStorage>`.

use crate::journal::{Journal, JournalKind, JournalType};
use async_trait::async_trait;
use ledger_core::{Commit, CommitId, LedgerResult, PageStorage};
use std::sync::Arc;

/// Journal operations on a page storage
#[async_trait]
pub trait JournalStorageExt {
    /// Start a journal on top of `base`
    ///
    /// # Errors
    ///
    /// `NotFound` if `base` is not in the storage.
    async fn start_commit(&self, base: &CommitId, journal_type: JournalType)
        -> LedgerResult<Journal>;

    /// Start an implicit merge journal with parents `base` and `other`
    ///
    /// The content starts as `base`'s tree.
    async fn start_merge_commit(&self, base: &CommitId, other: &CommitId) -> LedgerResult<Journal>;

    /// Commit a journal, consuming it
    ///
    /// A journal that fails to commit is rolled back before the error is
    /// returned.
    async fn commit_journal(&self, journal: Journal) -> LedgerResult<Commit>;
}

#[async_trait]
impl JournalStorageExt for Arc<dyn PageStorage> {
    async fn start_commit(
        &self,
        base: &CommitId,
        journal_type: JournalType,
    ) -> LedgerResult<Journal> {
        self.get_commit(base).await?;
        Journal::open(Arc::clone(self), JournalKind::Simple { base: *base }, journal_type).await
    }

    async fn start_merge_commit(&self, base: &CommitId, other: &CommitId) -> LedgerResult<Journal> {
        self.get_commit(base).await?;
        self.get_commit(other).await?;
        Journal::open(
            Arc::clone(self),
            JournalKind::Merge {
                base: *base,
                other: *other,
            },
            JournalType::Implicit,
        )
        .await
    }

    async fn commit_journal(&self, mut journal: Journal) -> LedgerResult<Commit> {
        match journal.commit().await {
            Ok(commit) => Ok(commit),
            Err(e) => {
                if journal.is_valid() {
                    // Already failing; the rollback error adds nothing.
                    let _ = journal.rollback().await;
                }
                Err(e)
            }
        }
    }
}
