//! Journal: mutable transaction buffer producing a new commit
//!
//! A journal accumulates `Put`/`Delete` mutations against a base commit
//! (or two, for merges) in the storage's journal DB. Committing applies the
//! buffered mutations to the base tree and records the resulting commit
//! together with the objects it introduces in a single storage batch.
//!
//! # Lifecycle
//!
//! ```text
//! Valid ──commit()──> Committed
//!   │
//!   └──rollback()──> RolledBack
//! ```
//!
//! Termination is one-way. Any operation on a terminated journal fails with
//! `IllegalState`. An explicit journal that failed one operation can only be
//! rolled back.
//!
//! # Value counters
//!
//! For every untracked (not yet synced) object, the storage keeps a counter
//! equal to the number of live journal entries pointing at it. Journals keep
//! it current with `AdjustValueCounter` deltas in the same batch as the entry
//! change, and release their share when they terminate.

use ledger_core::{
    BatchOp, Commit, CommitId, Entry, EntryChange, JournalId, KeyPriority, LedgerError,
    LedgerResult, ObjectId, PageStorage, StorageBatch,
};
use std::sync::Arc;
use tracing::{debug, error, trace};

/// Whether a journal backs a single write or a user transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalType {
    /// Single write or merge; stays usable after a failed operation
    Implicit,
    /// User transaction; fails fast after any failed operation
    Explicit,
}

/// Parent commits of the journal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalKind {
    /// One base commit
    Simple {
        /// Commit the mutations are applied to
        base: CommitId,
    },
    /// Base plus the commit being merged into it
    Merge {
        /// Commit the mutations are applied to
        base: CommitId,
        /// Second parent of the resulting commit
        other: CommitId,
    },
}

impl JournalKind {
    /// Commit whose tree the mutations are applied to
    pub fn base(&self) -> &CommitId {
        match self {
            JournalKind::Simple { base } | JournalKind::Merge { base, .. } => base,
        }
    }

    fn parent_ids(&self) -> Vec<CommitId> {
        match self {
            JournalKind::Simple { base } => vec![*base],
            JournalKind::Merge { base, other } => vec![*base, *other],
        }
    }
}

/// Lifecycle state of a journal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalState {
    /// Accepting mutations
    Valid,
    /// Produced a commit (or was a no-op)
    Committed,
    /// Discarded without producing a commit
    RolledBack,
}

/// Mutable transaction buffer owned by a single writer
pub struct Journal {
    id: JournalId,
    storage: Arc<dyn PageStorage>,
    kind: JournalKind,
    journal_type: JournalType,
    state: JournalState,
    failed_operation: bool,
}

impl Journal {
    /// Allocate a journal in `storage` on top of the given parents
    ///
    /// Parents are not checked here; see `JournalStorageExt` for the
    /// validating constructors.
    pub async fn open(
        storage: Arc<dyn PageStorage>,
        kind: JournalKind,
        journal_type: JournalType,
    ) -> LedgerResult<Self> {
        let id = storage.create_journal().await?;
        trace!(
            target: "ledger::journal",
            page_id = %storage.page_id(),
            journal_id = id.0,
            ?kind,
            ?journal_type,
            "Journal opened"
        );
        Ok(Self {
            id,
            storage,
            kind,
            journal_type,
            state: JournalState::Valid,
            failed_operation: false,
        })
    }

    /// Storage-assigned id
    pub fn id(&self) -> JournalId {
        self.id
    }

    /// Parent commits
    pub fn kind(&self) -> &JournalKind {
        &self.kind
    }

    /// Implicit or explicit
    pub fn journal_type(&self) -> JournalType {
        self.journal_type
    }

    /// Current lifecycle state
    pub fn state(&self) -> JournalState {
        self.state
    }

    /// Whether the journal still accepts operations
    pub fn is_valid(&self) -> bool {
        self.state == JournalState::Valid
    }

    /// Whether an operation on this journal has failed
    pub fn has_failed_operation(&self) -> bool {
        self.failed_operation
    }

    fn ensure_valid(&self) -> LedgerResult<()> {
        match self.state {
            JournalState::Valid => Ok(()),
            state => Err(LedgerError::illegal_state(format!(
                "{} is terminated: {:?}",
                self.id, state
            ))),
        }
    }

    fn ensure_writable(&self) -> LedgerResult<()> {
        self.ensure_valid()?;
        if self.journal_type == JournalType::Explicit && self.failed_operation {
            return Err(LedgerError::illegal_state(format!(
                "{} had a failed operation and can only be rolled back",
                self.id
            )));
        }
        Ok(())
    }

    fn record<T>(&mut self, result: LedgerResult<T>) -> LedgerResult<T> {
        if result.is_err() {
            self.failed_operation = true;
        }
        result
    }

    /// Bind `key` to the stored object `object_id`
    ///
    /// # Errors
    ///
    /// `IllegalState` if the journal is terminated, or explicit and failed.
    pub async fn put(
        &mut self,
        key: impl Into<Vec<u8>>,
        object_id: ObjectId,
        priority: KeyPriority,
    ) -> LedgerResult<()> {
        self.ensure_writable()?;
        let entry = Entry::new(key, object_id, priority);
        let result = self.write_put(entry).await;
        self.record(result)
    }

    async fn write_put(&self, entry: Entry) -> LedgerResult<()> {
        let previous = self.storage.get_journal_value(self.id, &entry.key).await?;
        let mut batch = StorageBatch::new();
        if self.storage.is_object_untracked(&entry.object_id).await? {
            batch.push(BatchOp::AdjustValueCounter {
                object_id: entry.object_id,
                delta: 1,
            });
        }
        self.release_previous(previous, &mut batch).await?;
        batch.push(BatchOp::AddJournalEntry {
            journal_id: self.id,
            entry,
        });
        self.storage.execute(batch).await
    }

    /// Remove `key`
    ///
    /// # Errors
    ///
    /// `IllegalState` if the journal is terminated, or explicit and failed.
    pub async fn delete(&mut self, key: impl Into<Vec<u8>>) -> LedgerResult<()> {
        self.ensure_writable()?;
        let result = self.write_delete(key.into()).await;
        self.record(result)
    }

    async fn write_delete(&self, key: Vec<u8>) -> LedgerResult<()> {
        let previous = self.storage.get_journal_value(self.id, &key).await?;
        let mut batch = StorageBatch::new();
        self.release_previous(previous, &mut batch).await?;
        batch.push(BatchOp::RemoveJournalEntry {
            journal_id: self.id,
            key,
        });
        self.storage.execute(batch).await
    }

    async fn release_previous(
        &self,
        previous: Option<EntryChange>,
        batch: &mut StorageBatch,
    ) -> LedgerResult<()> {
        if let Some(EntryChange::Put(entry)) = previous {
            if self.storage.is_object_untracked(&entry.object_id).await? {
                batch.push(BatchOp::AdjustValueCounter {
                    object_id: entry.object_id,
                    delta: -1,
                });
            }
        }
        Ok(())
    }

    /// Read a key as this journal would commit it
    ///
    /// Buffered mutations shadow the base commit's content.
    pub async fn get(&self, key: &[u8]) -> LedgerResult<Option<Entry>> {
        self.ensure_valid()?;
        match self.storage.get_journal_value(self.id, key).await? {
            Some(EntryChange::Put(entry)) => Ok(Some(entry)),
            Some(EntryChange::Delete(_)) => Ok(None),
            None => {
                let base = self.storage.get_commit(self.kind.base()).await?;
                self.storage.get_entry(base.root_id(), key).await
            }
        }
    }

    /// Buffered mutations, sorted by key
    pub async fn changes(&self) -> LedgerResult<Vec<EntryChange>> {
        self.ensure_valid()?;
        self.storage.get_journal_entries(self.id).await
    }

    /// Counter decrements releasing this journal's untracked entries
    async fn release_all(&self, changes: &[EntryChange], batch: &mut StorageBatch) -> LedgerResult<()> {
        for change in changes {
            if let EntryChange::Put(entry) = change {
                if self.storage.is_object_untracked(&entry.object_id).await? {
                    batch.push(BatchOp::AdjustValueCounter {
                        object_id: entry.object_id,
                        delta: -1,
                    });
                }
            }
        }
        Ok(())
    }

    /// Commit the buffered mutations
    ///
    /// Returns the new commit, or the unchanged parent if the journal has a
    /// single parent and its mutations leave the content unchanged. On error
    /// the journal stays valid and nothing is recorded.
    ///
    /// # Errors
    ///
    /// `IllegalState` if the journal is terminated, or explicit and failed.
    pub async fn commit(&mut self) -> LedgerResult<Commit> {
        self.ensure_writable()?;

        let mut parents = Vec::with_capacity(2);
        for parent_id in self.kind.parent_ids() {
            parents.push(self.storage.get_commit(&parent_id).await?);
        }
        let changes = self.storage.get_journal_entries(self.id).await?;
        let base_root = *parents[0].root_id();
        let update = self.storage.apply_changes(&base_root, changes.clone()).await?;

        if parents.len() == 1 && update.root_id == base_root {
            debug!(
                target: "ledger::journal",
                page_id = %self.storage.page_id(),
                journal_id = self.id.0,
                "No-op commit, returning parent"
            );
            self.rollback().await?;
            self.state = JournalState::Committed;
            return Ok(parents.swap_remove(0));
        }

        let timestamp = match &parents[..] {
            [left, right] => left.timestamp().max(right.timestamp()),
            _ => self.storage.next_timestamp(),
        };
        let parent_refs: Vec<&Commit> = parents.iter().collect();
        let commit = Commit::new(update.root_id, &parent_refs, timestamp)?;

        let mut objects = update.new_nodes;
        for change in &changes {
            if let EntryChange::Put(entry) = change {
                if self.storage.is_object_untracked(&entry.object_id).await?
                    && !objects.contains(&entry.object_id)
                {
                    objects.push(entry.object_id);
                }
            }
        }

        let mut batch = StorageBatch::new();
        batch.push(BatchOp::AddCommit {
            commit: commit.clone(),
            objects,
        });
        self.release_all(&changes, &mut batch).await?;
        batch.push(BatchOp::RemoveJournal {
            journal_id: self.id,
        });
        self.storage.execute(batch).await?;
        self.state = JournalState::Committed;

        debug!(
            target: "ledger::journal",
            page_id = %self.storage.page_id(),
            journal_id = self.id.0,
            commit_id = %commit.id().short(),
            merge = commit.is_merge(),
            "Journal committed"
        );
        Ok(commit)
    }

    /// Discard all buffered state
    ///
    /// # Errors
    ///
    /// `IllegalState` if the journal is already terminated.
    pub async fn rollback(&mut self) -> LedgerResult<()> {
        self.ensure_valid()?;
        let changes = self.storage.get_journal_entries(self.id).await?;
        let mut batch = StorageBatch::new();
        self.release_all(&changes, &mut batch).await?;
        batch.push(BatchOp::RemoveJournal {
            journal_id: self.id,
        });
        self.storage.execute(batch).await?;
        self.state = JournalState::RolledBack;
        trace!(
            target: "ledger::journal",
            page_id = %self.storage.page_id(),
            journal_id = self.id.0,
            "Journal rolled back"
        );
        Ok(())
    }
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("journal_type", &self.journal_type)
            .field("state", &self.state)
            .field("failed_operation", &self.failed_operation)
            .finish()
    }
}

impl Drop for Journal {
    fn drop(&mut self) {
        if self.is_valid() {
            error!(
                target: "ledger::journal",
                page_id = %self.storage.page_id(),
                journal_id = self.id.0,
                "Journal dropped without commit or rollback"
            );
        }
    }
}
