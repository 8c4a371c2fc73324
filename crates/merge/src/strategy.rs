//! Merge strategies
//!
//! A [`MergeStrategy`] folds two diverging commits into one merge commit,
//! given their common ancestor. The left commit is the older one and is the
//! base of the merge journal, so any key the strategy does not touch keeps
//! its left binding.
//!
//! | Strategy | Non-overlapping changes | Overlapping changes |
//! |----------|------------------------|---------------------|
//! | [`LastOneWins`] | merged | right (newer) wins |
//! | [`AutomaticWithFallback`] | merged | [`ConflictResolver`] decides |
//! | [`Custom`] | [`ConflictResolver`] decides | [`ConflictResolver`] decides |
//!
//! Strategies are cancellable: after [`MergeStrategy::cancel`] a strategy
//! rolls back its journal at the next step and returns `Cancelled` instead
//! of committing.

use crate::diff::{diff_three_way, ThreeWayChange};
use async_trait::async_trait;
use ledger_core::{Commit, Entry, KeyPriority, LedgerError, LedgerResult, PageId, PageStorage};
use ledger_journal::{Journal, JournalStorageExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Pluggable policy resolving two diverging commits into one
#[async_trait]
pub trait MergeStrategy: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &'static str;

    /// Produce a merge commit of `left` (older) and `right` (newer)
    ///
    /// # Errors
    ///
    /// `Cancelled` if [`cancel`](Self::cancel) was called before the merge
    /// commit was recorded. Any other error means the round failed and may
    /// be retried.
    async fn merge(
        &self,
        storage: &Arc<dyn PageStorage>,
        left: &Commit,
        right: &Commit,
        ancestor: &Commit,
    ) -> LedgerResult<Commit>;

    /// Stop producing side effects; the pending merge returns `Cancelled`
    fn cancel(&self);
}

/// Source of a key's merged binding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueSource {
    /// Keep the right commit's binding
    Right,
    /// Keep the left commit's binding
    Left,
    /// Bind to a new value
    New(Vec<u8>, KeyPriority),
    /// Remove the key
    Delete,
}

/// Resolution of one key returned by a [`ConflictResolver`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedValue {
    /// Key being resolved
    pub key: Vec<u8>,
    /// Where its merged binding comes from
    pub source: ValueSource,
}

impl MergedValue {
    /// Resolve `key` from `source`
    pub fn new(key: impl Into<Vec<u8>>, source: ValueSource) -> Self {
        Self {
            key: key.into(),
            source,
        }
    }
}

/// A changed key with its values on each side, as shown to a resolver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueDiff {
    /// Key
    pub key: Vec<u8>,
    /// Value in the common ancestor
    pub base: Option<Vec<u8>>,
    /// Value in the left (older) commit
    pub left: Option<Vec<u8>>,
    /// Value in the right (newer) commit
    pub right: Option<Vec<u8>>,
}

/// External conflict resolution, typically supplied by the application
///
/// Called once per chunk of the diff. Keys of the chunk that are missing
/// from the answer keep their left binding.
#[async_trait]
pub trait ConflictResolver: Send + Sync {
    /// Resolve one chunk of changed keys
    async fn resolve(&self, page_id: &PageId, changes: Vec<ValueDiff>)
        -> LedgerResult<Vec<MergedValue>>;
}

/// One-shot cancellation flag shared by the strategies
#[derive(Debug, Default)]
struct CancelFlag(AtomicBool);

impl CancelFlag {
    fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    fn check(&self, strategy: &str) -> LedgerResult<()> {
        if self.0.load(Ordering::Acquire) {
            Err(LedgerError::cancelled(format!("{} merge cancelled", strategy)))
        } else {
            Ok(())
        }
    }
}

async fn write_entry(journal: &mut Journal, key: &[u8], entry: Option<&Entry>) -> LedgerResult<()> {
    match entry {
        Some(e) => journal.put(e.key.clone(), e.object_id, e.priority).await,
        None => journal.delete(key.to_vec()).await,
    }
}

async fn read_value(storage: &dyn PageStorage, entry: Option<&Entry>) -> LedgerResult<Option<Vec<u8>>> {
    match entry {
        Some(e) => Ok(Some(storage.get_object(&e.object_id).await?)),
        None => Ok(None),
    }
}

/// Run `fill` on a fresh merge journal, then commit it unless cancelled
///
/// The journal is rolled back on any error.
async fn merge_into_journal<F: FillJournal + ?Sized>(
    storage: &Arc<dyn PageStorage>,
    left: &Commit,
    right: &Commit,
    cancel: &CancelFlag,
    name: &str,
    changes: Vec<ThreeWayChange>,
    fill: &F,
) -> LedgerResult<Commit> {
    cancel.check(name)?;
    let mut journal = storage.start_merge_commit(left.id(), right.id()).await?;
    let filled = fill.fill(storage, &mut journal, changes).await;
    if let Err(e) = filled.and_then(|()| cancel.check(name)) {
        journal.rollback().await?;
        return Err(e);
    }
    let commit = storage.commit_journal(journal).await?;
    debug!(
        target: "ledger::resolver",
        page_id = %storage.page_id(),
        strategy = name,
        commit_id = %commit.id().short(),
        "Strategy produced merge commit"
    );
    Ok(commit)
}

/// Journal-filling step of a strategy
#[async_trait]
trait FillJournal: Send + Sync {
    async fn fill(
        &self,
        storage: &Arc<dyn PageStorage>,
        journal: &mut Journal,
        changes: Vec<ThreeWayChange>,
    ) -> LedgerResult<()>;
}

// ============================================================================
// LastOneWins
// ============================================================================

/// Newer commit wins every key it changed
#[derive(Debug, Default)]
pub struct LastOneWins {
    cancel: CancelFlag,
}

impl LastOneWins {
    /// Create the strategy
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FillJournal for LastOneWins {
    async fn fill(
        &self,
        _storage: &Arc<dyn PageStorage>,
        journal: &mut Journal,
        changes: Vec<ThreeWayChange>,
    ) -> LedgerResult<()> {
        for change in changes.iter().filter(|c| c.right_changed()) {
            self.cancel.check("last_one_wins")?;
            write_entry(journal, &change.key, change.right.as_ref()).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl MergeStrategy for LastOneWins {
    fn name(&self) -> &'static str {
        "last_one_wins"
    }

    async fn merge(
        &self,
        storage: &Arc<dyn PageStorage>,
        left: &Commit,
        right: &Commit,
        ancestor: &Commit,
    ) -> LedgerResult<Commit> {
        let changes = diff_three_way(storage.as_ref(), ancestor, left, right).await?;
        merge_into_journal(storage, left, right, &self.cancel, self.name(), changes, self).await
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }
}

// ============================================================================
// Resolver delegation (AutomaticWithFallback, Custom)
// ============================================================================

/// Hands changes to a `ConflictResolver` chunk by chunk and applies answers
struct Delegate {
    resolver: Arc<dyn ConflictResolver>,
    chunk_size: usize,
    cancel: CancelFlag,
    name: &'static str,
}

impl Delegate {
    fn new(resolver: Arc<dyn ConflictResolver>, chunk_size: usize, name: &'static str) -> Self {
        Self {
            resolver,
            chunk_size: chunk_size.max(1),
            cancel: CancelFlag::default(),
            name,
        }
    }

    async fn resolve(
        &self,
        storage: &Arc<dyn PageStorage>,
        journal: &mut Journal,
        changes: &[ThreeWayChange],
    ) -> LedgerResult<()> {
        for chunk in changes.chunks(self.chunk_size) {
            self.cancel.check(self.name)?;
            let mut diffs = Vec::with_capacity(chunk.len());
            for change in chunk {
                diffs.push(ValueDiff {
                    key: change.key.clone(),
                    base: read_value(storage.as_ref(), change.base.as_ref()).await?,
                    left: read_value(storage.as_ref(), change.left.as_ref()).await?,
                    right: read_value(storage.as_ref(), change.right.as_ref()).await?,
                });
            }
            let merged = self.resolver.resolve(storage.page_id(), diffs).await?;
            self.cancel.check(self.name)?;

            let by_key: HashMap<&[u8], &ThreeWayChange> =
                chunk.iter().map(|c| (c.key.as_slice(), c)).collect();
            for value in merged {
                let change = by_key.get(value.key.as_slice()).ok_or_else(|| {
                    LedgerError::invalid_argument(format!(
                        "conflict resolver answered for key {:?} outside its chunk",
                        String::from_utf8_lossy(&value.key)
                    ))
                })?;
                match value.source {
                    ValueSource::Right => {
                        write_entry(journal, &value.key, change.right.as_ref()).await?
                    }
                    ValueSource::Left => {
                        write_entry(journal, &value.key, change.left.as_ref()).await?
                    }
                    ValueSource::New(bytes, priority) => {
                        let object_id = storage.add_object(bytes).await?;
                        journal.put(value.key, object_id, priority).await?
                    }
                    ValueSource::Delete => journal.delete(value.key).await?,
                }
            }
        }
        Ok(())
    }
}

/// Merges non-overlapping changes; overlapping ones go to a resolver
pub struct AutomaticWithFallback {
    delegate: Delegate,
}

impl AutomaticWithFallback {
    /// Create the strategy with the resolver for overlapping keys
    pub fn new(resolver: Arc<dyn ConflictResolver>, chunk_size: usize) -> Self {
        Self {
            delegate: Delegate::new(resolver, chunk_size, "automatic_with_fallback"),
        }
    }
}

#[async_trait]
impl FillJournal for AutomaticWithFallback {
    async fn fill(
        &self,
        storage: &Arc<dyn PageStorage>,
        journal: &mut Journal,
        changes: Vec<ThreeWayChange>,
    ) -> LedgerResult<()> {
        let (conflicts, automatic): (Vec<_>, Vec<_>) =
            changes.into_iter().partition(ThreeWayChange::is_conflict);
        for change in automatic.iter().filter(|c| !c.left_changed()) {
            write_entry(journal, &change.key, change.right.as_ref()).await?;
        }
        self.delegate.resolve(storage, journal, &conflicts).await
    }
}

#[async_trait]
impl MergeStrategy for AutomaticWithFallback {
    fn name(&self) -> &'static str {
        self.delegate.name
    }

    async fn merge(
        &self,
        storage: &Arc<dyn PageStorage>,
        left: &Commit,
        right: &Commit,
        ancestor: &Commit,
    ) -> LedgerResult<Commit> {
        let changes = diff_three_way(storage.as_ref(), ancestor, left, right).await?;
        merge_into_journal(
            storage,
            left,
            right,
            &self.delegate.cancel,
            self.name(),
            changes,
            self,
        )
        .await
    }

    fn cancel(&self) {
        self.delegate.cancel.cancel();
    }
}

/// Hands the full diff to a resolver
pub struct Custom {
    delegate: Delegate,
}

impl Custom {
    /// Create the strategy with the resolver for every changed key
    pub fn new(resolver: Arc<dyn ConflictResolver>, chunk_size: usize) -> Self {
        Self {
            delegate: Delegate::new(resolver, chunk_size, "custom"),
        }
    }
}

#[async_trait]
impl FillJournal for Custom {
    async fn fill(
        &self,
        storage: &Arc<dyn PageStorage>,
        journal: &mut Journal,
        changes: Vec<ThreeWayChange>,
    ) -> LedgerResult<()> {
        self.delegate.resolve(storage, journal, &changes).await
    }
}

#[async_trait]
impl MergeStrategy for Custom {
    fn name(&self) -> &'static str {
        self.delegate.name
    }

    async fn merge(
        &self,
        storage: &Arc<dyn PageStorage>,
        left: &Commit,
        right: &Commit,
        ancestor: &Commit,
    ) -> LedgerResult<Commit> {
        let changes = diff_three_way(storage.as_ref(), ancestor, left, right).await?;
        merge_into_journal(
            storage,
            left,
            right,
            &self.delegate.cancel,
            self.name(),
            changes,
            self,
        )
        .await
    }

    fn cancel(&self) {
        self.delegate.cancel.cancel();
    }
}
