//! In-memory page storage
//!
//! This module implements the `PageStorage` trait using:
//! - `HashMap<CommitId, Commit>` for the commit DAG plus a sorted head set
//! - content-addressed tree nodes and value objects
//! - a journal DB (buffered changes per journal) with per-object counters
//! - `parking_lot::RwLock` for thread-safe access
//!
//! # Atomicity
//!
//! `execute` validates every operation of a batch before applying any of
//! them, and applies them under a single write lock. Watchers are notified
//! after the lock is released so they may call back into the storage.

use crate::testing::{FailPoint, FaultInjector};
use crate::tree::{self, TreeNode};
use async_trait::async_trait;
use ledger_core::{
    BatchOp, ChangeSource, Commit, CommitBundle, CommitId, CommitWatcher, Entry, EntryChange,
    JournalId, LedgerError, LedgerResult, MonotonicClock, ObjectId, PageId, PageStorage,
    StorageBatch, Timestamp, TreeUpdate,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace};

#[derive(Debug, Default)]
struct PageState {
    commits: HashMap<CommitId, Commit>,
    /// Commits that have at least one child
    has_child: HashSet<CommitId>,
    /// Commits with no child, ordered by (timestamp, id)
    heads: BTreeSet<(Timestamp, CommitId)>,
    /// Objects each commit keeps alive
    commit_objects: HashMap<CommitId, Vec<ObjectId>>,
    trees: HashMap<ObjectId, TreeNode>,
    /// Trees that are the root of at least one commit
    committed_roots: HashSet<ObjectId>,
    objects: HashMap<ObjectId, Vec<u8>>,
    untracked: HashSet<ObjectId>,
    journals: HashMap<JournalId, BTreeMap<Vec<u8>, EntryChange>>,
    value_counters: HashMap<ObjectId, i64>,
    next_journal_id: u64,
}

impl PageState {
    fn commit(&self, id: &CommitId) -> LedgerResult<&Commit> {
        self.commits
            .get(id)
            .ok_or_else(|| LedgerError::not_found(format!("commit {}", id)))
    }

    fn tree(&self, id: &ObjectId) -> LedgerResult<&TreeNode> {
        self.trees
            .get(id)
            .ok_or_else(|| LedgerError::not_found(format!("tree {}", id)))
    }

    fn journal_mut(
        &mut self,
        id: JournalId,
    ) -> LedgerResult<&mut BTreeMap<Vec<u8>, EntryChange>> {
        self.journals
            .get_mut(&id)
            .ok_or_else(|| LedgerError::not_found(format!("{}", id)))
    }

    /// Insert a commit whose parents and tree are present; false if already known
    fn insert_commit(&mut self, commit: Commit, objects: Vec<ObjectId>) -> bool {
        let id = *commit.id();
        if self.commits.contains_key(&id) {
            return false;
        }
        for parent_id in commit.parent_ids() {
            self.has_child.insert(*parent_id);
            if let Some(parent) = self.commits.get(parent_id) {
                self.heads.remove(&(parent.timestamp(), *parent_id));
            }
        }
        if !self.has_child.contains(&id) {
            self.heads.insert((commit.timestamp(), id));
        }
        self.committed_roots.insert(*commit.root_id());
        self.commit_objects.insert(id, objects);
        self.commits.insert(id, commit);
        true
    }

    fn validate(&self, op: &BatchOp) -> LedgerResult<()> {
        match op {
            BatchOp::AddJournalEntry { journal_id, .. }
            | BatchOp::RemoveJournalEntry { journal_id, .. }
            | BatchOp::RemoveJournal { journal_id } => {
                if !self.journals.contains_key(journal_id) {
                    return Err(LedgerError::not_found(format!("{}", journal_id)));
                }
            }
            BatchOp::AdjustValueCounter { .. } => {}
            BatchOp::AddCommit { commit, .. } => {
                for parent_id in commit.parent_ids() {
                    self.commit(parent_id)?;
                }
                self.tree(commit.root_id())?;
            }
        }
        Ok(())
    }

    fn apply(&mut self, op: BatchOp, added: &mut Vec<Commit>) -> LedgerResult<()> {
        match op {
            BatchOp::AddJournalEntry { journal_id, entry } => {
                let journal = self.journal_mut(journal_id)?;
                journal.insert(entry.key.clone(), EntryChange::Put(entry));
            }
            BatchOp::RemoveJournalEntry { journal_id, key } => {
                let journal = self.journal_mut(journal_id)?;
                journal.insert(key.clone(), EntryChange::Delete(key));
            }
            BatchOp::AdjustValueCounter { object_id, delta } => {
                let counter = self.value_counters.entry(object_id).or_insert(0);
                *counter += delta;
                if *counter == 0 {
                    self.value_counters.remove(&object_id);
                }
            }
            BatchOp::RemoveJournal { journal_id } => {
                self.journals.remove(&journal_id);
            }
            BatchOp::AddCommit { commit, objects } => {
                if self.insert_commit(commit.clone(), objects) {
                    added.push(commit);
                }
            }
        }
        Ok(())
    }
}

/// A received bundle whose objects and tree match their ids
struct StagedBundle {
    commit: Commit,
    content: BTreeMap<Vec<u8>, Entry>,
    objects: Vec<(ObjectId, Vec<u8>)>,
}

impl StagedBundle {
    fn verify(bundle: CommitBundle) -> LedgerResult<Self> {
        let id = *bundle.commit.id();
        for (object_id, data) in &bundle.objects {
            if ObjectId::hash_of(data) != *object_id {
                return Err(LedgerError::internal(format!(
                    "object {} does not match its content",
                    object_id
                )));
            }
        }
        let content: BTreeMap<Vec<u8>, Entry> = bundle
            .entries
            .into_iter()
            .map(|e| (e.key.clone(), e))
            .collect();
        let root_id = tree::tree_id(&content)?;
        if root_id != *bundle.commit.root_id() {
            return Err(LedgerError::internal(format!(
                "commit {} root {} does not match received tree {}",
                id,
                bundle.commit.root_id(),
                root_id
            )));
        }
        Ok(Self {
            commit: bundle.commit,
            content,
            objects: bundle.objects,
        })
    }
}

/// In-memory `PageStorage`
///
/// Created with the page's root commit (empty tree, no parents) already in
/// place, so the page starts converged with a single head.
pub struct InMemoryPageStorage {
    page_id: PageId,
    state: RwLock<PageState>,
    watchers: Mutex<Vec<Arc<dyn CommitWatcher>>>,
    clock: MonotonicClock,
    faults: FaultInjector,
}

impl InMemoryPageStorage {
    /// Create storage for a page, seeded with its root commit
    pub fn new(page_id: PageId) -> Self {
        let empty_id = tree::empty_tree_id();
        let mut state = PageState::default();
        state.trees.insert(empty_id, Arc::new(BTreeMap::new()));
        state.insert_commit(Commit::root(empty_id), Vec::new());
        Self {
            page_id,
            state: RwLock::new(state),
            watchers: Mutex::new(Vec::new()),
            clock: MonotonicClock::new(),
            faults: FaultInjector::new(),
        }
    }

    /// Fault injector consulted by this storage
    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    /// Number of commits in the DAG, including the root commit
    pub fn commit_count(&self) -> usize {
        self.state.read().commits.len()
    }

    /// Number of journals not yet committed or rolled back
    pub fn open_journal_count(&self) -> usize {
        self.state.read().journals.len()
    }

    /// Objects registered together with a commit
    pub fn commit_objects(&self, id: &CommitId) -> Option<Vec<ObjectId>> {
        self.state.read().commit_objects.get(id).cloned()
    }

    fn notify(&self, commits: &[Commit], source: ChangeSource) {
        if commits.is_empty() {
            return;
        }
        // Clone the list so watchers can subscribe/unsubscribe from the callback.
        let watchers: Vec<Arc<dyn CommitWatcher>> = self.watchers.lock().clone();
        trace!(
            target: "ledger::storage",
            page_id = %self.page_id,
            count = commits.len(),
            watchers = watchers.len(),
            ?source,
            "Notifying commit watchers"
        );
        for watcher in watchers {
            watcher.on_new_commits(commits, source);
        }
    }
}

#[async_trait]
impl PageStorage for InMemoryPageStorage {
    fn page_id(&self) -> &PageId {
        &self.page_id
    }

    fn next_timestamp(&self) -> Timestamp {
        self.clock.tick()
    }

    async fn get_head_commit_ids(&self) -> LedgerResult<Vec<CommitId>> {
        self.faults.check(FailPoint::GetHeads)?;
        Ok(self.state.read().heads.iter().map(|(_, id)| *id).collect())
    }

    async fn get_commit(&self, id: &CommitId) -> LedgerResult<Commit> {
        self.faults.check(FailPoint::GetCommit)?;
        self.state.read().commit(id).cloned()
    }

    async fn get_commit_bundle(&self, id: &CommitId) -> LedgerResult<CommitBundle> {
        let state = self.state.read();
        let commit = state.commit(id)?.clone();
        let entries: Vec<Entry> = state.tree(commit.root_id())?.values().cloned().collect();
        let objects = entries
            .iter()
            .filter_map(|e| {
                state
                    .objects
                    .get(&e.object_id)
                    .map(|data| (e.object_id, data.clone()))
            })
            .collect();
        Ok(CommitBundle {
            commit,
            entries,
            objects,
        })
    }

    async fn add_commits_from_sync(&self, bundles: Vec<CommitBundle>) -> LedgerResult<()> {
        let mut added = Vec::new();
        {
            let mut state = self.state.write();
            let mut staged: Vec<StagedBundle> = Vec::new();
            let mut staged_ids: HashSet<CommitId> = HashSet::new();
            for bundle in bundles {
                let id = *bundle.commit.id();
                if state.commits.contains_key(&id) || staged_ids.contains(&id) {
                    continue;
                }
                for parent_id in bundle.commit.parent_ids() {
                    if !staged_ids.contains(parent_id) {
                        state.commit(parent_id)?;
                    }
                }
                staged_ids.insert(id);
                staged.push(StagedBundle::verify(bundle)?);
            }
            for StagedBundle {
                commit,
                content,
                objects,
            } in staged
            {
                let root_id = *commit.root_id();
                state.trees.entry(root_id).or_insert_with(|| Arc::new(content));
                let mut retained = vec![root_id];
                for (object_id, data) in objects {
                    state.objects.entry(object_id).or_insert(data);
                    retained.push(object_id);
                }
                self.clock.observe(commit.timestamp());
                if state.insert_commit(commit.clone(), retained) {
                    added.push(commit);
                }
            }
        }
        debug!(
            target: "ledger::storage",
            page_id = %self.page_id,
            added = added.len(),
            "Imported commits from sync"
        );
        self.notify(&added, ChangeSource::Remote);
        Ok(())
    }

    async fn add_object(&self, data: Vec<u8>) -> LedgerResult<ObjectId> {
        let id = ObjectId::hash_of(&data);
        let mut state = self.state.write();
        if !state.objects.contains_key(&id) {
            state.objects.insert(id, data);
            state.untracked.insert(id);
        }
        Ok(id)
    }

    async fn get_object(&self, id: &ObjectId) -> LedgerResult<Vec<u8>> {
        self.state
            .read()
            .objects
            .get(id)
            .cloned()
            .ok_or_else(|| LedgerError::not_found(format!("object {}", id)))
    }

    async fn is_object_untracked(&self, id: &ObjectId) -> LedgerResult<bool> {
        Ok(self.state.read().untracked.contains(id))
    }

    async fn mark_object_synced(&self, id: &ObjectId) -> LedgerResult<()> {
        let mut state = self.state.write();
        state.untracked.remove(id);
        state.value_counters.remove(id);
        Ok(())
    }

    fn empty_tree_id(&self) -> ObjectId {
        tree::empty_tree_id()
    }

    async fn get_entries(&self, root_id: &ObjectId) -> LedgerResult<Vec<Entry>> {
        Ok(self.state.read().tree(root_id)?.values().cloned().collect())
    }

    async fn get_entry(&self, root_id: &ObjectId, key: &[u8]) -> LedgerResult<Option<Entry>> {
        Ok(self.state.read().tree(root_id)?.get(key).cloned())
    }

    async fn apply_changes(
        &self,
        base_root: &ObjectId,
        changes: Vec<EntryChange>,
    ) -> LedgerResult<TreeUpdate> {
        let base = Arc::clone(self.state.read().tree(base_root)?);
        let content = tree::apply(&base, changes);
        let root_id = tree::tree_id(&content)?;

        let mut state = self.state.write();
        state.trees.entry(root_id).or_insert_with(|| Arc::new(content));
        // A tree left behind by a failed commit is still new to the DAG.
        let new_nodes = if state.committed_roots.contains(&root_id) {
            Vec::new()
        } else {
            vec![root_id]
        };
        Ok(TreeUpdate { root_id, new_nodes })
    }

    async fn create_journal(&self) -> LedgerResult<JournalId> {
        let mut state = self.state.write();
        state.next_journal_id += 1;
        let id = JournalId(state.next_journal_id);
        state.journals.insert(id, BTreeMap::new());
        Ok(id)
    }

    async fn get_journal_value(
        &self,
        journal_id: JournalId,
        key: &[u8],
    ) -> LedgerResult<Option<EntryChange>> {
        let state = self.state.read();
        let journal = state
            .journals
            .get(&journal_id)
            .ok_or_else(|| LedgerError::not_found(format!("{}", journal_id)))?;
        Ok(journal.get(key).cloned())
    }

    async fn get_journal_entries(&self, journal_id: JournalId) -> LedgerResult<Vec<EntryChange>> {
        let state = self.state.read();
        let journal = state
            .journals
            .get(&journal_id)
            .ok_or_else(|| LedgerError::not_found(format!("{}", journal_id)))?;
        Ok(journal.values().cloned().collect())
    }

    async fn get_journal_value_counter(&self, object_id: &ObjectId) -> LedgerResult<i64> {
        Ok(self
            .state
            .read()
            .value_counters
            .get(object_id)
            .copied()
            .unwrap_or(0))
    }

    async fn execute(&self, batch: StorageBatch) -> LedgerResult<()> {
        self.faults.check(FailPoint::Execute)?;
        let mut added = Vec::new();
        {
            let mut state = self.state.write();
            for op in batch.ops() {
                state.validate(op)?;
            }
            for op in batch.into_ops() {
                state.apply(op, &mut added)?;
            }
        }
        self.notify(&added, ChangeSource::Local);
        Ok(())
    }

    fn add_commit_watcher(&self, watcher: Arc<dyn CommitWatcher>) {
        self.watchers.lock().push(watcher);
    }

    fn remove_commit_watcher(&self, watcher: &Arc<dyn CommitWatcher>) {
        self.watchers.lock().retain(|w| !Arc::ptr_eq(w, watcher));
    }
}
