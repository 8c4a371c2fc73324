//! Three-way diff between two commits and their common ancestor

use ledger_core::{Commit, Entry, LedgerResult, PageStorage};
use std::collections::{BTreeMap, BTreeSet};

/// One key whose binding differs on at least one side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreeWayChange {
    /// Key
    pub key: Vec<u8>,
    /// Binding in the common ancestor
    pub base: Option<Entry>,
    /// Binding in the left (older) commit
    pub left: Option<Entry>,
    /// Binding in the right (newer) commit
    pub right: Option<Entry>,
}

impl ThreeWayChange {
    /// Whether the left side changed this key
    pub fn left_changed(&self) -> bool {
        self.left != self.base
    }

    /// Whether the right side changed this key
    pub fn right_changed(&self) -> bool {
        self.right != self.base
    }

    /// Both sides changed the key, to different bindings
    pub fn is_conflict(&self) -> bool {
        self.left_changed() && self.right_changed() && self.left != self.right
    }
}

async fn tree_of(
    storage: &dyn PageStorage,
    commit: &Commit,
) -> LedgerResult<BTreeMap<Vec<u8>, Entry>> {
    Ok(storage
        .get_entries(commit.root_id())
        .await?
        .into_iter()
        .map(|e| (e.key.clone(), e))
        .collect())
}

/// Keys changed by `left` or `right` relative to `ancestor`, sorted by key
pub async fn diff_three_way(
    storage: &dyn PageStorage,
    ancestor: &Commit,
    left: &Commit,
    right: &Commit,
) -> LedgerResult<Vec<ThreeWayChange>> {
    let mut base = tree_of(storage, ancestor).await?;
    let mut left_tree = tree_of(storage, left).await?;
    let mut right_tree = tree_of(storage, right).await?;

    let keys: BTreeSet<Vec<u8>> = base
        .keys()
        .chain(left_tree.keys())
        .chain(right_tree.keys())
        .cloned()
        .collect();

    Ok(keys
        .into_iter()
        .filter_map(|key| {
            let change = ThreeWayChange {
                base: base.remove(&key),
                left: left_tree.remove(&key),
                right: right_tree.remove(&key),
                key,
            };
            (change.left_changed() || change.right_changed()).then_some(change)
        })
        .collect())
}
