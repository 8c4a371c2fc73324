//! Content-addressed trees
//!
//! A tree is the full sorted key → entry map of one page version. Its id is
//! the SHA-256 of a domain-tagged encoding of the entries, so two trees with
//! the same content always share an id and no-op edits are detectable by
//! comparing root ids.
//!
//! The on-disk B-tree encoding belongs to the block store; this in-memory
//! representation keeps one node per tree.

use ledger_core::{Entry, EntryChange, LedgerResult, ObjectId};
use std::collections::BTreeMap;
use std::sync::Arc;

const TREE_TAG: &[u8] = b"ledger-tree\0";

/// Immutable shared tree node
pub type TreeNode = Arc<BTreeMap<Vec<u8>, Entry>>;

/// Compute the id of a tree from its entries
pub fn tree_id(entries: &BTreeMap<Vec<u8>, Entry>) -> LedgerResult<ObjectId> {
    let list: Vec<&Entry> = entries.values().collect();
    let mut bytes = TREE_TAG.to_vec();
    bytes.extend(bincode::serialize(&list)?);
    Ok(ObjectId::hash_of(&bytes))
}

/// Id of the tree with no entries
pub fn empty_tree_id() -> ObjectId {
    // The empty entry list always encodes.
    tree_id(&BTreeMap::new()).unwrap_or_else(|_| ObjectId::hash_of(TREE_TAG))
}

/// Apply changes to a base tree, returning the new content
///
/// Later changes to the same key win.
pub fn apply(base: &BTreeMap<Vec<u8>, Entry>, changes: Vec<EntryChange>) -> BTreeMap<Vec<u8>, Entry> {
    let mut next = base.clone();
    for change in changes {
        match change {
            EntryChange::Put(entry) => {
                next.insert(entry.key.clone(), entry);
            }
            EntryChange::Delete(key) => {
                next.remove(&key);
            }
        }
    }
    next
}
