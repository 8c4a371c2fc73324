//! Lowest common ancestor search over the commit DAG
//!
//! Walks back from both commits at once, always expanding the commit with
//! the highest `(generation, id)`. Every commit is tagged with the side(s)
//! it was reached from. Generations strictly decrease along parent edges, so
//! by the time a commit is popped all of its reachable descendants have been
//! expanded and its tags are final: the first commit popped with both tags
//! is a common ancestor with no common ancestor below it.

use ledger_core::{Commit, CommitId, LedgerError, LedgerResult, PageStorage};
use std::collections::{BinaryHeap, HashMap};
use tracing::{error, trace};

const LEFT: u8 = 0b01;
const RIGHT: u8 = 0b10;
const BOTH: u8 = LEFT | RIGHT;

/// Find the lowest common ancestor of `left` and `right`
///
/// # Errors
///
/// `Internal` if the walk runs out of commits without meeting, which means
/// the DAG is inconsistent. Storage errors from `get_commit` are returned
/// as is.
pub async fn find_common_ancestor(
    storage: &dyn PageStorage,
    left: &Commit,
    right: &Commit,
) -> LedgerResult<Commit> {
    let mut tags: HashMap<CommitId, (Commit, u8)> = HashMap::new();
    let mut queue: BinaryHeap<(u64, CommitId)> = BinaryHeap::new();

    for (commit, tag) in [(left, LEFT), (right, RIGHT)] {
        let slot = tags
            .entry(*commit.id())
            .or_insert_with(|| (commit.clone(), 0));
        if slot.1 == 0 {
            queue.push((commit.generation(), *commit.id()));
        }
        slot.1 |= tag;
    }

    let mut visited = 0usize;
    while let Some((_, id)) = queue.pop() {
        visited += 1;
        let (commit, tag) = match tags.get(&id) {
            Some((commit, tag)) => (commit.clone(), *tag),
            None => continue,
        };
        if tag == BOTH {
            trace!(
                target: "ledger::resolver",
                ancestor = %commit.id().short(),
                visited,
                "Found common ancestor"
            );
            return Ok(commit);
        }
        for parent_id in commit.parent_ids() {
            if let Some(slot) = tags.get_mut(parent_id) {
                slot.1 |= tag;
                continue;
            }
            let parent = storage.get_commit(parent_id).await?;
            queue.push((parent.generation(), *parent_id));
            tags.insert(*parent_id, (parent, tag));
        }
    }

    error!(
        target: "ledger::resolver",
        left = %left.id().short(),
        right = %right.id().short(),
        visited,
        "Commit DAG has no common ancestor"
    );
    Err(LedgerError::internal(format!(
        "no common ancestor for {} and {}",
        left.id(),
        right.id()
    )))
}
