//! Immutable commit DAG nodes
//!
//! A commit names one version of a page: the root of its content tree plus
//! the commits it descends from. Commits are created only by committing a
//! journal or by decoding a commit received through sync, and are never
//! mutated afterwards. [`Commit`] is a cheap-to-clone shared handle.

use crate::error::{LedgerError, LedgerResult};
use crate::timestamp::Timestamp;
use crate::types::{CommitId, ObjectId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Hashed part of a commit; the id is the SHA-256 of its encoding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct CommitMetadata {
    parent_ids: Vec<CommitId>,
    root_id: ObjectId,
    timestamp: Timestamp,
    generation: u64,
}

#[derive(Debug, PartialEq, Eq)]
struct CommitInner {
    id: CommitId,
    metadata: CommitMetadata,
}

/// Immutable DAG node representing one version of a page's content
///
/// Invariants:
/// - `parent_ids` has 0 entries (root commit), 1 (normal commit) or 2 (merge commit)
/// - `generation` is `max(parent generations) + 1`, and 0 for the root commit
/// - `id` is the content hash of the other fields
#[derive(Clone, PartialEq, Eq)]
pub struct Commit(Arc<CommitInner>);

impl Commit {
    /// Create the root commit of a page from the id of the empty tree
    pub fn root(empty_tree_id: ObjectId) -> Self {
        Self::from_metadata(CommitMetadata {
            parent_ids: Vec::new(),
            root_id: empty_tree_id,
            timestamp: Timestamp::EPOCH,
            generation: 0,
        })
    }

    /// Create a commit on top of one parent (normal) or two parents (merge)
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` unless exactly one or two parents are given.
    pub fn new(root_id: ObjectId, parents: &[&Commit], timestamp: Timestamp) -> LedgerResult<Self> {
        if parents.is_empty() || parents.len() > 2 {
            return Err(LedgerError::invalid_argument(format!(
                "a commit needs 1 or 2 parents, got {}",
                parents.len()
            )));
        }
        let generation = parents
            .iter()
            .map(|p| p.generation())
            .max()
            .unwrap_or(0)
            + 1;
        Ok(Self::from_metadata(CommitMetadata {
            parent_ids: parents.iter().map(|p| *p.id()).collect(),
            root_id,
            timestamp,
            generation,
        }))
    }

    fn from_metadata(metadata: CommitMetadata) -> Self {
        // Encoding plain data into a Vec cannot fail.
        let bytes = bincode::serialize(&metadata).unwrap_or_default();
        let id = CommitId::hash_of(&bytes);
        Commit(Arc::new(CommitInner { id, metadata }))
    }

    /// Encode for transfer to a peer
    pub fn to_bytes(&self) -> LedgerResult<Vec<u8>> {
        Ok(bincode::serialize(&self.0.metadata)?)
    }

    /// Decode a commit received from a peer
    ///
    /// # Errors
    ///
    /// Returns `Serialization` if the bytes are malformed and
    /// `InvalidArgument` if the parent count is out of range.
    pub fn from_bytes(bytes: &[u8]) -> LedgerResult<Self> {
        let metadata: CommitMetadata = bincode::deserialize(bytes)?;
        if metadata.parent_ids.len() > 2 {
            return Err(LedgerError::invalid_argument(format!(
                "commit has {} parents",
                metadata.parent_ids.len()
            )));
        }
        Ok(Self::from_metadata(metadata))
    }

    /// Content hash of this commit
    pub fn id(&self) -> &CommitId {
        &self.0.id
    }

    /// Parents of this commit
    pub fn parent_ids(&self) -> &[CommitId] {
        &self.0.metadata.parent_ids
    }

    /// Root of the content tree
    pub fn root_id(&self) -> &ObjectId {
        &self.0.metadata.root_id
    }

    /// Creation time, used for tie-breaking only
    pub fn timestamp(&self) -> Timestamp {
        self.0.metadata.timestamp
    }

    /// Distance from the root commit along the longest parent chain
    pub fn generation(&self) -> u64 {
        self.0.metadata.generation
    }

    /// Whether this commit has two parents
    pub fn is_merge(&self) -> bool {
        self.0.metadata.parent_ids.len() == 2
    }

    /// Whether this is the page's root commit
    pub fn is_root(&self) -> bool {
        self.0.metadata.parent_ids.is_empty()
    }
}

impl fmt::Debug for Commit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Commit")
            .field("id", self.id())
            .field("parents", &self.parent_ids())
            .field("root", self.root_id())
            .field("timestamp", &self.timestamp())
            .field("generation", &self.generation())
            .finish()
    }
}

/// Order two commits oldest first: by timestamp, then by id
///
/// The older commit is the "left" merge input by convention.
pub fn order_by_age(a: Commit, b: Commit) -> (Commit, Commit) {
    if (a.timestamp(), *a.id()) <= (b.timestamp(), *b.id()) {
        (a, b)
    } else {
        (b, a)
    }
}
