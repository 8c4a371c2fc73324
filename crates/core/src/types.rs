//! Identifier and entry types
//!
//! This module defines the foundational value types:
//! - PageId: opaque byte-string naming a page within a ledger
//! - ObjectId: content hash of a stored value or tree node
//! - CommitId: content hash of a commit's serialized metadata
//! - JournalId: storage-assigned handle of an open journal
//! - Entry / EntryChange: key mutations carried by journals and diffs

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Length in bytes of every content hash
pub const HASH_LEN: usize = 32;

/// Opaque identifier of a page within a ledger namespace
///
/// Immutable and used as a map key; any byte string is a valid id.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PageId(Vec<u8>);

impl PageId {
    /// Wrap raw bytes as a page id
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        PageId(bytes.into())
    }

    /// Raw bytes of this id
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for PageId {
    fn from(s: &str) -> Self {
        PageId(s.as_bytes().to_vec())
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) if s.chars().all(|c| c.is_ascii_graphic()) => write!(f, "{}", s),
            _ => write!(f, "{}", hex::encode(&self.0)),
        }
    }
}

impl fmt::Debug for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PageId({})", self)
    }
}

macro_rules! hash_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name([u8; HASH_LEN]);

        impl $name {
            /// Wrap a raw digest
            pub const fn from_digest(digest: [u8; HASH_LEN]) -> Self {
                $name(digest)
            }

            /// SHA-256 of `data`
            pub fn hash_of(data: &[u8]) -> Self {
                let digest: [u8; HASH_LEN] = Sha256::digest(data).into();
                $name(digest)
            }

            /// Raw digest bytes
            pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
                &self.0
            }

            /// Short hex prefix used in logs
            pub fn short(&self) -> String {
                hex::encode(&self.0[..4])
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.short())
            }
        }
    };
}

hash_id!(
    /// Content hash identifying a serialized value or a tree node
    ///
    /// Equality implies identical content.
    ObjectId
);

hash_id!(
    /// Content hash of a commit's serialized metadata
    CommitId
);

/// Storage-assigned identifier of an open journal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JournalId(pub u64);

impl fmt::Display for JournalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "journal-{}", self.0)
    }
}

/// Download priority of a value
///
/// Eager values are fetched with the commit; lazy values on first read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum KeyPriority {
    /// Fetched together with the commit
    #[default]
    Eager,
    /// Fetched on demand
    Lazy,
}

/// A key bound to a stored value
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Entry {
    /// User key
    pub key: Vec<u8>,
    /// Id of the value object
    pub object_id: ObjectId,
    /// Download priority of the value
    pub priority: KeyPriority,
}

impl Entry {
    /// Create a new entry
    pub fn new(key: impl Into<Vec<u8>>, object_id: ObjectId, priority: KeyPriority) -> Self {
        Self {
            key: key.into(),
            object_id,
            priority,
        }
    }
}

/// A single mutation of a content tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryChange {
    /// Bind the key to a value
    Put(Entry),
    /// Remove the key
    Delete(Vec<u8>),
}

impl EntryChange {
    /// Key touched by this change
    pub fn key(&self) -> &[u8] {
        match self {
            EntryChange::Put(entry) => &entry.key,
            EntryChange::Delete(key) => key,
        }
    }
}

/// Origin of commits delivered to a commit watcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeSource {
    /// Committed by a journal on this device
    Local,
    /// Received from a peer through sync
    Remote,
}
