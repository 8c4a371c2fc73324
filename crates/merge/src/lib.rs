//! Conflict resolution for the ledger
//!
//! This crate brings a page with several DAG heads back to one head:
//! - find_common_ancestor: lowest common ancestor of two commits
//! - diff_three_way: per-key changes of two commits against their ancestor
//! - MergeStrategy: LastOneWins, AutomaticWithFallback, Custom
//! - MergeResolver: per-page actor detecting conflicts and driving merges
//! - Backoff: storm avoidance and failure retry delays
//! - LedgerMergeManager: per-page policy selection and factory swaps

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod ancestor;
pub mod backoff;
pub mod diff;
pub mod policy;
pub mod resolver;
pub mod strategy;

pub use ancestor::find_common_ancestor;
pub use backoff::{Backoff, BackoffConfig};
pub use diff::{diff_three_way, ThreeWayChange};
pub use policy::{ConflictResolverFactory, LedgerMergeManager, MergePolicy, MergePolicyKind};
pub use resolver::{
    ConflictResolutionOutcome, DelayPolicy, MergeResolver, ResolverConfig, ResolverPhase,
    ResolverStats,
};
pub use strategy::{
    AutomaticWithFallback, ConflictResolver, Custom, LastOneWins, MergeStrategy, MergedValue,
    ValueDiff, ValueSource,
};
