//! Merge policies and the ledger-wide merge manager
//!
//! A [`MergePolicy`] names the strategy a page should use. The
//! [`LedgerMergeManager`] decides the policy of every page, either from the
//! application's [`ConflictResolverFactory`] or from the configured default,
//! and pushes the resulting strategy to the page's resolver. Replacing the
//! factory re-applies policies to every live page.

use crate::resolver::MergeResolver;
use crate::strategy::{AutomaticWithFallback, ConflictResolver, Custom, LastOneWins, MergeStrategy};
use ledger_core::{LedgerError, LedgerResult, PageId};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Policy name, as found in configuration and returned by factories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicyKind {
    /// Never merge automatically
    None,
    /// Newer commit wins overlapping keys
    #[default]
    LastOneWins,
    /// Merge disjoint changes, delegate overlapping keys
    AutomaticWithFallback,
    /// Delegate every changed key
    Custom,
}

impl MergePolicyKind {
    /// Configuration spelling of the policy
    pub fn as_str(&self) -> &'static str {
        match self {
            MergePolicyKind::None => "none",
            MergePolicyKind::LastOneWins => "last_one_wins",
            MergePolicyKind::AutomaticWithFallback => "automatic_with_fallback",
            MergePolicyKind::Custom => "custom",
        }
    }

    /// Whether the policy needs a conflict resolver
    pub fn needs_resolver(&self) -> bool {
        matches!(
            self,
            MergePolicyKind::AutomaticWithFallback | MergePolicyKind::Custom
        )
    }
}

impl fmt::Display for MergePolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MergePolicyKind {
    type Err = LedgerError;

    fn from_str(s: &str) -> LedgerResult<Self> {
        match s {
            "none" => Ok(MergePolicyKind::None),
            "last_one_wins" => Ok(MergePolicyKind::LastOneWins),
            "automatic_with_fallback" => Ok(MergePolicyKind::AutomaticWithFallback),
            "custom" => Ok(MergePolicyKind::Custom),
            other => Err(LedgerError::invalid_argument(format!(
                "unknown merge policy '{}'",
                other
            ))),
        }
    }
}

/// Policy of a page, with the resolver it delegates to if any
#[derive(Clone)]
pub enum MergePolicy {
    /// Leave conflicts in place
    None,
    /// Newer commit wins overlapping keys
    LastOneWins,
    /// Merge disjoint changes, delegate overlapping keys
    AutomaticWithFallback(Arc<dyn ConflictResolver>),
    /// Delegate every changed key
    Custom(Arc<dyn ConflictResolver>),
}

impl MergePolicy {
    /// Policy name
    pub fn kind(&self) -> MergePolicyKind {
        match self {
            MergePolicy::None => MergePolicyKind::None,
            MergePolicy::LastOneWins => MergePolicyKind::LastOneWins,
            MergePolicy::AutomaticWithFallback(_) => MergePolicyKind::AutomaticWithFallback,
            MergePolicy::Custom(_) => MergePolicyKind::Custom,
        }
    }

    /// Build a fresh strategy; `None` for [`MergePolicy::None`]
    pub fn into_strategy(self, chunk_size: usize) -> Option<Arc<dyn MergeStrategy>> {
        match self {
            MergePolicy::None => None,
            MergePolicy::LastOneWins => Some(Arc::new(LastOneWins::new())),
            MergePolicy::AutomaticWithFallback(resolver) => {
                Some(Arc::new(AutomaticWithFallback::new(resolver, chunk_size)))
            }
            MergePolicy::Custom(resolver) => Some(Arc::new(Custom::new(resolver, chunk_size))),
        }
    }
}

impl fmt::Debug for MergePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MergePolicy({})", self.kind())
    }
}

/// Application hook choosing policies and resolvers per page
pub trait ConflictResolverFactory: Send + Sync {
    /// Policy for a page
    fn get_policy(&self, page_id: &PageId) -> MergePolicyKind;

    /// Resolver for a page whose policy needs one
    fn new_conflict_resolver(&self, page_id: &PageId) -> Arc<dyn ConflictResolver>;
}

/// Ledger-wide merge configuration
///
/// Tracks the resolvers of live pages weakly; a resolver is forgotten when
/// its page is torn down.
pub struct LedgerMergeManager {
    default_policy: MergePolicyKind,
    chunk_size: usize,
    factory: RwLock<Option<Arc<dyn ConflictResolverFactory>>>,
    resolvers: Mutex<HashMap<PageId, Weak<MergeResolver>>>,
}

impl LedgerMergeManager {
    /// Create a manager with the policy used when no factory is set
    pub fn new(default_policy: MergePolicyKind, chunk_size: usize) -> Self {
        Self {
            default_policy,
            chunk_size,
            factory: RwLock::new(None),
            resolvers: Mutex::new(HashMap::new()),
        }
    }

    /// Policy used when no factory is set
    pub fn default_policy(&self) -> MergePolicyKind {
        self.default_policy
    }

    /// Policy a page should use
    ///
    /// Policies needing a resolver fall back to `None` when no factory can
    /// provide one.
    pub fn policy_for(&self, page_id: &PageId) -> MergePolicy {
        let factory = self.factory.read().clone();
        let kind = match &factory {
            Some(factory) => factory.get_policy(page_id),
            None => self.default_policy,
        };
        match (kind, factory) {
            (MergePolicyKind::None, _) => MergePolicy::None,
            (MergePolicyKind::LastOneWins, _) => MergePolicy::LastOneWins,
            (MergePolicyKind::AutomaticWithFallback, Some(factory)) => {
                MergePolicy::AutomaticWithFallback(factory.new_conflict_resolver(page_id))
            }
            (MergePolicyKind::Custom, Some(factory)) => {
                MergePolicy::Custom(factory.new_conflict_resolver(page_id))
            }
            (kind, None) => {
                warn!(
                    target: "ledger::ledger",
                    page_id = %page_id,
                    policy = %kind,
                    "Policy needs a conflict resolver factory, leaving conflicts in place"
                );
                MergePolicy::None
            }
        }
    }

    /// Fresh strategy for a page
    pub fn strategy_for(&self, page_id: &PageId) -> Option<Arc<dyn MergeStrategy>> {
        self.policy_for(page_id).into_strategy(self.chunk_size)
    }

    /// Build a strategy for an explicit policy with this manager's settings
    pub fn strategy_from(&self, policy: MergePolicy) -> Option<Arc<dyn MergeStrategy>> {
        policy.into_strategy(self.chunk_size)
    }

    /// Track a page's resolver and install its strategy
    pub fn register(&self, resolver: &Arc<MergeResolver>) {
        let page_id = resolver.page_id().clone();
        resolver.set_merge_strategy(self.strategy_for(&page_id));
        self.resolvers.lock().insert(page_id, Arc::downgrade(resolver));
    }

    /// Forget a page's resolver, unless another one took its place
    pub fn unregister(&self, resolver: &Arc<MergeResolver>) {
        let mut resolvers = self.resolvers.lock();
        let current = resolvers
            .get(resolver.page_id())
            .map_or(false, |weak| weak.as_ptr() == Arc::as_ptr(resolver));
        if current {
            resolvers.remove(resolver.page_id());
        }
    }

    /// Replace the factory and re-apply policies to every live page
    pub fn set_factory(&self, factory: Option<Arc<dyn ConflictResolverFactory>>) {
        *self.factory.write() = factory;
        let live: Vec<Arc<MergeResolver>> = {
            let mut resolvers = self.resolvers.lock();
            resolvers.retain(|_, weak| weak.strong_count() > 0);
            resolvers.values().filter_map(Weak::upgrade).collect()
        };
        debug!(
            target: "ledger::ledger",
            pages = live.len(),
            "Conflict resolver factory replaced, re-applying policies"
        );
        for resolver in live {
            resolver.set_merge_strategy(self.strategy_for(resolver.page_id()));
        }
    }
}
