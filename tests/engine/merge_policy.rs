//! Merge policies chosen per page by handles and resolver factories.

use crate::common::*;
use async_trait::async_trait;
use ledger_core::{LedgerResult, PageId};
use ledger_engine::{LedgerConfig, PageState};
use ledger_merge::{
    ConflictResolutionOutcome, ConflictResolver, ConflictResolverFactory, MergePolicy,
    MergePolicyKind, MergedValue, ValueDiff, ValueSource,
};
use std::sync::Arc;

async fn fork(handle: &ledger_engine::PageHandle, left: &str, right: &str) {
    let storage = handle.manager().storage();
    let base = handle.manager().newest_head().await.unwrap();
    commit_on(storage, base.id(), &[("k", left)], &[]).await;
    commit_on(storage, base.id(), &[("k", right)], &[]).await;
}

#[tokio::test]
async fn default_policy_merges_conflicts() {
    init_tracing();
    let (_, ledger) = ledger();
    let handle = ledger.get_page(PageId::from("lww"), PageState::Named).await.unwrap();
    fork(&handle, "old", "new").await;

    let outcome = handle.wait_for_conflict_resolution().await.unwrap();
    assert_eq!(outcome, ConflictResolutionOutcome::ConflictsResolved);
    assert_eq!(handle.get(b"k").await.unwrap(), Some(b"new".to_vec()));
}

#[tokio::test]
async fn configured_none_policy_keeps_heads() {
    init_tracing();
    let (_, ledger) = ledger_with(LedgerConfig {
        default_merge_policy: "none".to_string(),
        ..LedgerConfig::default()
    });
    let page_id = PageId::from("manual");
    let handle = ledger.get_page(page_id.clone(), PageState::Named).await.unwrap();
    fork(&handle, "a", "b").await;
    handle.manager().resolver().wait_until_idle().await;
    assert_eq!(ledger.debug_page(&page_id).await.unwrap().heads.len(), 2);

    handle.set_merge_policy(MergePolicy::LastOneWins);
    handle.wait_for_conflict_resolution().await.unwrap();
    assert_eq!(ledger.debug_page(&page_id).await.unwrap().heads.len(), 1);
}

struct Uppercase;

#[async_trait]
impl ConflictResolver for Uppercase {
    async fn resolve(&self, _page_id: &PageId, changes: Vec<ValueDiff>) -> LedgerResult<Vec<MergedValue>> {
        Ok(changes
            .into_iter()
            .map(|c| {
                let value = c.right.unwrap_or_default().to_ascii_uppercase();
                MergedValue::new(c.key, ValueSource::New(value, Default::default()))
            })
            .collect())
    }
}

struct Factory(MergePolicyKind);

impl ConflictResolverFactory for Factory {
    fn get_policy(&self, _page_id: &PageId) -> MergePolicyKind {
        self.0
    }

    fn new_conflict_resolver(&self, _page_id: &PageId) -> Arc<dyn ConflictResolver> {
        Arc::new(Uppercase)
    }
}

#[tokio::test]
async fn factory_swap_reapplies_policies_to_live_pages() {
    init_tracing();
    let (_, ledger) = ledger();
    ledger.set_conflict_resolver_factory(Some(Arc::new(Factory(MergePolicyKind::None))));
    let page_id = PageId::from("factory");
    let handle = ledger.get_page(page_id.clone(), PageState::Named).await.unwrap();
    fork(&handle, "left", "right").await;
    handle.manager().resolver().wait_until_idle().await;
    assert_eq!(ledger.debug_page(&page_id).await.unwrap().heads.len(), 2);

    ledger.set_conflict_resolver_factory(Some(Arc::new(Factory(MergePolicyKind::Custom))));
    handle.wait_for_conflict_resolution().await.unwrap();
    assert_eq!(handle.get(b"k").await.unwrap(), Some(b"RIGHT".to_vec()));
}

#[tokio::test]
async fn handle_policy_with_resolver() {
    init_tracing();
    let (_, ledger) = ledger();
    let handle = ledger.get_page(PageId::from("auto"), PageState::Named).await.unwrap();
    handle.set_merge_policy(MergePolicy::AutomaticWithFallback(Arc::new(Uppercase)));
    fork(&handle, "x", "y").await;

    handle.wait_for_conflict_resolution().await.unwrap();
    assert_eq!(handle.get(b"k").await.unwrap(), Some(b"Y".to_vec()));
}
