//! Pages with several heads converge one merge at a time.

use crate::common::*;
use async_trait::async_trait;
use ledger_core::{Commit, LedgerError, LedgerResult, PageStorage};
use ledger_merge::{ConflictResolutionOutcome, LastOneWins, MergeStrategy, ResolverPhase};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Last-one-wins that records how many merges overlap and may fail first
#[derive(Default)]
struct Instrumented {
    inner: LastOneWins,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    calls: AtomicUsize,
    fail_first: AtomicUsize,
}

impl Instrumented {
    fn failing(times: usize) -> Self {
        let strategy = Self::default();
        strategy.fail_first.store(times, Ordering::SeqCst);
        strategy
    }
}

#[async_trait]
impl MergeStrategy for Instrumented {
    fn name(&self) -> &'static str {
        "instrumented"
    }

    async fn merge(
        &self,
        storage: &Arc<dyn PageStorage>,
        left: &Commit,
        right: &Commit,
        ancestor: &Commit,
    ) -> LedgerResult<Commit> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
        let result = if self
            .fail_first
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            Err(LedgerError::storage("injected merge failure"))
        } else {
            self.inner.merge(storage, left, right, ancestor).await
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn cancel(&self) {
        self.inner.cancel();
    }
}

#[tokio::test]
async fn four_heads_converge_with_one_merge_at_a_time() {
    init_tracing();
    let (_, storage) = page("four");
    let resolver = resolver(&storage);
    let base = root(&storage).await;
    for i in 0..4 {
        let key = format!("k{}", i);
        commit_on(&storage, base.id(), &[(key.as_str(), "v")], &[]).await;
    }
    resolver.wait_until_idle().await;
    assert_eq!(storage.get_head_commit_ids().await.unwrap().len(), 4);

    let strategy = Arc::new(Instrumented::default());
    resolver.set_merge_strategy(Some(strategy.clone()));
    let outcome = resolver.wait_for_no_conflicts().await.unwrap();

    assert_eq!(outcome, ConflictResolutionOutcome::ConflictsResolved);
    assert_eq!(
        converged_contents(&storage).await,
        map(&[("k0", "v"), ("k1", "v"), ("k2", "v"), ("k3", "v")])
    );
    assert_eq!(strategy.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(strategy.calls.load(Ordering::SeqCst), 3);
    assert_eq!(resolver.stats().merges(), 3);
}

#[tokio::test]
async fn concurrent_writes_during_merge_are_coalesced() {
    init_tracing();
    let (_, storage) = page("busy");
    let resolver = resolver(&storage);
    let strategy = Arc::new(Instrumented::default());
    resolver.set_merge_strategy(Some(strategy.clone()));
    let base = root(&storage).await;

    let writers: Vec<_> = (0..6)
        .map(|i| {
            let storage = Arc::clone(&storage);
            let base = *base.id();
            tokio::spawn(async move {
                let key = format!("w{}", i);
                commit_on(&storage, &base, &[(key.as_str(), "x")], &[]).await;
            })
        })
        .collect();
    for writer in writers {
        writer.await.unwrap();
    }
    resolver.wait_for_no_conflicts().await.unwrap();
    resolver.wait_until_idle().await;

    assert_eq!(converged_contents(&storage).await.len(), 6);
    assert_eq!(strategy.max_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn identical_content_converges_without_strategy_call() {
    init_tracing();
    let (_, storage) = page("identical");
    let resolver = resolver(&storage);
    let strategy = Arc::new(Instrumented::default());
    let base = root(&storage).await;
    let a = commit_on(&storage, base.id(), &[("same", "value")], &[]).await;
    let b = commit_on(&storage, base.id(), &[("same", "value")], &[]).await;
    assert_ne!(a.id(), b.id());

    resolver.set_merge_strategy(Some(strategy.clone()));
    resolver.wait_for_no_conflicts().await.unwrap();

    let heads = storage.get_head_commit_ids().await.unwrap();
    let merge = storage.get_commit(&heads[0]).await.unwrap();
    assert!(merge.is_merge());
    assert_eq!(merge.root_id(), a.root_id());
    assert_eq!(strategy.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn single_head_releases_waiters_without_strategy() {
    init_tracing();
    let (_, storage) = page("single");
    let resolver = resolver(&storage);
    commit_on(&storage, root(&storage).await.id(), &[("k", "v")], &[]).await;

    let outcome = resolver.wait_for_no_conflicts().await.unwrap();
    assert_eq!(outcome, ConflictResolutionOutcome::NoConflicts);
}

#[tokio::test]
async fn no_strategy_leaves_heads_in_place() {
    init_tracing();
    let (_, storage) = page("manual");
    let resolver = resolver(&storage);
    let base = root(&storage).await;
    commit_on(&storage, base.id(), &[("a", "1")], &[]).await;
    commit_on(&storage, base.id(), &[("b", "2")], &[]).await;
    resolver.wait_until_idle().await;

    assert_eq!(storage.get_head_commit_ids().await.unwrap().len(), 2);
    assert_eq!(resolver.phase(), ResolverPhase::Idle);
    assert!(!resolver.has_unfinished_merges());
    assert_eq!(resolver.stats().merges(), 0);
}

#[tokio::test(start_paused = true)]
async fn failed_merge_is_retried_after_backoff() {
    init_tracing();
    let (_, storage) = page("retry");
    let resolver = resolver(&storage);
    let base = root(&storage).await;
    commit_on(&storage, base.id(), &[("a", "1")], &[]).await;
    commit_on(&storage, base.id(), &[("b", "2")], &[]).await;
    resolver.wait_until_idle().await;

    let strategy = Arc::new(Instrumented::failing(1));
    resolver.set_merge_strategy(Some(strategy.clone()));
    eventually(|| resolver.stats().failures() == 1).await;
    resolver.wait_until_idle().await;
    assert_eq!(storage.get_head_commit_ids().await.unwrap().len(), 2);

    tokio::time::advance(Duration::from_millis(50)).await;
    eventually(|| resolver.stats().merges() == 1).await;
    resolver.wait_until_idle().await;

    assert_eq!(converged_contents(&storage).await, map(&[("a", "1"), ("b", "2")]));
    assert_eq!(strategy.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn dropping_resolver_unsubscribes() {
    init_tracing();
    let (_, storage) = page("dropped");
    let resolver = resolver(&storage);
    resolver.set_merge_strategy(Some(Arc::new(LastOneWins::new())));
    resolver.wait_until_idle().await;
    drop(resolver);

    let base = root(&storage).await;
    commit_on(&storage, base.id(), &[("a", "1")], &[]).await;
    commit_on(&storage, base.id(), &[("b", "2")], &[]).await;
    tokio::task::yield_now().await;
    assert_eq!(storage.get_head_commit_ids().await.unwrap().len(), 2);
}
