//! Journal lifecycle across commit, rollback, and failure.

use crate::common::*;
use ledger_core::{KeyPriority, LedgerError, PageStorage};
use ledger_journal::{JournalKind, JournalState, JournalStorageExt, JournalType};
use ledger_storage::FailPoint;

#[tokio::test]
async fn delete_on_terminated_journal_is_illegal_and_keeps_counters() {
    init_tracing();
    let (_, storage) = page("lifecycle");
    let base = root(&storage).await;
    let object_id = storage.add_object(b"Alice".to_vec()).await.unwrap();

    let mut journal = storage
        .start_commit(base.id(), JournalType::Implicit)
        .await
        .unwrap();
    journal
        .put("name", object_id, KeyPriority::Eager)
        .await
        .unwrap();
    assert_eq!(storage.get_journal_value_counter(&object_id).await.unwrap(), 1);
    journal.rollback().await.unwrap();
    assert_eq!(storage.get_journal_value_counter(&object_id).await.unwrap(), 0);

    let err = journal.delete("name").await.unwrap_err();
    assert!(matches!(err, LedgerError::IllegalState(_)));
    assert_eq!(journal.state(), JournalState::RolledBack);
    assert_eq!(storage.get_journal_value_counter(&object_id).await.unwrap(), 0);
}

#[tokio::test]
async fn no_op_commit_returns_parent() {
    init_tracing();
    let (concrete, storage) = page("noop");
    let base = commit_on(&storage, root(&storage).await.id(), &[("city", "Paris")], &[]).await;
    let commits_before = concrete.commit_count();

    // Rebinding a key to its current value leaves the tree untouched.
    let mut journal = storage
        .start_commit(base.id(), JournalType::Implicit)
        .await
        .unwrap();
    let same = storage.add_object(b"Paris".to_vec()).await.unwrap();
    journal.put("city", same, KeyPriority::Eager).await.unwrap();
    let commit = journal.commit().await.unwrap();

    assert_eq!(commit.id(), base.id());
    assert_eq!(journal.state(), JournalState::Committed);
    assert_eq!(concrete.commit_count(), commits_before);
    assert_eq!(concrete.open_journal_count(), 0);
    assert_eq!(storage.get_head_commit_ids().await.unwrap(), vec![*base.id()]);
}

#[tokio::test]
async fn reads_see_buffered_writes() {
    init_tracing();
    let (_, storage) = page("reads");
    let base = commit_on(&storage, root(&storage).await.id(), &[("a", "1"), ("b", "2")], &[]).await;

    let mut journal = storage
        .start_commit(base.id(), JournalType::Explicit)
        .await
        .unwrap();
    let three = storage.add_object(b"3".to_vec()).await.unwrap();
    journal.put("a", three, KeyPriority::Lazy).await.unwrap();
    journal.delete("b").await.unwrap();

    assert_eq!(journal.get(b"a").await.unwrap().unwrap().object_id, three);
    assert!(journal.get(b"b").await.unwrap().is_none());
    let commit = storage.commit_journal(journal).await.unwrap();
    assert_eq!(contents(&storage, commit.id()).await, map(&[("a", "3")]));
}

#[tokio::test]
async fn failed_explicit_journal_can_only_roll_back() {
    init_tracing();
    let (concrete, storage) = page("explicit");
    let base = root(&storage).await;
    let object_id = storage.add_object(b"v".to_vec()).await.unwrap();

    let mut journal = storage
        .start_commit(base.id(), JournalType::Explicit)
        .await
        .unwrap();
    concrete.faults().fail_next(FailPoint::Execute, 1);
    assert!(journal.put("k", object_id, KeyPriority::Eager).await.is_err());
    assert!(journal.has_failed_operation());

    let err = journal.put("k", object_id, KeyPriority::Eager).await.unwrap_err();
    assert!(matches!(err, LedgerError::IllegalState(_)));
    assert!(matches!(journal.commit().await, Err(LedgerError::IllegalState(_))));
    journal.rollback().await.unwrap();
    assert_eq!(concrete.open_journal_count(), 0);
}

#[tokio::test]
async fn failed_implicit_journal_keeps_going() {
    init_tracing();
    let (concrete, storage) = page("implicit");
    let base = root(&storage).await;
    let object_id = storage.add_object(b"v".to_vec()).await.unwrap();

    let mut journal = storage
        .start_commit(base.id(), JournalType::Implicit)
        .await
        .unwrap();
    concrete.faults().fail_next(FailPoint::Execute, 1);
    assert!(journal.put("k", object_id, KeyPriority::Eager).await.is_err());
    journal.put("k", object_id, KeyPriority::Eager).await.unwrap();
    let commit = journal.commit().await.unwrap();
    assert_eq!(contents(&storage, commit.id()).await, map(&[("k", "v")]));
}

#[tokio::test]
async fn merge_journal_takes_latest_parent_timestamp() {
    init_tracing();
    let (_, storage) = page("merge-ts");
    let base = root(&storage).await;
    let left = commit_on(&storage, base.id(), &[("x", "1")], &[]).await;
    let right = commit_on(&storage, base.id(), &[("y", "2")], &[]).await;

    let journal = storage.start_merge_commit(left.id(), right.id()).await.unwrap();
    assert!(matches!(journal.kind(), JournalKind::Merge { .. }));
    assert_eq!(journal.journal_type(), JournalType::Implicit);
    let merge = storage.commit_journal(journal).await.unwrap();

    assert_eq!(merge.parent_ids(), &[*left.id(), *right.id()]);
    assert_eq!(merge.timestamp(), left.timestamp().max(right.timestamp()));
    assert_eq!(merge.generation(), 2);
    assert_eq!(storage.get_head_commit_ids().await.unwrap(), vec![*merge.id()]);
}

#[tokio::test]
async fn start_commit_on_unknown_base_is_not_found() {
    init_tracing();
    let (_, storage) = page("unknown");
    let ghost = ledger_core::CommitId::hash_of(b"ghost");
    let err = storage
        .start_commit(&ghost, JournalType::Implicit)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn commit_retried_after_storage_failure_keeps_its_tree() {
    init_tracing();
    let (concrete, storage) = page("retry-tree");
    let base = root(&storage).await;
    let object_id = storage.add_object(b"Lyon".to_vec()).await.unwrap();

    let mut journal = storage
        .start_commit(base.id(), JournalType::Implicit)
        .await
        .unwrap();
    journal.put("city", object_id, KeyPriority::Eager).await.unwrap();
    concrete.faults().fail_next(FailPoint::Execute, 1);
    assert!(journal.commit().await.unwrap_err().is_transient());
    assert_eq!(journal.state(), JournalState::Valid);

    let commit = journal.commit().await.unwrap();
    let objects = concrete.commit_objects(commit.id()).unwrap();
    assert!(objects.contains(commit.root_id()));
    assert!(objects.contains(&object_id));
}
