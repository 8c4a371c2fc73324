//! Reference counts of untracked values held by live journals.

use crate::common::*;
use ledger_core::{KeyPriority, ObjectId, PageStorage};
use ledger_journal::{JournalStorageExt, JournalType};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;

const VALUES: [&str; 3] = ["red", "green", "blue"];

#[derive(Debug, Clone)]
enum Op {
    Put(u8, usize),
    Delete(u8),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0u8..4, 0usize..VALUES.len()).prop_map(|(k, v)| Op::Put(k, v)),
        1 => (0u8..4).prop_map(Op::Delete),
    ]
}

async fn counter(storage: &Arc<dyn PageStorage>, id: &ObjectId) -> i64 {
    storage.get_journal_value_counter(id).await.unwrap()
}

async fn run_ops(ops: Vec<Op>, commit: bool) {
    let (concrete, storage) = page("counters");
    let base = root(&storage).await;
    let mut ids = Vec::new();
    for value in VALUES {
        ids.push(storage.add_object(value.as_bytes().to_vec()).await.unwrap());
    }

    let mut journal = storage
        .start_commit(base.id(), JournalType::Implicit)
        .await
        .unwrap();
    let mut model: BTreeMap<u8, usize> = BTreeMap::new();
    for op in ops {
        match op {
            Op::Put(key, value) => {
                journal
                    .put(vec![key], ids[value], KeyPriority::Eager)
                    .await
                    .unwrap();
                model.insert(key, value);
            }
            Op::Delete(key) => {
                journal.delete(vec![key]).await.unwrap();
                model.remove(&key);
            }
        }
        // Each untracked value is counted once per key bound to it.
        for (value, id) in ids.iter().enumerate() {
            let expected = model.values().filter(|v| **v == value).count() as i64;
            assert_eq!(counter(&storage, id).await, expected);
        }
    }

    if commit {
        let commit = storage.commit_journal(journal).await.unwrap();
        let expected: BTreeMap<String, String> = model
            .iter()
            .map(|(k, v)| (String::from_utf8(vec![*k]).unwrap(), VALUES[*v].to_string()))
            .collect();
        assert_eq!(contents(&storage, commit.id()).await, expected);
    } else {
        journal.rollback().await.unwrap();
    }
    for id in &ids {
        assert_eq!(counter(&storage, id).await, 0);
    }
    assert_eq!(concrete.open_journal_count(), 0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn counters_track_live_entries(ops in prop::collection::vec(op(), 0..24), commit in any::<bool>()) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(run_ops(ops, commit));
    }
}

#[tokio::test]
async fn synced_value_is_not_counted() {
    init_tracing();
    let (_, storage) = page("synced");
    let base = root(&storage).await;
    let id = storage.add_object(b"stable".to_vec()).await.unwrap();
    storage.mark_object_synced(&id).await.unwrap();
    assert!(!storage.is_object_untracked(&id).await.unwrap());

    let mut journal = storage
        .start_commit(base.id(), JournalType::Implicit)
        .await
        .unwrap();
    journal.put("k", id, KeyPriority::Eager).await.unwrap();
    assert_eq!(counter(&storage, &id).await, 0);
    journal.rollback().await.unwrap();
}

#[tokio::test]
async fn two_journals_count_independently() {
    init_tracing();
    let (_, storage) = page("shared-value");
    let base = root(&storage).await;
    let id = storage.add_object(b"shared".to_vec()).await.unwrap();

    let mut first = storage
        .start_commit(base.id(), JournalType::Implicit)
        .await
        .unwrap();
    let mut second = storage
        .start_commit(base.id(), JournalType::Explicit)
        .await
        .unwrap();
    first.put("a", id, KeyPriority::Eager).await.unwrap();
    second.put("b", id, KeyPriority::Lazy).await.unwrap();
    assert_eq!(counter(&storage, &id).await, 2);

    first.rollback().await.unwrap();
    assert_eq!(counter(&storage, &id).await, 1);
    storage.commit_journal(second).await.unwrap();
    assert_eq!(counter(&storage, &id).await, 0);
}
