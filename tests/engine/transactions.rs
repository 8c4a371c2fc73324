//! Explicit transactions on page handles.

use crate::common::*;
use ledger_core::{LedgerError, PageId};
use ledger_engine::PageState;
use ledger_storage::FailPoint;

#[tokio::test]
async fn transaction_is_invisible_until_commit() {
    init_tracing();
    let (_, ledger) = ledger();
    let page_id = PageId::from("tx");
    let mut writer = ledger.get_page(page_id.clone(), PageState::Named).await.unwrap();
    let reader = ledger.get_page(page_id, PageState::Existing).await.unwrap();
    writer.put("a", "1").await.unwrap();

    writer.start_transaction().await.unwrap();
    assert!(writer.in_transaction());
    writer.put("b", "2").await.unwrap();
    writer.delete("a").await.unwrap();

    assert_eq!(writer.get(b"b").await.unwrap(), Some(b"2".to_vec()));
    assert_eq!(writer.get(b"a").await.unwrap(), None);
    assert_eq!(
        writer.entries().await.unwrap(),
        vec![(b"b".to_vec(), b"2".to_vec())]
    );
    assert_eq!(reader.get(b"a").await.unwrap(), Some(b"1".to_vec()));
    assert_eq!(reader.get(b"b").await.unwrap(), None);

    writer.commit().await.unwrap();
    assert!(!writer.in_transaction());
    assert_eq!(
        reader.entries().await.unwrap(),
        vec![(b"b".to_vec(), b"2".to_vec())]
    );
}

#[tokio::test]
async fn rollback_discards_everything() {
    init_tracing();
    let (storage, ledger) = ledger();
    let page_id = PageId::from("rollback");
    let mut handle = ledger.get_page(page_id.clone(), PageState::Named).await.unwrap();
    let head = handle.manager().newest_head().await.unwrap();

    handle.start_transaction().await.unwrap();
    handle.put("k", "v").await.unwrap();
    handle.rollback().await.unwrap();

    assert_eq!(handle.manager().newest_head().await.unwrap().id(), head.id());
    assert_eq!(handle.get(b"k").await.unwrap(), None);
    assert_eq!(storage.page(&page_id).unwrap().open_journal_count(), 0);
}

#[tokio::test]
async fn transaction_misuse_is_illegal_state() {
    init_tracing();
    let (_, ledger) = ledger();
    let mut handle = ledger.get_page(PageId::from("misuse"), PageState::Named).await.unwrap();

    assert!(matches!(handle.commit().await, Err(LedgerError::IllegalState(_))));
    assert!(matches!(handle.rollback().await, Err(LedgerError::IllegalState(_))));
    handle.start_transaction().await.unwrap();
    assert!(matches!(
        handle.start_transaction().await,
        Err(LedgerError::IllegalState(_))
    ));
    handle.rollback().await.unwrap();
}

#[tokio::test]
async fn failed_write_poisons_transaction() {
    init_tracing();
    let (storage, ledger) = ledger();
    let page_id = PageId::from("poisoned");
    let mut handle = ledger.get_page(page_id.clone(), PageState::Named).await.unwrap();
    let page = storage.page(&page_id).unwrap();

    handle.start_transaction().await.unwrap();
    handle.put("a", "1").await.unwrap();
    page.faults().fail_next(FailPoint::Execute, 1);
    assert!(handle.put("b", "2").await.is_err());
    assert!(matches!(
        handle.put("c", "3").await,
        Err(LedgerError::IllegalState(_))
    ));

    // Committing a poisoned transaction fails and closes it.
    assert!(matches!(handle.commit().await, Err(LedgerError::IllegalState(_))));
    assert!(!handle.in_transaction());
    assert_eq!(page.open_journal_count(), 0);
    assert!(handle.entries().await.unwrap().is_empty());
}

#[tokio::test]
async fn dropped_handle_rolls_back_open_transaction() {
    init_tracing();
    let (storage, ledger) = ledger();
    let page_id = PageId::from("abandoned");
    let mut handle = ledger.get_page(page_id.clone(), PageState::Named).await.unwrap();
    let page = storage.page(&page_id).unwrap();

    handle.start_transaction().await.unwrap();
    handle.put("k", "v").await.unwrap();
    assert_eq!(page.open_journal_count(), 1);
    drop(handle);

    for _ in 0..1000 {
        if page.open_journal_count() == 0 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(page.open_journal_count(), 0);
    eventually(|| ledger.live_pages().is_empty()).await;
}
