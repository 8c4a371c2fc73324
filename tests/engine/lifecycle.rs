//! Opening, sharing, releasing, and deleting pages.

use crate::common::*;
use ledger_core::{LedgerError, PageId};
use ledger_engine::PageState;
use ledger_storage::FailPoint;
use std::sync::Arc;

#[tokio::test]
async fn writes_survive_page_release() {
    init_tracing();
    let (_, ledger) = ledger();
    let page_id = PageId::from("notes");

    let mut handle = ledger.get_page(page_id.clone(), PageState::Named).await.unwrap();
    handle.put("title", "groceries").await.unwrap();
    handle.put("body", "milk").await.unwrap();
    handle.delete("body").await.unwrap();
    assert_eq!(handle.get(b"title").await.unwrap(), Some(b"groceries".to_vec()));
    drop(handle);
    eventually(|| ledger.live_pages().is_empty()).await;

    let handle = ledger.get_page(page_id, PageState::Existing).await.unwrap();
    assert_eq!(
        handle.entries().await.unwrap(),
        vec![(b"title".to_vec(), b"groceries".to_vec())]
    );
}

#[tokio::test]
async fn queued_requests_share_one_page_manager() {
    init_tracing();
    let (_, ledger) = ledger();
    let page_id = PageId::from("queued");

    let (a, b, c) = tokio::join!(
        ledger.get_page(page_id.clone(), PageState::Named),
        ledger.get_page(page_id.clone(), PageState::Named),
        ledger.get_page(page_id.clone(), PageState::Existing),
    );
    let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());
    assert!(Arc::ptr_eq(a.manager(), b.manager()));
    assert!(Arc::ptr_eq(a.manager(), c.manager()));
    assert_eq!(a.manager().bindings(), 3);

    drop(a);
    drop(b);
    assert_eq!(ledger.live_pages(), vec![page_id.clone()]);
    drop(c);
    eventually(|| ledger.live_pages().is_empty()).await;
}

#[tokio::test]
async fn open_failure_reaches_every_queued_request() {
    init_tracing();
    let (storage, ledger) = ledger();
    storage.faults().fail_next(FailPoint::OpenPage, 1);
    let page_id = PageId::from("unlucky");

    let (a, b, c) = tokio::join!(
        ledger.get_page(page_id.clone(), PageState::Named),
        ledger.get_page(page_id.clone(), PageState::Named),
        ledger.get_page(page_id.clone(), PageState::Named),
    );
    for result in [a, b, c] {
        let err = result.err().unwrap();
        assert!(err.is_transient(), "unexpected error: {}", err);
    }
    assert!(ledger.live_pages().is_empty());
    assert!(ledger.get_pages_list().await.unwrap().is_empty());

    ledger.get_page(page_id, PageState::Named).await.unwrap();
}

#[tokio::test]
async fn existing_page_requests_fail_together() {
    init_tracing();
    let (_, ledger) = ledger();
    let page_id = PageId::from("missing");
    let (a, b) = tokio::join!(
        ledger.get_page(page_id.clone(), PageState::Existing),
        ledger.get_page(page_id.clone(), PageState::Existing),
    );
    assert!(matches!(a.err(), Some(LedgerError::PageNotFound(_))));
    assert!(matches!(b.err(), Some(LedgerError::PageNotFound(_))));
}

#[tokio::test]
async fn delete_page_detaches_live_handles() {
    init_tracing();
    let (_, ledger) = ledger();
    let page_id = PageId::from("doomed");
    let mut handle = ledger.get_page(page_id.clone(), PageState::Named).await.unwrap();
    handle.put("k", "v").await.unwrap();

    ledger.delete_page(&page_id).await.unwrap();
    assert!(ledger.live_pages().is_empty());
    assert!(ledger.get_pages_list().await.unwrap().is_empty());
    // The bound handle keeps its detached storage.
    assert_eq!(handle.get(b"k").await.unwrap(), Some(b"v".to_vec()));
    drop(handle);

    let err = ledger
        .get_page(page_id.clone(), PageState::Existing)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, LedgerError::PageNotFound(_)));
    assert!(matches!(
        ledger.delete_page(&page_id).await,
        Err(LedgerError::PageNotFound(_))
    ));
}

#[tokio::test]
async fn debug_page_reports_heads_and_bindings() {
    init_tracing();
    let (_, ledger) = ledger();
    let page_id = PageId::from("inspect");
    let mut handle = ledger.get_page(page_id.clone(), PageState::Named).await.unwrap();
    let commit = handle.manager().put("k", b"v".to_vec(), Default::default()).await.unwrap();
    handle.put("k2", "v2").await.unwrap();
    let head = handle.manager().newest_head().await.unwrap();
    assert_eq!(head.parent_ids(), &[*commit.id()]);

    let info = ledger.debug_page(&page_id).await.unwrap();
    assert_eq!(info.page_id, page_id);
    assert_eq!(info.heads, vec![*head.id()]);
    assert_eq!(info.bindings, 1);

    drop(handle);
    eventually(|| ledger.live_pages().is_empty()).await;
    let info = ledger.debug_page(&page_id).await.unwrap();
    assert_eq!(info.heads, vec![*head.id()]);
    assert_eq!(info.bindings, 0);
    assert!(!info.has_unfinished_merges);

    assert!(matches!(
        ledger.debug_page(&PageId::from("nope")).await,
        Err(LedgerError::PageNotFound(_))
    ));
}

#[tokio::test]
async fn pages_list_is_sorted() {
    init_tracing();
    let (_, ledger) = ledger();
    for name in ["b", "c", "a"] {
        ledger.get_page(PageId::from(name), PageState::Named).await.unwrap();
    }
    assert_eq!(
        ledger.get_pages_list().await.unwrap(),
        vec![PageId::from("a"), PageId::from("b"), PageId::from("c")]
    );
}
