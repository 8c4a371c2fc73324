//! Sync components attached to pages.

use crate::common::*;
use ledger_core::{LedgerResult, PageId, PageStorage};
use ledger_engine::{LedgerConfig, PageState, PageSync, PageSyncFactory};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct RecordingSync {
    started: AtomicBool,
    stopped: AtomicBool,
}

impl PageSync for RecordingSync {
    fn start(&self) -> LedgerResult<()> {
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// Hands out recording syncs and keeps the storages they were given
#[derive(Default)]
struct RecordingFactory {
    created: Mutex<Vec<(Arc<dyn PageStorage>, Arc<RecordingSync>)>>,
}

impl PageSyncFactory for RecordingFactory {
    fn create_page_sync(&self, storage: Arc<dyn PageStorage>) -> LedgerResult<Arc<dyn PageSync>> {
        let sync = Arc::new(RecordingSync::default());
        self.created.lock().push((storage, sync.clone()));
        Ok(sync)
    }
}

#[tokio::test]
async fn sync_runs_while_page_is_open() {
    init_tracing();
    let (_, ledger) = ledger();
    let factory = Arc::new(RecordingFactory::default());
    ledger.set_sync_factory(Some(factory.clone()));

    let handle = ledger.get_page(PageId::from("synced"), PageState::Named).await.unwrap();
    let sync = factory.created.lock()[0].1.clone();
    assert!(sync.started.load(Ordering::SeqCst));
    assert!(!sync.stopped.load(Ordering::SeqCst));

    drop(handle);
    eventually(|| sync.stopped.load(Ordering::SeqCst)).await;
    assert!(ledger.live_pages().is_empty());
}

#[tokio::test]
async fn sync_disabled_by_config() {
    init_tracing();
    let (_, ledger) = ledger_with(LedgerConfig {
        sync_enabled: false,
        ..LedgerConfig::default()
    });
    let factory = Arc::new(RecordingFactory::default());
    ledger.set_sync_factory(Some(factory.clone()));

    ledger.get_page(PageId::from("local-only"), PageState::Named).await.unwrap();
    assert!(factory.created.lock().is_empty());
}

#[tokio::test]
async fn commits_from_sync_are_merged() {
    init_tracing();
    let (_, ledger) = ledger();
    let factory = Arc::new(RecordingFactory::default());
    ledger.set_sync_factory(Some(factory.clone()));
    let page_id = PageId::from("shared-list");

    let mut handle = ledger.get_page(page_id.clone(), PageState::Named).await.unwrap();
    handle.put("milk", "1").await.unwrap();

    let (_, peer) = page("shared-list");
    let remote = commit_on(&peer, root(&peer).await.id(), &[("eggs", "12")], &[]).await;
    let synced = factory.created.lock()[0].0.clone();
    synced
        .add_commits_from_sync(export(&peer, &[remote.id()]).await)
        .await
        .unwrap();

    handle.wait_for_conflict_resolution().await.unwrap();
    assert_eq!(
        handle.entries().await.unwrap(),
        vec![
            (b"eggs".to_vec(), b"12".to_vec()),
            (b"milk".to_vec(), b"1".to_vec()),
        ]
    );
    assert_eq!(ledger.debug_page(&page_id).await.unwrap().heads.len(), 1);
}
