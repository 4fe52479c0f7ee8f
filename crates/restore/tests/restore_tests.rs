use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use filetime::FileTime;
use pit_restore_core::{PitWindow, RestoreTarget, RetrievalStatus, StorageClass};
use s3_pit_restore::store::ServerSideEncryption;
use s3_pit_restore::{MemoryStore, RestoreConfig, RestoreError, RestoreSession, RunSummary};
use tokio_util::sync::CancellationToken;

const SRC: &str = "src";

fn t(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, minute, 0).unwrap()
}

fn config(target: RestoreTarget, window: PitWindow) -> RestoreConfig {
    RestoreConfig {
        source_bucket: SRC.into(),
        prefix: String::new(),
        target,
        window,
        retrieval_enabled: false,
        dry_run: false,
        verbose: true,
        max_workers: 4,
        sse: None,
    }
}

fn local(root: &Path) -> RestoreTarget {
    RestoreTarget::Local {
        root: root.to_path_buf(),
    }
}

fn in_place() -> RestoreTarget {
    RestoreTarget::Bucket {
        bucket: SRC.into(),
        prefix: None,
    }
}

async fn run(store: &Arc<MemoryStore>, cfg: RestoreConfig) -> Result<RunSummary, RestoreError> {
    RestoreSession::new(cfg, store.clone(), CancellationToken::new())
        .run()
        .await
}

/// a/file overwritten at 2, b/file deleted at 1, c/file created at 3.
fn seeded(page_size: usize) -> Arc<MemoryStore> {
    let store = MemoryStore::new().with_page_size(page_size);
    store.put(SRC, "a/file", b"X", t(0));
    store.put(SRC, "a/file", b"Y", t(2));
    store.put(SRC, "b/file", b"B", t(0));
    store.delete(SRC, "b/file", t(1));
    store.put(SRC, "c/file", b"C", t(3));
    Arc::new(store)
}

#[tokio::test]
async fn local_restore_writes_content_from_the_window() {
    let store = seeded(1000);
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("restore");

    let summary = run(&store, config(local(&root), PitWindow::at(t(1)))).await.unwrap();

    let restored = root.join("a/file");
    assert_eq!(std::fs::read(&restored).unwrap(), b"X");
    let mtime = FileTime::from_last_modification_time(&std::fs::metadata(&restored).unwrap());
    assert_eq!(mtime.unix_seconds(), t(0).timestamp());

    assert!(!root.join("b/file").exists(), "b/file is deleted at the window end");
    assert!(!root.join("c/file").exists(), "c/file did not exist yet");
    assert_eq!(summary.restored, 1);
    assert_eq!(summary.deleted_at_window, 1);
    assert!(summary.failed.is_empty());
}

#[tokio::test]
async fn in_place_restore_rewinds_the_bucket() {
    let store = seeded(1000);
    let summary = run(&store, config(in_place(), PitWindow::at(t(1)))).await.unwrap();

    assert_eq!(store.current(SRC, "a/file").as_deref(), Some(&b"X"[..]));
    assert_eq!(store.current(SRC, "b/file"), None);
    assert_eq!(store.current(SRC, "c/file"), None, "created after the window end");
    assert_eq!(summary.restored, 1);
    assert_eq!(summary.removed, 1);
    assert_eq!(summary.deleted_at_window, 1);
}

#[tokio::test]
async fn deleted_key_stays_deleted() {
    let store = seeded(1000);
    let before = store.entry_count(SRC);
    let summary = run(&store, config(in_place(), PitWindow::at(t(2)))).await.unwrap();

    assert_eq!(store.current(SRC, "b/file"), None);
    assert_eq!(summary.deleted_at_window, 1);
    // a/file copied onto itself, c/file hidden behind a marker.
    assert_eq!(store.entry_count(SRC), before + 2);
}

#[tokio::test]
async fn page_size_does_not_change_the_outcome() {
    for page_size in [1, 2, 3, 1000] {
        let store = seeded(page_size);
        let summary = run(&store, config(in_place(), PitWindow::at(t(1)))).await.unwrap();
        assert_eq!(store.current(SRC, "a/file").as_deref(), Some(&b"X"[..]), "page size {page_size}");
        assert_eq!(store.current(SRC, "c/file"), None, "page size {page_size}");
        assert_eq!((summary.restored, summary.removed), (1, 1), "page size {page_size}");
    }
}

#[tokio::test]
async fn ranged_window_never_cleans_up() {
    let store = seeded(1000);
    let window = PitWindow::new(Some(t(0)), Some(t(1)));
    let summary = run(&store, config(in_place(), window)).await.unwrap();

    assert_eq!(summary.removed, 0);
    assert_eq!(store.current(SRC, "c/file").as_deref(), Some(&b"C"[..]));
}

#[tokio::test]
async fn archival_version_without_opt_in_needs_restore() {
    let store = Arc::new(MemoryStore::new());
    store.put_with_class(SRC, "g/cold", b"ice", StorageClass::Glacier, t(0));
    let dir = tempfile::tempdir().unwrap();

    let summary = run(&store, config(local(dir.path()), PitWindow::at(t(5)))).await.unwrap();

    assert_eq!(summary.pending_retrieval, 1);
    assert!(summary.failed.is_empty());
    assert!(!dir.path().join("g/cold").exists());
    assert!(store.retrieval_requests().is_empty());
}

#[tokio::test]
async fn archival_retrieval_is_requested_once() {
    let store = Arc::new(MemoryStore::new());
    let vid = store.put_with_class(SRC, "g/cold", b"ice", StorageClass::DeepArchive, t(0));
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(local(dir.path()), PitWindow::at(t(5)));
    cfg.retrieval_enabled = true;

    run(&store, cfg.clone()).await.unwrap();
    run(&store, cfg.clone()).await.unwrap();
    assert_eq!(store.retrieval_requests().len(), 1, "second run sees it in progress");

    store.set_retrieval(SRC, "g/cold", &vid, RetrievalStatus::Complete);
    let summary = run(&store, cfg).await.unwrap();
    assert_eq!(summary.restored, 1);
    assert_eq!(std::fs::read(dir.path().join("g/cold")).unwrap(), b"ice");
}

#[tokio::test]
async fn retrieval_already_in_progress_is_not_an_error() {
    let store = Arc::new(MemoryStore::new());
    store.put_with_class(SRC, "g/cold", b"ice", StorageClass::Glacier, t(0));
    store.reject_retrievals_as_in_progress();
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(local(dir.path()), PitWindow::at(t(5)));
    cfg.retrieval_enabled = true;

    let summary = run(&store, cfg).await.unwrap();
    assert_eq!(store.retrieval_requests().len(), 1);
    assert!(summary.failed.is_empty());
    assert_eq!(summary.pending_retrieval, 1);
}

#[tokio::test]
async fn unreadable_retrieval_status_still_requests_retrieval() {
    let store = Arc::new(MemoryStore::new());
    store.put_with_class(SRC, "g/cold", b"ice", StorageClass::Glacier, t(0));
    store.fail_retrieval_status("g/cold");
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(local(dir.path()), PitWindow::at(t(5)));
    cfg.retrieval_enabled = true;

    let summary = run(&store, cfg).await.unwrap();
    assert_eq!(store.retrieval_requests().len(), 1);
    assert_eq!(summary.pending_retrieval, 1);
    assert!(summary.failed.is_empty());
}

#[tokio::test]
async fn failed_download_does_not_stop_other_keys() {
    let store = Arc::new(MemoryStore::new().with_page_size(2));
    for i in 0..6 {
        store.put(SRC, &format!("k{i}"), format!("body{i}").as_bytes(), t(0));
    }
    store.fail_key("k3");
    let dir = tempfile::tempdir().unwrap();

    let summary = run(&store, config(local(dir.path()), PitWindow::at(t(5)))).await.unwrap();

    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].key, "k3");
    assert_eq!(summary.restored, 5);
    for i in [0, 1, 2, 4, 5] {
        let body = std::fs::read(dir.path().join(format!("k{i}"))).unwrap();
        assert_eq!(body, format!("body{i}").into_bytes());
    }
    assert!(!dir.path().join("k3").exists());
}

#[tokio::test]
async fn dry_run_changes_nothing() {
    let store = seeded(1000);
    let before = store.entry_count(SRC);
    let mut cfg = config(in_place(), PitWindow::at(t(1)));
    cfg.dry_run = true;

    let summary = run(&store, cfg).await.unwrap();
    assert_eq!(store.entry_count(SRC), before);
    assert_eq!(store.current(SRC, "c/file").as_deref(), Some(&b"C"[..]));
    assert!(summary.dry_run);
    assert_eq!((summary.restored, summary.removed), (1, 1));

    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("never-created");
    let mut cfg = config(local(&root), PitWindow::at(t(1)));
    cfg.dry_run = true;
    run(&store, cfg).await.unwrap();
    assert!(!root.exists());
}

#[tokio::test]
async fn copy_to_other_bucket_keeps_source_untouched() {
    let store = seeded(1000);
    let mut cfg = config(
        RestoreTarget::Bucket {
            bucket: "dst".into(),
            prefix: Some("restored".into()),
        },
        PitWindow::at(t(1)),
    );
    cfg.sse = Some(ServerSideEncryption::Aes256);

    let summary = run(&store, cfg).await.unwrap();

    assert_eq!(store.current("dst", "restored/a/file").as_deref(), Some(&b"X"[..]));
    assert_eq!(store.current(SRC, "c/file").as_deref(), Some(&b"C"[..]));
    assert_eq!(summary.removed, 0);
    let copies = store.copies();
    assert_eq!(copies.len(), 1);
    assert_eq!(copies[0].sse, Some(ServerSideEncryption::Aes256));
}

#[tokio::test]
async fn same_bucket_with_prefix_is_not_cleaned() {
    let store = seeded(1000);
    let cfg = config(
        RestoreTarget::Bucket {
            bucket: SRC.into(),
            prefix: Some("rewound".into()),
        },
        PitWindow::at(t(1)),
    );
    let summary = run(&store, cfg).await.unwrap();
    assert_eq!(summary.removed, 0);
    assert_eq!(store.current(SRC, "rewound/a/file").as_deref(), Some(&b"X"[..]));
    assert_eq!(store.current(SRC, "c/file").as_deref(), Some(&b"C"[..]));
}

#[tokio::test]
async fn retained_objects_survive_cleanup() {
    let store = Arc::new(MemoryStore::new());
    store.put(SRC, "a/file", b"X", t(0));
    let vid = store.put(SRC, "locked", b"L", t(3));
    store.set_retention(SRC, "locked", &vid, Utc.with_ymd_and_hms(2999, 1, 1, 0, 0, 0).unwrap());

    let summary = run(&store, config(in_place(), PitWindow::at(t(1)))).await.unwrap();
    assert_eq!(summary.retained, 1);
    assert_eq!(summary.removed, 0);
    assert_eq!(store.current(SRC, "locked").as_deref(), Some(&b"L"[..]));
}

#[tokio::test]
async fn unreadable_retention_does_not_block_cleanup() {
    let store = seeded(1000);
    store.fail_retention("c/file");

    let summary = run(&store, config(in_place(), PitWindow::at(t(1)))).await.unwrap();
    assert_eq!(store.current(SRC, "c/file"), None);
    assert_eq!(summary.removed, 1);
    assert_eq!(summary.retained, 0);
    assert!(summary.failed.is_empty());
}

#[tokio::test]
async fn empty_listing_is_fatal() {
    let store = Arc::new(MemoryStore::new());
    let dir = tempfile::tempdir().unwrap();
    let err = run(&store, config(local(dir.path()), PitWindow::at(t(1))))
        .await
        .unwrap_err();
    assert!(matches!(err, RestoreError::NoMatchingVersions));
}

#[tokio::test]
async fn folder_keys_become_directories() {
    let store = Arc::new(MemoryStore::new());
    store.put(SRC, "photos/", b"", t(0));
    store.put(SRC, "photos/cat.jpg", b"meow", t(0));
    let dir = tempfile::tempdir().unwrap();

    run(&store, config(local(dir.path()), PitWindow::at(t(1)))).await.unwrap();
    assert!(dir.path().join("photos").is_dir());
    assert_eq!(std::fs::read(dir.path().join("photos/cat.jpg")).unwrap(), b"meow");
}

#[tokio::test]
async fn interrupted_run_stops_without_work() {
    let store = seeded(1);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let summary = RestoreSession::new(config(in_place(), PitWindow::at(t(1))), store.clone(), cancel)
        .run()
        .await
        .unwrap();

    assert!(summary.interrupted);
    assert_eq!(summary.restored + summary.removed, 0);
    assert_eq!(store.current(SRC, "c/file").as_deref(), Some(&b"C"[..]));
}

#[tokio::test]
async fn interrupt_waits_for_the_running_download() {
    let store = MemoryStore::new().with_latency(Duration::from_millis(300));
    for i in 0..3 {
        store.put(SRC, &format!("k{i}"), format!("body{i}").as_bytes(), t(0));
    }
    let store = Arc::new(store);
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(local(dir.path()), PitWindow::at(t(5)));
    cfg.max_workers = 1;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let summary = RestoreSession::new(cfg, store.clone(), cancel).run().await.unwrap();

    assert!(summary.interrupted);
    assert_eq!(summary.restored, 1);
    assert_eq!(summary.cancelled, 2);
    assert!(summary.failed.is_empty());
    let written: Vec<_> = (0..3)
        .filter_map(|i| std::fs::read(dir.path().join(format!("k{i}"))).ok().map(|b| (i, b)))
        .collect();
    assert_eq!(written.len(), 1, "only the running download completes");
    let (i, body) = &written[0];
    assert_eq!(body, &format!("body{i}").into_bytes());
}

#[tokio::test]
async fn prefix_limits_the_restore() {
    let store = seeded(1000);
    let mut cfg = config(in_place(), PitWindow::at(t(1)));
    cfg.prefix = "a/".into();

    let summary = run(&store, cfg).await.unwrap();
    assert_eq!(summary.restored, 1);
    assert_eq!(store.current(SRC, "c/file").as_deref(), Some(&b"C"[..]));
}
