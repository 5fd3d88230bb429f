//! End-to-end passes through SyncEngine
//!
//! Each test builds a fresh in-memory SQLite store and in-memory or
//! tempdir-backed adapters, then drives whole passes and inspects the
//! destination tree and the persisted entries.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use treesync_cache::{DatabasePool, SqliteEntryStore};
use treesync_core::domain::{
    AdapterId, ChangeFlag, PassMode, PassOutcome, ProcessingState, SyncPass,
};
use treesync_core::ports::{IEntryStore, IStorageAdapter};
use treesync_sync::{
    Direction, EngineSettings, LocalFileSystemAdapter, MemoryAdapter, RetryPolicy, SyncEngine,
};
use treesync_transfer::PemKeySource;

// ============================================================================
// Test helpers
// ============================================================================

async fn store() -> Arc<dyn IEntryStore> {
    let pool = DatabasePool::in_memory()
        .await
        .expect("Failed to create in-memory database");
    Arc::new(SqliteEntryStore::new(pool.pool().clone()))
}

fn adapter_id(name: &str) -> AdapterId {
    AdapterId::new(name.to_string()).unwrap()
}

fn memory(name: &str) -> MemoryAdapter {
    MemoryAdapter::new(adapter_id(name)).unwrap()
}

fn settings() -> EngineSettings {
    EngineSettings {
        retry: RetryPolicy::none(),
        ..EngineSettings::default()
    }
}

async fn engine(source: Arc<MemoryAdapter>, destination: Arc<MemoryAdapter>) -> SyncEngine {
    SyncEngine::new(source, destination, store().await, settings())
}

fn flagged(pass: &SyncPass, flag: ChangeFlag) -> Vec<String> {
    pass.descriptors()
        .iter()
        .filter(|d| d.flags.contains(flag))
        .map(|d| d.path().to_string())
        .collect()
}

// ============================================================================
// Tree walk and change tracking
// ============================================================================

#[tokio::test]
async fn test_first_pass_mirrors_tree_and_second_is_idle() {
    for tracking in [false, true] {
        let source = Arc::new(memory("source").with_change_tracking(tracking));
        let destination = Arc::new(memory("destination"));
        source.write_file("docs/readme.txt", &[b'r'; 500]).unwrap();
        source.write_file("docs/guide/intro.md", b"# intro").unwrap();
        source.add_directory("empty").unwrap();
        let engine = engine(source.clone(), destination.clone()).await;

        let first = engine.run_pass(PassMode::Execute).await.unwrap();
        assert_eq!(first.outcome(), Some(PassOutcome::Success), "tracking={tracking}");
        assert_eq!(first.files_completed(), 2);
        assert_eq!(first.bytes_transferred(), 507);
        assert_eq!(
            destination.read_file("docs/readme.txt").unwrap(),
            vec![b'r'; 500]
        );
        assert_eq!(destination.read_file("docs/guide/intro.md").unwrap(), b"# intro");
        assert!(destination.item_at("empty").is_some());

        let second = engine.run_pass(PassMode::Execute).await.unwrap();
        assert_eq!(second.outcome(), Some(PassOutcome::NotRun), "tracking={tracking}");
        assert!(second.analysis().is_up_to_date());
        assert_eq!(second.bytes_transferred(), 0);
    }
}

#[tokio::test]
async fn test_directories_created_before_their_files() {
    let source = Arc::new(memory("source").with_change_tracking(false));
    let destination = Arc::new(memory("destination"));
    source.write_file("a/b/c/d.txt", b"deep").unwrap();
    let engine = engine(source, destination.clone()).await;

    let pass = engine.run_pass(PassMode::Execute).await.unwrap();
    let order: Vec<String> = pass.descriptors().iter().map(|d| d.path().to_string()).collect();
    assert_eq!(order, ["a", "a/b", "a/b/c", "a/b/c/d.txt"]);
    assert!(pass
        .descriptors()
        .iter()
        .all(|d| d.state() == ProcessingState::Succeeded));
    assert_eq!(destination.read_file("a/b/c/d.txt").unwrap(), b"deep");
}

#[tokio::test]
async fn test_move_is_applied_as_relocation() {
    for tracking in [false, true] {
        let source = Arc::new(memory("source").with_change_tracking(tracking));
        let destination = Arc::new(memory("destination"));
        source.write_file("a/x.txt", b"payload").unwrap();
        source.add_directory("b").unwrap();
        let engine = engine(source.clone(), destination.clone()).await;
        engine.run_pass(PassMode::Execute).await.unwrap();
        let copied_id = destination.item_at("a/x.txt").unwrap().unique_id;

        source.rename("a/x.txt", "b/x.txt").unwrap();
        let pass = engine.run_pass(PassMode::Execute).await.unwrap();

        assert_eq!(pass.outcome(), Some(PassOutcome::Success), "tracking={tracking}");
        assert_eq!(pass.descriptors().len(), 1);
        assert_eq!(flagged(&pass, ChangeFlag::Moved), ["b/x.txt"]);
        assert_eq!(pass.bytes_transferred(), 0);
        assert!(destination.item_at("a/x.txt").is_none());
        // Moved in place, not recopied
        assert_eq!(destination.item_at("b/x.txt").unwrap().unique_id, copied_id);
    }
}

#[tokio::test]
async fn test_content_change_recopies_file() {
    let source = Arc::new(memory("source"));
    let destination = Arc::new(memory("destination"));
    source.write_file("notes.txt", b"v1").unwrap();
    let engine = engine(source.clone(), destination.clone()).await;
    engine.run_pass(PassMode::Execute).await.unwrap();

    source.write_file("notes.txt", b"version two").unwrap();
    let pass = engine.run_pass(PassMode::Execute).await.unwrap();

    assert_eq!(flagged(&pass, ChangeFlag::FileSize), ["notes.txt"]);
    assert_eq!(pass.bytes_transferred(), 11);
    assert_eq!(destination.read_file("notes.txt").unwrap(), b"version two");
}

#[tokio::test]
async fn test_deleted_directory_cascades_and_tombstones() {
    let source = Arc::new(memory("source").with_change_tracking(false));
    let destination = Arc::new(memory("destination"));
    source.write_file("old/one.txt", b"1").unwrap();
    source.write_file("old/two.txt", b"2").unwrap();
    source.write_file("keep.txt", b"k").unwrap();
    let store = store().await;
    let engine = SyncEngine::new(source.clone(), destination.clone(), store.clone(), settings());
    engine.run_pass(PassMode::Execute).await.unwrap();

    source.remove("old").unwrap();
    let pass = engine.run_pass(PassMode::Execute).await.unwrap();

    assert_eq!(pass.outcome(), Some(PassOutcome::Success));
    assert_eq!(flagged(&pass, ChangeFlag::Deleted).len(), 3);
    assert!(destination.item_at("old").is_none());
    assert!(destination.item_at("keep.txt").is_some());

    let counts = store.count_entries().await.unwrap();
    assert_eq!(counts.deleted, 3);
    assert_eq!(counts.files, 1);

    // Tombstones are not reported again
    let third = engine.run_pass(PassMode::Execute).await.unwrap();
    assert_eq!(third.outcome(), Some(PassOutcome::NotRun));
}

#[tokio::test]
async fn test_recycled_id_does_not_wedge_later_passes() {
    for tracking in [false, true] {
        let source = Arc::new(memory("source").with_change_tracking(tracking));
        let destination = Arc::new(memory("destination"));
        let old = source.write_file("old.txt", b"old").unwrap();
        let engine = engine(source.clone(), destination.clone()).await;
        engine.run_pass(PassMode::Execute).await.unwrap();

        // A new directory inherits the deleted file's id, as inodes do
        source.remove("old.txt").unwrap();
        source.recycle_id(&old).unwrap();
        source.write_file("photos/a.jpg", b"jpeg").unwrap();
        assert_eq!(source.item_at("photos").unwrap().unique_id, old);

        let pass = engine.run_pass(PassMode::Execute).await.unwrap();
        assert_eq!(pass.outcome(), Some(PassOutcome::Success), "tracking={tracking}");
        assert_eq!(flagged(&pass, ChangeFlag::Deleted), ["old.txt"]);
        assert_eq!(flagged(&pass, ChangeFlag::NewDirectory), ["photos"]);
        assert!(destination.item_at("old.txt").is_none());
        assert_eq!(destination.read_file("photos/a.jpg").unwrap(), b"jpeg");

        let idle = engine.run_pass(PassMode::Execute).await.unwrap();
        assert_eq!(idle.outcome(), Some(PassOutcome::NotRun), "tracking={tracking}");
    }
}

#[tokio::test]
async fn test_error_marked_item_gives_warning() {
    let source = Arc::new(memory("source").with_change_tracking(false));
    let destination = Arc::new(memory("destination"));
    source.write_file("ok.txt", b"fine").unwrap();
    source.write_file("locked.txt", b"secret").unwrap();
    source.set_error("locked.txt", "permission denied").unwrap();
    let engine = engine(source, destination.clone()).await;

    let pass = engine.run_pass(PassMode::Execute).await.unwrap();
    assert_eq!(pass.outcome(), Some(PassOutcome::Warning));
    assert_eq!(pass.analysis().total_skipped(), 1);
    assert!(destination.item_at("ok.txt").is_some());
    assert!(destination.item_at("locked.txt").is_none());
}

// ============================================================================
// First-sync shortcut
// ============================================================================

#[tokio::test]
async fn test_identical_destination_copy_is_not_transferred() {
    let source = Arc::new(memory("source").with_change_tracking(false));
    let destination = Arc::new(memory("destination"));
    source.write_file("photo.jpg", b"same bytes").unwrap();
    destination.write_file("photo.jpg", b"same bytes").unwrap();
    let store = store().await;
    let engine = SyncEngine::new(source, destination, store.clone(), settings());

    let pass = engine.run_pass(PassMode::Execute).await.unwrap();

    assert_eq!(pass.outcome(), Some(PassOutcome::Success));
    assert_eq!(flagged(&pass, ChangeFlag::DestinationExists), ["photo.jpg"]);
    assert_eq!(pass.bytes_transferred(), 0);
    let entry = store
        .get_all()
        .await
        .unwrap()
        .into_iter()
        .find(|e| e.name() == "photo.jpg")
        .unwrap();
    assert!(entry.source_hashes().sha1.is_some());
    assert_eq!(entry.source_hashes(), entry.destination_hashes());
}

#[tokio::test]
async fn test_different_destination_copy_is_overwritten() {
    let source = Arc::new(memory("source").with_change_tracking(false));
    let destination = Arc::new(memory("destination"));
    source.write_file("photo.jpg", b"new bytes!").unwrap();
    destination.write_file("photo.jpg", b"old bytes!").unwrap();
    let engine = engine(source, destination.clone()).await;

    let pass = engine.run_pass(PassMode::Execute).await.unwrap();

    assert!(flagged(&pass, ChangeFlag::DestinationExists).is_empty());
    assert_eq!(pass.bytes_transferred(), 10);
    assert_eq!(destination.read_file("photo.jpg").unwrap(), b"new bytes!");
}

// ============================================================================
// Encryption
// ============================================================================

#[tokio::test]
async fn test_encrypted_backup_restores_plaintext() {
    let keys = Arc::new(PemKeySource::generate(1024).unwrap());
    let source = Arc::new(memory("source"));
    let vault = Arc::new(memory("vault"));
    let plaintext: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    source.write_file("docs/report.bin", &plaintext).unwrap();
    source.write_file("empty.txt", b"").unwrap();

    let backup = engine(source.clone(), vault.clone()).await.with_keys(keys.clone());
    let pass = backup.run_pass(PassMode::Execute).await.unwrap();
    assert_eq!(pass.outcome(), Some(PassOutcome::Success));

    let stored = vault.read_file("docs/report.bin").unwrap();
    assert_eq!(stored.len(), 1024 + plaintext.len() + 16);
    assert_ne!(&stored[1024..1024 + 64], &plaintext[..64]);
    assert_eq!(vault.read_file("empty.txt").unwrap().len(), 1024 + 16);

    let restored = Arc::new(memory("restored"));
    let restore = SyncEngine::new(restored.clone(), vault.clone(), store().await, settings())
        .with_direction(Direction::Restore)
        .with_keys(keys);
    let pass = restore.run_pass(PassMode::Execute).await.unwrap();

    assert_eq!(pass.outcome(), Some(PassOutcome::Success));
    assert_eq!(restored.read_file("docs/report.bin").unwrap(), plaintext);
    assert_eq!(restored.read_file("empty.txt").unwrap(), b"");
}

#[tokio::test]
async fn test_encryption_disables_destination_shortcut() {
    let keys = Arc::new(PemKeySource::generate(1024).unwrap());
    let source = Arc::new(memory("source").with_change_tracking(false));
    let destination = Arc::new(memory("destination"));
    source.write_file("a.txt", b"abc").unwrap();
    destination.write_file("a.txt", b"abc").unwrap();
    let engine = engine(source, destination.clone()).await.with_keys(keys);

    let pass = engine.run_pass(PassMode::Execute).await.unwrap();

    assert!(flagged(&pass, ChangeFlag::DestinationExists).is_empty());
    assert_eq!(destination.read_file("a.txt").unwrap().len(), 1024 + 3 + 16);
}

// ============================================================================
// Cursors
// ============================================================================

#[tokio::test]
async fn test_cursor_committed_after_pass() {
    let source = Arc::new(memory("source"));
    let destination = Arc::new(memory("destination"));
    source.write_file("a.txt", b"a").unwrap();
    let store = store().await;
    let engine = SyncEngine::new(source.clone(), destination, store.clone(), settings());

    engine.run_pass(PassMode::Execute).await.unwrap();
    let committed = source.committed_cursor().unwrap();
    assert_eq!(
        store.get_cursor(source.id()).await.unwrap(),
        Some(committed.clone())
    );

    source.write_file("b.txt", b"b").unwrap();
    let pass = engine.run_pass(PassMode::Execute).await.unwrap();
    assert_eq!(pass.descriptors().len(), 1);
    assert_ne!(source.committed_cursor().unwrap(), committed);
}

#[tokio::test]
async fn test_stale_cursor_resynchronizes_through_redirect() {
    let source = Arc::new(memory("source"));
    let destination = Arc::new(memory("destination"));
    source.write_file("a.txt", b"a").unwrap();
    source.write_file("gone.txt", b"g").unwrap();
    let engine = engine(source.clone(), destination.clone()).await;
    engine.run_pass(PassMode::Execute).await.unwrap();
    let before = source.committed_cursor().unwrap();

    source.write_file("b.txt", b"b").unwrap();
    source.remove("gone.txt").unwrap();
    source.compact_journal();
    let pass = engine.run_pass(PassMode::Execute).await.unwrap();

    assert_eq!(pass.outcome(), Some(PassOutcome::Success));
    assert!(destination.item_at("b.txt").is_some());
    // The resync walks the tree, so deletions hidden by compaction are found
    assert!(destination.item_at("gone.txt").is_none());
    assert_ne!(source.committed_cursor().unwrap(), before);
}

#[tokio::test]
async fn test_stale_cursor_without_redirect_is_an_error() {
    let source = Arc::new(memory("source").with_resync_redirect(false));
    let destination = Arc::new(memory("destination"));
    source.write_file("a.txt", b"a").unwrap();
    let engine = engine(source.clone(), destination.clone()).await;
    engine.run_pass(PassMode::Execute).await.unwrap();
    let before = source.committed_cursor().unwrap();

    source.write_file("b.txt", b"b").unwrap();
    source.compact_journal();
    let pass = engine.run_pass(PassMode::Execute).await.unwrap();

    assert_eq!(pass.outcome(), Some(PassOutcome::Error));
    assert!(pass.analysis().has_exceptions());
    assert!(destination.item_at("b.txt").is_none());
    assert_eq!(source.committed_cursor().unwrap(), before);
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn test_cancelled_pass_leaves_everything_unstarted() {
    let source = Arc::new(memory("source"));
    let destination = Arc::new(memory("destination"));
    source.write_file("a.txt", b"a").unwrap();
    source.write_file("b/c.txt", b"c").unwrap();
    let engine = engine(source.clone(), destination.clone()).await;
    engine.cancel_token().cancel();

    let pass = engine.run_pass(PassMode::Execute).await.unwrap();

    assert_eq!(pass.outcome(), Some(PassOutcome::Cancelled));
    assert_eq!(pass.descriptors().len(), 3);
    assert!(pass
        .descriptors()
        .iter()
        .all(|d| d.state() == ProcessingState::NotStarted));
    assert_eq!(destination.item_count(), 0);
    assert!(source.committed_cursor().is_none());
}

// ============================================================================
// Local filesystem
// ============================================================================

#[tokio::test]
async fn test_local_directories_are_mirrored() {
    let source_dir = tempfile::tempdir().unwrap();
    let destination_dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(source_dir.path().join("docs")).unwrap();
    std::fs::write(source_dir.path().join("docs/readme.txt"), b"hello").unwrap();
    std::fs::write(source_dir.path().join("top.txt"), b"top").unwrap();

    let engine = SyncEngine::new(
        Arc::new(LocalFileSystemAdapter::new(adapter_id("local"), source_dir.path())),
        Arc::new(LocalFileSystemAdapter::new(adapter_id("mirror"), destination_dir.path())),
        store().await,
        settings(),
    );

    let pass = engine.run_pass(PassMode::Execute).await.unwrap();
    assert_eq!(pass.outcome(), Some(PassOutcome::Success));
    assert_eq!(
        std::fs::read(destination_dir.path().join("docs/readme.txt")).unwrap(),
        b"hello"
    );
    assert_eq!(std::fs::read(destination_dir.path().join("top.txt")).unwrap(), b"top");

    std::fs::rename(
        source_dir.path().join("top.txt"),
        source_dir.path().join("docs/top.txt"),
    )
    .unwrap();
    let pass = engine.run_pass(PassMode::Execute).await.unwrap();

    assert_eq!(flagged(&pass, ChangeFlag::Moved), ["docs/top.txt"]);
    assert!(!destination_dir.path().join("top.txt").exists());
    assert_eq!(
        std::fs::read(destination_dir.path().join("docs/top.txt")).unwrap(),
        b"top"
    );
}

// ============================================================================
// Watch
// ============================================================================

#[tokio::test]
async fn test_watch_reruns_on_change_until_cancelled() {
    let source = Arc::new(memory("source"));
    let destination = Arc::new(memory("destination"));
    source.write_file("first.txt", b"1").unwrap();
    let engine = engine(source.clone(), destination.clone()).await;
    let cancel = engine.cancel_token();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(async move {
        engine
            .watch(Duration::from_millis(20), move |pass| {
                let _ = tx.send(pass.outcome());
            })
            .await
    });

    let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap();
    assert_eq!(first, Some(Some(PassOutcome::Success)));

    source.write_file("second.txt", b"2").unwrap();
    let second = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap();
    assert_eq!(second, Some(Some(PassOutcome::Success)));
    assert!(destination.item_at("second.txt").is_some());

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
