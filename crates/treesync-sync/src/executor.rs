//! Change execution
//!
//! [`SyncExecutor`] applies change descriptors to the opposite adapter and
//! persists the resulting entries.
//!
//! ## Ordering
//!
//! ```text
//!  new / restored directories   ascending path, one at a time
//!  relocated directories        ascending path, one at a time
//!  everything else              worker pool (Semaphore, worker_count)
//!  deletions                    descending path, one at a time
//! ```
//!
//! Directory work runs alone because later items depend on it: a file can
//! only be written once its parent exists, and target paths of items below
//! a moved directory are only valid after the move.
//!
//! ## Completion
//!
//! Every finished item is reported to a single aggregator task over an mpsc
//! channel. The aggregator owns all store writes and the progress counters,
//! and acknowledges each item through a oneshot reply.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context};
use tokio::sync::{broadcast, mpsc, oneshot, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use treesync_core::domain::{
    ChangeDescriptor, ChangeFlag, Entry, ItemRef, ProgressEvent, RawItem, RelativePath,
};
use treesync_core::ports::{IEntryStore, IStorageAdapter, MetadataUpdate};
use treesync_transfer::{CodecMode, EncryptionCodec, KeySource, ThroughputMeter, TransferOutcome, TransferPipeline};

use crate::analyzer::resolve_path;
use crate::retry::{with_retry, RetryPolicy};

/// Result of executing one batch of descriptors
#[derive(Debug, Default)]
pub struct ExecutionReport {
    /// Every descriptor handed in, with its processing state set
    pub descriptors: Vec<ChangeDescriptor>,
    pub bytes_transferred: u64,
    pub files_completed: u64,
    /// Cancellation was requested before the batch finished
    pub cancelled: bool,
}

impl ExecutionReport {
    pub fn failed(&self) -> usize {
        self.descriptors
            .iter()
            .filter(|d| d.state() == treesync_core::domain::ProcessingState::Failed)
            .count()
    }
}

/// What applying one descriptor produced on the target
#[derive(Debug, Default)]
struct Applied {
    target_item: Option<RawItem>,
    transfer: Option<TransferOutcome>,
}

/// Message from a worker to the aggregator
struct Completion {
    path: RelativePath,
    outcome: std::result::Result<Commit, String>,
    bytes: u64,
    is_file: bool,
    reply: oneshot::Sender<std::result::Result<(), String>>,
}

struct Commit {
    entry: Entry,
    insert: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct Totals {
    bytes: u64,
    files: u64,
}

/// Applies descriptors from one adapter to the other
#[derive(Clone)]
pub struct SyncExecutor {
    store: Arc<dyn IEntryStore>,
    source: Arc<dyn IStorageAdapter>,
    destination: Arc<dyn IStorageAdapter>,
    pipeline: TransferPipeline,
    keys: Option<Arc<dyn KeySource>>,
    worker_count: usize,
    retry: RetryPolicy,
    cancel: CancellationToken,
    events: broadcast::Sender<ProgressEvent>,
    meter: Arc<ThroughputMeter>,
}

impl SyncExecutor {
    pub fn new(
        store: Arc<dyn IEntryStore>,
        source: Arc<dyn IStorageAdapter>,
        destination: Arc<dyn IStorageAdapter>,
        pipeline: TransferPipeline,
        cancel: CancellationToken,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            store,
            source,
            destination,
            pipeline,
            keys: None,
            worker_count: 4,
            retry: RetryPolicy::default(),
            cancel,
            events,
            meter: Arc::new(ThroughputMeter::default()),
        }
    }

    /// Encrypt content written to the destination, decrypt content read from it
    #[must_use]
    pub fn with_keys(mut self, keys: Arc<dyn KeySource>) -> Self {
        self.keys = Some(keys);
        self
    }

    #[must_use]
    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count.max(1);
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_events(mut self, events: broadcast::Sender<ProgressEvent>) -> Self {
        self.events = events;
        self
    }

    /// Meter the pipeline records into, read for progress events
    #[must_use]
    pub fn with_meter(mut self, meter: Arc<ThroughputMeter>) -> Self {
        self.meter = meter;
        self
    }

    /// Apply `descriptors` and persist the entries of the successful ones
    #[instrument(skip_all, fields(count = descriptors.len(), workers = self.worker_count))]
    pub async fn execute(&self, descriptors: Vec<ChangeDescriptor>) -> ExecutionReport {
        let (tx, rx) = mpsc::channel(self.worker_count * 2);
        let aggregator = tokio::spawn(aggregate(
            self.store.clone(),
            self.events.clone(),
            self.meter.clone(),
            rx,
        ));

        let mut directories = Vec::new();
        let mut relocated = Vec::new();
        let mut deletions = Vec::new();
        let mut pooled = Vec::new();
        for d in descriptors {
            let flags = d.flags;
            if flags.is_deleted() {
                deletions.push(d);
            } else if d.entry.is_directory() && (flags.is_new() || flags.is_restored()) {
                directories.push(d);
            } else if d.entry.is_directory() && flags.is_relocation() {
                relocated.push(d);
            } else {
                pooled.push(d);
            }
        }
        directories.sort_by_key(ChangeDescriptor::path);
        relocated.sort_by_key(ChangeDescriptor::path);
        deletions.sort_by_key(|d| std::cmp::Reverse(d.path()));

        let mut finished = Vec::new();
        for d in directories.into_iter().chain(relocated) {
            finished.push(self.run_sequential(d, &tx).await);
        }

        let semaphore = Arc::new(Semaphore::new(self.worker_count));
        let mut workers = JoinSet::new();
        let mut pending = pooled.into_iter();
        while let Some(d) = pending.next() {
            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    finished.push(d);
                    finished.extend(pending.by_ref());
                    break;
                }
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        finished.push(d);
                        continue;
                    }
                },
            };
            let this = self.clone();
            let tx = tx.clone();
            workers.spawn(async move {
                let _permit = permit;
                this.run_one(d, &tx).await
            });
        }
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(d) => finished.push(d),
                Err(e) => error!(error = %e, "Worker task failed"),
            }
        }

        for d in deletions {
            finished.push(self.run_sequential(d, &tx).await);
        }

        drop(tx);
        let totals = aggregator.await.unwrap_or_else(|e| {
            error!(error = %e, "Progress aggregator failed");
            Totals::default()
        });

        let report = ExecutionReport {
            descriptors: finished,
            bytes_transferred: totals.bytes,
            files_completed: totals.files,
            cancelled: self.cancel.is_cancelled(),
        };
        info!(
            bytes = report.bytes_transferred,
            files = report.files_completed,
            failed = report.failed(),
            cancelled = report.cancelled,
            "Execution complete"
        );
        report
    }

    async fn run_sequential(
        &self,
        d: ChangeDescriptor,
        tx: &mpsc::Sender<Completion>,
    ) -> ChangeDescriptor {
        if self.cancel.is_cancelled() {
            return d;
        }
        self.run_one(d, tx).await
    }

    /// Apply one descriptor and wait for the aggregator to persist it
    async fn run_one(
        &self,
        mut d: ChangeDescriptor,
        tx: &mpsc::Sender<Completion>,
    ) -> ChangeDescriptor {
        let path = d.path();
        let _ = self.events.send(ProgressEvent::ItemStarted { path: path.clone() });
        debug!(path = %path, flags = %d.flags, "Applying change");

        let applied =
            with_retry(&self.retry, "apply_change", &self.cancel, || self.apply(&d)).await;
        let (bytes, outcome) = match applied {
            Ok(applied) => (
                applied.transfer.as_ref().map_or(0, |t| t.bytes_written),
                Ok(self.commit_for(&d, &applied)),
            ),
            Err(e) => {
                warn!(path = %path, error = %format!("{e:#}"), "Change failed");
                (0, Err(format!("{e:#}")))
            }
        };

        let (reply, ack) = oneshot::channel();
        let completion = Completion {
            path,
            outcome,
            bytes,
            is_file: !d.entry.is_directory() && !d.flags.is_deleted(),
            reply,
        };
        let status = match tx.send(completion).await {
            Ok(()) => ack
                .await
                .unwrap_or_else(|_| Err("progress aggregator stopped".to_string())),
            Err(_) => Err("progress aggregator stopped".to_string()),
        };
        match status {
            Ok(()) => d.mark_succeeded(),
            Err(message) => d.mark_failed(message),
        }
        d
    }

    /// Entry as it should be persisted after a successful apply
    fn commit_for(&self, d: &ChangeDescriptor, applied: &Applied) -> Commit {
        let (origin, target, _) = self.route(d);
        let mut entry = d.entry.clone();
        if let Some(item) = &applied.target_item {
            entry.set_binding(target.id().clone(), item.unique_id.clone());
        }
        if let Some(transfer) = &applied.transfer {
            let (read, written) = (transfer.read_digests.clone(), transfer.written_digests.clone());
            if origin.id() == self.source.id() {
                entry.set_source_hashes(read);
                entry.set_destination_hashes(written);
            } else {
                entry.set_destination_hashes(read);
                entry.set_source_hashes(written);
            }
        }
        entry.mark_synchronized();
        Commit {
            entry,
            insert: d.flags.is_new(),
        }
    }

    /// Origin adapter, target adapter and codec direction for a descriptor
    fn route(&self, d: &ChangeDescriptor) -> (&dyn IStorageAdapter, &dyn IStorageAdapter, Option<CodecMode>) {
        let encrypted = self.keys.is_some();
        if &d.origin == self.source.id() {
            (
                self.source.as_ref(),
                self.destination.as_ref(),
                encrypted.then_some(CodecMode::Encrypt),
            )
        } else {
            (
                self.destination.as_ref(),
                self.source.as_ref(),
                encrypted.then_some(CodecMode::Decrypt),
            )
        }
    }

    // ========================================================================
    // Applying one descriptor
    // ========================================================================

    async fn apply(&self, d: &ChangeDescriptor) -> anyhow::Result<Applied> {
        let (origin, target, mode) = self.route(d);
        let flags = d.flags;
        let entry = &d.entry;

        if flags.is_deleted() {
            self.delete(d, target).await?;
            return Ok(Applied::default());
        }

        if flags.contains(ChangeFlag::DestinationExists) {
            let existing = ItemRef::new(d.destination.new.unique_id.clone(), d.path());
            match target.get_item(&existing).await? {
                Some(item) if Some(item.size) == d.destination.new.size => {
                    debug!(path = %d.path(), "Target copy kept");
                    return Ok(Applied {
                        target_item: Some(item),
                        transfer: None,
                    });
                }
                _ => debug!(path = %d.path(), "Target copy gone, transferring"),
            }
        }

        let parent_ref = self.target_parent(entry, target).await?;
        let bound = entry.binding_for(target.id()).is_some();

        if entry.is_directory() {
            let item = if flags.is_new() || flags.is_restored() || !bound {
                target.create_directory(&parent_ref, entry.name()).await?
            } else if flags.is_relocation() {
                self.relocate(entry, target, &parent_ref).await?
            } else {
                return Ok(Applied::default());
            };
            return Ok(Applied {
                target_item: Some(item),
                transfer: None,
            });
        }

        let fresh = flags.is_new() || flags.is_restored() || !bound;
        let mut target_item = None;
        if flags.is_relocation() && !fresh {
            target_item = Some(self.relocate(entry, target, &parent_ref).await?);
        }
        let mut transfer = None;
        if fresh || flags.affects_content() {
            let (item, outcome) = self
                .transfer_file(d, origin, target, mode, &parent_ref)
                .await?;
            target_item = Some(item);
            transfer = Some(outcome);
        }

        // Timestamps last: a content write resets them
        let item_ref = match &target_item {
            Some(item) => ItemRef::of(item, parent_ref.path.join(entry.name())?),
            None => ItemRef::new(
                entry.binding_for(target.id()).cloned(),
                parent_ref.path.join(entry.name())?,
            ),
        };
        let timestamps = MetadataUpdate::timestamps(Some(entry.created()), entry.modified());
        let item = target
            .update_metadata(&item_ref, &timestamps)
            .await
            .with_context(|| format!("Failed to set timestamps of {}", item_ref.path))?;
        Ok(Applied {
            target_item: Some(item),
            transfer,
        })
    }

    async fn delete(&self, d: &ChangeDescriptor, target: &dyn IStorageAdapter) -> anyhow::Result<()> {
        let Some(uid) = d.entry.binding_for(target.id()).cloned() else {
            debug!(path = %d.path(), "Never synchronized to target, nothing to delete");
            return Ok(());
        };
        // The stored entry still has its pre-pass location
        let path = match self.store.get_entry(d.entry.id()).await? {
            Some(stored) => resolve_path(self.store.as_ref(), &stored, &HashMap::new()).await?,
            None => d.path(),
        };
        target.delete_item(&ItemRef::new(Some(uid), path)).await
    }

    /// Move or rename the target copy of `entry` under `parent_ref`
    async fn relocate(
        &self,
        entry: &Entry,
        target: &dyn IStorageAdapter,
        parent_ref: &ItemRef,
    ) -> anyhow::Result<RawItem> {
        let stored = self
            .store
            .get_entry(entry.id())
            .await?
            .with_context(|| format!("Entry {} is not stored", entry.id()))?;
        let current_path = resolve_path(self.store.as_ref(), &stored, &HashMap::new()).await?;
        let update = MetadataUpdate {
            new_parent: Some(parent_ref.clone()),
            new_name: Some(entry.name().to_string()),
            ..MetadataUpdate::default()
        };
        let item = ItemRef::new(entry.binding_for(target.id()).cloned(), current_path);
        debug!(from = %item.path, name = entry.name(), "Relocating");
        target
            .update_metadata(&item, &update)
            .await
            .with_context(|| format!("Failed to relocate {}", item.path))
    }

    /// Where `entry` lives on the target, as persisted
    async fn target_parent(
        &self,
        entry: &Entry,
        target: &dyn IStorageAdapter,
    ) -> anyhow::Result<ItemRef> {
        let parent_id = entry
            .parent_id()
            .context("The root has no parent")?;
        let parent = self
            .store
            .get_entry(parent_id)
            .await?
            .with_context(|| format!("Parent of {} is not synchronized", entry.name()))?;
        let Some(uid) = parent.binding_for(target.id()).cloned() else {
            bail!("Parent of {} does not exist on {}", entry.name(), target.id());
        };
        let path = resolve_path(self.store.as_ref(), &parent, &HashMap::new()).await?;
        Ok(ItemRef::new(Some(uid), path))
    }

    /// Stream the origin's content to the target through the codec
    async fn transfer_file(
        &self,
        d: &ChangeDescriptor,
        origin: &dyn IStorageAdapter,
        target: &dyn IStorageAdapter,
        mode: Option<CodecMode>,
        parent_ref: &ItemRef,
    ) -> anyhow::Result<(RawItem, TransferOutcome)> {
        let entry = &d.entry;
        let origin_ref = ItemRef::new(entry.binding_for(origin.id()).cloned(), d.path());
        let mut reader = origin.open_read(&origin_ref).await?;

        let codec = match (mode, &self.keys) {
            (Some(CodecMode::Encrypt), Some(keys)) => {
                Some(EncryptionCodec::encryptor(keys.clone(), entry.size()))
            }
            (Some(CodecMode::Decrypt), Some(keys)) => Some(EncryptionCodec::decryptor(keys.clone())),
            _ => None,
        };
        let expected_len = match &codec {
            Some(codec) => codec
                .output_len(entry.size())
                .with_context(|| format!("{} bytes is not a valid encrypted length", entry.size()))?,
            None => entry.size(),
        };

        let mut writer = target
            .open_write(parent_ref, entry.name(), expected_len)
            .await?;
        match self.pipeline.transfer(&mut reader, &mut *writer, codec).await {
            Ok(outcome) => {
                let item = writer.commit().await?;
                Ok((item, outcome))
            }
            Err(e) => {
                if let Err(abort) = writer.abort().await {
                    warn!(path = %d.path(), error = %abort, "Failed to discard staged write");
                }
                Err(e).with_context(|| format!("Failed to transfer {}", d.path()))
            }
        }
    }
}

/// Persist completed items and keep the running totals
async fn aggregate(
    store: Arc<dyn IEntryStore>,
    events: broadcast::Sender<ProgressEvent>,
    meter: Arc<ThroughputMeter>,
    mut rx: mpsc::Receiver<Completion>,
) -> Totals {
    let mut totals = Totals::default();
    while let Some(completion) = rx.recv().await {
        let status = match completion.outcome {
            Ok(commit) => {
                let written = if commit.insert {
                    store.insert_entry(&commit.entry).await
                } else {
                    store.update_entry(&commit.entry).await
                };
                written.map_err(|e| {
                    error!(path = %completion.path, error = %e, "Failed to persist entry");
                    format!("{e:#}")
                })
            }
            Err(message) => Err(message),
        };

        if status.is_ok() {
            totals.bytes += completion.bytes;
            if completion.is_file {
                totals.files += 1;
            }
        }
        let _ = events.send(ProgressEvent::ItemCompleted {
            path: completion.path,
            succeeded: status.is_ok(),
            bytes_completed: totals.bytes,
            files_completed: totals.files,
            throughput_bytes_per_sec: meter.bytes_per_second(),
        });
        let _ = completion.reply.send(status);
    }
    totals
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::ChangeAnalyzer;
    use crate::memory::MemoryAdapter;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use treesync_cache::{DatabasePool, SqliteEntryStore};
    use treesync_core::domain::{AdapterId, ProcessingState};
    use treesync_core::ports::{AdapterKind, ReadStream, WriteHandle};

    /// Source whose reads wait for the test to open the gate
    struct GatedAdapter {
        inner: Arc<MemoryAdapter>,
        gate: Semaphore,
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl GatedAdapter {
        fn new(inner: Arc<MemoryAdapter>) -> Arc<Self> {
            Arc::new(Self {
                inner,
                gate: Semaphore::new(0),
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            })
        }

        /// Wait until `count` reads are parked at the gate
        async fn wait_for_readers(&self, count: usize) {
            tokio::time::timeout(Duration::from_secs(5), async {
                while self.active.load(Ordering::SeqCst) < count {
                    tokio::task::yield_now().await;
                }
            })
            .await
            .expect("readers never arrived");
        }
    }

    #[async_trait::async_trait]
    impl IStorageAdapter for GatedAdapter {
        fn id(&self) -> &AdapterId {
            self.inner.id()
        }
        fn kind(&self) -> AdapterKind {
            self.inner.kind()
        }
        async fn root(&self) -> anyhow::Result<RawItem> {
            self.inner.root().await
        }
        async fn list_children(&self, item: &ItemRef) -> anyhow::Result<Vec<RawItem>> {
            self.inner.list_children(item).await
        }
        async fn get_item(&self, item: &ItemRef) -> anyhow::Result<Option<RawItem>> {
            self.inner.get_item(item).await
        }
        async fn open_read(&self, item: &ItemRef) -> anyhow::Result<ReadStream> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.gate.acquire().await?.forget();
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.inner.open_read(item).await
        }
        async fn open_write(
            &self,
            parent: &ItemRef,
            name: &str,
            expected_len: u64,
        ) -> anyhow::Result<Box<dyn WriteHandle>> {
            self.inner.open_write(parent, name, expected_len).await
        }
        async fn create_directory(&self, parent: &ItemRef, name: &str) -> anyhow::Result<RawItem> {
            self.inner.create_directory(parent, name).await
        }
        async fn delete_item(&self, item: &ItemRef) -> anyhow::Result<()> {
            self.inner.delete_item(item).await
        }
        async fn update_metadata(
            &self,
            item: &ItemRef,
            update: &MetadataUpdate,
        ) -> anyhow::Result<RawItem> {
            self.inner.update_metadata(item, update).await
        }
    }

    struct Fixture {
        store: Arc<dyn IEntryStore>,
        source: Arc<MemoryAdapter>,
        destination: Arc<MemoryAdapter>,
        root: Entry,
        cancel: CancellationToken,
    }

    async fn fixture() -> Fixture {
        let pool = DatabasePool::in_memory().await.unwrap();
        let store: Arc<dyn IEntryStore> = Arc::new(SqliteEntryStore::new(pool.pool().clone()));
        let source = Arc::new(
            MemoryAdapter::new(AdapterId::new("source".into()).unwrap())
                .unwrap()
                .with_change_tracking(false),
        );
        let destination =
            Arc::new(MemoryAdapter::new(AdapterId::new("destination".into()).unwrap()).unwrap());
        let mut root = Entry::root();
        root.set_binding(source.id().clone(), source.root().await.unwrap().unique_id);
        root.set_binding(
            destination.id().clone(),
            destination.root().await.unwrap().unique_id,
        );
        store.insert_entry(&root).await.unwrap();
        Fixture {
            store,
            source,
            destination,
            root,
            cancel: CancellationToken::new(),
        }
    }

    impl Fixture {
        fn executor(&self) -> SyncExecutor {
            self.executor_reading_from(self.source.clone())
        }

        fn executor_reading_from(&self, source: Arc<dyn IStorageAdapter>) -> SyncExecutor {
            SyncExecutor::new(
                self.store.clone(),
                source,
                self.destination.clone(),
                TransferPipeline::new(self.cancel.clone()),
                self.cancel.clone(),
            )
            .with_retry(RetryPolicy::none())
        }

        async fn analyze(&self) -> Vec<ChangeDescriptor> {
            let result = ChangeAnalyzer::new(self.store.clone(), self.source.id().clone())
                .analyze(self.source.as_ref(), self.destination.as_ref(), &self.root, None)
                .await;
            assert!(result.exception.is_none(), "{:?}", result.exception);
            result.descriptors
        }

        async fn sync(&self) -> ExecutionReport {
            let descriptors = self.analyze().await;
            self.executor().execute(descriptors).await
        }
    }

    #[tokio::test]
    async fn test_copies_new_tree() {
        let f = fixture().await;
        f.source.write_file("docs/readme.txt", &[1u8; 500]).unwrap();
        f.source.write_file("docs/sub/deep.bin", b"deep").unwrap();

        let report = f.sync().await;
        assert_eq!(report.failed(), 0);
        assert_eq!(report.files_completed, 2);
        assert_eq!(report.bytes_transferred, 504);
        assert_eq!(f.destination.read_file("docs/readme.txt").unwrap(), vec![1u8; 500]);
        assert_eq!(f.destination.read_file("docs/sub/deep.bin").unwrap(), b"deep");

        let counts = f.store.count_entries().await.unwrap();
        assert_eq!(counts.total(), 4);
    }

    #[tokio::test]
    async fn test_persisted_entry_has_bindings_and_hashes() {
        let f = fixture().await;
        let uid = f.source.write_file("a.txt", b"hello").unwrap();
        f.sync().await;

        let entry = f
            .store
            .get_by_binding(f.source.id(), &uid)
            .await
            .unwrap()
            .unwrap();
        let dest_uid = entry.binding_for(f.destination.id()).unwrap();
        assert_eq!(&f.destination.item_at("a.txt").unwrap().unique_id, dest_uid);
        assert!(entry.source_hashes().sha1.is_some());
        assert_eq!(entry.source_hashes(), entry.destination_hashes());
        assert!(!entry.state().is_not_synchronized());
    }

    #[tokio::test]
    async fn test_timestamps_copied() {
        let f = fixture().await;
        let when = chrono::DateTime::parse_from_rfc3339("2021-06-01T08:00:00Z")
            .unwrap()
            .with_timezone(&chrono::Utc);
        f.source.write_file_at("t.txt", b"t", when).unwrap();
        f.sync().await;
        assert_eq!(f.destination.item_at("t.txt").unwrap().modified, when);
    }

    #[tokio::test]
    async fn test_rename_and_delete_applied() {
        let f = fixture().await;
        f.source.write_file("dir/old.txt", b"x").unwrap();
        f.source.write_file("gone/file.txt", b"y").unwrap();
        f.sync().await;

        f.source.rename("dir/old.txt", "dir/new.txt").unwrap();
        f.source.remove("gone").unwrap();
        let report = f.sync().await;
        assert_eq!(report.failed(), 0);
        assert!(f.destination.item_at("dir/old.txt").is_none());
        assert_eq!(f.destination.read_file("dir/new.txt").unwrap(), b"x");
        assert!(f.destination.item_at("gone").is_none());
        // A pure rename moves no content
        assert_eq!(report.bytes_transferred, 0);
    }

    #[tokio::test]
    async fn test_directory_move_then_child_update() {
        let f = fixture().await;
        f.source.write_file("a/inner/f.txt", b"one").unwrap();
        f.source.add_directory("b").unwrap();
        f.sync().await;

        f.source.rename("a/inner", "b/inner").unwrap();
        f.source.write_file("b/inner/f.txt", b"changed").unwrap();
        let report = f.sync().await;
        assert_eq!(report.failed(), 0, "{:?}", report.descriptors);
        assert_eq!(f.destination.read_file("b/inner/f.txt").unwrap(), b"changed");
        assert!(f.destination.item_at("a/inner").is_none());
    }

    #[tokio::test]
    async fn test_failure_is_isolated() {
        let f = fixture().await;
        f.source.write_file("ok.txt", b"1").unwrap();
        f.source.write_file("bad.txt", b"2").unwrap();
        let result = ChangeAnalyzer::new(f.store.clone(), f.source.id().clone())
            .analyze(f.source.as_ref(), f.destination.as_ref(), &f.root, None)
            .await;
        // Becomes unreadable between analysis and execution
        f.source.set_error("bad.txt", "locked").unwrap();

        let report = f.executor().execute(result.descriptors).await;
        assert_eq!(report.failed(), 1);
        let bad = report
            .descriptors
            .iter()
            .find(|d| d.path().as_str() == "bad.txt")
            .unwrap();
        assert_eq!(bad.state(), ProcessingState::Failed);
        assert!(f.destination.read_file("ok.txt").is_some());
        // Nothing persisted for the failed item
        assert!(f
            .store
            .get_by_binding(f.source.id(), &bad.entry.binding_for(f.source.id()).unwrap().clone())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_progress_events_reported() {
        let f = fixture().await;
        f.source.write_file("x.txt", b"abc").unwrap();
        let (events, mut rx) = broadcast::channel(16);
        let result = ChangeAnalyzer::new(f.store.clone(), f.source.id().clone())
            .analyze(f.source.as_ref(), f.destination.as_ref(), &f.root, None)
            .await;
        f.executor().with_events(events).execute(result.descriptors).await;

        assert!(matches!(rx.recv().await.unwrap(), ProgressEvent::ItemStarted { .. }));
        match rx.recv().await.unwrap() {
            ProgressEvent::ItemCompleted {
                succeeded,
                bytes_completed,
                files_completed,
                ..
            } => {
                assert!(succeeded);
                assert_eq!(bytes_completed, 3);
                assert_eq!(files_completed, 1);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_before_start_leaves_items_not_started() {
        let f = fixture().await;
        f.source.write_file("a.txt", b"a").unwrap();
        f.source.write_file("b.txt", b"b").unwrap();
        let result = ChangeAnalyzer::new(f.store.clone(), f.source.id().clone())
            .analyze(f.source.as_ref(), f.destination.as_ref(), &f.root, None)
            .await;
        f.cancel.cancel();

        let report = f.executor().execute(result.descriptors).await;
        assert!(report.cancelled);
        assert_eq!(report.descriptors.len(), 2);
        assert!(report
            .descriptors
            .iter()
            .all(|d| d.state() == ProcessingState::NotStarted));
        assert_eq!(f.destination.item_count(), 0);
    }

    #[tokio::test]
    async fn test_worker_pool_bounds_concurrency() {
        let f = fixture().await;
        for i in 0..6 {
            f.source.write_file(&format!("f{i}.txt"), b"data").unwrap();
        }
        let descriptors = f.analyze().await;
        let gated = GatedAdapter::new(f.source.clone());
        let executor = f.executor_reading_from(gated.clone()).with_worker_count(2);
        let run = tokio::spawn(async move { executor.execute(descriptors).await });

        gated.wait_for_readers(2).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(gated.active.load(Ordering::SeqCst), 2);

        gated.gate.add_permits(6);
        let report = run.await.unwrap();
        assert_eq!(report.failed(), 0, "{:?}", report.descriptors);
        assert_eq!(report.files_completed, 6);
        assert_eq!(gated.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancel_with_transfers_in_flight() {
        let f = fixture().await;
        for i in 0..4 {
            f.source.write_file(&format!("f{i}.txt"), b"data").unwrap();
        }
        let descriptors = f.analyze().await;
        let gated = GatedAdapter::new(f.source.clone());
        let executor = f.executor_reading_from(gated.clone()).with_worker_count(2);
        let run = tokio::spawn(async move { executor.execute(descriptors).await });

        gated.wait_for_readers(2).await;
        f.cancel.cancel();
        gated.gate.add_permits(4);
        let report = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("execution hung after cancellation")
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.descriptors.len(), 4);
        let failed: Vec<_> = report
            .descriptors
            .iter()
            .filter(|d| d.state() == ProcessingState::Failed)
            .collect();
        assert_eq!(failed.len(), 2, "{:?}", report.descriptors);
        for d in &failed {
            assert!(d.error().unwrap().contains("cancelled"), "{:?}", d.error());
        }
        let untouched = report
            .descriptors
            .iter()
            .filter(|d| d.state() == ProcessingState::NotStarted)
            .count();
        assert_eq!(untouched, 2);
        assert_eq!(f.destination.item_count(), 0);
        // Both gated reads ran to completion and left the gate
        assert_eq!(gated.active.load(Ordering::SeqCst), 0);
        assert_eq!(gated.peak.load(Ordering::SeqCst), 2);
    }
}
