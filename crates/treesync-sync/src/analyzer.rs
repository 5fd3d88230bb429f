//! Change analysis
//!
//! [`ChangeAnalyzer`] compares what an adapter reports against the persisted
//! entry tree and produces one [`ChangeDescriptor`] per difference. Entries
//! are changed in memory only; persisting them is the executor's job.
//!
//! ## Strategies
//!
//! ```text
//!                 ┌── cursor given ──→ change-tracking queue
//!   analyze() ────┤
//!                 └── no cursor ─────→ recursive tree walk
//! ```
//!
//! **Change tracking** drains the adapter's delta as a FIFO queue. Items whose
//! parent is not known yet are requeued; a skip counter that outgrows the
//! queue means the feed can never be ordered and aborts the analysis.
//!
//! **Tree walk** lists each directory on the adapter and matches the children
//! against the stored children by unique id. Unmatched live items are looked
//! up across the whole store (moves), unmatched stored entries become pending
//! deletions which a later match anywhere in the tree can still claim.
//!
//! Both strategies share [`AnalysisContext`], which owns the per-pass state
//! (moved set, pending deletions, path caches, the result being built).

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::pin::Pin;
use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};
use treesync_core::domain::{
    validate_name, AdapterId, AnalysisResult, ChangeDescriptor, ChangeFlag, ChangeFlags,
    ChangeTrackingCursor, ContentHashes, Entry, EntryId, ItemRef, ItemSnapshot, RawChange,
    RawItem, RelativePath, UniqueId,
};
use treesync_core::ports::{IEntryStore, IStorageAdapter};
use treesync_transfer::{hash_reader, DEFAULT_CHUNK_SIZE};

use crate::{Result, SyncError};

// ============================================================================
// Analysis context
// ============================================================================

/// Stored entry waiting to be emitted as deleted, unless claimed by a move
#[derive(Debug)]
struct PendingDelete {
    entry: Entry,
    path: RelativePath,
}

/// Mutable state of one analysis, threaded through every step
struct AnalysisContext<'a> {
    origin: &'a dyn IStorageAdapter,
    target: &'a dyn IStorageAdapter,
    /// Whether `origin` is the relationship's source (selects the hash side)
    origin_is_source: bool,
    /// Only the root is stored: nothing was ever synchronized
    first_sync: bool,
    /// Hashes of every origin unique id the store knows, tombstones included
    known_ids: HashSet<u64>,
    /// Unique ids found under a new parent during this walk
    moved: HashSet<UniqueId>,
    pending_deleted: HashMap<UniqueId, PendingDelete>,
    /// Unique ids the adapter handed from a deleted item to a new one
    reused: HashSet<UniqueId>,
    /// Stored (pre-pass) paths
    store_paths: HashMap<EntryId, RelativePath>,
    /// Paths of entries placed during this pass
    new_paths: HashMap<EntryId, RelativePath>,
    result: AnalysisResult,
}

impl AnalysisContext<'_> {
    fn origin_id(&self) -> &AdapterId {
        self.origin.id()
    }

    fn origin_hashes<'e>(&self, entry: &'e Entry) -> &'e ContentHashes {
        if self.origin_is_source {
            entry.source_hashes()
        } else {
            entry.destination_hashes()
        }
    }

    fn set_origin_hashes(&self, entry: &mut Entry, hashes: ContentHashes) {
        if self.origin_is_source {
            entry.set_source_hashes(hashes);
        } else {
            entry.set_destination_hashes(hashes);
        }
    }

    fn set_target_hashes(&self, entry: &mut Entry, hashes: ContentHashes) {
        if self.origin_is_source {
            entry.set_destination_hashes(hashes);
        } else {
            entry.set_source_hashes(hashes);
        }
    }

    fn count_unchanged(&mut self, entry: &Entry) {
        if entry.is_directory() {
            self.result.unchanged_directories += 1;
        } else {
            self.result.unchanged_files += 1;
        }
    }

    fn emit(&mut self, descriptor: ChangeDescriptor) {
        debug!(
            path = %descriptor.path(),
            flags = %descriptor.flags,
            "Change detected"
        );
        self.result.descriptors.push(descriptor);
    }
}

fn id_hash(id: &UniqueId) -> u64 {
    let mut hasher = DefaultHasher::new();
    id.hash(&mut hasher);
    hasher.finish()
}

/// Snapshot of what the adapter reports for `item` at `path`
fn snapshot_of(item: &RawItem, path: RelativePath) -> ItemSnapshot {
    ItemSnapshot {
        path: Some(path),
        size: Some(item.size),
        hashes: item.hashes.clone(),
        created: item.created,
        modified: Some(item.modified),
        unique_id: Some(item.unique_id.clone()),
    }
}

// ============================================================================
// ChangeAnalyzer
// ============================================================================

/// Detects the changes needed to bring the opposite adapter up to date
pub struct ChangeAnalyzer {
    store: Arc<dyn IEntryStore>,
    source_id: AdapterId,
    check_if_sync_required: bool,
    chunk_size: usize,
}

impl ChangeAnalyzer {
    /// Analyzer for the relationship whose source adapter is `source_id`
    pub fn new(store: Arc<dyn IEntryStore>, source_id: AdapterId) -> Self {
        Self {
            store,
            source_id,
            check_if_sync_required: false,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Skip copying new files that already exist identically on the target
    /// during the first synchronization
    #[must_use]
    pub fn with_check_if_sync_required(mut self, enabled: bool) -> Self {
        self.check_if_sync_required = enabled;
        self
    }

    /// Read size used when content has to be hashed
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Analyze `origin` against the stored tree rooted at `root`
    ///
    /// With a `cursor` the delta it carries is processed; without one the
    /// whole tree is walked. Fatal errors are captured as the result's
    /// exception and discard any partial findings.
    #[instrument(skip_all, fields(origin = %origin.id(), tracking = cursor.is_some()))]
    pub async fn analyze(
        &self,
        origin: &dyn IStorageAdapter,
        target: &dyn IStorageAdapter,
        root: &Entry,
        cursor: Option<ChangeTrackingCursor>,
    ) -> AnalysisResult {
        let mut ctx = match self.prepare(origin, target).await {
            Ok(ctx) => ctx,
            Err(e) => {
                error!(error = %e, "Analysis could not start");
                return AnalysisResult::failed(origin.id().clone(), e.to_string());
            }
        };

        let outcome = match cursor {
            Some(cursor) => self.process_changes(&mut ctx, root, cursor).await,
            None => match self.walk(&mut ctx, root.clone(), RelativePath::root(), false).await {
                Ok(()) => self.emit_pending_deletes(&mut ctx),
                Err(e) => Err(e),
            },
        };

        match outcome {
            Ok(()) => {
                info!(
                    changes = ctx.result.descriptors.len(),
                    unchanged = ctx.result.unchanged(),
                    skipped = ctx.result.skipped,
                    "Analysis complete"
                );
                ctx.result
            }
            Err(e) => {
                error!(error = %e, "Analysis failed");
                AnalysisResult::failed(origin.id().clone(), e.to_string())
            }
        }
    }

    async fn prepare<'a>(
        &self,
        origin: &'a dyn IStorageAdapter,
        target: &'a dyn IStorageAdapter,
    ) -> Result<AnalysisContext<'a>> {
        let all = self.store.get_all().await.map_err(SyncError::store)?;
        let first_sync = all.iter().all(Entry::is_root);
        let known_ids = all
            .iter()
            .filter_map(|e| e.binding_for(origin.id()))
            .map(id_hash)
            .collect();
        debug!(stored = all.len(), first_sync, "Store loaded");

        Ok(AnalysisContext {
            origin,
            target,
            origin_is_source: origin.id() == &self.source_id,
            first_sync,
            known_ids,
            moved: HashSet::new(),
            pending_deleted: HashMap::new(),
            reused: HashSet::new(),
            store_paths: HashMap::new(),
            new_paths: HashMap::new(),
            result: AnalysisResult::new(origin.id().clone()),
        })
    }

    // ========================================================================
    // Tree walk
    // ========================================================================

    /// Compare the live children of `dir` with its stored children, recursively
    fn walk<'b, 'a: 'b>(
        &'b self,
        ctx: &'b mut AnalysisContext<'a>,
        dir: Entry,
        dir_path: RelativePath,
        known_new: bool,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'b>> {
        Box::pin(async move {
            let origin = ctx.origin;
            let dir_ref = ItemRef::new(dir.binding_for(origin.id()).cloned(), dir_path.clone());
            let live = origin
                .list_children(&dir_ref)
                .await
                .map_err(|e| SyncError::adapter(origin.id(), e))?;

            let mut stored: HashMap<UniqueId, Entry> = HashMap::new();
            if !known_new {
                for entry in self
                    .store
                    .get_children(dir.id())
                    .await
                    .map_err(SyncError::store)?
                {
                    if let Some(uid) = entry.binding_for(origin.id()).cloned() {
                        stored.insert(uid, entry);
                    }
                }
            }

            for item in live {
                if let Some(reason) = skip_reason(&item) {
                    warn!(path = %dir_path, name = %item.name, reason = %reason, "Skipping item");
                    ctx.result.skipped += 1;
                    stored.remove(&item.unique_id);
                    ctx.pending_deleted.remove(&item.unique_id);
                    continue;
                }
                let path = dir_path.join(&item.name)?;

                let existing = match stored.remove(&item.unique_id) {
                    Some(entry) => Some(entry),
                    None => self.find_elsewhere(ctx, &item).await?,
                };

                let (entry, is_new) = match existing {
                    Some(entry) if is_reused_id(&entry, &item, &dir) => {
                        info!(path = %path, "Unique id reused by a new item");
                        ctx.reused.insert(item.unique_id.clone());
                        let pending = ctx.pending_deleted.contains_key(&item.unique_id);
                        if !entry.is_deleted() && !pending {
                            self.mark_pending_delete(ctx, item.unique_id.clone(), entry)
                                .await?;
                        }
                        (self.classify_new(ctx, &item, &dir, &path).await?, true)
                    }
                    Some(entry) => {
                        ctx.pending_deleted.remove(&item.unique_id);
                        if entry.parent_id() != Some(dir.id()) {
                            ctx.moved.insert(item.unique_id.clone());
                        }
                        (self.classify_existing(ctx, entry, &item, &dir, &path).await?, false)
                    }
                    None => (self.classify_new(ctx, &item, &dir, &path).await?, true),
                };

                if entry.is_directory() {
                    self.walk(ctx, entry, path, is_new).await?;
                }
            }

            // Stored children the adapter no longer reports
            let mut leftovers: Vec<(UniqueId, Entry)> = stored.into_iter().collect();
            leftovers.sort_by(|a, b| a.1.name().cmp(b.1.name()));
            for (uid, entry) in leftovers {
                if entry.is_deleted() || ctx.moved.contains(&uid) {
                    continue;
                }
                self.mark_pending_delete(ctx, uid, entry).await?;
            }
            Ok(())
        })
    }

    /// Look up an unmatched item across the whole store
    async fn find_elsewhere(
        &self,
        ctx: &AnalysisContext<'_>,
        item: &RawItem,
    ) -> Result<Option<Entry>> {
        if !ctx.known_ids.contains(&id_hash(&item.unique_id)) {
            return Ok(None);
        }
        let found = self
            .store
            .get_by_binding(ctx.origin_id(), &item.unique_id)
            .await
            .map_err(SyncError::store)?;
        Ok(found.filter(|e| !e.is_root()))
    }

    /// Record `entry` and its live stored descendants as pending deletions
    async fn mark_pending_delete(
        &self,
        ctx: &mut AnalysisContext<'_>,
        uid: UniqueId,
        entry: Entry,
    ) -> Result<()> {
        let mut stack = vec![(uid, entry)];
        while let Some((uid, entry)) = stack.pop() {
            let path = self.stored_path(ctx, &entry).await?;
            if entry.is_directory() {
                for child in self
                    .store
                    .get_children(entry.id())
                    .await
                    .map_err(SyncError::store)?
                {
                    if child.is_deleted() {
                        continue;
                    }
                    if let Some(child_uid) = child.binding_for(ctx.origin_id()).cloned() {
                        if !ctx.moved.contains(&child_uid) {
                            stack.push((child_uid, child));
                        }
                    }
                }
            }
            debug!(path = %path, "Pending delete");
            ctx.pending_deleted
                .insert(uid, PendingDelete { entry, path });
        }
        Ok(())
    }

    /// Emit whatever no move claimed, parents before children
    fn emit_pending_deletes(&self, ctx: &mut AnalysisContext<'_>) -> Result<()> {
        let mut pending: Vec<PendingDelete> = ctx.pending_deleted.drain().map(|(_, p)| p).collect();
        pending.sort_by(|a, b| a.path.cmp(&b.path));
        for PendingDelete { entry, path } in pending {
            self.emit_delete(ctx, entry, path)?;
        }
        Ok(())
    }

    fn emit_delete(
        &self,
        ctx: &mut AnalysisContext<'_>,
        mut entry: Entry,
        path: RelativePath,
    ) -> Result<()> {
        let unique_id = entry.binding_for(ctx.origin_id()).cloned();
        if unique_id.as_ref().is_some_and(|uid| ctx.reused.contains(uid)) {
            // The id now belongs to the replacing item
            entry.remove_binding(ctx.origin_id());
        }
        let old = ItemSnapshot {
            unique_id,
            ..ItemSnapshot::of_entry(&entry, path, ctx.origin_hashes(&entry).clone())
        };
        entry.tombstone()?;
        let mut descriptor = ChangeDescriptor::new(
            entry,
            ctx.origin_id().clone(),
            ChangeFlags::single(ChangeFlag::Deleted),
        );
        descriptor.source.old = old;
        ctx.emit(descriptor);
        Ok(())
    }

    // ========================================================================
    // Change tracking
    // ========================================================================

    async fn process_changes(
        &self,
        ctx: &mut AnalysisContext<'_>,
        root: &Entry,
        cursor: ChangeTrackingCursor,
    ) -> Result<()> {
        ctx.result.cursor = Some(cursor.token.clone());
        let changes = cursor.deduplicated();
        let root_uid = root.binding_for(ctx.origin_id()).cloned();
        // Parent each live item ends up under, by unique id
        let live_parents: HashMap<UniqueId, Option<UniqueId>> = changes
            .iter()
            .filter(|c| !c.deleted)
            .map(|c| (c.item.unique_id.clone(), c.item.parent_id.clone()))
            .collect();
        let doomed = doomed_ids(&changes, root_uid.as_ref());

        // Entries placed during this pass, by origin unique id
        let mut placed: HashMap<UniqueId, Entry> = HashMap::new();
        let mut deleted: HashSet<EntryId> = HashSet::new();
        if let Some(uid) = &root_uid {
            placed.insert(uid.clone(), root.clone());
        }
        ctx.new_paths.insert(root.id(), RelativePath::root());

        let mut queue: VecDeque<_> = changes.into_iter().collect();
        let mut skips = 0usize;
        debug!(queued = queue.len(), "Processing change feed");

        while let Some(change) = queue.pop_front() {
            let item = &change.item;
            if root_uid.as_ref() == Some(&item.unique_id) || item.parent_id.is_none() {
                continue;
            }

            if change.deleted || doomed.contains(&item.unique_id) {
                if !change.deleted {
                    debug!(name = %item.name, "Parent deleted in this feed");
                }
                self.process_deleted(ctx, item, &live_parents, &mut deleted)
                    .await?;
                skips = 0;
                continue;
            }
            if let Some(reason) = skip_reason(item) {
                warn!(name = %item.name, reason = %reason, "Skipping item");
                ctx.result.skipped += 1;
                skips = 0;
                continue;
            }

            let Some(parent) = self.resolve_parent(ctx, item, &placed, &deleted).await? else {
                skips += 1;
                if skips > queue.len() {
                    return Err(SyncError::DependencyCycle {
                        skipped: skips,
                        queued: queue.len() + 1,
                    });
                }
                debug!(name = %item.name, skips, "Parent not resolved yet, requeued");
                queue.push_back(change);
                continue;
            };
            skips = 0;

            let parent_path = self.current_path(ctx, &parent).await?;
            let path = parent_path.join(&item.name)?;
            let existing = self
                .store
                .get_by_binding(ctx.origin_id(), &item.unique_id)
                .await
                .map_err(SyncError::store)?
                .filter(|e| !e.is_root());
            let entry = match existing {
                Some(entry) if is_reused_id(&entry, item, &parent) => {
                    info!(path = %path, "Unique id reused by a new item");
                    ctx.reused.insert(item.unique_id.clone());
                    if !entry.is_deleted() {
                        self.cascade_delete(ctx, entry, &live_parents, &mut deleted)
                            .await?;
                    }
                    self.classify_new(ctx, item, &parent, &path).await?
                }
                Some(entry) => self.classify_existing(ctx, entry, item, &parent, &path).await?,
                None => self.classify_new(ctx, item, &parent, &path).await?,
            };
            ctx.new_paths.insert(entry.id(), path);
            placed.insert(item.unique_id.clone(), entry);
        }
        Ok(())
    }

    /// Tombstone the stored entry of `item` along with its subtree
    async fn process_deleted(
        &self,
        ctx: &mut AnalysisContext<'_>,
        item: &RawItem,
        live_parents: &HashMap<UniqueId, Option<UniqueId>>,
        deleted: &mut HashSet<EntryId>,
    ) -> Result<()> {
        let found = self
            .store
            .get_by_binding(ctx.origin_id(), &item.unique_id)
            .await
            .map_err(SyncError::store)?;
        let entry = match found {
            Some(entry) if !entry.is_deleted() && !entry.is_root() => entry,
            Some(_) => return Ok(()),
            None => {
                debug!(name = %item.name, "Created and deleted within one cycle, skipped");
                return Ok(());
            }
        };
        self.cascade_delete(ctx, entry, live_parents, deleted).await
    }

    /// Emit deletions for `entry` and its stored descendants, parents first
    ///
    /// A descendant escapes only when the feed reports it live under some
    /// other parent. `deleted` collects what was emitted so no entry is
    /// tombstoned twice.
    async fn cascade_delete(
        &self,
        ctx: &mut AnalysisContext<'_>,
        entry: Entry,
        live_parents: &HashMap<UniqueId, Option<UniqueId>>,
        deleted: &mut HashSet<EntryId>,
    ) -> Result<()> {
        let mut stack = vec![entry];
        while let Some(entry) = stack.pop() {
            if !deleted.insert(entry.id()) {
                continue;
            }
            if entry.is_directory() {
                let dir_uid = entry.binding_for(ctx.origin_id()).cloned();
                for child in self
                    .store
                    .get_children(entry.id())
                    .await
                    .map_err(SyncError::store)?
                {
                    if child.is_deleted() {
                        continue;
                    }
                    let moved_out = child
                        .binding_for(ctx.origin_id())
                        .and_then(|uid| live_parents.get(uid))
                        .is_some_and(|parent| parent.as_ref() != dir_uid.as_ref());
                    if !moved_out {
                        stack.push(child);
                    }
                }
            }
            let path = self.stored_path(ctx, &entry).await?;
            self.emit_delete(ctx, entry, path)?;
        }
        Ok(())
    }

    /// Parent entry of a feed item, from this pass first, then the store
    async fn resolve_parent(
        &self,
        ctx: &AnalysisContext<'_>,
        item: &RawItem,
        placed: &HashMap<UniqueId, Entry>,
        deleted: &HashSet<EntryId>,
    ) -> Result<Option<Entry>> {
        let Some(parent_uid) = &item.parent_id else {
            return Ok(None);
        };
        if let Some(parent) = placed.get(parent_uid) {
            return Ok(Some(parent.clone()));
        }
        let stored = self
            .store
            .get_by_binding(ctx.origin_id(), parent_uid)
            .await
            .map_err(SyncError::store)?;
        // A file here means the id was reused and the new directory is not placed yet
        Ok(stored.filter(|p| {
            p.is_directory() && !p.is_deleted() && !deleted.contains(&p.id())
        }))
    }

    // ========================================================================
    // Classification
    // ========================================================================

    /// Diff a matched entry against what the adapter reports now
    async fn classify_existing(
        &self,
        ctx: &mut AnalysisContext<'_>,
        mut entry: Entry,
        item: &RawItem,
        parent: &Entry,
        path: &RelativePath,
    ) -> Result<Entry> {
        if entry.kind() != item.kind {
            return Err(SyncError::TypeTransition {
                path: path.clone(),
                from: entry.kind(),
                to: item.kind,
            });
        }

        let mut flags = Vec::new();
        if entry.is_deleted() {
            flags.push(ChangeFlag::Restored);
        }
        if entry.name() != item.name {
            flags.push(ChangeFlag::Renamed);
        }
        if entry.parent_id() != Some(parent.id()) {
            flags.push(ChangeFlag::Moved);
        }
        if !entry.is_directory() {
            if entry.size() != item.size {
                flags.push(ChangeFlag::FileSize);
            }
            if entry.modified() != item.modified {
                flags.push(ChangeFlag::ModifiedTimestamp);
            }
            if item.created.is_some_and(|c| c != entry.created()) {
                flags.push(ChangeFlag::CreatedTimestamp);
            }
            let known = ctx.origin_hashes(&entry);
            if let (Some(old), Some(new)) = (&known.sha1, &item.hashes.sha1) {
                if old != new {
                    flags.push(ChangeFlag::Sha1Hash);
                }
            }
            if let (Some(old), Some(new)) = (&known.md5, &item.hashes.md5) {
                if old != new {
                    flags.push(ChangeFlag::Md5Hash);
                }
            }
        }

        if flags.is_empty() {
            ctx.count_unchanged(&entry);
            return Ok(entry);
        }
        let flags = ChangeFlags::new(flags)?;

        let old_path = self.stored_path(ctx, &entry).await?;
        let old = ItemSnapshot {
            unique_id: Some(item.unique_id.clone()),
            ..ItemSnapshot::of_entry(&entry, old_path, ctx.origin_hashes(&entry).clone())
        };

        if flags.is_restored() {
            entry.restore();
        }
        if flags.is_relocation() {
            entry.relocate(parent.id(), item.name.clone())?;
        }
        if !entry.is_directory() {
            entry.set_size(item.size);
            entry.set_timestamps(item.created.unwrap_or(entry.created()), item.modified);
            if !item.hashes.is_empty() {
                ctx.set_origin_hashes(&mut entry, item.hashes.clone());
            }
        }
        entry.mark_not_synchronized();

        let mut descriptor = ChangeDescriptor::new(entry.clone(), ctx.origin_id().clone(), flags);
        descriptor.source.old = old;
        descriptor.source.new = snapshot_of(item, path.clone());
        ctx.emit(descriptor);
        Ok(entry)
    }

    /// Build the entry for an item the store has never seen
    async fn classify_new(
        &self,
        ctx: &mut AnalysisContext<'_>,
        item: &RawItem,
        parent: &Entry,
        path: &RelativePath,
    ) -> Result<Entry> {
        let mut entry = Entry::new(
            parent.id(),
            item.name.clone(),
            item.kind,
            item.size,
            item.created.unwrap_or(item.modified),
            item.modified,
        )?;
        entry.set_binding(ctx.origin_id().clone(), item.unique_id.clone());
        if !item.hashes.is_empty() {
            ctx.set_origin_hashes(&mut entry, item.hashes.clone());
        }

        let flag = if item.is_directory() {
            ChangeFlag::NewDirectory
        } else {
            ChangeFlag::NewFile
        };
        let mut descriptor =
            ChangeDescriptor::new(entry.clone(), ctx.origin_id().clone(), ChangeFlags::single(flag));
        descriptor.source.new = snapshot_of(item, path.clone());

        if self.check_if_sync_required && ctx.first_sync && !item.is_directory() {
            self.check_destination(ctx, &mut descriptor, item, parent, path)
                .await?;
        }
        let entry = descriptor.entry.clone();
        ctx.emit(descriptor);
        Ok(entry)
    }

    /// First-sync shortcut: when the target already holds a file of the same
    /// name, size and content, mark the descriptor [`ChangeFlag::DestinationExists`]
    async fn check_destination(
        &self,
        ctx: &mut AnalysisContext<'_>,
        descriptor: &mut ChangeDescriptor,
        item: &RawItem,
        parent: &Entry,
        path: &RelativePath,
    ) -> Result<()> {
        let target = ctx.target;
        let parent_path = path.parent().unwrap_or_default();
        let parent_ref = ItemRef::new(parent.binding_for(target.id()).cloned(), parent_path);
        let existing = match target.find_child(&parent_ref, &item.name).await {
            Ok(Some(existing)) => existing,
            Ok(None) => return Ok(()),
            Err(e) => {
                debug!(path = %path, error = %e, "Target parent not readable, copying");
                return Ok(());
            }
        };
        if existing.is_directory() || existing.has_error() || existing.size != item.size {
            return Ok(());
        }

        let origin_ref = ItemRef::of(item, path.clone());
        let Some(origin_hashes) = self.hashes_of(ctx.origin, &origin_ref, item).await else {
            return Ok(());
        };
        let target_ref = ItemRef::of(&existing, path.clone());
        let Some(target_hashes) = self.hashes_of(target, &target_ref, &existing).await else {
            return Ok(());
        };
        if !origin_hashes.agrees_with(&target_hashes) {
            debug!(path = %path, "Target copy differs, copying");
            return Ok(());
        }

        info!(path = %path, "Identical copy already on target, skipping content");
        descriptor.flags = descriptor.flags.with(ChangeFlag::DestinationExists)?;
        ctx.set_origin_hashes(&mut descriptor.entry, origin_hashes.clone());
        ctx.set_target_hashes(&mut descriptor.entry, target_hashes.clone());
        descriptor.source.new.hashes = origin_hashes;
        descriptor.destination.new = ItemSnapshot {
            hashes: target_hashes,
            ..snapshot_of(&existing, path.clone())
        };
        Ok(())
    }

    /// Reported hashes, or hashes computed from the content
    async fn hashes_of(
        &self,
        adapter: &dyn IStorageAdapter,
        item_ref: &ItemRef,
        item: &RawItem,
    ) -> Option<ContentHashes> {
        if !item.hashes.is_empty() {
            return Some(item.hashes.clone());
        }
        let mut reader = match adapter.open_read(item_ref).await {
            Ok(reader) => reader,
            Err(e) => {
                warn!(adapter = %adapter.id(), path = %item_ref.path, error = %e, "Cannot read for hashing");
                return None;
            }
        };
        match hash_reader(&mut reader, self.chunk_size).await {
            Ok((hashes, _)) => Some(hashes),
            Err(e) => {
                warn!(adapter = %adapter.id(), path = %item_ref.path, error = %e, "Hashing failed");
                None
            }
        }
    }

    // ========================================================================
    // Paths
    // ========================================================================

    /// Path of `entry` as persisted before this pass
    async fn stored_path(&self, ctx: &mut AnalysisContext<'_>, entry: &Entry) -> Result<RelativePath> {
        if let Some(path) = ctx.store_paths.get(&entry.id()) {
            return Ok(path.clone());
        }
        let path = resolve_path(self.store.as_ref(), entry, &ctx.store_paths).await?;
        ctx.store_paths.insert(entry.id(), path.clone());
        Ok(path)
    }

    /// Path of `entry` once this pass's changes are applied
    async fn current_path(&self, ctx: &AnalysisContext<'_>, entry: &Entry) -> Result<RelativePath> {
        if let Some(path) = ctx.new_paths.get(&entry.id()) {
            return Ok(path.clone());
        }
        resolve_path(self.store.as_ref(), entry, &ctx.new_paths).await
    }
}

/// Unique ids the feed leaves deleted: deleted items, plus live items whose
/// reported parent is one of them, transitively
fn doomed_ids(changes: &[RawChange], root: Option<&UniqueId>) -> HashSet<UniqueId> {
    let mut doomed: HashSet<UniqueId> = changes
        .iter()
        .filter(|c| c.deleted && Some(&c.item.unique_id) != root)
        .map(|c| c.item.unique_id.clone())
        .collect();
    loop {
        let before = doomed.len();
        for change in changes.iter().filter(|c| !c.deleted) {
            if change.item.parent_id.as_ref().is_some_and(|p| doomed.contains(p)) {
                doomed.insert(change.item.unique_id.clone());
            }
        }
        if doomed.len() == before {
            return doomed;
        }
    }
}

/// Whether a stored entry matched by unique id is really a different item
///
/// File systems recycle ids (inode numbers): a kind change together with a
/// new name or parent is a new item. A kind change in place stays an error.
fn is_reused_id(entry: &Entry, item: &RawItem, parent: &Entry) -> bool {
    entry.kind() != item.kind
        && (entry.is_deleted()
            || entry.name() != item.name
            || entry.parent_id() != Some(parent.id()))
}

/// Why an item cannot be analyzed, if it cannot
fn skip_reason(item: &RawItem) -> Option<String> {
    if let Some(error) = &item.error {
        return Some(error.clone());
    }
    validate_name(&item.name).err().map(|e| e.to_string())
}

/// Walk up the stored parents of `entry`, stopping at the root or at an
/// ancestor whose path `known` already holds
pub(crate) async fn resolve_path(
    store: &dyn IEntryStore,
    entry: &Entry,
    known: &HashMap<EntryId, RelativePath>,
) -> Result<RelativePath> {
    if entry.is_root() {
        return Ok(RelativePath::root());
    }
    let mut names = vec![entry.name().to_string()];
    let mut parent_id = entry.parent_id();
    let base = loop {
        let Some(id) = parent_id else {
            break RelativePath::root();
        };
        if let Some(path) = known.get(&id) {
            break path.clone();
        }
        let parent = store
            .get_entry(id)
            .await
            .map_err(SyncError::store)?
            .ok_or_else(|| SyncError::Store(format!("missing parent entry {id}")))?;
        if parent.is_root() {
            break RelativePath::root();
        }
        names.push(parent.name().to_string());
        parent_id = parent.parent_id();
    };
    let mut path = base;
    for name in names.iter().rev() {
        path = path.join(name)?;
    }
    Ok(path)
}
