//! In-memory storage adapter
//!
//! [`MemoryAdapter`] keeps a whole tree in process memory and journals every
//! mutation, which gives it the change-tracking capability the local
//! filesystem lacks. It stands in for cloud backends in tests and demos.
//!
//! ## Change tracking
//!
//! Cursor tokens are journal sequence numbers. `get_changes(None)` lists every
//! live item; `get_changes(Some(n))` returns what was journaled after `n`.
//! [`MemoryAdapter::compact_journal`] drops history, after which older tokens
//! are stale and answered with [`ChangeSet::ResyncRequired`]. The redirect
//! token it hands out yields a full listing.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use anyhow::{bail, Context as _, Result};
use chrono::{DateTime, Utc};
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tracing::debug;
use treesync_core::domain::{
    AdapterId, ChangeTrackingCursor, ContentHashes, CursorToken, EntryKind, ItemRef, RawChange,
    RawItem, RelativePath, UniqueId,
};
use treesync_core::ports::{
    AdapterKind, ChangeSet, IStorageAdapter, MetadataUpdate, ReadStream, WriteHandle,
};
use treesync_transfer::StreamDigests;

const FULL_LISTING_TOKEN: &str = "full";

// ============================================================================
// Tree state
// ============================================================================

#[derive(Debug, Clone)]
struct Node {
    item: RawItem,
    content: Vec<u8>,
}

#[derive(Debug)]
struct Tree {
    nodes: HashMap<UniqueId, Node>,
    root: UniqueId,
    next_id: u64,
    /// Handed out by the next allocation instead of a fresh id
    recycled: Option<UniqueId>,
    journal: Vec<(u64, RawChange)>,
    seq: u64,
    /// Tokens below this sequence number are stale
    horizon: u64,
    report_hashes: bool,
}

impl Tree {
    fn new(report_hashes: bool) -> Result<Self> {
        let root = UniqueId::new("m0".to_string())?;
        let now = Utc::now();
        let mut nodes = HashMap::new();
        nodes.insert(
            root.clone(),
            Node {
                item: RawItem {
                    unique_id: root.clone(),
                    parent_id: None,
                    name: String::new(),
                    kind: EntryKind::Directory,
                    size: 0,
                    hashes: ContentHashes::default(),
                    created: Some(now),
                    modified: now,
                    error: None,
                },
                content: Vec::new(),
            },
        );
        Ok(Self {
            nodes,
            root,
            next_id: 1,
            recycled: None,
            journal: Vec::new(),
            seq: 0,
            horizon: 0,
            report_hashes,
        })
    }

    fn allocate_id(&mut self) -> Result<UniqueId> {
        if let Some(id) = self.recycled.take() {
            return Ok(id);
        }
        let id = UniqueId::new(format!("m{}", self.next_id))?;
        self.next_id += 1;
        Ok(id)
    }

    fn record(&mut self, item: RawItem, deleted: bool) {
        self.seq += 1;
        self.journal.push((self.seq, RawChange { item, deleted }));
    }

    fn children(&self, parent: &UniqueId) -> impl Iterator<Item = &Node> {
        let parent = parent.clone();
        self.nodes
            .values()
            .filter(move |n| n.item.parent_id.as_ref() == Some(&parent))
    }

    fn child_named(&self, parent: &UniqueId, name: &str) -> Option<&Node> {
        self.children(parent).find(|n| n.item.name == name)
    }

    fn lookup_path(&self, path: &RelativePath) -> Option<&UniqueId> {
        let mut current = &self.root;
        for component in path.components() {
            current = &self.child_named(current, component)?.item.unique_id;
        }
        Some(current)
    }

    fn resolve(&self, item: &ItemRef) -> Option<UniqueId> {
        if let Some(id) = &item.unique_id {
            if self.nodes.contains_key(id) {
                return Some(id.clone());
            }
        }
        self.lookup_path(&item.path).cloned()
    }

    fn require(&self, item: &ItemRef) -> Result<UniqueId> {
        self.resolve(item)
            .with_context(|| format!("item not found: {}", describe(item)))
    }

    fn require_directory(&self, item: &ItemRef) -> Result<UniqueId> {
        let id = self.require(item)?;
        if !self.nodes[&id].item.is_directory() {
            bail!("not a directory: {}", describe(item));
        }
        Ok(id)
    }

    /// Descendants of `id`, parents before children
    fn subtree(&self, id: &UniqueId) -> Vec<UniqueId> {
        let mut out = vec![id.clone()];
        let mut idx = 0;
        while idx < out.len() {
            let current = out[idx].clone();
            out.extend(self.children(&current).map(|n| n.item.unique_id.clone()));
            idx += 1;
        }
        out
    }

    fn upsert_file(
        &mut self,
        parent: &UniqueId,
        name: &str,
        content: Vec<u8>,
        modified: DateTime<Utc>,
    ) -> Result<RawItem> {
        treesync_core::domain::validate_name(name)?;
        let hashes = if self.report_hashes {
            let mut digests = StreamDigests::new();
            digests.update(&content);
            digests.finalize()
        } else {
            ContentHashes::default()
        };
        let existing = self
            .child_named(parent, name)
            .map(|n| (n.item.unique_id.clone(), n.item.kind, n.item.created));
        let item = match existing {
            Some((_, EntryKind::Directory, _)) => bail!("a directory named {name} exists"),
            Some((id, EntryKind::File, created)) => RawItem {
                unique_id: id,
                parent_id: Some(parent.clone()),
                name: name.to_string(),
                kind: EntryKind::File,
                size: content.len() as u64,
                hashes,
                created,
                modified,
                error: None,
            },
            None => RawItem {
                unique_id: self.allocate_id()?,
                parent_id: Some(parent.clone()),
                name: name.to_string(),
                kind: EntryKind::File,
                size: content.len() as u64,
                hashes,
                created: Some(modified),
                modified,
                error: None,
            },
        };
        self.nodes.insert(
            item.unique_id.clone(),
            Node {
                item: item.clone(),
                content,
            },
        );
        self.record(item.clone(), false);
        Ok(item)
    }

    fn create_directory(&mut self, parent: &UniqueId, name: &str) -> Result<RawItem> {
        treesync_core::domain::validate_name(name)?;
        if let Some(existing) = self.child_named(parent, name) {
            if existing.item.is_directory() {
                return Ok(existing.item.clone());
            }
            bail!("a file named {name} exists");
        }
        let now = Utc::now();
        let item = RawItem {
            unique_id: self.allocate_id()?,
            parent_id: Some(parent.clone()),
            name: name.to_string(),
            kind: EntryKind::Directory,
            size: 0,
            hashes: ContentHashes::default(),
            created: Some(now),
            modified: now,
            error: None,
        };
        self.nodes.insert(
            item.unique_id.clone(),
            Node {
                item: item.clone(),
                content: Vec::new(),
            },
        );
        self.record(item.clone(), false);
        Ok(item)
    }

    fn remove(&mut self, id: &UniqueId) -> Result<()> {
        if id == &self.root {
            bail!("cannot delete the root");
        }
        for removed in self.subtree(id) {
            if let Some(node) = self.nodes.remove(&removed) {
                self.record(node.item, true);
            }
        }
        Ok(())
    }

    fn update(&mut self, id: &UniqueId, update: &MetadataUpdate) -> Result<RawItem> {
        let new_parent = match &update.new_parent {
            Some(parent) => Some(self.require_directory(parent)?),
            None => None,
        };
        if let Some(parent) = &new_parent {
            if self.subtree(id).contains(parent) {
                bail!("cannot move an item below itself");
            }
        }
        let current = self
            .nodes
            .get(id)
            .map(|n| n.item.clone())
            .with_context(|| format!("item not found: {id}"))?;
        let parent = new_parent.or(current.parent_id.clone());
        let name = update.new_name.clone().unwrap_or(current.name.clone());
        if update.is_relocation() {
            treesync_core::domain::validate_name(&name)?;
            if let Some(parent) = &parent {
                if let Some(clash) = self.child_named(parent, &name) {
                    if &clash.item.unique_id != id {
                        bail!("an item named {name} already exists");
                    }
                }
            }
        }

        let node = self
            .nodes
            .get_mut(id)
            .with_context(|| format!("item not found: {id}"))?;
        node.item.parent_id = parent;
        node.item.name = name;
        if let Some(created) = update.created {
            node.item.created = Some(created);
        }
        if let Some(modified) = update.modified {
            node.item.modified = modified;
        }
        let item = node.item.clone();
        self.record(item.clone(), false);
        Ok(item)
    }

    fn live_items(&self) -> Vec<RawItem> {
        self.subtree(&self.root)
            .into_iter()
            .skip(1)
            .filter_map(|id| self.nodes.get(&id).map(|n| n.item.clone()))
            .collect()
    }
}

fn describe(item: &ItemRef) -> String {
    match &item.unique_id {
        Some(id) => format!("{} ({id})", item.path),
        None => item.path.to_string(),
    }
}

// ============================================================================
// MemoryAdapter
// ============================================================================

struct Shared {
    tree: Mutex<Tree>,
    subscribers: Mutex<Vec<mpsc::Sender<()>>>,
}

impl Shared {
    fn tree(&self) -> std::sync::MutexGuard<'_, Tree> {
        self.tree.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| !tx.is_closed());
        for tx in subscribers.iter() {
            // A full channel already carries a pending signal.
            let _ = tx.try_send(());
        }
    }
}

/// Storage adapter over an in-process tree with a change journal
pub struct MemoryAdapter {
    id: AdapterId,
    shared: Arc<Shared>,
    change_tracking: bool,
    resync_redirect: bool,
    committed: Mutex<Option<CursorToken>>,
}

impl MemoryAdapter {
    /// Empty tree with change tracking enabled and hashes reported
    ///
    /// # Errors
    /// Returns error if the root id cannot be built
    pub fn new(id: AdapterId) -> Result<Self> {
        Ok(Self {
            id,
            shared: Arc::new(Shared {
                tree: Mutex::new(Tree::new(true)?),
                subscribers: Mutex::new(Vec::new()),
            }),
            change_tracking: true,
            resync_redirect: true,
            committed: Mutex::new(None),
        })
    }

    /// Enable or disable the change-tracking capability
    #[must_use]
    pub fn with_change_tracking(mut self, enabled: bool) -> Self {
        self.change_tracking = enabled;
        self
    }

    /// Whether stale cursors are answered with a usable redirect
    #[must_use]
    pub fn with_resync_redirect(mut self, enabled: bool) -> Self {
        self.resync_redirect = enabled;
        self
    }

    /// Whether file items carry SHA-1/MD5 digests
    #[must_use]
    pub fn with_reported_hashes(self, enabled: bool) -> Self {
        self.shared.tree().report_hashes = enabled;
        self
    }

    // --- Direct manipulation, bypassing the engine ---

    /// Create a directory at `path`, creating missing parents
    ///
    /// # Errors
    /// Returns error if a file is in the way
    pub fn add_directory(&self, path: &str) -> Result<UniqueId> {
        let path = RelativePath::new(path.to_string())?;
        let mut tree = self.shared.tree();
        let mut current = tree.root.clone();
        for component in path.components() {
            current = tree.create_directory(&current, component)?.unique_id;
        }
        drop(tree);
        self.shared.notify();
        Ok(current)
    }

    /// Create or overwrite the file at `path`, creating missing parents
    ///
    /// # Errors
    /// Returns error if `path` is the root or a directory is in the way
    pub fn write_file(&self, path: &str, content: &[u8]) -> Result<UniqueId> {
        self.write_file_at(path, content, Utc::now())
    }

    /// Like [`Self::write_file`] with an explicit modification time
    ///
    /// # Errors
    /// Returns error if `path` is the root or a directory is in the way
    pub fn write_file_at(
        &self,
        path: &str,
        content: &[u8],
        modified: DateTime<Utc>,
    ) -> Result<UniqueId> {
        let path = RelativePath::new(path.to_string())?;
        let (parent_path, name) = match (path.parent(), path.file_name()) {
            (Some(parent), Some(name)) => (parent, name.to_string()),
            _ => bail!("cannot write the root"),
        };
        let parent = if parent_path.is_root() {
            self.shared.tree().root.clone()
        } else {
            self.add_directory(parent_path.as_str())?
        };
        let item = self
            .shared
            .tree()
            .upsert_file(&parent, &name, content.to_vec(), modified)?;
        self.shared.notify();
        Ok(item.unique_id)
    }

    /// Delete the item at `path` with its descendants
    ///
    /// # Errors
    /// Returns error if nothing exists at `path`
    pub fn remove(&self, path: &str) -> Result<()> {
        let item = ItemRef::new(None, RelativePath::new(path.to_string())?);
        {
            let mut tree = self.shared.tree();
            let id = tree.require(&item)?;
            tree.remove(&id)?;
        }
        self.shared.notify();
        Ok(())
    }

    /// Move and/or rename the item at `from` to `to`; the parent of `to` must exist
    ///
    /// # Errors
    /// Returns error if either path cannot be resolved
    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from = ItemRef::new(None, RelativePath::new(from.to_string())?);
        let to = RelativePath::new(to.to_string())?;
        let (parent, name) = match (to.parent(), to.file_name()) {
            (Some(parent), Some(name)) => (parent, name.to_string()),
            _ => bail!("cannot rename onto the root"),
        };
        {
            let mut tree = self.shared.tree();
            let id = tree.require(&from)?;
            let update = MetadataUpdate {
                new_parent: Some(ItemRef::new(None, parent)),
                new_name: Some(name),
                ..MetadataUpdate::default()
            };
            tree.update(&id, &update)?;
        }
        self.shared.notify();
        Ok(())
    }

    /// Give `id`, which must belong to a deleted item, to the next item created
    ///
    /// Mimics file systems that reuse inode numbers.
    ///
    /// # Errors
    /// Returns error if `id` is still in use
    pub fn recycle_id(&self, id: &UniqueId) -> Result<()> {
        let mut tree = self.shared.tree();
        if tree.nodes.contains_key(id) {
            bail!("id still in use: {id}");
        }
        tree.recycled = Some(id.clone());
        Ok(())
    }

    /// Flag the item at `path` as unreadable
    ///
    /// # Errors
    /// Returns error if nothing exists at `path`
    pub fn set_error(&self, path: &str, message: &str) -> Result<()> {
        let item = ItemRef::new(None, RelativePath::new(path.to_string())?);
        let mut tree = self.shared.tree();
        let id = tree.require(&item)?;
        if let Some(node) = tree.nodes.get_mut(&id) {
            node.item.error = Some(message.to_string());
            let reported = node.item.clone();
            tree.record(reported, false);
        }
        Ok(())
    }

    /// Content of the file at `path`
    pub fn read_file(&self, path: &str) -> Option<Vec<u8>> {
        let path = RelativePath::new(path.to_string()).ok()?;
        let tree = self.shared.tree();
        let id = tree.lookup_path(&path)?;
        let node = tree.nodes.get(id)?;
        (!node.item.is_directory()).then(|| node.content.clone())
    }

    /// Metadata of the item at `path`
    pub fn item_at(&self, path: &str) -> Option<RawItem> {
        let path = RelativePath::new(path.to_string()).ok()?;
        let tree = self.shared.tree();
        let id = tree.lookup_path(&path)?;
        tree.nodes.get(id).map(|n| n.item.clone())
    }

    /// Number of live items, the root excluded
    pub fn item_count(&self) -> usize {
        self.shared.tree().nodes.len() - 1
    }

    /// Forget the journal; tokens older than the current one become stale
    pub fn compact_journal(&self) {
        let mut tree = self.shared.tree();
        tree.journal.clear();
        tree.horizon = tree.seq;
    }

    /// Token most recently acknowledged through `commit_cursor`
    pub fn committed_cursor(&self) -> Option<CursorToken> {
        self.committed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn full_listing(&self) -> Result<ChangeTrackingCursor> {
        let tree = self.shared.tree();
        let changes = tree
            .live_items()
            .into_iter()
            .map(|item| RawChange {
                item,
                deleted: false,
            })
            .collect();
        Ok(ChangeTrackingCursor::new(
            CursorToken::new(tree.seq.to_string())?,
            changes,
        ))
    }
}

#[async_trait::async_trait]
impl IStorageAdapter for MemoryAdapter {
    fn id(&self) -> &AdapterId {
        &self.id
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Memory
    }

    async fn root(&self) -> Result<RawItem> {
        let tree = self.shared.tree();
        Ok(tree.nodes[&tree.root].item.clone())
    }

    async fn list_children(&self, item: &ItemRef) -> Result<Vec<RawItem>> {
        let tree = self.shared.tree();
        let id = tree.require_directory(item)?;
        let mut children: Vec<RawItem> = tree.children(&id).map(|n| n.item.clone()).collect();
        children.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(children)
    }

    async fn get_item(&self, item: &ItemRef) -> Result<Option<RawItem>> {
        let tree = self.shared.tree();
        Ok(tree
            .resolve(item)
            .and_then(|id| tree.nodes.get(&id).map(|n| n.item.clone())))
    }

    async fn open_read(&self, item: &ItemRef) -> Result<ReadStream> {
        let tree = self.shared.tree();
        let id = tree.require(item)?;
        let node = &tree.nodes[&id];
        if node.item.is_directory() {
            bail!("cannot read a directory: {}", describe(item));
        }
        if let Some(error) = &node.item.error {
            bail!("item is unreadable: {error}");
        }
        Ok(Box::new(std::io::Cursor::new(node.content.clone())))
    }

    async fn open_write(
        &self,
        parent: &ItemRef,
        name: &str,
        expected_len: u64,
    ) -> Result<Box<dyn WriteHandle>> {
        treesync_core::domain::validate_name(name)?;
        let parent = self.shared.tree().require_directory(parent)?;
        Ok(Box::new(MemoryWriteHandle {
            shared: Arc::clone(&self.shared),
            parent,
            name: name.to_string(),
            expected_len,
            buffer: Vec::with_capacity(usize::try_from(expected_len).unwrap_or(0)),
        }))
    }

    async fn create_directory(&self, parent: &ItemRef, name: &str) -> Result<RawItem> {
        let item = {
            let mut tree = self.shared.tree();
            let parent = tree.require_directory(parent)?;
            tree.create_directory(&parent, name)?
        };
        self.shared.notify();
        Ok(item)
    }

    async fn delete_item(&self, item: &ItemRef) -> Result<()> {
        {
            let mut tree = self.shared.tree();
            let Some(id) = tree.resolve(item) else {
                debug!(item = %describe(item), "Delete of missing item ignored");
                return Ok(());
            };
            tree.remove(&id)?;
        }
        self.shared.notify();
        Ok(())
    }

    async fn update_metadata(&self, item: &ItemRef, update: &MetadataUpdate) -> Result<RawItem> {
        let updated = {
            let mut tree = self.shared.tree();
            let id = tree.require(item)?;
            tree.update(&id, update)?
        };
        self.shared.notify();
        Ok(updated)
    }

    fn supports_change_tracking(&self) -> bool {
        self.change_tracking
    }

    async fn get_changes(&self, token: Option<&CursorToken>) -> Result<ChangeSet> {
        if !self.change_tracking {
            bail!("adapter {} does not support change tracking", self.id);
        }
        let Some(token) = token else {
            return Ok(ChangeSet::Delta(self.full_listing()?));
        };
        if token.as_str() == FULL_LISTING_TOKEN {
            return Ok(ChangeSet::Delta(self.full_listing()?));
        }

        let since: u64 = token
            .as_str()
            .parse()
            .with_context(|| format!("malformed cursor token {token}"))?;
        let tree = self.shared.tree();
        if since < tree.horizon || since > tree.seq {
            let redirect = if self.resync_redirect {
                Some(CursorToken::new(FULL_LISTING_TOKEN.to_string())?)
            } else {
                None
            };
            return Ok(ChangeSet::ResyncRequired { redirect });
        }
        let changes = tree
            .journal
            .iter()
            .filter(|(seq, _)| *seq > since)
            .map(|(_, change)| change.clone())
            .collect();
        Ok(ChangeSet::Delta(ChangeTrackingCursor::new(
            CursorToken::new(tree.seq.to_string())?,
            changes,
        )))
    }

    async fn commit_cursor(&self, token: &CursorToken) -> Result<()> {
        *self.committed.lock().unwrap_or_else(PoisonError::into_inner) = Some(token.clone());
        Ok(())
    }

    async fn subscribe_changes(&self) -> Result<Option<mpsc::Receiver<()>>> {
        let (tx, rx) = mpsc::channel(1);
        self.shared
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        Ok(Some(rx))
    }
}

// ============================================================================
// Write handle
// ============================================================================

/// Buffers written bytes and publishes them on commit
struct MemoryWriteHandle {
    shared: Arc<Shared>,
    parent: UniqueId,
    name: String,
    expected_len: u64,
    buffer: Vec<u8>,
}

impl AsyncWrite for MemoryWriteHandle {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.get_mut().buffer.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[async_trait::async_trait]
impl WriteHandle for MemoryWriteHandle {
    async fn commit(self: Box<Self>) -> Result<RawItem> {
        let this = *self;
        if this.buffer.len() as u64 != this.expected_len {
            bail!(
                "wrote {} bytes to {}, expected {}",
                this.buffer.len(),
                this.name,
                this.expected_len
            );
        }
        let item = {
            let mut tree = this.shared.tree();
            if !tree.nodes.contains_key(&this.parent) {
                bail!("parent of {} disappeared", this.name);
            }
            tree.upsert_file(&this.parent, &this.name, this.buffer, Utc::now())?
        };
        this.shared.notify();
        Ok(item)
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn adapter() -> MemoryAdapter {
        MemoryAdapter::new(AdapterId::new("memory".to_string()).unwrap()).unwrap()
    }

    fn at(path: &str) -> ItemRef {
        ItemRef::new(None, RelativePath::new(path.to_string()).unwrap())
    }

    fn delta(set: ChangeSet) -> ChangeTrackingCursor {
        match set {
            ChangeSet::Delta(cursor) => cursor,
            ChangeSet::ResyncRequired { .. } => panic!("unexpected resync"),
        }
    }

    #[tokio::test]
    async fn test_write_and_read_back() {
        let mem = adapter();
        mem.write_file("docs/readme.txt", b"hello").unwrap();

        let item = mem.item_at("docs/readme.txt").unwrap();
        assert_eq!(item.size, 5);
        assert!(item.hashes.sha1.is_some());

        let mut content = Vec::new();
        mem.open_read(&at("docs/readme.txt"))
            .await
            .unwrap()
            .read_to_end(&mut content)
            .await
            .unwrap();
        assert_eq!(content, b"hello");

        let children = mem.list_children(&ItemRef::root(None)).await.unwrap();
        assert_eq!(children.len(), 1);
        assert!(children[0].is_directory());
    }

    #[tokio::test]
    async fn test_write_handle_commit_and_length_check() {
        let mem = adapter();
        let mut handle = mem.open_write(&ItemRef::root(None), "a.bin", 3).await.unwrap();
        handle.write_all(b"abc").await.unwrap();
        let item = handle.commit().await.unwrap();
        assert_eq!(item.size, 3);
        assert_eq!(mem.read_file("a.bin").unwrap(), b"abc");

        let mut short = mem.open_write(&ItemRef::root(None), "b.bin", 10).await.unwrap();
        short.write_all(b"abc").await.unwrap();
        assert!(short.commit().await.is_err());
        assert!(mem.item_at("b.bin").is_none());
    }

    #[tokio::test]
    async fn test_overwrite_keeps_unique_id() {
        let mem = adapter();
        let first = mem.write_file("f", b"one").unwrap();
        let second = mem.write_file("f", b"two!").unwrap();
        assert_eq!(first, second);
        assert_eq!(mem.item_at("f").unwrap().size, 4);
    }

    #[tokio::test]
    async fn test_recycled_id_goes_to_next_item() {
        let mem = adapter();
        let old = mem.write_file("old.txt", b"x").unwrap();
        assert!(mem.recycle_id(&old).is_err());

        mem.remove("old.txt").unwrap();
        mem.recycle_id(&old).unwrap();
        assert_eq!(mem.add_directory("photos").unwrap(), old);
        assert_ne!(mem.write_file("next.txt", b"y").unwrap(), old);
    }

    #[tokio::test]
    async fn test_delete_missing_is_ok_and_recursive() {
        let mem = adapter();
        mem.write_file("a/b/c.txt", b"x").unwrap();
        mem.delete_item(&at("a")).await.unwrap();
        assert_eq!(mem.item_count(), 0);
        mem.delete_item(&at("a")).await.unwrap();
    }

    #[tokio::test]
    async fn test_rename_by_unique_id() {
        let mem = adapter();
        let id = mem.write_file("a.txt", b"x").unwrap();
        mem.add_directory("sub").unwrap();
        let item = ItemRef::new(Some(id.clone()), RelativePath::root());
        let update = MetadataUpdate {
            new_parent: Some(at("sub")),
            new_name: Some("b.txt".to_string()),
            ..MetadataUpdate::default()
        };
        let moved = mem.update_metadata(&item, &update).await.unwrap();
        assert_eq!(moved.unique_id, id);
        assert!(mem.item_at("sub/b.txt").is_some());
        assert!(mem.item_at("a.txt").is_none());
    }

    #[tokio::test]
    async fn test_move_below_itself_rejected() {
        let mem = adapter();
        mem.add_directory("a/b").unwrap();
        assert!(mem.rename("a", "a/b/a").is_err());
    }

    #[tokio::test]
    async fn test_change_feed_and_tokens() {
        let mem = adapter();
        mem.write_file("a.txt", b"1").unwrap();
        let initial = delta(mem.get_changes(None).await.unwrap());
        assert_eq!(initial.changes.len(), 1);

        mem.write_file("b.txt", b"2").unwrap();
        mem.remove("a.txt").unwrap();
        let next = delta(mem.get_changes(Some(&initial.token)).await.unwrap());
        assert_eq!(next.changes.len(), 2);
        assert!(next.changes[1].deleted);

        let empty = delta(mem.get_changes(Some(&next.token)).await.unwrap());
        assert!(empty.changes.is_empty());
    }

    #[tokio::test]
    async fn test_stale_token_redirects_to_full_listing() {
        let mem = adapter();
        mem.write_file("a.txt", b"1").unwrap();
        let first = delta(mem.get_changes(None).await.unwrap());
        mem.write_file("b.txt", b"2").unwrap();
        mem.compact_journal();

        let redirect = match mem.get_changes(Some(&first.token)).await.unwrap() {
            ChangeSet::ResyncRequired { redirect } => redirect.unwrap(),
            ChangeSet::Delta(_) => panic!("expected resync"),
        };
        let listing = delta(mem.get_changes(Some(&redirect)).await.unwrap());
        assert_eq!(listing.changes.len(), 2);
    }

    #[tokio::test]
    async fn test_stale_token_without_redirect() {
        let mem = adapter().with_resync_redirect(false);
        let first = delta(mem.get_changes(None).await.unwrap());
        mem.write_file("a.txt", b"1").unwrap();
        mem.compact_journal();
        assert!(matches!(
            mem.get_changes(Some(&first.token)).await.unwrap(),
            ChangeSet::ResyncRequired { redirect: None }
        ));
    }

    #[tokio::test]
    async fn test_subscribers_are_signalled() {
        let mem = adapter();
        let mut rx = mem.subscribe_changes().await.unwrap().unwrap();
        mem.write_file("a", b"1").unwrap();
        mem.write_file("b", b"2").unwrap();
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_error_marked_item_cannot_be_read() {
        let mem = adapter();
        mem.write_file("locked", b"1").unwrap();
        mem.set_error("locked", "permission denied").unwrap();
        assert!(mem.item_at("locked").unwrap().has_error());
        assert!(mem.open_read(&at("locked")).await.is_err());
    }
}
