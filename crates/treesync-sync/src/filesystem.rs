//! Local filesystem adapter (secondary/driven adapter)
//!
//! Implements [`IStorageAdapter`] over a directory using `tokio::fs`.
//!
//! ## Design Decisions
//!
//! - **Unique ids**: `{dev}:{ino}` on unix, so ids survive renames and moves
//!   within the tree but not delete + recreate.
//! - **Atomic writes**: content is staged in a hidden `.<name>.treesync-part`
//!   file next to the target and renamed over it on commit. Staging files are
//!   never listed.
//! - **No change tracking**: analysis walks the tree. Change notification is
//!   available through a recursive `notify` watcher.
//! - **No cheap hashes**: items are reported without digests.
//! - **Symlinks** are reported with an error marker and therefore skipped.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};
use std::task::{Context, Poll};

use anyhow::{bail, Context as _, Result};
use chrono::{DateTime, Utc};
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};
use treesync_core::domain::{
    AdapterId, ContentHashes, EntryKind, ItemRef, RawItem, RelativePath, UniqueId,
};
use treesync_core::ports::{AdapterKind, IStorageAdapter, MetadataUpdate, ReadStream, WriteHandle};

use crate::watcher::ChangeWatcher;

const STAGING_SUFFIX: &str = ".treesync-part";

/// Whether `path` names a staging file written by this adapter
pub(crate) fn is_staging_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.') && n.ends_with(STAGING_SUFFIX))
}

fn staging_name(name: &str) -> String {
    format!(".{name}{STAGING_SUFFIX}")
}

// ============================================================================
// LocalFileSystemAdapter
// ============================================================================

/// Adapter that bridges the [`IStorageAdapter`] port to a local directory
pub struct LocalFileSystemAdapter {
    id: AdapterId,
    root: PathBuf,
    watchers: Mutex<Vec<ChangeWatcher>>,
}

impl std::fmt::Debug for LocalFileSystemAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalFileSystemAdapter")
            .field("id", &self.id)
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl LocalFileSystemAdapter {
    /// Create an adapter rooted at `root`
    #[must_use]
    pub fn new(id: AdapterId, root: impl Into<PathBuf>) -> Self {
        Self {
            id,
            root: root.into(),
            watchers: Mutex::new(Vec::new()),
        }
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    /// Absolute path of a relative path under the root
    pub fn absolute(&self, path: &RelativePath) -> PathBuf {
        path.components()
            .fold(self.root.clone(), |acc, component| acc.join(component))
    }

    async fn unique_id_of(&self, path: &Path) -> Result<UniqueId> {
        let metadata = tokio::fs::symlink_metadata(path)
            .await
            .with_context(|| format!("Failed to stat {}", path.display()))?;
        unique_id(path, &metadata)
    }

    async fn parent_id_of(&self, path: &RelativePath) -> Result<Option<UniqueId>> {
        match path.parent() {
            Some(parent) => Ok(Some(self.unique_id_of(&self.absolute(&parent)).await?)),
            None => Ok(None),
        }
    }

    async fn item_at(&self, path: &RelativePath) -> Result<RawItem> {
        let absolute = self.absolute(path);
        let metadata = tokio::fs::symlink_metadata(&absolute)
            .await
            .with_context(|| format!("Failed to stat {}", absolute.display()))?;
        let parent_id = self.parent_id_of(path).await?;
        let name = path.file_name().unwrap_or_default().to_string();
        raw_item(&absolute, &metadata, name, parent_id)
    }
}

/// Device and inode of a file, stable across renames
#[cfg(unix)]
fn unique_id(_path: &Path, metadata: &std::fs::Metadata) -> Result<UniqueId> {
    use std::os::unix::fs::MetadataExt;
    Ok(UniqueId::new(format!("{}:{}", metadata.dev(), metadata.ino()))?)
}

/// Without inode numbers the absolute path is the best available id
#[cfg(not(unix))]
fn unique_id(path: &Path, _metadata: &std::fs::Metadata) -> Result<UniqueId> {
    Ok(UniqueId::new(path.display().to_string())?)
}

fn to_utc(time: std::io::Result<std::time::SystemTime>) -> Option<DateTime<Utc>> {
    time.ok().map(DateTime::<Utc>::from)
}

fn raw_item(
    path: &Path,
    metadata: &std::fs::Metadata,
    name: String,
    parent_id: Option<UniqueId>,
) -> Result<RawItem> {
    let file_type = metadata.file_type();
    let kind = if file_type.is_dir() {
        EntryKind::Directory
    } else {
        EntryKind::File
    };
    let error = if file_type.is_symlink() {
        Some("symbolic links are not synchronized".to_string())
    } else if !file_type.is_dir() && !file_type.is_file() {
        Some("special files are not synchronized".to_string())
    } else {
        None
    };
    let modified = to_utc(metadata.modified()).unwrap_or_else(Utc::now);
    Ok(RawItem {
        unique_id: unique_id(path, metadata)?,
        parent_id,
        name,
        kind,
        size: if kind == EntryKind::Directory {
            0
        } else {
            metadata.len()
        },
        hashes: ContentHashes::default(),
        created: to_utc(metadata.created()),
        modified,
        error,
    })
}

/// Set the modification time of `path`; creation times cannot be set portably
async fn set_modified(path: &Path, modified: DateTime<Utc>) -> Result<()> {
    let path = path.to_path_buf();
    let time = std::time::SystemTime::from(modified);
    tokio::task::spawn_blocking(move || -> Result<()> {
        let file = std::fs::File::open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        file.set_modified(time)
            .with_context(|| format!("Failed to set mtime of {}", path.display()))?;
        Ok(())
    })
    .await?
}

#[async_trait::async_trait]
impl IStorageAdapter for LocalFileSystemAdapter {
    fn id(&self) -> &AdapterId {
        &self.id
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Filesystem
    }

    async fn root(&self) -> Result<RawItem> {
        let metadata = tokio::fs::metadata(&self.root)
            .await
            .with_context(|| format!("Sync root {} is not accessible", self.root.display()))?;
        if !metadata.is_dir() {
            bail!("Sync root {} is not a directory", self.root.display());
        }
        raw_item(&self.root, &metadata, String::new(), None)
    }

    #[instrument(skip(self), fields(adapter = %self.id, path = %item.path))]
    async fn list_children(&self, item: &ItemRef) -> Result<Vec<RawItem>> {
        let dir = self.absolute(&item.path);
        let parent_id = self.unique_id_of(&dir).await?;
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .with_context(|| format!("Failed to list {}", dir.display()))?;

        let mut children = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if is_staging_file(&path) {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                warn!(path = %path.display(), "Skipping non UTF-8 file name");
                continue;
            };
            let metadata = match tokio::fs::symlink_metadata(&path).await {
                Ok(m) => m,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to stat {}", path.display()))
                }
            };
            children.push(raw_item(&path, &metadata, name, Some(parent_id.clone()))?);
        }
        children.sort_by(|a, b| a.name.cmp(&b.name));
        debug!(count = children.len(), "Listed children");
        Ok(children)
    }

    async fn get_item(&self, item: &ItemRef) -> Result<Option<RawItem>> {
        match self.item_at(&item.path).await {
            Ok(found) => Ok(Some(found)),
            Err(e)
                if e.downcast_ref::<std::io::Error>()
                    .is_some_and(|io| io.kind() == ErrorKind::NotFound) =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn open_read(&self, item: &ItemRef) -> Result<ReadStream> {
        let path = self.absolute(&item.path);
        let file = tokio::fs::File::open(&path)
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;
        Ok(Box::new(file))
    }

    #[instrument(skip(self), fields(adapter = %self.id, parent = %parent.path))]
    async fn open_write(
        &self,
        parent: &ItemRef,
        name: &str,
        expected_len: u64,
    ) -> Result<Box<dyn WriteHandle>> {
        treesync_core::domain::validate_name(name)?;
        let relative = parent.path.join(name)?;
        let dir = self.absolute(&parent.path);
        let staging = dir.join(staging_name(name));
        let file = tokio::fs::File::create(&staging)
            .await
            .with_context(|| format!("Failed to create {}", staging.display()))?;
        debug!(staging = %staging.display(), expected_len, "Staging write");
        Ok(Box::new(LocalWriteHandle {
            file,
            staging,
            target: self.absolute(&relative),
            name: name.to_string(),
            parent_id: self.unique_id_of(&dir).await?,
            expected_len,
            written: 0,
        }))
    }

    #[instrument(skip(self), fields(adapter = %self.id, parent = %parent.path))]
    async fn create_directory(&self, parent: &ItemRef, name: &str) -> Result<RawItem> {
        let relative = parent.path.join(name)?;
        let path = self.absolute(&relative);
        match tokio::fs::create_dir(&path).await {
            Ok(()) => debug!(path = %path.display(), "Directory created"),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                if !tokio::fs::metadata(&path).await?.is_dir() {
                    bail!("A file named {name} already exists in {}", parent.path);
                }
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to create {}", path.display()))
            }
        }
        self.item_at(&relative).await
    }

    #[instrument(skip(self), fields(adapter = %self.id, path = %item.path))]
    async fn delete_item(&self, item: &ItemRef) -> Result<()> {
        if item.path.is_root() {
            bail!("Refusing to delete the sync root");
        }
        let path = self.absolute(&item.path);
        let metadata = match tokio::fs::symlink_metadata(&path).await {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("Already gone");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        if metadata.is_dir() {
            debug!("Removing directory recursively");
            tokio::fs::remove_dir_all(&path).await?;
        } else {
            tokio::fs::remove_file(&path).await?;
        }
        Ok(())
    }

    #[instrument(skip(self, update), fields(adapter = %self.id, path = %item.path))]
    async fn update_metadata(&self, item: &ItemRef, update: &MetadataUpdate) -> Result<RawItem> {
        let mut relative = item.path.clone();
        if update.is_relocation() {
            let parent = match &update.new_parent {
                Some(parent) => parent.path.clone(),
                None => item.path.parent().unwrap_or_default(),
            };
            let name = match &update.new_name {
                Some(name) => name.clone(),
                None => item.path.file_name().unwrap_or_default().to_string(),
            };
            let target = parent.join(&name)?;
            if target != relative {
                let from = self.absolute(&relative);
                let to = self.absolute(&target);
                if tokio::fs::symlink_metadata(&to).await.is_ok() {
                    bail!("Cannot move {relative} to {target}: target exists");
                }
                tokio::fs::rename(&from, &to).await.with_context(|| {
                    format!("Failed to move {} to {}", from.display(), to.display())
                })?;
                debug!(from = %relative, to = %target, "Item relocated");
                relative = target;
            }
        }
        if let Some(modified) = update.modified {
            set_modified(&self.absolute(&relative), modified).await?;
        }
        if update.created.is_some() {
            debug!("Creation time left unchanged");
        }
        self.item_at(&relative).await
    }

    async fn subscribe_changes(&self) -> Result<Option<mpsc::Receiver<()>>> {
        let (watcher, rx) = ChangeWatcher::watch(&self.root)?;
        self.watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(watcher);
        Ok(Some(rx))
    }
}

// ============================================================================
// Write handle
// ============================================================================

/// Staged file, renamed over the target on commit
struct LocalWriteHandle {
    file: tokio::fs::File,
    staging: PathBuf,
    target: PathBuf,
    name: String,
    parent_id: UniqueId,
    expected_len: u64,
    written: u64,
}

impl AsyncWrite for LocalWriteHandle {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.file).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &poll {
            this.written += *n as u64;
        }
        poll
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().file).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().file).poll_shutdown(cx)
    }
}

#[async_trait::async_trait]
impl WriteHandle for LocalWriteHandle {
    async fn commit(self: Box<Self>) -> Result<RawItem> {
        let this = *self;
        if this.written != this.expected_len {
            let _ = tokio::fs::remove_file(&this.staging).await;
            bail!(
                "Wrote {} bytes to {}, expected {}",
                this.written,
                this.name,
                this.expected_len
            );
        }
        this.file.sync_all().await?;
        drop(this.file);

        if tokio::fs::symlink_metadata(&this.target)
            .await
            .is_ok_and(|m| m.is_dir())
        {
            let _ = tokio::fs::remove_file(&this.staging).await;
            bail!("A directory named {} already exists", this.name);
        }
        tokio::fs::rename(&this.staging, &this.target)
            .await
            .with_context(|| format!("Failed to publish {}", this.target.display()))?;

        let metadata = tokio::fs::symlink_metadata(&this.target).await?;
        raw_item(&this.target, &metadata, this.name, Some(this.parent_id))
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        let this = *self;
        drop(this.file);
        match tokio::fs::remove_file(&this.staging).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ============================================================================
// Unit tests
// ============================================================================
