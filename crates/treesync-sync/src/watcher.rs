//! Change notification for local trees
//!
//! Wraps the `notify` crate to watch a directory recursively and turns any
//! relevant OS event into a unit signal on an mpsc channel. The signal only
//! says that *something* changed; deciding what is the analyzer's job.
//!
//! ## Architecture
//!
//! ```text
//! inotify / kqueue / ReadDirectoryChangesW
//!       │
//!       ▼
//!  ChangeWatcher  ──→  mpsc::channel(1)  ──→  SyncEngine::watch
//! ```
//!
//! The channel holds a single pending signal, so bursts of events collapse
//! into one wake-up. Debouncing happens on the receiving side.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::filesystem::is_staging_file;

/// Recursive watch over one directory, alive for as long as this value is
pub struct ChangeWatcher {
    _watcher: RecommendedWatcher,
    root: PathBuf,
}

impl std::fmt::Debug for ChangeWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeWatcher")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl ChangeWatcher {
    /// Start watching `root` and everything below it
    ///
    /// # Errors
    /// Returns an error if the OS watcher cannot be created or the path
    /// cannot be watched (missing, permissions, watch limit reached)
    pub fn watch(root: &Path) -> Result<(Self, mpsc::Receiver<()>)> {
        let (tx, rx) = mpsc::channel::<()>(1);

        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    if is_relevant(&event) {
                        // Full means a signal is already pending.
                        let _ = tx.try_send(());
                    }
                }
                Err(err) => {
                    error!(error = %err, "File watcher error");
                }
            },
            notify::Config::default(),
        )
        .context("Failed to create file watcher")?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch path: {}", root.display()))?;
        info!(path = %root.display(), "Watching for changes");

        Ok((
            Self {
                _watcher: watcher,
                root: root.to_path_buf(),
            },
            rx,
        ))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Whether an event describes a change to synchronized content
fn is_relevant(event: &notify::Event) -> bool {
    match event.kind {
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) => {
            let relevant = event.paths.iter().any(|p| !is_staging_file(p));
            if !relevant {
                debug!(paths = ?event.paths, "Ignoring staging file event");
            }
            relevant
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind};
    use std::time::Duration;

    fn event(kind: EventKind, path: &str) -> notify::Event {
        notify::Event::new(kind).add_path(PathBuf::from(path))
    }

    #[test]
    fn test_access_events_ignored() {
        assert!(!is_relevant(&event(
            EventKind::Access(AccessKind::Any),
            "/tmp/a"
        )));
    }

    #[test]
    fn test_create_event_relevant() {
        assert!(is_relevant(&event(
            EventKind::Create(CreateKind::File),
            "/tmp/a"
        )));
    }

    #[test]
    fn test_staging_files_ignored() {
        assert!(!is_relevant(&event(
            EventKind::Create(CreateKind::File),
            "/tmp/.a.txt.treesync-part"
        )));
    }

    #[tokio::test]
    async fn test_watch_signals_on_create() {
        let dir = tempfile::tempdir().unwrap();
        let (watcher, mut rx) = ChangeWatcher::watch(dir.path()).unwrap();
        assert_eq!(watcher.root(), dir.path());

        tokio::fs::write(dir.path().join("new.txt"), b"x").await.unwrap();
        let signal = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await;
        assert!(matches!(signal, Ok(Some(()))));
    }

    #[test]
    fn test_watch_missing_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ChangeWatcher::watch(&dir.path().join("missing")).is_err());
    }
}
