//! Pass orchestration
//!
//! The [`SyncEngine`] runs one synchronization pass from a source adapter to
//! a destination adapter.
//!
//! ## Pass Flow
//!
//! 1. **Root**: make sure the root entry exists and is bound to both roots
//! 2. **Cursor**: fetch the source's delta from the stored cursor token,
//!    following a resync redirect once
//! 3. **Analysis**: [`ChangeAnalyzer`] over the delta, or a tree walk
//! 4. **Execution**: [`SyncExecutor`] unless the pass is analysis-only
//! 5. **Bookkeeping**: outcome, cursor commit, metrics, `Finished` event
//!
//! A [`Direction::Restore`] engine analyzes the destination instead and
//! applies its changes back to the source. With encryption keys set,
//! content is encrypted towards the destination and decrypted from it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use treesync_core::config::Config;
use treesync_core::domain::{
    AnalysisResult, AnalysisSummary, ChangeTrackingCursor, CursorToken, Entry, PassMode,
    PassOutcome, PassStage, ProgressEvent, SyncPass,
};
use treesync_core::ports::{ChangeSet, IEntryStore, IStorageAdapter};
use treesync_telemetry::MetricsRegistry;
use treesync_transfer::{KeySource, ThrottlingManager, ThroughputMeter, TransferPipeline, DEFAULT_CHUNK_SIZE};

use crate::analyzer::ChangeAnalyzer;
use crate::executor::{ExecutionReport, SyncExecutor};
use crate::retry::{with_retry, RetryPolicy};
use crate::{Result, SyncError};

/// Tunables of an engine, usually taken from [`Config`]
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub worker_count: usize,
    pub chunk_size: usize,
    pub check_if_sync_required: bool,
    pub retry: RetryPolicy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            worker_count: 4,
            chunk_size: DEFAULT_CHUNK_SIZE,
            check_if_sync_required: true,
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            worker_count: config.sync.worker_count.max(1),
            chunk_size: config.sync.chunk_size_kib.max(1) * 1024,
            check_if_sync_required: config.sync.check_if_sync_required,
            retry: RetryPolicy::from(&config.retry),
        }
    }
}

/// Which adapter a pass analyzes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Direction {
    /// Mirror the source onto the destination
    #[default]
    Backup,
    /// Bring destination changes back to the source
    Restore,
}

/// How the origin will be analyzed this pass
enum CursorPlan {
    /// No change tracking: walk the tree
    Walk,
    /// Process the delta
    Delta(ChangeTrackingCursor),
    /// The stored token was stale: walk the tree, then commit this token
    Resync(CursorToken),
}

/// One-way synchronization from `source` to `destination`
pub struct SyncEngine {
    source: Arc<dyn IStorageAdapter>,
    destination: Arc<dyn IStorageAdapter>,
    store: Arc<dyn IEntryStore>,
    settings: EngineSettings,
    direction: Direction,
    throttle: Option<Arc<ThrottlingManager>>,
    keys: Option<Arc<dyn KeySource>>,
    metrics: Option<Arc<MetricsRegistry>>,
    events: broadcast::Sender<ProgressEvent>,
    cancel: CancellationToken,
}

impl SyncEngine {
    pub fn new(
        source: Arc<dyn IStorageAdapter>,
        destination: Arc<dyn IStorageAdapter>,
        store: Arc<dyn IEntryStore>,
        settings: EngineSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            source,
            destination,
            store,
            settings,
            direction: Direction::Backup,
            throttle: None,
            keys: None,
            metrics: None,
            events,
            cancel: CancellationToken::new(),
        }
    }

    /// Backoff policy for transient adapter failures
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.settings.retry = retry;
        self
    }

    #[must_use]
    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    /// Limit transfer bandwidth with a shared token bucket
    #[must_use]
    pub fn with_throttle(mut self, throttle: Arc<ThrottlingManager>) -> Self {
        self.throttle = Some(throttle);
        self
    }

    /// Encrypt content on its way to the destination
    ///
    /// Disables the first-sync content comparison: plaintext and ciphertext
    /// never compare equal.
    #[must_use]
    pub fn with_keys(mut self, keys: Arc<dyn KeySource>) -> Self {
        self.keys = Some(keys);
        self
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Use an externally owned cancellation token
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Receive progress events of every later pass
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    /// Token that cancels the running pass and every later one
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn source(&self) -> &Arc<dyn IStorageAdapter> {
        &self.source
    }

    pub fn destination(&self) -> &Arc<dyn IStorageAdapter> {
        &self.destination
    }

    /// Adapter analyzed by a pass and the adapter its changes go to
    fn sides(&self) -> (&Arc<dyn IStorageAdapter>, &Arc<dyn IStorageAdapter>) {
        match self.direction {
            Direction::Backup => (&self.source, &self.destination),
            Direction::Restore => (&self.destination, &self.source),
        }
    }

    // ========================================================================
    // Pass
    // ========================================================================

    /// Run one pass
    ///
    /// Per-item failures end up in the pass; only failures that leave the
    /// engine unable to analyze at all (store unreachable, roots unreadable)
    /// are returned as errors.
    #[instrument(skip(self), fields(source = %self.source.id(), destination = %self.destination.id()))]
    pub async fn run_pass(&self, mode: PassMode) -> Result<SyncPass> {
        let mut pass = SyncPass::new(mode);
        info!(pass_id = %pass.id(), ?mode, direction = ?self.direction, "Starting pass");

        self.emit(ProgressEvent::StageChanged {
            stage: PassStage::Analyzing,
        });
        let root = self.ensure_root().await?;
        let result = self.analyze(&root).await;
        let cursor = result.cursor.clone();
        pass.set_analysis(AnalysisSummary::new(vec![result]));

        if mode == PassMode::AnalyzeOnly {
            pass.finish(PassOutcome::NotRun);
            self.emit(ProgressEvent::StageChanged {
                stage: PassStage::Finished,
            });
            info!(
                changes = pass.analysis().total_changes(),
                "Analysis-only pass finished"
            );
            return Ok(pass);
        }

        let descriptors: Vec<_> = pass
            .analysis()
            .results
            .iter()
            .flat_map(|r| r.descriptors.iter().cloned())
            .collect();
        let meter = Arc::new(ThroughputMeter::default());
        let report = if descriptors.is_empty() || self.cancel.is_cancelled() {
            ExecutionReport {
                descriptors,
                ..ExecutionReport::default()
            }
        } else {
            self.emit(ProgressEvent::StageChanged {
                stage: PassStage::Executing,
            });
            self.executor(meter.clone()).execute(descriptors).await
        };
        pass.record_execution(
            report.descriptors,
            report.bytes_transferred,
            report.files_completed,
        );

        let mut outcome = pass_outcome(&pass, self.cancel.is_cancelled());
        if outcome.allows_cursor_commit() {
            if let Some(token) = cursor {
                self.emit(ProgressEvent::StageChanged {
                    stage: PassStage::Committing,
                });
                if let Err(e) = self.commit_cursor(&token).await {
                    error!(error = %e, "Cursor commit failed, the delta will be replayed");
                    outcome = PassOutcome::Warning;
                }
            }
        } else if cursor.is_some() {
            debug!(%outcome, "Cursor not committed");
        }
        pass.finish(outcome);

        if let Some(metrics) = &self.metrics {
            metrics.record_pass(&pass);
            metrics.set_throughput(meter.bytes_per_second());
        }
        self.emit(ProgressEvent::StageChanged {
            stage: PassStage::Finished,
        });
        info!(
            pass_id = %pass.id(),
            %outcome,
            changes = pass.descriptors().len(),
            failed = pass.failed_descriptors().count(),
            bytes = pass.bytes_transferred(),
            files = pass.files_completed(),
            duration_ms = pass.duration().num_milliseconds(),
            "Pass finished"
        );
        Ok(pass)
    }

    /// Rerun passes whenever the analyzed adapter signals a change, until
    /// cancelled
    ///
    /// Signals arriving within `debounce` of each other start a single pass.
    pub async fn watch<F>(&self, debounce: Duration, mut on_pass: F) -> Result<()>
    where
        F: FnMut(&SyncPass),
    {
        let (origin, _) = self.sides();
        let Some(mut signals) = origin
            .subscribe_changes()
            .await
            .map_err(|e| SyncError::adapter(origin.id(), e))?
        else {
            return Err(SyncError::Adapter {
                adapter: origin.id().to_string(),
                message: "change notification is not supported".to_string(),
            });
        };
        info!(origin = %origin.id(), "Watching for changes");

        loop {
            let pass = self.run_pass(PassMode::Execute).await?;
            on_pass(&pass);

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                signal = signals.recv() => if signal.is_none() { break },
            }
            // Let a burst of changes settle
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(debounce) => break,
                    signal = signals.recv() => if signal.is_none() { break },
                }
            }
            debug!("Change signalled, starting pass");
        }
        info!("Watch stopped");
        Ok(())
    }

    // ========================================================================
    // Steps
    // ========================================================================

    /// Load or create the root entry and bind it to both adapters' roots
    async fn ensure_root(&self) -> Result<Entry> {
        let stored = self.store.get_root().await.map_err(SyncError::store)?;
        let is_new = stored.is_none();
        let mut root = stored.unwrap_or_else(Entry::root);

        let mut changed = is_new;
        for adapter in [&self.source, &self.destination] {
            let item = with_retry(&self.settings.retry, "root", &self.cancel, || {
                adapter.root()
            })
            .await
            .map_err(|e| SyncError::adapter(adapter.id(), e))?;
            if root.binding_for(adapter.id()) != Some(&item.unique_id) {
                root.set_binding(adapter.id().clone(), item.unique_id);
                changed = true;
            }
        }

        if is_new {
            self.store.insert_entry(&root).await.map_err(SyncError::store)?;
            info!(root = %root.id(), "Created root entry");
        } else if changed {
            self.store.update_entry(&root).await.map_err(SyncError::store)?;
            debug!(root = %root.id(), "Root bindings refreshed");
        }
        Ok(root)
    }

    /// Analyze the origin, turning cursor failures into an analysis exception
    async fn analyze(&self, root: &Entry) -> AnalysisResult {
        let analyzer = ChangeAnalyzer::new(self.store.clone(), self.source.id().clone())
            .with_check_if_sync_required(self.settings.check_if_sync_required && self.keys.is_none())
            .with_chunk_size(self.settings.chunk_size);
        let (origin, target) = self.sides();
        let (origin, target) = (origin.as_ref(), target.as_ref());

        match self.cursor_plan().await {
            Ok(CursorPlan::Walk) => analyzer.analyze(origin, target, root, None).await,
            Ok(CursorPlan::Delta(cursor)) => {
                analyzer.analyze(origin, target, root, Some(cursor)).await
            }
            Ok(CursorPlan::Resync(token)) => {
                let mut result = analyzer.analyze(origin, target, root, None).await;
                if result.exception.is_none() {
                    result.cursor = Some(token);
                }
                result
            }
            Err(e) => {
                warn!(error = %e, "Change tracking unavailable for this pass");
                AnalysisResult::failed(origin.id().clone(), e.to_string())
            }
        }
    }

    async fn cursor_plan(&self) -> Result<CursorPlan> {
        let (origin, _) = self.sides();
        if !origin.supports_change_tracking() {
            return Ok(CursorPlan::Walk);
        }
        let stored = self
            .store
            .get_cursor(origin.id())
            .await
            .map_err(SyncError::store)?;
        debug!(token = ?stored.as_ref().map(CursorToken::as_str), "Fetching changes");

        match self.get_changes(stored.as_ref()).await? {
            ChangeSet::Delta(cursor) => Ok(CursorPlan::Delta(cursor)),
            ChangeSet::ResyncRequired {
                redirect: Some(redirect),
            } => {
                warn!(redirect = %redirect, "Cursor is stale, resynchronizing");
                match self.get_changes(Some(&redirect)).await? {
                    ChangeSet::Delta(cursor) => Ok(CursorPlan::Resync(cursor.token)),
                    ChangeSet::ResyncRequired { .. } => Err(SyncError::CursorResync(format!(
                        "redirect {redirect} was rejected as stale"
                    ))),
                }
            }
            ChangeSet::ResyncRequired { redirect: None } => Err(SyncError::CursorResync(format!(
                "cursor for {} is stale and no redirect was offered",
                origin.id()
            ))),
        }
    }

    async fn get_changes(&self, token: Option<&CursorToken>) -> Result<ChangeSet> {
        let (origin, _) = self.sides();
        with_retry(&self.settings.retry, "get_changes", &self.cancel, || {
            origin.get_changes(token)
        })
        .await
        .map_err(|e| SyncError::adapter(origin.id(), e))
    }

    async fn commit_cursor(&self, token: &CursorToken) -> Result<()> {
        let (origin, _) = self.sides();
        with_retry(&self.settings.retry, "commit_cursor", &self.cancel, || {
            origin.commit_cursor(token)
        })
        .await
        .map_err(|e| SyncError::adapter(origin.id(), e))?;
        self.store
            .set_cursor(origin.id(), token)
            .await
            .map_err(SyncError::store)?;
        debug!(token = %token, "Cursor committed");
        Ok(())
    }

    fn executor(&self, meter: Arc<ThroughputMeter>) -> SyncExecutor {
        let mut pipeline = TransferPipeline::new(self.cancel.clone())
            .with_chunk_size(self.settings.chunk_size)
            .with_meter(meter.clone());
        if let Some(throttle) = &self.throttle {
            pipeline = pipeline.with_throttle(throttle.clone());
        }
        let executor = SyncExecutor::new(
            self.store.clone(),
            self.source.clone(),
            self.destination.clone(),
            pipeline,
            self.cancel.clone(),
        )
        .with_worker_count(self.settings.worker_count)
        .with_retry(self.settings.retry)
        .with_events(self.events.clone())
        .with_meter(meter);
        match &self.keys {
            Some(keys) => executor.with_keys(keys.clone()),
            None => executor,
        }
    }

    fn emit(&self, event: ProgressEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

/// Terminal outcome of an executed pass
fn pass_outcome(pass: &SyncPass, cancelled: bool) -> PassOutcome {
    let analysis = pass.analysis();
    let nothing_done = pass.descriptors().is_empty();
    if cancelled {
        PassOutcome::Cancelled
    } else if pass.failed_descriptors().next().is_some()
        || (analysis.has_exceptions() && nothing_done)
    {
        PassOutcome::Error
    } else if analysis.has_exceptions() || analysis.total_skipped() > 0 {
        PassOutcome::Warning
    } else if nothing_done {
        PassOutcome::NotRun
    } else {
        PassOutcome::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryAdapter;
    use treesync_cache::{DatabasePool, SqliteEntryStore};
    use treesync_core::domain::{AdapterId, ChangeDescriptor, ChangeFlag, ChangeFlags, EntryId, EntryKind};

    async fn engine(source: Arc<MemoryAdapter>, destination: Arc<MemoryAdapter>) -> SyncEngine {
        let pool = DatabasePool::in_memory().await.unwrap();
        let store = Arc::new(SqliteEntryStore::new(pool.pool().clone()));
        SyncEngine::new(
            source,
            destination,
            store,
            EngineSettings {
                retry: RetryPolicy::none(),
                ..EngineSettings::default()
            },
        )
    }

    fn adapter(name: &str) -> Arc<MemoryAdapter> {
        Arc::new(MemoryAdapter::new(AdapterId::new(name.to_string()).unwrap()).unwrap())
    }

    fn descriptor(name: &str) -> ChangeDescriptor {
        let now = chrono::Utc::now();
        let entry = Entry::new(EntryId::new(), name, EntryKind::File, 1, now, now).unwrap();
        ChangeDescriptor::new(
            entry,
            AdapterId::new("source".to_string()).unwrap(),
            ChangeFlags::single(ChangeFlag::NewFile),
        )
    }

    fn pass_with(results: Vec<AnalysisResult>, descriptors: Vec<ChangeDescriptor>) -> SyncPass {
        let mut pass = SyncPass::new(PassMode::Execute);
        pass.set_analysis(AnalysisSummary::new(results));
        pass.record_execution(descriptors, 0, 0);
        pass
    }

    fn source_id() -> AdapterId {
        AdapterId::new("source".to_string()).unwrap()
    }

    #[test]
    fn test_outcome_precedence() {
        let mut ok = descriptor("a");
        ok.mark_succeeded();
        let mut bad = descriptor("b");
        bad.mark_failed("boom");

        let clean = || vec![AnalysisResult::new(source_id())];
        assert_eq!(
            pass_outcome(&pass_with(clean(), vec![ok.clone()]), true),
            PassOutcome::Cancelled
        );
        assert_eq!(
            pass_outcome(&pass_with(clean(), vec![ok.clone(), bad]), false),
            PassOutcome::Error
        );
        assert_eq!(
            pass_outcome(&pass_with(clean(), vec![]), false),
            PassOutcome::NotRun
        );
        assert_eq!(
            pass_outcome(&pass_with(clean(), vec![ok.clone()]), false),
            PassOutcome::Success
        );

        let mut skipped = AnalysisResult::new(source_id());
        skipped.skipped = 1;
        assert_eq!(
            pass_outcome(&pass_with(vec![skipped], vec![ok.clone()]), false),
            PassOutcome::Warning
        );

        let failed = || vec![AnalysisResult::failed(source_id(), "cycle")];
        assert_eq!(
            pass_outcome(&pass_with(failed(), vec![]), false),
            PassOutcome::Error
        );
        assert_eq!(
            pass_outcome(&pass_with(failed(), vec![ok]), false),
            PassOutcome::Warning
        );
    }

    #[tokio::test]
    async fn test_root_created_once() {
        let engine = engine(adapter("source"), adapter("destination")).await;
        let first = engine.ensure_root().await.unwrap();
        let second = engine.ensure_root().await.unwrap();
        assert_eq!(first.id(), second.id());
        assert!(first.binding_for(engine.source().id()).is_some());
        assert!(first.binding_for(engine.destination().id()).is_some());
    }

    #[tokio::test]
    async fn test_analyze_only_changes_nothing() {
        let source = adapter("source");
        let destination = adapter("destination");
        source.write_file("a.txt", b"a").unwrap();
        let engine = engine(source.clone(), destination.clone()).await;

        let pass = engine.run_pass(PassMode::AnalyzeOnly).await.unwrap();
        assert_eq!(pass.outcome(), Some(PassOutcome::NotRun));
        assert_eq!(pass.analysis().total_changes(), 1);
        assert!(pass.descriptors().is_empty());
        assert_eq!(destination.item_count(), 0);
        assert!(source.committed_cursor().is_none());
        assert!(engine.store.get_cursor(source.id()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stage_events_in_order() {
        let source = adapter("source");
        source.write_file("a.txt", b"a").unwrap();
        let engine = engine(source, adapter("destination")).await;
        let mut rx = engine.subscribe();

        engine.run_pass(PassMode::Execute).await.unwrap();
        let mut stages = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ProgressEvent::StageChanged { stage } = event {
                stages.push(stage);
            }
        }
        assert_eq!(
            stages,
            [
                PassStage::Analyzing,
                PassStage::Executing,
                PassStage::Committing,
                PassStage::Finished
            ]
        );
    }

    #[tokio::test]
    async fn test_metrics_recorded() {
        let source = adapter("source");
        source.write_file("a.txt", b"abcd").unwrap();
        let metrics = Arc::new(MetricsRegistry::new().unwrap());
        let engine = engine(source, adapter("destination"))
            .await
            .with_metrics(metrics.clone());

        engine.run_pass(PassMode::Execute).await.unwrap();
        let text = metrics.gather_text().unwrap();
        assert!(text.contains("treesync_passes_total{outcome=\"success\"} 1"));
        assert!(text.contains("treesync_bytes_transferred_total 4"));
    }
}
