//! Sync and analyze commands
//!
//! `treesync sync`:
//! 1. Loads configuration and applies command-line overrides
//! 2. Wires the local adapters, entry database, keys and throttling
//! 3. Runs one pass, or keeps running passes on change with `--watch`
//! 4. Prints a summary and optionally dumps Prometheus metrics
//!
//! `treesync analyze` runs an analysis-only pass and lists what would change.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use tracing::info;
use treesync_core::config::Config;
use treesync_core::domain::{PassMode, PassOutcome, ProgressEvent, SyncPass};
use treesync_sync::{Direction, SyncEngine};
use treesync_telemetry::MetricsRegistry;

use super::{build_engine, check_config};
use crate::output::{format_bytes, get_formatter, plural, OutputFormat, OutputFormatter};

/// Delay that lets a burst of filesystem events settle before a pass
const WATCH_DEBOUNCE: Duration = Duration::from_millis(500);

/// Overrides shared by `sync` and `analyze`
#[derive(Debug, Args)]
pub struct TreeArgs {
    /// Source directory (overrides sync.source)
    #[arg(long)]
    pub source: Option<PathBuf>,

    /// Destination directory (overrides sync.destination)
    #[arg(long)]
    pub destination: Option<PathBuf>,

    /// Analyze the destination and bring its changes back into the source
    #[arg(long)]
    pub restore: bool,
}

impl TreeArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(source) = &self.source {
            config.sync.source = source.clone();
        }
        if let Some(destination) = &self.destination {
            config.sync.destination = destination.clone();
        }
    }

    fn direction(&self) -> Direction {
        if self.restore {
            Direction::Restore
        } else {
            Direction::Backup
        }
    }
}

#[derive(Debug, Args)]
pub struct SyncCommand {
    #[command(flatten)]
    pub tree: TreeArgs,

    /// Show what would be done without making changes
    #[arg(long)]
    pub dry_run: bool,

    /// Keep running passes whenever the source changes, until Ctrl-C
    #[arg(long, conflicts_with = "dry_run")]
    pub watch: bool,

    /// Number of concurrent transfers (overrides sync.worker_count)
    #[arg(long)]
    pub workers: Option<usize>,

    /// Write Prometheus metrics to this file when done
    #[arg(long)]
    pub metrics: Option<PathBuf>,
}

impl SyncCommand {
    pub async fn execute(&self, config_path: &Path, format: OutputFormat) -> Result<()> {
        let formatter = get_formatter(format);

        let mut config = Config::load_or_default(config_path);
        self.tree.apply(&mut config);
        if let Some(workers) = self.workers {
            config.sync.worker_count = workers;
        }
        if !check_config(&config, formatter.as_ref()) {
            anyhow::bail!("invalid configuration");
        }
        info!(
            config_path = %config_path.display(),
            source = %config.sync.source.display(),
            destination = %config.sync.destination.display(),
            "Loaded configuration"
        );

        if self.dry_run {
            formatter.info("Dry run mode - no changes will be made");
            let engine = build_engine(&config, self.tree.direction()).await?;
            let pass = engine.run_pass(PassMode::AnalyzeOnly).await?;
            print_analysis(&pass, format, formatter.as_ref())?;
            return Ok(());
        }

        let metrics = Arc::new(MetricsRegistry::new()?);
        let engine = build_engine(&config, self.tree.direction())
            .await?
            .with_metrics(metrics.clone());
        cancel_on_ctrl_c(&engine);
        if format == OutputFormat::Human {
            show_progress(&engine);
        }

        let mut failed = false;
        if self.watch {
            formatter.info("Watching for changes, press Ctrl-C to stop");
            engine
                .watch(WATCH_DEBOUNCE, |pass| {
                    failed |= pass.outcome() == Some(PassOutcome::Error);
                    if let Err(e) = print_pass(pass, format, formatter.as_ref()) {
                        formatter.error(&e.to_string());
                    }
                })
                .await?;
        } else {
            formatter.info("Starting synchronization...");
            let pass = engine.run_pass(PassMode::Execute).await?;
            failed = pass.outcome() == Some(PassOutcome::Error);
            print_pass(&pass, format, formatter.as_ref())?;
        }

        if let Some(path) = &self.metrics {
            std::fs::write(path, metrics.gather_text()?)
                .with_context(|| format!("Failed to write metrics to {}", path.display()))?;
        }
        if failed {
            anyhow::bail!("synchronization finished with errors");
        }
        Ok(())
    }
}

#[derive(Debug, Args)]
pub struct AnalyzeCommand {
    #[command(flatten)]
    pub tree: TreeArgs,
}

impl AnalyzeCommand {
    pub async fn execute(&self, config_path: &Path, format: OutputFormat) -> Result<()> {
        let formatter = get_formatter(format);
        let mut config = Config::load_or_default(config_path);
        self.tree.apply(&mut config);
        if !check_config(&config, formatter.as_ref()) {
            anyhow::bail!("invalid configuration");
        }

        let engine = build_engine(&config, self.tree.direction()).await?;
        let pass = engine.run_pass(PassMode::AnalyzeOnly).await?;
        print_analysis(&pass, format, formatter.as_ref())
    }
}

// ============================================================================
// Wiring helpers
// ============================================================================

fn cancel_on_ctrl_c(engine: &SyncEngine) {
    let cancel = engine.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, cancelling");
            cancel.cancel();
        }
    });
}

/// Print one line per completed item while a pass runs
fn show_progress(engine: &SyncEngine) {
    let mut events = engine.subscribe();
    let formatter = get_formatter(OutputFormat::Human);
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let ProgressEvent::ItemCompleted {
                path, succeeded, ..
            } = event
            {
                if succeeded {
                    formatter.change(&path.to_string(), "done");
                } else {
                    formatter.change(&path.to_string(), "failed");
                }
            }
        }
    });
}

// ============================================================================
// Rendering
// ============================================================================

fn print_pass(pass: &SyncPass, format: OutputFormat, formatter: &dyn OutputFormatter) -> Result<()> {
    if format == OutputFormat::Json {
        let json = serde_json::to_value(pass).context("Failed to serialize pass")?;
        formatter.print_json(&json);
        return Ok(());
    }

    let duration_ms = pass.duration().num_milliseconds().max(0);
    let duration_display = if duration_ms >= 1000 {
        format!("{:.1}s", duration_ms as f64 / 1000.0)
    } else {
        format!("{}ms", duration_ms)
    };

    match pass.outcome() {
        Some(PassOutcome::NotRun) => formatter.success("Already up to date"),
        Some(PassOutcome::Success) => {
            formatter.success(&format!("Sync completed in {}", duration_display))
        }
        Some(PassOutcome::Warning) => {
            formatter.warn(&format!("Sync completed with warnings in {}", duration_display))
        }
        Some(PassOutcome::Cancelled) => formatter.warn("Sync cancelled"),
        Some(PassOutcome::Error) | None => formatter.error("Sync finished with errors"),
    }

    let changes = pass.descriptors().len();
    if changes > 0 {
        formatter.info(&format!("Changes:     {}", changes));
        formatter.info(&format!(
            "Transferred: {} in {}",
            format_bytes(pass.bytes_transferred()),
            plural(pass.files_completed(), "file")
        ));
    }
    let skipped = pass.analysis().total_skipped();
    if skipped > 0 {
        formatter.info(&format!("Skipped:     {} (unreadable)", plural(skipped, "item")));
    }
    for result in &pass.analysis().results {
        if let Some(exception) = &result.exception {
            formatter.error(&format!("Analysis of {} failed: {}", result.adapter_id, exception));
        }
    }
    for d in pass.failed_descriptors() {
        formatter.error(&format!(
            "{}: {}",
            d.path(),
            d.error().unwrap_or("unknown error")
        ));
    }
    Ok(())
}

fn print_analysis(pass: &SyncPass, format: OutputFormat, formatter: &dyn OutputFormatter) -> Result<()> {
    let analysis = pass.analysis();
    if format == OutputFormat::Json {
        let json = serde_json::to_value(analysis).context("Failed to serialize analysis")?;
        formatter.print_json(&json);
        return Ok(());
    }

    for result in &analysis.results {
        if let Some(exception) = &result.exception {
            formatter.error(&format!("Analysis of {} failed: {}", result.adapter_id, exception));
            continue;
        }
        if result.is_up_to_date() {
            formatter.success("Already up to date");
            continue;
        }
        formatter.success(&format!(
            "{} pending",
            plural(result.descriptors.len() as u64, "change")
        ));
        for d in &result.descriptors {
            let flags: Vec<&str> = d.flags.iter().map(|f| f.name()).collect();
            formatter.change(&d.path().to_string(), &flags.join(","));
        }
    }
    formatter.info(&format!(
        "Unchanged: {}, skipped: {}",
        analysis.total_unchanged(),
        analysis.total_skipped()
    ));
    Ok(())
}
