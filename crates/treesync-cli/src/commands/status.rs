//! Status command - Summarize the entry database
//!
//! Shows the number of tracked files and directories, tombstones, entries
//! waiting for synchronization, and the change-tracking cursor stored for
//! each adapter.

use std::path::Path;

use anyhow::{Context, Result};
use clap::Args;
use tracing::info;
use treesync_core::config::Config;
use treesync_core::ports::IEntryStore;

use super::{adapter_id, open_store, DESTINATION_ID, SOURCE_ID};
use crate::output::{get_formatter, OutputFormat};

#[derive(Debug, Args)]
pub struct StatusCommand {}

impl StatusCommand {
    pub async fn execute(&self, config_path: &Path, format: OutputFormat) -> Result<()> {
        let formatter = get_formatter(format);
        let config = Config::load_or_default(config_path);
        let database = &config.sync.database;

        if !database.exists() {
            formatter.error("No database found. Run 'treesync sync' first.");
            return Ok(());
        }
        info!(database = %database.display(), "Reading status");

        let store = open_store(database).await?;
        let counts = store
            .count_entries()
            .await
            .context("Failed to count entries")?;
        let mut cursors = Vec::new();
        for name in [SOURCE_ID, DESTINATION_ID] {
            let token = store
                .get_cursor(&adapter_id(name)?)
                .await
                .context("Failed to read cursor")?;
            cursors.push((name, token));
        }

        if matches!(format, OutputFormat::Json) {
            let cursors: serde_json::Map<String, serde_json::Value> = cursors
                .iter()
                .map(|(name, token)| {
                    (
                        (*name).to_string(),
                        serde_json::json!(token.as_ref().map(|t| t.as_str())),
                    )
                })
                .collect();
            let json = serde_json::json!({
                "source": config.sync.source.display().to_string(),
                "destination": config.sync.destination.display().to_string(),
                "database": database.display().to_string(),
                "files": counts.files,
                "directories": counts.directories,
                "deleted": counts.deleted,
                "not_synchronized": counts.not_synchronized,
                "cursors": cursors,
            });
            formatter.print_json(&json);
            return Ok(());
        }

        formatter.success(&format!(
            "{} -> {}",
            config.sync.source.display(),
            config.sync.destination.display()
        ));
        formatter.info(&format!("Files:            {}", counts.files));
        formatter.info(&format!("Directories:      {}", counts.directories));
        formatter.info(&format!("Deleted:          {}", counts.deleted));
        if counts.not_synchronized > 0 {
            formatter.warn(&format!(
                "{} entries not synchronized yet",
                counts.not_synchronized
            ));
        }
        for (name, token) in &cursors {
            let shown = token.as_ref().map_or("(none)", |t| t.as_str());
            formatter.info(&format!("Cursor {:<10} {}", format!("{name}:"), shown));
        }
        Ok(())
    }
}
