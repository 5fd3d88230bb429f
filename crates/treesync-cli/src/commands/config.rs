//! Config command - View and manage treesync configuration
//!
//! Provides the `treesync config` CLI command which:
//! 1. Shows the effective configuration (YAML or JSON)
//! 2. Validates the configuration file and reports every error
//! 3. Writes a default configuration file

use std::path::Path;

use anyhow::{Context, Result};
use clap::Subcommand;
use tracing::info;
use treesync_core::config::Config;

use crate::output::{get_formatter, OutputFormat};

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Display current configuration
    Show,
    /// Validate configuration file
    Validate,
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

impl ConfigCommand {
    pub async fn execute(&self, config_path: &Path, format: OutputFormat) -> Result<()> {
        match self {
            ConfigCommand::Show => execute_show(config_path, format),
            ConfigCommand::Validate => execute_validate(config_path, format),
            ConfigCommand::Init { force } => execute_init(config_path, *force, format),
        }
    }
}

fn execute_show(config_path: &Path, format: OutputFormat) -> Result<()> {
    let formatter = get_formatter(format);
    let config = Config::load_or_default(config_path);

    info!(config_path = %config_path.display(), "Showing configuration");

    if matches!(format, OutputFormat::Json) {
        let json =
            serde_json::to_value(&config).context("Failed to serialize configuration to JSON")?;
        formatter.print_json(&json);
    } else {
        formatter.success(&format!("Configuration ({})", config_path.display()));
        formatter.info("");

        let yaml =
            serde_yaml::to_string(&config).context("Failed to serialize configuration to YAML")?;
        for line in yaml.lines() {
            formatter.info(line);
        }
    }
    Ok(())
}

fn execute_validate(config_path: &Path, format: OutputFormat) -> Result<()> {
    let formatter = get_formatter(format);

    // Load explicitly, a parse error must not fall back to defaults
    let config = match Config::load(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            let message = if config_path.exists() {
                format!("Failed to parse configuration: {}", e)
            } else {
                "Configuration file not found".to_string()
            };
            if matches!(format, OutputFormat::Json) {
                let json = serde_json::json!({
                    "valid": false,
                    "config_path": config_path.display().to_string(),
                    "errors": [message],
                });
                formatter.print_json(&json);
            } else {
                formatter.error(&message);
                formatter.info(&format!("File: {}", config_path.display()));
                if !config_path.exists() {
                    formatter.info("Run 'treesync config init' to create one.");
                }
            }
            return Ok(());
        }
    };

    info!(config_path = %config_path.display(), "Validating configuration");
    let errors = config.validate();

    if matches!(format, OutputFormat::Json) {
        let error_strings: Vec<String> = errors
            .iter()
            .map(|e| format!("{}: {}", e.field, e.message))
            .collect();
        let json = serde_json::json!({
            "valid": errors.is_empty(),
            "config_path": config_path.display().to_string(),
            "errors": error_strings,
        });
        formatter.print_json(&json);
    } else if errors.is_empty() {
        formatter.success("Configuration is valid");
        formatter.info(&format!("File: {}", config_path.display()));
    } else {
        formatter.error(&format!(
            "Configuration has {} error{}:",
            errors.len(),
            if errors.len() == 1 { "" } else { "s" }
        ));
        formatter.info(&format!("File: {}", config_path.display()));
        formatter.info("");
        for error in &errors {
            formatter.info(&format!("  {} - {}", error.field, error.message));
        }
    }
    Ok(())
}

fn execute_init(config_path: &Path, force: bool, format: OutputFormat) -> Result<()> {
    let formatter = get_formatter(format);

    if config_path.exists() && !force {
        formatter.error(&format!(
            "{} already exists, use --force to overwrite",
            config_path.display()
        ));
        return Ok(());
    }
    Config::default()
        .save(config_path)
        .context("Failed to write configuration file")?;
    info!(config_path = %config_path.display(), "Wrote default configuration");

    if matches!(format, OutputFormat::Json) {
        formatter.print_json(&serde_json::json!({
            "success": true,
            "config_path": config_path.display().to_string(),
        }));
    } else {
        formatter.success(&format!("Wrote {}", config_path.display()));
        formatter.info("Edit sync.source and sync.destination before the first sync.");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_writes_loadable_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.yaml");

        execute_init(&path, false, OutputFormat::Json).unwrap();
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.sync.worker_count, Config::default().sync.worker_count);
    }

    #[test]
    fn test_init_keeps_existing_file_without_force() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "sync:\n  worker_count: 9\n").unwrap();

        execute_init(&path, false, OutputFormat::Json).unwrap();
        assert_eq!(Config::load(&path).unwrap().sync.worker_count, 9);

        execute_init(&path, true, OutputFormat::Json).unwrap();
        assert_eq!(Config::load(&path).unwrap().sync.worker_count, 4);
    }
}
