//! CLI subcommands and the wiring they share

pub mod config;
pub mod keys;
pub mod status;
pub mod sync;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;
use treesync_cache::{DatabasePool, SqliteEntryStore};
use treesync_core::config::{Config, EncryptionConfig, ThrottlingConfig};
use treesync_core::domain::AdapterId;
use treesync_sync::{Direction, EngineSettings, LocalFileSystemAdapter, SyncEngine};
use treesync_transfer::{KeySource, PemKeySource, ThrottlingManager};

use crate::output::OutputFormatter;

/// Adapter id of the configured source tree
pub const SOURCE_ID: &str = "source";
/// Adapter id of the configured destination tree
pub const DESTINATION_ID: &str = "destination";

pub fn adapter_id(name: &str) -> Result<AdapterId> {
    Ok(AdapterId::new(name.to_string())?)
}

/// Report validation errors; returns false when there were any
pub fn check_config(config: &Config, formatter: &dyn OutputFormatter) -> bool {
    let errors = config.validate();
    for e in &errors {
        formatter.error(&format!("{}: {}", e.field, e.message));
    }
    errors.is_empty()
}

/// Open the entry database, creating it and its directory if needed
pub async fn open_store(database: &Path) -> Result<Arc<SqliteEntryStore>> {
    if let Some(parent) = database.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let pool = DatabasePool::new(database)
        .await
        .context("Failed to open database")?;
    Ok(Arc::new(SqliteEntryStore::new(pool.pool().clone())))
}

fn load_keys(config: &EncryptionConfig) -> Result<Option<Arc<dyn KeySource>>> {
    if !config.enabled {
        return Ok(None);
    }
    let public = config
        .public_key
        .as_deref()
        .context("encryption.public_key is not set")?;
    let keys = PemKeySource::load(public, config.private_key.as_deref())
        .context("Failed to load encryption keys")?;
    info!(thumbprint = %keys.thumbprint_hex(), "Loaded encryption keys");
    let keys: Arc<dyn KeySource> = Arc::new(keys);
    Ok(Some(keys))
}

fn throttle(config: &ThrottlingConfig) -> Option<Arc<ThrottlingManager>> {
    config.enabled.then(|| {
        Arc::new(ThrottlingManager::with_settings(
            config.bytes_per_second,
            Duration::from_millis(config.tick_ms),
            config.bytes_per_second.saturating_mul(config.burst_multiplier),
        ))
    })
}

/// Wire adapters, store, keys and throttling into an engine
pub async fn build_engine(config: &Config, direction: Direction) -> Result<SyncEngine> {
    let source_root = &config.sync.source;
    let destination_root = &config.sync.destination;
    anyhow::ensure!(
        source_root.is_dir(),
        "source {} is not a directory",
        source_root.display()
    );
    tokio::fs::create_dir_all(destination_root)
        .await
        .with_context(|| format!("Failed to create {}", destination_root.display()))?;

    let store = open_store(&config.sync.database).await?;
    let source = Arc::new(LocalFileSystemAdapter::new(adapter_id(SOURCE_ID)?, source_root));
    let destination = Arc::new(LocalFileSystemAdapter::new(
        adapter_id(DESTINATION_ID)?,
        destination_root,
    ));

    let mut engine = SyncEngine::new(source, destination, store, EngineSettings::from_config(config))
        .with_direction(direction);
    if let Some(keys) = load_keys(&config.encryption)? {
        engine = engine.with_keys(keys);
    }
    if let Some(throttle) = throttle(&config.throttling) {
        engine = engine.with_throttle(throttle);
    }
    Ok(engine)
}

#[cfg(test)]
mod tests {
    use super::*;
    use treesync_core::config::ConfigBuilder;

    #[test]
    fn test_throttle_disabled_by_default() {
        assert!(throttle(&ThrottlingConfig::default()).is_none());
    }

    #[tokio::test]
    async fn test_throttle_capacity_uses_burst() {
        let config = ThrottlingConfig {
            enabled: true,
            bytes_per_second: 1000,
            burst_multiplier: 3,
            tick_ms: 100,
        };
        let manager = throttle(&config).unwrap();
        assert_eq!(manager.tokens_per_second(), 1000);
        assert_eq!(manager.capacity(), 3000);
    }

    #[test]
    fn test_keys_not_loaded_when_disabled() {
        assert!(load_keys(&EncryptionConfig::default()).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_build_engine_rejects_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigBuilder::new()
            .source(dir.path().join("missing"))
            .destination(dir.path().join("out"))
            .database(dir.path().join("db.sqlite"))
            .build();
        assert!(build_engine(&config, Direction::Backup).await.is_err());
    }

    #[tokio::test]
    async fn test_build_engine_creates_destination_and_database() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        let config = ConfigBuilder::new()
            .source(dir.path().join("src"))
            .destination(dir.path().join("out"))
            .database(dir.path().join("state/db.sqlite"))
            .build();

        build_engine(&config, Direction::Backup).await.unwrap();
        assert!(dir.path().join("out").is_dir());
        assert!(dir.path().join("state/db.sqlite").exists());
    }
}
