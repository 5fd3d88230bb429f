//! Configuration module for treesync.
//!
//! Provides typed configuration structs that map to the YAML configuration file,
//! with loading, validation, defaults, and a builder pattern for programmatic use.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration for treesync.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sync: SyncConfig,
    pub throttling: ThrottlingConfig,
    pub encryption: EncryptionConfig,
    pub retry: RetryConfig,
    pub logging: LoggingConfig,
}

/// Source/destination pair and execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Directory whose content is mirrored.
    pub source: PathBuf,
    /// Directory that receives the mirror.
    pub destination: PathBuf,
    /// SQLite database holding entries, bindings and cursors.
    pub database: PathBuf,
    /// Number of concurrent content transfers.
    pub worker_count: usize,
    /// Transfer chunk size in KiB.
    pub chunk_size_kib: usize,
    /// Skip copying files that already exist identically at the destination
    /// on the first pass.
    pub check_if_sync_required: bool,
}

/// Bandwidth throttling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottlingConfig {
    pub enabled: bool,
    /// Sustained write rate.
    pub bytes_per_second: u64,
    /// Bucket capacity as a multiple of `bytes_per_second`.
    pub burst_multiplier: u64,
    /// Refill cadence in milliseconds.
    pub tick_ms: u64,
}

/// End-to-end encryption settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    pub enabled: bool,
    /// PEM file with the recipient's RSA public key.
    pub public_key: Option<PathBuf>,
    /// PEM file with the RSA private key, needed to decrypt.
    pub private_key: Option<PathBuf>,
}

/// Retry policy for transient adapter failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

// ---------------------------------------------------------------------------
// Config::load()
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Write the configuration as YAML to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/treesync/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("treesync")
            .join("config.yaml")
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for SyncConfig {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"));
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("~/.local/share"))
            .join("treesync");
        Self {
            source: home.join("Documents"),
            destination: home.join("Backup"),
            database: data_dir.join("treesync.db"),
            worker_count: 4,
            chunk_size_kib: 64,
            check_if_sync_required: true,
        }
    }
}

impl Default for ThrottlingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bytes_per_second: 1024 * 1024,
            burst_multiplier: 3,
            tick_ms: 100,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Config::validate()
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"sync.worker_count"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Valid values for `logging.level`.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let mut push = |field: &str, message: String| {
            errors.push(ValidationError {
                field: field.into(),
                message,
            });
        };

        // --- sync ---
        if self.sync.source == self.sync.destination {
            push(
                "sync.destination",
                "must differ from sync.source".into(),
            );
        } else if self.sync.destination.starts_with(&self.sync.source) {
            push(
                "sync.destination",
                "must not be inside sync.source".into(),
            );
        }
        if self.sync.worker_count == 0 || self.sync.worker_count > 64 {
            push("sync.worker_count", "must be in range 1..=64".into());
        }
        if self.sync.chunk_size_kib == 0 {
            push("sync.chunk_size_kib", "must be greater than 0".into());
        }

        // --- throttling ---
        if self.throttling.tick_ms < 10 || self.throttling.tick_ms > 1000 {
            push("throttling.tick_ms", "must be in range 10..=1000".into());
        }
        if self.throttling.burst_multiplier == 0 {
            push("throttling.burst_multiplier", "must be greater than 0".into());
        }
        if self.throttling.enabled {
            // A tick must grant at least one token or the bucket never refills.
            let per_tick = self.throttling.bytes_per_second * self.throttling.tick_ms / 1000;
            if per_tick == 0 {
                push(
                    "throttling.bytes_per_second",
                    format!(
                        "too small to refill at least one token per {} ms tick",
                        self.throttling.tick_ms
                    ),
                );
            }
        }

        // --- encryption ---
        if self.encryption.enabled && self.encryption.public_key.is_none() {
            push(
                "encryption.public_key",
                "required when encryption is enabled".into(),
            );
        }
        // --- retry ---
        if self.retry.max_attempts == 0 {
            push("retry.max_attempts", "must be greater than 0".into());
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            push(
                "retry.base_delay_ms",
                format!(
                    "base_delay_ms ({}) must not exceed max_delay_ms ({})",
                    self.retry.base_delay_ms, self.retry.max_delay_ms
                ),
            );
        }

        // --- logging ---
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            push(
                "logging.level",
                format!(
                    "invalid level '{}'; valid options: {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            );
        }

        errors
    }
}

// ---------------------------------------------------------------------------
// ConfigBuilder
// ---------------------------------------------------------------------------

/// Builder for [`Config`], starting from defaults.
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Start from [`Config::default`].
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    // -- sync --

    pub fn source(mut self, path: PathBuf) -> Self {
        self.config.sync.source = path;
        self
    }

    pub fn destination(mut self, path: PathBuf) -> Self {
        self.config.sync.destination = path;
        self
    }

    pub fn database(mut self, path: PathBuf) -> Self {
        self.config.sync.database = path;
        self
    }

    pub fn worker_count(mut self, n: usize) -> Self {
        self.config.sync.worker_count = n;
        self
    }

    pub fn chunk_size_kib(mut self, kib: usize) -> Self {
        self.config.sync.chunk_size_kib = kib;
        self
    }

    pub fn check_if_sync_required(mut self, enabled: bool) -> Self {
        self.config.sync.check_if_sync_required = enabled;
        self
    }

    // -- throttling --

    pub fn throttle_bytes_per_second(mut self, rate: u64) -> Self {
        self.config.throttling.enabled = true;
        self.config.throttling.bytes_per_second = rate;
        self
    }

    pub fn throttle_tick_ms(mut self, ms: u64) -> Self {
        self.config.throttling.tick_ms = ms;
        self
    }

    // -- encryption --

    pub fn encryption_keys(mut self, public_key: PathBuf, private_key: Option<PathBuf>) -> Self {
        self.config.encryption.enabled = true;
        self.config.encryption.public_key = Some(public_key);
        self.config.encryption.private_key = private_key;
        self
    }

    // -- retry --

    pub fn retry_max_attempts(mut self, n: u32) -> Self {
        self.config.retry.max_attempts = n;
        self
    }

    pub fn retry_delays_ms(mut self, base: u64, max: u64) -> Self {
        self.config.retry.base_delay_ms = base;
        self.config.retry.max_delay_ms = max;
        self
    }

    // -- logging --

    pub fn logging_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn logging_json(mut self, json: bool) -> Self {
        self.config.logging.json = json;
        self
    }

    /// Consume the builder and return the config without validation.
    pub fn build(self) -> Config {
        self.config
    }

    /// Consume the builder and return the config if it validates.
    pub fn build_validated(self) -> Result<Config, Vec<ValidationError>> {
        let errors = self.config.validate();
        if errors.is_empty() {
            Ok(self.config)
        } else {
            Err(errors)
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    // -- Defaults --

    #[test]
    fn default_config_has_sensible_values() {
        let cfg = Config::default();
        assert_eq!(cfg.sync.worker_count, 4);
        assert_eq!(cfg.sync.chunk_size_kib, 64);
        assert!(cfg.sync.check_if_sync_required);
        assert!(!cfg.throttling.enabled);
        assert_eq!(cfg.throttling.burst_multiplier, 3);
        assert_eq!(cfg.throttling.tick_ms, 100);
        assert!(!cfg.encryption.enabled);
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn default_config_passes_validation() {
        let errors = Config::default().validate();
        assert!(errors.is_empty(), "unexpected errors: {errors:?}");
    }

    // -- Loading --

    #[test]
    fn load_from_yaml_file() {
        let yaml = r#"
sync:
  source: /data/photos
  destination: /mnt/backup/photos
  database: /var/lib/treesync/photos.db
  worker_count: 8
  chunk_size_kib: 128
  check_if_sync_required: false
throttling:
  enabled: true
  bytes_per_second: 500000
  burst_multiplier: 2
  tick_ms: 50
encryption:
  enabled: true
  public_key: /etc/treesync/public.pem
retry:
  max_attempts: 5
  base_delay_ms: 100
  max_delay_ms: 1000
logging:
  level: debug
  json: true
"#;
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        tmp.write_all(yaml.as_bytes()).unwrap();
        tmp.flush().unwrap();

        let cfg = Config::load(tmp.path()).expect("load config");
        assert_eq!(cfg.sync.source, PathBuf::from("/data/photos"));
        assert_eq!(cfg.sync.worker_count, 8);
        assert!(!cfg.sync.check_if_sync_required);
        assert!(cfg.throttling.enabled);
        assert_eq!(cfg.throttling.bytes_per_second, 500_000);
        assert_eq!(
            cfg.encryption.public_key,
            Some(PathBuf::from("/etc/treesync/public.pem"))
        );
        assert!(cfg.encryption.private_key.is_none());
        assert_eq!(cfg.retry.max_attempts, 5);
        assert_eq!(cfg.logging.level, "debug");
        assert!(cfg.logging.json);
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn load_partial_yaml_fills_defaults() {
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        tmp.write_all(b"sync:\n  worker_count: 2\n").unwrap();
        tmp.flush().unwrap();

        let cfg = Config::load(tmp.path()).expect("load config");
        assert_eq!(cfg.sync.worker_count, 2);
        assert_eq!(cfg.sync.chunk_size_kib, 64);
        assert_eq!(cfg.retry.max_attempts, 3);
    }

    #[test]
    fn load_or_default_returns_default_on_missing_file() {
        let cfg = Config::load_or_default(Path::new("/nonexistent/config.yaml"));
        assert_eq!(cfg.sync.worker_count, 4);
    }

    #[test]
    fn load_returns_error_on_invalid_yaml() {
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        tmp.write_all(b"not: [valid: yaml: {{{").unwrap();
        tmp.flush().unwrap();

        assert!(Config::load(tmp.path()).is_err());
    }

    #[test]
    fn save_then_load_preserves_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.yaml");
        let cfg = ConfigBuilder::new().worker_count(7).build();
        cfg.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.sync.worker_count, 7);
    }

    // -- Validation --

    #[test]
    fn validate_catches_same_source_and_destination() {
        let cfg = ConfigBuilder::new()
            .source(PathBuf::from("/data"))
            .destination(PathBuf::from("/data"))
            .build();
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.field == "sync.destination"));
    }

    #[test]
    fn validate_catches_nested_destination() {
        let cfg = ConfigBuilder::new()
            .source(PathBuf::from("/data"))
            .destination(PathBuf::from("/data/backup"))
            .build();
        let errors = cfg.validate();
        assert!(errors
            .iter()
            .any(|e| e.field == "sync.destination" && e.message.contains("inside")));
    }

    #[test]
    fn validate_catches_worker_count_out_of_range() {
        let mut cfg = Config::default();
        cfg.sync.worker_count = 0;
        assert!(cfg.validate().iter().any(|e| e.field == "sync.worker_count"));
        cfg.sync.worker_count = 65;
        assert!(cfg.validate().iter().any(|e| e.field == "sync.worker_count"));
    }

    #[test]
    fn validate_catches_zero_chunk_size() {
        let mut cfg = Config::default();
        cfg.sync.chunk_size_kib = 0;
        assert!(cfg.validate().iter().any(|e| e.field == "sync.chunk_size_kib"));
    }

    #[test]
    fn validate_catches_rate_too_small_for_tick() {
        let cfg = ConfigBuilder::new()
            .throttle_bytes_per_second(5)
            .throttle_tick_ms(100)
            .build();
        assert!(cfg
            .validate()
            .iter()
            .any(|e| e.field == "throttling.bytes_per_second"));
    }

    #[test]
    fn validate_catches_tick_out_of_range() {
        let mut cfg = Config::default();
        cfg.throttling.tick_ms = 5;
        assert!(cfg.validate().iter().any(|e| e.field == "throttling.tick_ms"));
    }

    #[test]
    fn validate_requires_public_key_when_encrypting() {
        let mut cfg = Config::default();
        cfg.encryption.enabled = true;
        assert!(cfg
            .validate()
            .iter()
            .any(|e| e.field == "encryption.public_key"));
    }

    #[test]
    fn validate_catches_inverted_retry_delays() {
        let cfg = ConfigBuilder::new().retry_delays_ms(5000, 100).build();
        assert!(cfg
            .validate()
            .iter()
            .any(|e| e.field == "retry.base_delay_ms" && e.message.contains("must not exceed")));
    }

    #[test]
    fn validate_catches_invalid_log_level() {
        let mut cfg = Config::default();
        cfg.logging.level = "verbose".to_string();
        assert!(cfg.validate().iter().any(|e| e.field == "logging.level"));
    }

    #[test]
    fn validate_accepts_all_valid_log_levels() {
        for level in VALID_LOG_LEVELS {
            let mut cfg = Config::default();
            cfg.logging.level = (*level).to_string();
            assert!(
                !cfg.validate().iter().any(|e| e.field == "logging.level"),
                "level '{level}' should be valid"
            );
        }
    }

    // -- Builder --

    #[test]
    fn builder_starts_from_defaults() {
        let cfg = ConfigBuilder::new().build();
        assert_eq!(cfg.sync.worker_count, Config::default().sync.worker_count);
    }

    #[test]
    fn builder_overrides_fields() {
        let cfg = ConfigBuilder::new()
            .source(PathBuf::from("/a"))
            .destination(PathBuf::from("/b"))
            .database(PathBuf::from("/tmp/t.db"))
            .worker_count(2)
            .chunk_size_kib(32)
            .check_if_sync_required(false)
            .throttle_bytes_per_second(2048)
            .encryption_keys(PathBuf::from("/k/pub.pem"), Some(PathBuf::from("/k/priv.pem")))
            .retry_max_attempts(1)
            .logging_level("warn")
            .logging_json(true)
            .build();

        assert_eq!(cfg.sync.source, PathBuf::from("/a"));
        assert_eq!(cfg.sync.destination, PathBuf::from("/b"));
        assert_eq!(cfg.sync.database, PathBuf::from("/tmp/t.db"));
        assert_eq!(cfg.sync.worker_count, 2);
        assert_eq!(cfg.sync.chunk_size_kib, 32);
        assert!(!cfg.sync.check_if_sync_required);
        assert!(cfg.throttling.enabled);
        assert_eq!(cfg.throttling.bytes_per_second, 2048);
        assert!(cfg.encryption.enabled);
        assert_eq!(cfg.retry.max_attempts, 1);
        assert_eq!(cfg.logging.level, "warn");
        assert!(cfg.logging.json);
    }

    #[test]
    fn builder_build_validated_succeeds_for_valid_config() {
        assert!(ConfigBuilder::new().build_validated().is_ok());
    }

    #[test]
    fn builder_build_validated_fails_for_invalid_config() {
        let result = ConfigBuilder::new().worker_count(0).build_validated();
        let errors = result.unwrap_err();
        assert!(errors.iter().any(|e| e.field == "sync.worker_count"));
    }
}
