//! Store configuration
//!
//! Loaded from a TOML file layered with `KVSESSION_*` environment variables,
//! or built in code with the `with_*` setters.

use crate::error::{CoreError, CoreResult, ErrorContext};
use crate::types::{DEFAULT_MAX_VALUE_LEN, DEFAULT_TABLE_NAME};
use crate::{config_error, validation_error};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default interval between reaper passes, in seconds
pub const DEFAULT_GC_INTERVAL_SECS: i64 = 600;

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "KVSESSION";

/// Longest table name accepted by `validate`
const MAX_TABLE_NAME_LEN: usize = 64;

/// Configuration for a session store instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Data-source connection string (`sqlite:` or `mysql:` URL)
    pub database_url: String,

    /// Maximum number of open database connections
    pub max_open_conns: u32,

    /// Number of connections kept warm in the pool
    pub max_idle_conns: u32,

    /// Maximum lifetime of a single connection
    pub conn_max_lifetime_secs: u64,

    /// Idle connections above `max_idle_conns` are closed after this long
    pub idle_timeout_secs: u64,

    /// How long to wait for a free connection
    pub acquire_timeout_secs: u64,

    /// Session table name; empty means the default
    pub table_name: String,

    /// Seconds between reaper passes; non-positive means the default
    pub gc_interval_secs: i64,

    /// Longest encoded value a session may persist
    pub max_value_len: usize,

    /// Idle value buffers retained by the handle pool
    pub handle_pool_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://kvsession.db?mode=rwc".to_string(),
            max_open_conns: 50,
            max_idle_conns: 25,
            conn_max_lifetime_secs: 2 * 60 * 60,
            idle_timeout_secs: 10 * 60,
            acquire_timeout_secs: 30,
            table_name: DEFAULT_TABLE_NAME.to_string(),
            gc_interval_secs: DEFAULT_GC_INTERVAL_SECS,
            max_value_len: DEFAULT_MAX_VALUE_LEN,
            handle_pool_capacity: 128,
        }
    }
}

impl StoreConfig {
    /// Create a configuration for the given connection string with default
    /// pool sizing.
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            ..Self::default()
        }
    }

    pub fn with_max_open_conns(mut self, max: u32) -> Self {
        self.max_open_conns = max;
        self
    }

    pub fn with_max_idle_conns(mut self, max: u32) -> Self {
        self.max_idle_conns = max;
        self
    }

    pub fn with_conn_max_lifetime(mut self, lifetime: Duration) -> Self {
        self.conn_max_lifetime_secs = lifetime.as_secs();
        self
    }

    pub fn with_table_name(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = table_name.into();
        self
    }

    pub fn with_gc_interval_secs(mut self, secs: i64) -> Self {
        self.gc_interval_secs = secs;
        self
    }

    pub fn with_max_value_len(mut self, len: usize) -> Self {
        self.max_value_len = len;
        self
    }

    pub fn with_handle_pool_capacity(mut self, capacity: usize) -> Self {
        self.handle_pool_capacity = capacity;
        self
    }

    /// Table name with the empty-string default applied
    pub fn effective_table_name(&self) -> &str {
        if self.table_name.is_empty() {
            DEFAULT_TABLE_NAME
        } else {
            &self.table_name
        }
    }

    /// Reaper interval with the non-positive default applied
    pub fn gc_interval(&self) -> Duration {
        let secs = if self.gc_interval_secs > 0 {
            self.gc_interval_secs
        } else {
            DEFAULT_GC_INTERVAL_SECS
        };
        Duration::from_secs(secs as u64)
    }

    /// Warm connections, never more than the open limit
    pub fn min_connections(&self) -> u32 {
        self.max_idle_conns.min(self.max_open_conns)
    }

    pub fn conn_max_lifetime(&self) -> Duration {
        Duration::from_secs(self.conn_max_lifetime_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    /// Load configuration from a file, then apply `KVSESSION_*` overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        Self::load(Some(path.as_ref()))
    }

    /// Load configuration from defaults, an optional file and the environment
    pub fn load(path: Option<&Path>) -> CoreResult<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(true));
        }
        builder = builder.add_source(::config::Environment::with_prefix(ENV_PREFIX).try_parsing(true));

        let settings = builder
            .build()
            .map_err(|e| config_error!(format!("Failed to read config: {}", e), "config", e))?;

        let config: StoreConfig = settings
            .try_deserialize()
            .map_err(|e| config_error!(format!("Failed to parse config: {}", e), "config", e))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration as TOML
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> CoreResult<()> {
        let content = toml::to_string_pretty(self).map_err(|e| CoreError::Config {
            message: format!("Failed to serialize config: {}", e),
            source: Some(Box::new(e)),
            context: ErrorContext::new("config").with_operation("serialize_toml"),
        })?;

        std::fs::write(path, content).map_err(|e| CoreError::Config {
            message: format!("Failed to write config file: {}", e),
            source: Some(Box::new(e)),
            context: ErrorContext::new("config")
                .with_operation("write_file")
                .with_suggestion("Check if the directory exists and is writable"),
        })?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> CoreResult<()> {
        if self.database_url.trim().is_empty() {
            return Err(validation_error!(
                "database_url must not be empty",
                "database_url",
                "config"
            ));
        }

        if self.max_open_conns == 0 {
            return Err(validation_error!(
                "max_open_conns must be greater than 0",
                "max_open_conns",
                "config"
            ));
        }

        if self.max_value_len == 0 {
            return Err(validation_error!(
                "max_value_len must be greater than 0",
                "max_value_len",
                "config"
            ));
        }

        validate_table_name(self.effective_table_name())
    }
}

/// The table name is spliced into statement text, so only plain identifiers
/// are accepted.
pub fn validate_table_name(name: &str) -> CoreResult<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if !valid_start || !valid_rest || name.len() > MAX_TABLE_NAME_LEN {
        return Err(validation_error!(
            format!("invalid table name: {:?}", name),
            "table_name",
            "config"
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fall_back() {
        let config = StoreConfig::new("sqlite::memory:")
            .with_table_name("")
            .with_gc_interval_secs(-5);
        assert_eq!(config.effective_table_name(), "go_session");
        assert_eq!(config.gc_interval(), Duration::from_secs(600));

        let config = config.with_gc_interval_secs(0);
        assert_eq!(config.gc_interval(), Duration::from_secs(600));

        let config = config.with_gc_interval_secs(1);
        assert_eq!(config.gc_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_pool_defaults() {
        let config = StoreConfig::new("mysql://root@localhost/app");
        assert_eq!(config.max_open_conns, 50);
        assert_eq!(config.max_idle_conns, 25);
        assert_eq!(config.conn_max_lifetime(), Duration::from_secs(7200));

        let clamped = config.with_max_open_conns(4);
        assert_eq!(clamped.min_connections(), 4);
    }

    #[test]
    fn test_table_name_validation() {
        assert!(validate_table_name("go_session").is_ok());
        assert!(validate_table_name("_sessions2").is_ok());
        assert!(validate_table_name("").is_err());
        assert!(validate_table_name("1sessions").is_err());
        assert!(validate_table_name("sessions; DROP TABLE users").is_err());
        assert!(validate_table_name(&"a".repeat(65)).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(StoreConfig::new("").validate().is_err());
        assert!(StoreConfig::new("sqlite::memory:")
            .with_max_open_conns(0)
            .validate()
            .is_err());
        assert!(StoreConfig::new("sqlite::memory:")
            .with_max_value_len(0)
            .validate()
            .is_err());
        assert!(StoreConfig::new("sqlite::memory:").validate().is_ok());
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kvsession.toml");

        let config = StoreConfig::new("sqlite://sessions.db?mode=rwc")
            .with_table_name("web_sessions")
            .with_gc_interval_secs(30);
        config.save_to_file(&path).unwrap();

        let loaded = StoreConfig::from_file(&path).unwrap();
        assert_eq!(loaded.table_name, "web_sessions");
        assert_eq!(loaded.gc_interval_secs, 30);
        assert_eq!(loaded.max_open_conns, 50);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.toml");
        std::fs::write(&path, "database_url = \"sqlite://x.db?mode=rwc\"\n").unwrap();

        let loaded = StoreConfig::from_file(&path).unwrap();
        assert_eq!(loaded.database_url, "sqlite://x.db?mode=rwc");
        assert_eq!(loaded.table_name, "go_session");
        assert_eq!(loaded.max_value_len, 2048);
    }

    #[test]
    fn test_invalid_table_in_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "table_name = \"drop table\"\n").unwrap();

        assert!(matches!(
            StoreConfig::from_file(&path),
            Err(CoreError::Validation { .. })
        ));
    }
}
