//! Store configuration loading from file and environment variables.

use std::fs;
use std::path::Path;
use std::time::Duration as StdDuration;

use chrono::Duration;
use serde::Deserialize;
use thiserror::Error;

/// Configuration for [`Store::open`](crate::Store::open).
///
/// Every field has a default; a TOML file and `CUBBY_*` environment
/// variables can override any of them (env wins over file).
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Path to the migration watermark file.
    #[serde(default = "default_watermark_path")]
    pub watermark_path: String,

    /// Default lifetime of a file uploaded by the guest account, in seconds.
    #[serde(default = "default_guest_file_lifetime_secs")]
    pub guest_file_lifetime_secs: u64,

    /// Default lifetime of a file uploaded by an authenticated account,
    /// in seconds.
    #[serde(default = "default_file_lifetime_secs")]
    pub file_lifetime_secs: u64,

    /// Payload size ceiling for guest uploads, in bytes.
    #[serde(default = "default_guest_max_file_size")]
    pub guest_max_file_size: u64,

    /// Payload size ceiling for authenticated uploads, in bytes.
    /// The admin account is exempt from any ceiling.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    /// Interval between background expiry sweeps, in seconds.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Busy timeout for SQLite connections, in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Maximum number of pooled SQLite connections.
    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,

    /// Out-of-band admin password. When set, it authorizes the admin
    /// account regardless of its stored hash.
    #[serde(default)]
    pub admin_password: Option<String>,
}

fn default_db_path() -> String {
    "cubby.sqlite3".to_string()
}

fn default_watermark_path() -> String {
    "cubby.migration-state".to_string()
}

fn default_guest_file_lifetime_secs() -> u64 {
    604_800 // 1 week
}

fn default_file_lifetime_secs() -> u64 {
    2_419_200 // 4 weeks
}

fn default_guest_max_file_size() -> u64 {
    31_457_280 // 30 MiB
}

fn default_max_file_size() -> u64 {
    73_400_320 // 70 MiB
}

fn default_sweep_interval_secs() -> u64 {
    3_600
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_pool_max_size() -> u32 {
    8
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            watermark_path: default_watermark_path(),
            guest_file_lifetime_secs: default_guest_file_lifetime_secs(),
            file_lifetime_secs: default_file_lifetime_secs(),
            guest_max_file_size: default_guest_max_file_size(),
            max_file_size: default_max_file_size(),
            sweep_interval_secs: default_sweep_interval_secs(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
            admin_password: None,
        }
    }
}

impl StoreConfig {
    pub fn guest_file_lifetime(&self) -> Duration {
        Duration::seconds(self.guest_file_lifetime_secs as i64)
    }

    pub fn file_lifetime(&self) -> Duration {
        Duration::seconds(self.file_lifetime_secs as i64)
    }

    pub fn sweep_interval(&self) -> StdDuration {
        StdDuration::from_secs(self.sweep_interval_secs)
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// An environment override holds an unparseable value.
    #[error("environment variable {var} holds invalid value {value:?}")]
    InvalidEnv { var: &'static str, value: String },
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `CUBBY_DB_PATH` overrides `db_path`
/// - `CUBBY_WATERMARK_PATH` overrides `watermark_path`
/// - `CUBBY_LIFETIME_GUEST` overrides `guest_file_lifetime_secs`
/// - `CUBBY_LIFETIME` overrides `file_lifetime_secs`
/// - `CUBBY_MAXSIZE_GUEST` overrides `guest_max_file_size`
/// - `CUBBY_MAXSIZE` overrides `max_file_size`
/// - `CUBBY_SWEEP_INTERVAL` overrides `sweep_interval_secs`
/// - `CUBBY_ADMIN_PASSWORD` overrides `admin_password`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or
/// parsed, or if an environment override is unparseable.
pub fn load_config(path: Option<&Path>) -> Result<StoreConfig, ConfigError> {
    let mut config = match path {
        Some(path) if path.exists() => toml::from_str(&fs::read_to_string(path)?)?,
        _ => StoreConfig::default(),
    };
    apply_env_overrides(&mut config)?;
    Ok(config)
}

fn apply_env_overrides(config: &mut StoreConfig) -> Result<(), ConfigError> {
    if let Ok(value) = std::env::var("CUBBY_DB_PATH") {
        config.db_path = value;
    }
    if let Ok(value) = std::env::var("CUBBY_WATERMARK_PATH") {
        config.watermark_path = value;
    }
    override_u64("CUBBY_LIFETIME_GUEST", &mut config.guest_file_lifetime_secs)?;
    override_u64("CUBBY_LIFETIME", &mut config.file_lifetime_secs)?;
    override_u64("CUBBY_MAXSIZE_GUEST", &mut config.guest_max_file_size)?;
    override_u64("CUBBY_MAXSIZE", &mut config.max_file_size)?;
    override_u64("CUBBY_SWEEP_INTERVAL", &mut config.sweep_interval_secs)?;
    if let Ok(value) = std::env::var("CUBBY_ADMIN_PASSWORD") {
        config.admin_password = Some(value);
    }
    Ok(())
}

fn override_u64(var: &'static str, slot: &mut u64) -> Result<(), ConfigError> {
    if let Ok(value) = std::env::var(var) {
        *slot = value
            .parse()
            .map_err(|_| ConfigError::InvalidEnv { var, value })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-global; tests that touch them
    // serialize on this.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn defaults_match_documented_values() {
        let config = StoreConfig::default();
        assert_eq!(config.guest_file_lifetime_secs, 604_800);
        assert_eq!(config.file_lifetime_secs, 2_419_200);
        assert_eq!(config.guest_max_file_size, 31_457_280);
        assert_eq!(config.max_file_size, 73_400_320);
        assert_eq!(config.sweep_interval_secs, 3_600);
        assert!(config.admin_password.is_none());
    }

    #[test]
    fn toml_file_and_env_overrides_apply() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("cubby.toml");
        std::fs::write(&path, "max_file_size = 1024\nsweep_interval_secs = 5\n")
            .expect("should write config file");

        // Env wins over file.
        let _env = ENV_LOCK.lock().unwrap();
        std::env::set_var("CUBBY_MAXSIZE", "2048");
        let config = load_config(Some(&path)).expect("config should load");
        std::env::remove_var("CUBBY_MAXSIZE");

        assert_eq!(config.max_file_size, 2048);
        assert_eq!(config.sweep_interval_secs, 5);
        assert_eq!(config.db_path, default_db_path());
    }

    #[test]
    fn invalid_env_override_is_rejected() {
        let _env = ENV_LOCK.lock().unwrap();
        std::env::set_var("CUBBY_LIFETIME_GUEST", "not-a-number");
        let result = load_config(None);
        std::env::remove_var("CUBBY_LIFETIME_GUEST");

        assert!(matches!(
            result,
            Err(ConfigError::InvalidEnv {
                var: "CUBBY_LIFETIME_GUEST",
                ..
            })
        ));
    }
}
