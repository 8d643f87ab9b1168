use std::env;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

const DEFAULT_CHAIN_API_URL: &str = "http://localhost:8545/api/v1";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),
    #[error("invalid value for {name}: {value}")]
    InvalidVar { name: &'static str, value: String },
    #[error("no storage backend enabled; set DB_STORAGE_ENABLED or FILE_STORAGE_ENABLED")]
    NoBackendEnabled,
}

/// Which durable backends receive fetched blocks.
///
/// The relational control plane (known heights + gap ranges) is always present;
/// these toggles only govern where full block payloads land.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    pub db_enabled: bool,
    pub file_enabled: bool,
    pub file_dir: PathBuf,
    pub file_extension: bool,
    pub file_pretty_json: bool,
}

impl StorageConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.db_enabled && !self.file_enabled {
            return Err(ConfigError::NoBackendEnabled);
        }
        Ok(())
    }
}

/// Immutable process configuration, resolved once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub chain_api_url: String,
    pub db_url: String,
    pub storage: StorageConfig,
    pub genesis_height: i64,
    pub batch_size: i64,
    pub num_workers: usize,
    pub block_fetch_delay: Duration,
    pub max_retries: u32,
    pub api_timeout: Duration,
    pub max_gaps_per_pass: i64,
    pub gap_scan_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let db_url = env::var("DATABASE_URL").map_err(|_| ConfigError::MissingVar("DATABASE_URL"))?;
        Self::from_env_with_db_url(db_url)
    }

    /// Same as [`Config::from_env`] but with the database URL supplied by the
    /// caller, for CLI surfaces that accept `--database-url`.
    pub fn from_env_with_db_url(db_url: String) -> Result<Self, ConfigError> {
        let chain_api_url =
            env::var("CHAIN_API_URL").unwrap_or_else(|_| DEFAULT_CHAIN_API_URL.to_string());

        let storage = StorageConfig {
            db_enabled: parse_bool("DB_STORAGE_ENABLED", true)?,
            file_enabled: parse_bool("FILE_STORAGE_ENABLED", false)?,
            file_dir: PathBuf::from(
                env::var("FILE_STORAGE_DIR").unwrap_or_else(|_| "blocks".to_string()),
            ),
            file_extension: parse_bool("FILE_EXTENSION_ENABLED", true)?,
            file_pretty_json: parse_bool("FILE_PRETTY_JSON", false)?,
        };
        storage.validate()?;

        Ok(Self {
            chain_api_url,
            db_url,
            storage,
            genesis_height: parse_i64("GENESIS_HEIGHT", 0)?,
            batch_size: parse_i64("BATCH_SIZE", 100)?,
            num_workers: parse_usize("NUM_WORKERS", 4)?,
            block_fetch_delay: Duration::from_millis(parse_u64("BLOCK_FETCH_DELAY_MS", 500)?),
            max_retries: parse_u32("MAX_RETRIES", 3)?,
            api_timeout: Duration::from_secs(parse_u64("API_TIMEOUT_SECS", 12)?),
            max_gaps_per_pass: parse_i64("MAX_GAPS_PER_PASS", 1000)?,
            gap_scan_interval: Duration::from_secs(parse_u64("GAP_SCAN_INTERVAL_SECS", 60)?),
        })
    }
}

fn parse_bool(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match env::var(name) {
        Err(_) => Ok(default),
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidVar { name, value: raw }),
        },
    }
}

fn parse_i64(name: &'static str, default: i64) -> Result<i64, ConfigError> {
    match env::var(name) {
        Err(_) => Ok(default),
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidVar { name, value: raw }),
    }
}

fn parse_u32(name: &'static str, default: u32) -> Result<u32, ConfigError> {
    match env::var(name) {
        Err(_) => Ok(default),
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidVar { name, value: raw }),
    }
}

fn parse_u64(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    match env::var(name) {
        Err(_) => Ok(default),
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidVar { name, value: raw }),
    }
}

fn parse_usize(name: &'static str, default: usize) -> Result<usize, ConfigError> {
    match env::var(name) {
        Err(_) => Ok(default),
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidVar { name, value: raw }),
    }
}
