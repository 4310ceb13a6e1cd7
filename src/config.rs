use std::path::{Path, PathBuf};
use std::time::Duration;

use alloy_primitives::Address;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;

/// 32 ETH in gwei
pub const DEFAULT_DEPOSIT_AMOUNT_GWEI: u64 = 32_000_000_000;

const DEFAULT_CONFIG_FILE: &str = "config.toml";
const ENV_PREFIX: &str = "OPERATOR";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub keystores: KeystoresConfig,
    pub vault: VaultConfig,
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub oracles: OraclesConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeystoresConfig {
    pub keystores_dir: PathBuf,
    /// Directory holding per-keystore `<name>.txt` password files
    #[serde(default)]
    pub password_dir: Option<PathBuf>,
    /// Password used for keystores without their own password file
    #[serde(default)]
    pub password_file: Option<PathBuf>,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

impl KeystoresConfig {
    pub fn new(keystores_dir: impl Into<PathBuf>) -> Self {
        Self {
            keystores_dir: keystores_dir.into(),
            password_dir: None,
            password_file: None,
            pool_size: default_pool_size(),
        }
    }

    pub fn password_dir(&self) -> &Path {
        self.password_dir.as_deref().unwrap_or(&self.keystores_dir)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VaultConfig {
    pub address: Address,
    pub deposit_data_file: PathBuf,
    #[serde(default = "default_deposit_amount_gwei")]
    pub deposit_amount_gwei: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    pub endpoint: String,
    pub validators_registry: Address,
    /// Block the registry's deposit event scan starts from
    #[serde(default)]
    pub deposits_from_block: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OraclesConfig {
    /// Shared budget for one approval round, in seconds
    #[serde(default = "default_oracles_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Attempts per replica on transient failures
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl OraclesConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Default for OraclesConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_oracles_timeout_secs(),
            retry_delay_ms: default_retry_delay_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_deposit_amount_gwei() -> u64 {
    DEFAULT_DEPOSIT_AMOUNT_GWEI
}

fn default_oracles_timeout_secs() -> u64 {
    10
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Loads configuration from a TOML file layered with `OPERATOR__*` env variables.
///
/// Without an explicit path `config.toml` is read if present.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let file = match path {
        Some(path) => File::from(path).required(true),
        None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
    };

    let settings = Config::builder()
        .add_source(file)
        .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
        .build()?;

    let config: AppConfig = settings.try_deserialize()?;
    config.validate()?;
    Ok(config)
}

impl AppConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.keystores.pool_size == 0 {
            return Err(ConfigError::Invalid(
                "keystores.pool_size must be greater than zero".to_string(),
            ));
        }
        if self.oracles.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "oracles.max_attempts must be greater than zero".to_string(),
            ));
        }
        if self.oracles.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "oracles.timeout_secs must be greater than zero".to_string(),
            ));
        }
        url::Url::parse(&self.execution.endpoint).map_err(|e| {
            ConfigError::Invalid(format!(
                "execution.endpoint is not a valid URL ({}): {}",
                self.execution.endpoint, e
            ))
        })?;
        Ok(())
    }
}
