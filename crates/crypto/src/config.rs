//! Client-side crypto configuration loaded from `kemchat.toml` with env var
//! overrides.

use std::path::PathBuf;

use serde::Deserialize;

use crate::error::CryptoError;
use crate::master_key::KdfParams;
use crate::retry::RetryPolicy;

const CONFIG_PATH_VAR: &str = "KEMCHAT_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "kemchat.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct CryptoConfig {
    /// Argon2id cost parameters for password derivation.
    #[serde(default)]
    pub kdf: KdfParams,
    /// Backoff policy for store reads.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Tracing filter used when `RUST_LOG` is unset. Default: "info"
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// SQLite file for the local store. `None` keeps everything in memory.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            kdf: KdfParams::default(),
            retry: RetryPolicy::default(),
            log_level: default_log_level(),
            database_path: None,
        }
    }
}

impl CryptoConfig {
    /// Load `.env`, then the TOML file named by `KEMCHAT_CONFIG` (default
    /// `kemchat.toml` in CWD), then env overrides.
    ///
    /// A missing default file falls back to built-in defaults; a missing file
    /// that was named explicitly is an error.
    pub fn load() -> Result<Self, CryptoError> {
        dotenvy::dotenv().ok();

        let explicit = std::env::var(CONFIG_PATH_VAR).ok();
        let path = explicit
            .clone()
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

        match std::fs::read_to_string(&path) {
            Ok(contents) => Self::from_toml_str(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && explicit.is_none() => {
                tracing::debug!(path = %path, "no config file, using defaults");
                let mut config = Self::default();
                config.apply_env_overrides()?;
                config.kdf.validate()?;
                Ok(config)
            }
            Err(e) => Err(CryptoError::Config(format!("failed to read {path}: {e}"))),
        }
    }

    /// Parse a TOML string, then apply env var overrides and validate.
    pub fn from_toml_str(toml_str: &str) -> Result<Self, CryptoError> {
        let mut config: CryptoConfig =
            toml::from_str(toml_str).map_err(|e| CryptoError::Config(e.to_string()))?;
        config.apply_env_overrides()?;
        config.kdf.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to the config.
    ///
    /// Returns an error if a variable is set but does not parse.
    pub fn apply_env_overrides(&mut self) -> Result<(), CryptoError> {
        if let Some(val) = env_number("KEMCHAT_KDF_MEMORY_KIB")? {
            self.kdf.memory_kib = val;
        }
        if let Some(val) = env_number("KEMCHAT_KDF_ITERATIONS")? {
            self.kdf.iterations = val;
        }
        if let Some(val) = env_number("KEMCHAT_KDF_PARALLELISM")? {
            self.kdf.parallelism = val;
        }
        if let Some(val) = env_number("KEMCHAT_RETRY_MAX_ATTEMPTS")? {
            self.retry.max_attempts = val;
        }
        if let Ok(val) = std::env::var("KEMCHAT_LOG_LEVEL") {
            self.log_level = val;
        }
        if let Ok(val) = std::env::var("KEMCHAT_DATABASE_PATH") {
            self.database_path = Some(PathBuf::from(val));
        }
        Ok(())
    }
}

fn env_number(name: &str) -> Result<Option<u32>, CryptoError> {
    match std::env::var(name) {
        Ok(val) => val
            .parse()
            .map(Some)
            .map_err(|_| CryptoError::Config(format!("invalid {name} value: {val}"))),
        Err(_) => Ok(None),
    }
}
