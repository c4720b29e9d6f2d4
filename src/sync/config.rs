use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Linked-account tokens this close to expiring are refreshed before use
pub const DEFAULT_TOKEN_EXPIRY_MARGIN_SECS: i64 = 6 * 60 * 60;

const DEFAULT_MAILBOX_CAPACITY: usize = 256;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Tunables of the outbound synchronization engine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SendChangesConfig {
    /// Safety margin before a linked-account token's expiration
    pub token_expiry_margin_secs: i64,
    /// Capacity of the mailbox carrying local storage replies and timer events
    pub mailbox_capacity: usize,
}

impl Default for SendChangesConfig {
    fn default() -> Self {
        Self {
            token_expiry_margin_secs: DEFAULT_TOKEN_EXPIRY_MARGIN_SECS,
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
        }
    }
}

impl SendChangesConfig {
    /// `<config dir>/nous/sync.toml`, if the platform has a config dir
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("nous").join("sync.toml"))
    }

    /// Load from a TOML file, falling back to defaults when it does not exist
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            log::debug!("No sync config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.token_expiry_margin_secs < 0 {
            return Err(ConfigError::Invalid(format!(
                "tokenExpiryMarginSecs must not be negative, got {}",
                self.token_expiry_margin_secs
            )));
        }
        if self.mailbox_capacity == 0 {
            return Err(ConfigError::Invalid(
                "mailboxCapacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn token_expiry_margin(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.token_expiry_margin_secs)
    }
}
