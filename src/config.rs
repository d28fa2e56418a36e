//! Configuration loading.
//!
//! Layers, lowest to highest: built-in defaults, `<settings root>/config.toml`,
//! environment overrides, then CLI flags (applied by the binary).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::model::{BuildOptions, DEFAULT_MAX_ATTEMPTS, DEFAULT_STATE_SIZE};
use crate::slack::DEFAULT_API_BASE;

const APP_DIR: &str = "mimic-bot";
const CONFIG_FILE: &str = "config.toml";
const KEY_FILE: &str = "bot.key";

pub const HOME_ENV: &str = "MIMIC_BOT_HOME";
pub const POLL_MS_ENV: &str = "MIMIC_BOT_POLL_MS";

/// One `conversations.history` call per poll at this pace stays under
/// Slack's Tier 3 limit of roughly 50 calls a minute.
const DEFAULT_POLL_INTERVAL_MS: u64 = 1500;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub bot: BotConfig,
    pub model: ModelConfig,
    pub transport: TransportConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BotConfig {
    /// Name shown in help output. Defaults to the name the chat service reports.
    pub name: Option<String>,
    pub poll_interval_ms: u64,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            name: None,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelConfig {
    pub state_size: usize,
    pub max_attempts: usize,
    pub accept_any_sentence: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            state_size: DEFAULT_STATE_SIZE,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            accept_any_sentence: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportConfig {
    pub token: Option<String>,
    pub api_base: String,
    /// Channels whose history is fetched on each poll, in rotation.
    pub channels_per_poll: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            token: None,
            api_base: DEFAULT_API_BASE.to_string(),
            channels_per_poll: 1,
        }
    }
}

/// Per-installation settings directory holding config, credentials and models.
///
/// Uses `MIMIC_BOT_HOME` if set, otherwise `<config dir>/mimic-bot`.
pub fn settings_root() -> PathBuf {
    if let Some(dir) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
        return PathBuf::from(dir);
    }
    dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn key_path(root: &Path) -> PathBuf {
    root.join(KEY_FILE)
}

impl Config {
    /// Load `config.toml` under `root` (defaults when absent) and apply
    /// environment overrides.
    pub fn load(root: &Path) -> Result<Config, ConfigError> {
        let mut config = Self::load_file(&config_path(root))?;
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn load_file(path: &Path) -> Result<Config, ConfigError> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(POLL_MS_ENV).filter(|v| !v.trim().is_empty()) {
            self.bot.poll_interval_ms = raw.trim().parse().map_err(|_| ConfigError::Invalid {
                field: POLL_MS_ENV,
                reason: format!("`{raw}` is not a number of milliseconds"),
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model.state_size == 0 {
            return Err(ConfigError::Invalid {
                field: "model.state_size",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.model.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "model.max_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.transport.channels_per_poll == 0 {
            return Err(ConfigError::Invalid {
                field: "transport.channels_per_poll",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn build_options(&self) -> BuildOptions {
        BuildOptions {
            state_size: self.model.state_size,
            accept_any_sentence: self.model.accept_any_sentence,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.bot.poll_interval_ms)
    }

    /// Credential lookup: explicit value (flag or its env var), then the key
    /// file under `root`, then the config file.
    pub fn resolve_token(&self, explicit: Option<&str>, root: &Path) -> Option<String> {
        let from_key_file = || {
            fs::read_to_string(key_path(root))
                .ok()
                .map(|s| s.trim().to_string())
        };
        explicit
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .or_else(|| from_key_file().filter(|s| !s.is_empty()))
            .or_else(|| self.transport.token.clone().filter(|s| !s.trim().is_empty()))
    }
}
