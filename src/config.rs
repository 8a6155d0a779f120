//src/config.rs
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

const CONFIG_FILE_NAME: &str = "config.toml";
const APP_CONFIG_DIR: &str = "active-session";
const CONFIG_ENV_VAR: &str = "ACTIVE_SESSION_CONFIG_DIR"; // Environment variable name

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Could not determine configuration directory.")]
    CannotDetermineConfigDir,
    #[error("I/O error accessing config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config file (TOML): {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to serialize config data (TOML): {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("Server URL not set in config. Use 'set-server <url>' or update {0:?}.")]
    ServerNotSet(PathBuf),
    #[error("Invalid server URL: {0}")]
    InvalidServerUrl(String),
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Units {
    #[default]
    Metric, // kg
    Imperial, // lb
}

impl Units {
    #[must_use]
    pub const fn weight_label(self) -> &'static str {
        match self {
            Self::Metric => "kg",
            Self::Imperial => "lb",
        }
    }
}

/// Caps applied by the session mutators.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SessionLimits {
    pub max_sets_per_exercise: usize,
    pub max_exercises_per_workout: usize,
    pub default_rest_secs: u32,
    pub drop_set_stage_limit: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_sets_per_exercise: 50,
            max_exercises_per_workout: 50,
            default_rest_secs: 60,
            drop_set_stage_limit: 20,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct HistorySettings {
    pub fetch_limit: usize,   // Remote sessions scanned per rebuild
    pub window: usize,        // Items kept per exercise
    pub cache_ttl_secs: i64,  // After this the cached blob is served as stale
    pub fetch_timeout_ms: u64,
    pub watchdog_grace_ms: u64,
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self {
            fetch_limit: 80,
            window: 6,
            cache_ttl_secs: 15 * 60,
            fetch_timeout_ms: 9_000,
            watchdog_grace_ms: 1_500,
        }
    }
}

/// Thresholds of the deload analyzer. Treated as tunable, not as training law.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct DeloadSettings {
    pub recent_window: usize,
    pub regression_threshold: f64,
    pub stagnation_threshold: f64,
    pub reduction_overtraining: f64,
    pub reduction_stagnation: f64,
    pub reduction_stable: f64,
    pub min_1rm_factor: f64,
    pub round_step: f64,
    pub manual_reduction_min: f64,
    pub manual_reduction_max: f64,
    pub history_min: usize,
    pub default_suggested_rpe: f64,
}

impl Default for DeloadSettings {
    fn default() -> Self {
        Self {
            recent_window: 3,
            regression_threshold: 0.03,
            stagnation_threshold: 0.02,
            reduction_overtraining: 0.22,
            reduction_stagnation: 0.15,
            reduction_stable: 0.12,
            min_1rm_factor: 0.5,
            round_step: 0.5,
            manual_reduction_min: 0.05,
            manual_reduction_max: 0.40,
            history_min: 4,
            default_suggested_rpe: 8.0,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct OfflineSettings {
    pub max_attempts: u32,
    pub backoff_base_secs: i64,
}

impl Default for OfflineSettings {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            backoff_base_secs: 60,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)] // Ensure defaults are used if fields are missing
pub struct Config {
    pub units: Units,
    pub server_url: Option<String>,
    pub api_token: Option<String>,
    pub prompt_post_workout_checkin: bool, // Default is true
    pub min_full_session_minutes: u32,     // Default 30
    pub limits: SessionLimits,
    pub history: HistorySettings,
    pub deload: DeloadSettings,
    pub offline: OfflineSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            units: Units::default(),
            server_url: None,
            api_token: None,
            prompt_post_workout_checkin: true,
            min_full_session_minutes: 30,
            limits: SessionLimits::default(),
            history: HistorySettings::default(),
            deload: DeloadSettings::default(),
            offline: OfflineSettings::default(),
        }
    }
}

impl Config {
    /// Returns the configured server URL or explains how to set it.
    /// # Errors
    /// Returns `ConfigError::ServerNotSet` if no URL is configured.
    pub fn require_server_url(&self, config_path: &Path) -> Result<&str, ConfigError> {
        self.server_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .ok_or_else(|| ConfigError::ServerNotSet(config_path.to_path_buf()))
    }

    /// Sets the remote server and optional API token.
    /// # Errors
    /// Returns `ConfigError::InvalidServerUrl` unless the URL is http(s).
    pub fn set_server(&mut self, url: &str, token: Option<String>) -> Result<(), ConfigError> {
        let trimmed = url.trim().trim_end_matches('/');
        if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
            return Err(ConfigError::InvalidServerUrl(url.to_string()));
        }
        self.server_url = Some(trimmed.to_string());
        if token.is_some() {
            self.api_token = token;
        }
        Ok(())
    }
}

/// Determines the path to the configuration file.
/// Exposed at crate root as `get_config_path_util`
pub fn get_config_path() -> Result<PathBuf, ConfigError> {
    let config_dir_override = std::env::var(CONFIG_ENV_VAR).ok();

    let config_dir_path = if let Some(path_str) = config_dir_override {
        let path = PathBuf::from(path_str);
        if !path.is_dir() {
            tracing::warn!(
                "Environment variable {} points to '{}', which is not a directory. Trying to create it.",
                CONFIG_ENV_VAR,
                path.display()
            );
            fs::create_dir_all(&path)?;
        }
        path
    } else {
        let base_config_dir = dirs::config_dir().ok_or(ConfigError::CannotDetermineConfigDir)?;
        base_config_dir.join(APP_CONFIG_DIR)
    };

    if !config_dir_path.exists() {
        fs::create_dir_all(&config_dir_path)?;
    }

    Ok(config_dir_path.join(CONFIG_FILE_NAME))
}

/// Loads the configuration from the TOML file at the given path.
/// Writes a default file first if none exists.
pub fn load_config(config_path: &Path) -> Result<Config, ConfigError> {
    if config_path.exists() {
        let config_content = fs::read_to_string(config_path)?;
        // serde(default) fills in anything missing
        let config: Config = toml::from_str(&config_content).map_err(ConfigError::TomlParse)?;
        Ok(config)
    } else {
        let default_config = Config::default();
        save_config(config_path, &default_config)?;
        Ok(default_config)
    }
}

/// Saves the configuration to the TOML file.
pub fn save_config(config_path: &Path, config: &Config) -> Result<(), ConfigError> {
    if let Some(parent_dir) = config_path.parent() {
        if !parent_dir.exists() {
            fs::create_dir_all(parent_dir)?;
        }
    }
    let config_content = toml::to_string_pretty(config).map_err(ConfigError::TomlSerialize)?;
    fs::write(config_path, config_content)?;
    Ok(())
}
