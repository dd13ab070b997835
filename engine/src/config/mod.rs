//! Configuration management
//!
//! This module handles loading, validation, and management of the Atrium configuration.
//! Configuration is stored in TOML format at ~/.atrium/config.toml.
//!
//! # Configuration Sections
//!
//! - **core**: Log level, data directory, application root
//! - **assistants**: Cache capacity, default connector, system agent ids
//! - **connectors**: Named model endpoints
//! - **search**: Global search defaults merged under each assistant's own block
//! - **sandbox**: Container runtime used for sandboxed assistants (optional)
//! - **storage**: SQLite store location (optional)
//!
//! # Path Expansion
//!
//! `~` is expanded to the user's home directory for `data_dir`, `app_root`
//! and `storage.sqlite`. Missing directories are created.
//!
//! # Examples
//!
//! ```no_run
//! use atrium_engine::config::Config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_or_create()?;
//!
//! println!("App root: {:?}", config.core.app_root);
//! println!("Cache capacity: {}", config.assistants.cache_capacity);
//! # Ok(())
//! # }
//! ```

use crate::search::SearchConfig;
use sdk::errors::EngineError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Core engine settings
    pub core: CoreConfig,

    /// Assistant loading and caching
    #[serde(default)]
    pub assistants: AssistantsConfig,

    /// Named connectors
    #[serde(default)]
    pub connectors: BTreeMap<String, ConnectorConfig>,

    /// Global search defaults
    #[serde(default)]
    pub search: SearchConfig,

    /// Sandbox runtime
    #[serde(default)]
    pub sandbox: SandboxSettings,

    /// Persistence
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Core engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Data directory path (supports ~ expansion)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Directory that holds `assistants/` (supports ~ expansion)
    #[serde(default = "default_app_root")]
    pub app_root: PathBuf,
}

/// Assistant loading configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantsConfig {
    /// Maximum number of live assistants kept in memory
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    /// Connector used by assistants that do not name one
    #[serde(default)]
    pub default_connector: Option<String>,

    /// Assistant consulted to decide whether a turn needs a search
    #[serde(default = "default_needsearch_agent")]
    pub needsearch_agent: String,

    /// Assistant used for keyword extraction
    #[serde(default = "default_keyword_agent")]
    pub keyword_agent: String,
}

impl Default for AssistantsConfig {
    fn default() -> Self {
        Self {
            cache_capacity: default_cache_capacity(),
            default_connector: None,
            needsearch_agent: default_needsearch_agent(),
            keyword_agent: default_keyword_agent(),
        }
    }
}

/// A model endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    /// Protocol family (only `openai` is built in)
    #[serde(default = "default_connector_kind")]
    pub kind: String,

    /// Base URL for the API
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,

    /// Model name
    pub model: String,

    /// API key, or `$ENV.NAME` to read it from the environment
    #[serde(default)]
    pub api_key: Option<String>,

    /// Extra request options passed through to the API
    #[serde(default)]
    pub options: Map<String, Value>,
}

/// Container runtime for sandboxed assistants
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSettings {
    /// Enable the sandbox manager
    #[serde(default)]
    pub enabled: bool,

    /// Container CLI (docker, podman)
    #[serde(default = "default_sandbox_runtime")]
    pub runtime: String,

    /// Default image when an assistant does not set one
    #[serde(default = "default_sandbox_image")]
    pub image: String,

    /// Working directory inside the container
    #[serde(default = "default_container_workdir")]
    pub container_workdir: String,

    /// Host socket the MCP bridge connects to
    #[serde(default = "default_ipc_socket")]
    pub ipc_socket: String,

    /// Default memory limit (e.g. "2g")
    #[serde(default)]
    pub max_memory: Option<String>,

    /// Default CPU limit
    #[serde(default)]
    pub max_cpu: Option<f64>,

    /// Default execution timeout (e.g. "5m")
    #[serde(default = "default_sandbox_timeout")]
    pub timeout: String,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            runtime: default_sandbox_runtime(),
            image: default_sandbox_image(),
            container_workdir: default_container_workdir(),
            ipc_socket: default_ipc_socket(),
            max_memory: None,
            max_cpu: None,
            timeout: default_sandbox_timeout(),
        }
    }
}

/// Persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageConfig {
    /// SQLite database file (supports ~ expansion)
    #[serde(default)]
    pub sqlite: Option<PathBuf>,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("~/.atrium")
}

fn default_app_root() -> PathBuf {
    PathBuf::from("~/.atrium/app")
}

fn default_cache_capacity() -> usize {
    200
}

fn default_needsearch_agent() -> String {
    "__system.needsearch".to_string()
}

fn default_keyword_agent() -> String {
    "__system.keyword".to_string()
}

fn default_connector_kind() -> String {
    "openai".to_string()
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_sandbox_runtime() -> String {
    "docker".to_string()
}

fn default_sandbox_image() -> String {
    "atrium/sandbox-claude:latest".to_string()
}

fn default_container_workdir() -> String {
    "/workspace".to_string()
}

fn default_ipc_socket() -> String {
    "/tmp/yao.sock".to_string()
}

fn default_sandbox_timeout() -> String {
    "5m".to_string()
}

impl Config {
    /// Load configuration from the default location (~/.atrium/config.toml)
    ///
    /// If the configuration file doesn't exist, creates a default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration file cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    pub fn load_or_create() -> Result<Self, EngineError> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from_path(&config_path)
        } else {
            Self::create_default(&config_path)
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, EngineError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml_str(&contents)
    }

    /// Parse and validate configuration text
    pub fn from_toml_str(contents: &str) -> Result<Self, EngineError> {
        let mut config: Config = toml::from_str(contents)
            .map_err(|e| EngineError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Create default configuration and save to path
    fn create_default(path: &Path) -> Result<Self, EngineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                EngineError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let mut config = Self::default_config();
        config.validate()?;

        let toml_string = toml::to_string_pretty(&config)
            .map_err(|e| EngineError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| EngineError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(config)
    }

    /// Get the default configuration file path (~/.atrium/config.toml)
    pub fn default_config_path() -> Result<PathBuf, EngineError> {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(".atrium").join("config.toml"))
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self {
            core: CoreConfig {
                log_level: default_log_level(),
                data_dir: default_data_dir(),
                app_root: default_app_root(),
            },
            assistants: AssistantsConfig::default(),
            connectors: BTreeMap::new(),
            search: SearchConfig::default(),
            sandbox: SandboxSettings::default(),
            storage: StorageConfig::default(),
        }
    }

    /// Validate the configuration and expand its paths
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Config` if:
    /// - The log level is unknown
    /// - The cache capacity is zero
    /// - A connector uses an unsupported kind
    /// - The default connector is not defined
    /// - The sandbox timeout cannot be parsed
    /// - A directory cannot be created
    pub fn validate(&mut self) -> Result<(), EngineError> {
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.core.log_level.as_str()) {
            return Err(EngineError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.core.log_level,
                valid_log_levels.join(", ")
            )));
        }

        if self.assistants.cache_capacity == 0 {
            return Err(EngineError::Config(
                "assistants.cache_capacity must be greater than 0".to_string(),
            ));
        }

        for (id, connector) in &self.connectors {
            if connector.kind != "openai" {
                return Err(EngineError::Config(format!(
                    "Connector '{}' has unsupported kind '{}'",
                    id, connector.kind
                )));
            }
            if connector.model.trim().is_empty() {
                return Err(EngineError::Config(format!(
                    "Connector '{}' must set a model",
                    id
                )));
            }
        }

        if let Some(default) = &self.assistants.default_connector {
            if !self.connectors.contains_key(default) {
                return Err(EngineError::Config(format!(
                    "Default connector '{}' is not defined under [connectors]",
                    default
                )));
            }
        }

        parse_duration(&self.sandbox.timeout).map_err(|e| {
            EngineError::Config(format!("Invalid sandbox timeout: {}", e))
        })?;

        self.core.data_dir = expand_path(&self.core.data_dir)?;
        create_dir(&self.core.data_dir)?;

        self.core.app_root = expand_path(&self.core.app_root)?;
        create_dir(&self.core.app_root)?;

        if let Some(sqlite) = &self.storage.sqlite {
            self.storage.sqlite = Some(expand_path(sqlite)?);
        }

        Ok(())
    }
}

/// Resolve a `$ENV.NAME` reference
///
/// Returns `None` when `value` is not a reference or the variable is unset.
pub fn resolve_env_ref(value: &str) -> Option<String> {
    let name = value.strip_prefix("$ENV.")?;
    if name.is_empty() {
        return None;
    }
    std::env::var(name).ok()
}

/// Parse a duration such as `300ms`, `45s`, `5m` or `1h30m`
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| format!("missing unit in duration '{}'", input))?;
        if digits_end == 0 {
            return Err(format!("invalid duration '{}'", input));
        }
        let value: f64 = rest[..digits_end]
            .parse()
            .map_err(|_| format!("invalid number in duration '{}'", input))?;
        rest = &rest[digits_end..];

        let unit_end = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit = &rest[..unit_end];
        rest = &rest[unit_end..];

        let seconds = match unit {
            "ms" => value / 1000.0,
            "s" => value,
            "m" => value * 60.0,
            "h" => value * 3600.0,
            _ => return Err(format!("unknown unit '{}' in duration '{}'", unit, input)),
        };
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(format!("duration '{}' is out of range", input));
        }
        let part = Duration::try_from_secs_f64(seconds)
            .map_err(|_| format!("duration '{}' is out of range", input))?;
        total = total
            .checked_add(part)
            .ok_or_else(|| format!("duration '{}' is out of range", input))?;
    }

    Ok(total)
}

/// Expand ~ in path to user's home directory
pub fn expand_path(path: &Path) -> Result<PathBuf, EngineError> {
    let path_str = path
        .to_str()
        .ok_or_else(|| EngineError::Config("Invalid UTF-8 in path".to_string()))?;

    if let Some(rest) = path_str.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(rest))
    } else if path_str == "~" {
        dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))
    } else {
        Ok(path.to_path_buf())
    }
}

fn create_dir(path: &Path) -> Result<(), EngineError> {
    if !path.exists() {
        fs::create_dir_all(path).map_err(|e| {
            EngineError::Config(format!("Failed to create directory {:?}: {}", path, e))
        })?;
    }
    Ok(())
}
