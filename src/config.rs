//! Controller configuration
//!
//! Built once at startup from environment variables (and an optional plugin
//! file) and handed to the controllers through their `Context`.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_RESYNC_SECONDS: u64 = 300;
pub const DEFAULT_API_TIMEOUT_SECONDS: u64 = 30;
pub const DEFAULT_PLUGIN_TIMEOUT_SECONDS: u64 = 30;
pub const DEFAULT_PLUGIN_DIR: &str = "/home/rollgate/plugin-bin";
pub const DEFAULT_HEALTH_PORT: u16 = 8080;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },

    #[error("failed to read plugin file {path}: {source}")]
    PluginFileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse plugin file: {0}")]
    PluginFileParse(#[from] serde_yaml::Error),

    #[error("plugin {0} not configured")]
    PluginNotConfigured(String),

    #[error("plugin {0} configured more than once")]
    DuplicatePlugin(String),
}

/// One entry of the `trafficRouterPlugins` list
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PluginEntry {
    /// Plugin name as referenced from `trafficRouting.plugins`
    pub name: String,

    /// Where the binary comes from (file path or URL); informational for the
    /// controller, which only executes binaries from the plugin directory
    pub location: String,

    /// Expected SHA-256 of the binary, hex encoded
    #[serde(default)]
    pub sha256: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PluginFile {
    #[serde(rename = "trafficRouterPlugins", default)]
    traffic_router_plugins: Vec<PluginEntry>,
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Periodic resync; also the fallback requeue interval
    pub resync_period: Duration,
    /// Bound on every cluster API call
    pub api_timeout: Duration,
    /// Bound on every plugin call, including the handshake
    pub plugin_timeout: Duration,
    pub plugin_dir: PathBuf,
    pub plugins: Vec<PluginEntry>,
    /// Default weight verification for in-process routers
    pub verify_weight: bool,
    pub health_port: u16,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            resync_period: Duration::from_secs(DEFAULT_RESYNC_SECONDS),
            api_timeout: Duration::from_secs(DEFAULT_API_TIMEOUT_SECONDS),
            plugin_timeout: Duration::from_secs(DEFAULT_PLUGIN_TIMEOUT_SECONDS),
            plugin_dir: PathBuf::from(DEFAULT_PLUGIN_DIR),
            plugins: Vec::new(),
            verify_weight: false,
            health_port: DEFAULT_HEALTH_PORT,
        }
    }
}

impl ControllerConfig {
    /// Load configuration from `ROLLGATE_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = ControllerConfig::default();

        if let Some(secs) = parse_var::<u64, _>(&lookup, "ROLLGATE_RESYNC_SECONDS")? {
            config.resync_period = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "ROLLGATE_API_TIMEOUT_SECONDS")? {
            config.api_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "ROLLGATE_PLUGIN_TIMEOUT_SECONDS")? {
            config.plugin_timeout = Duration::from_secs(secs);
        }
        if let Some(dir) = lookup("ROLLGATE_PLUGIN_DIR").filter(|d| !d.is_empty()) {
            config.plugin_dir = PathBuf::from(dir);
        }
        if let Some(verify) = parse_var::<bool, _>(&lookup, "ROLLGATE_VERIFY_WEIGHT")? {
            config.verify_weight = verify;
        }
        if let Some(port) = parse_var::<u16, _>(&lookup, "ROLLGATE_HEALTH_PORT")? {
            config.health_port = port;
        }
        if let Some(path) = lookup("ROLLGATE_PLUGINS_FILE").filter(|p| !p.is_empty()) {
            config.plugins = load_plugin_file(Path::new(&path))?;
        }

        Ok(config)
    }

    /// Resolve the executable path of a configured plugin
    pub fn plugin_location(&self, name: &str) -> Result<PathBuf, ConfigError> {
        self.plugins
            .iter()
            .find(|p| p.name == name)
            .map(|p| self.plugin_dir.join(&p.name))
            .ok_or_else(|| ConfigError::PluginNotConfigured(name.to_string()))
    }

    pub fn plugin(&self, name: &str) -> Option<&PluginEntry> {
        self.plugins.iter().find(|p| p.name == name)
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(value) if value.trim().is_empty() => Ok(None),
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value,
            }),
    }
}

fn load_plugin_file(path: &Path) -> Result<Vec<PluginEntry>, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::PluginFileRead {
        path: path.to_path_buf(),
        source,
    })?;
    parse_plugin_file(&raw)
}

/// Parse the YAML plugin list, rejecting duplicate names
pub fn parse_plugin_file(raw: &str) -> Result<Vec<PluginEntry>, ConfigError> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    let file: PluginFile = serde_yaml::from_str(raw)?;
    let mut seen = std::collections::HashSet::new();
    for entry in &file.traffic_router_plugins {
        if !seen.insert(entry.name.as_str()) {
            return Err(ConfigError::DuplicatePlugin(entry.name.clone()));
        }
    }
    Ok(file.traffic_router_plugins)
}
