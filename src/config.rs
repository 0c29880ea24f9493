//! Configuration loader.
//!
//! Loads configuration from:
//! 1. Default values
//! 2. `.skyctl/config.yaml` in project directory
//! 3. `~/.skyctl/config.yaml` in home directory
//! 4. Environment variables with `SKYCTL_` prefix (`__` separates nested keys)
//! 5. `SKYCTL_PLUGIN_HOME`, which relocates the whole plugin home

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::rpc::BridgeConfig;

/// Main configuration structure
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub plugins: PluginsConfig,
    /// Registered plugin repositories, searched in order
    #[serde(default)]
    pub repositories: Vec<RepositoryConfig>,
}

/// Plugin installation settings
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PluginsConfig {
    /// Plugin home; holds the registry, installed binaries and staging area
    #[serde(default = "default_plugin_home")]
    pub home: PathBuf,
    /// How long a freshly launched plugin has to print its handshake line
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    /// Upper bound for a single RPC call to the plugin
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
    /// Grace period between SIGTERM and SIGKILL when stopping a plugin
    #[serde(default = "default_kill_grace")]
    pub kill_grace_millis: u64,
    /// Overall timeout for downloading a plugin binary or repository index
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,
}

fn default_plugin_home() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".skyctl").join("plugins"))
        .unwrap_or_else(|| PathBuf::from(".skyctl/plugins"))
}

fn default_handshake_timeout() -> u64 {
    30
}

fn default_call_timeout() -> u64 {
    30
}

fn default_kill_grace() -> u64 {
    2000
}

fn default_fetch_timeout() -> u64 {
    300
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            home: default_plugin_home(),
            handshake_timeout_secs: default_handshake_timeout(),
            call_timeout_secs: default_call_timeout(),
            kill_grace_millis: default_kill_grace(),
            fetch_timeout_secs: default_fetch_timeout(),
        }
    }
}

impl PluginsConfig {
    /// Config rooted at `home` with default timeouts
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            ..Self::default()
        }
    }

    /// Registry document
    pub fn registry_path(&self) -> PathBuf {
        self.home.join("installed_plugins.json")
    }

    /// Lock file held for the duration of an install or uninstall
    pub fn lock_path(&self) -> PathBuf {
        self.home.join(".lock")
    }

    /// Directory holding installed plugin binaries
    pub fn bin_dir(&self) -> PathBuf {
        self.home.join("bin")
    }

    /// Private staging area for candidate binaries. Lives under the plugin
    /// home so that committing a staged binary is a same-filesystem rename.
    pub fn staging_dir(&self) -> PathBuf {
        self.home.join("staging")
    }

    /// Install location for the binary of plugin `name`
    pub fn binary_path(&self, name: &str) -> PathBuf {
        let file_name = if cfg!(windows) {
            format!("{}.exe", name)
        } else {
            name.to_string()
        };
        self.bin_dir().join(file_name)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    /// Timeouts for the RPC bridge
    pub fn bridge(&self) -> BridgeConfig {
        BridgeConfig {
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            call_timeout: Duration::from_secs(self.call_timeout_secs),
            kill_grace: Duration::from_millis(self.kill_grace_millis),
        }
    }
}

/// A named plugin repository
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct RepositoryConfig {
    pub name: String,
    /// Base URL; the index is served at `<url>/list`
    pub url: String,
}

impl AppConfig {
    /// Reject settings that would let an install block forever
    pub fn validate(&self) -> Result<(), String> {
        let plugins = &self.plugins;
        if plugins.handshake_timeout_secs == 0 {
            return Err("plugins.handshake_timeout_secs must be greater than 0".to_string());
        }
        if plugins.call_timeout_secs == 0 {
            return Err("plugins.call_timeout_secs must be greater than 0".to_string());
        }
        if plugins.fetch_timeout_secs == 0 {
            return Err("plugins.fetch_timeout_secs must be greater than 0".to_string());
        }
        let mut seen = std::collections::HashSet::new();
        for repo in &self.repositories {
            if repo.name.trim().is_empty() {
                return Err("repository name must not be empty".to_string());
            }
            if !seen.insert(repo.name.to_lowercase()) {
                return Err(format!("repository '{}' is configured twice", repo.name));
            }
            if url::Url::parse(&repo.url).is_err() {
                return Err(format!(
                    "repository '{}' has an invalid url: {}",
                    repo.name, repo.url
                ));
            }
        }
        Ok(())
    }
}

/// Load configuration from all sources
pub fn load_config() -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder();

    // Set defaults
    builder = builder
        .set_default(
            "plugins.home",
            default_plugin_home().to_string_lossy().to_string(),
        )?
        .set_default("plugins.handshake_timeout_secs", default_handshake_timeout())?
        .set_default("plugins.call_timeout_secs", default_call_timeout())?
        .set_default("plugins.kill_grace_millis", default_kill_grace())?
        .set_default("plugins.fetch_timeout_secs", default_fetch_timeout())?;

    // Load from project config file
    let project_config = PathBuf::from(".skyctl/config.yaml");
    if project_config.exists() {
        builder = builder.add_source(File::from(project_config).required(false));
    }

    // Load from home directory config file
    if let Some(home) = dirs::home_dir() {
        let home_config: PathBuf = home.join(".skyctl/config.yaml");
        if home_config.exists() {
            builder = builder.add_source(File::from(home_config).required(false));
        }
    }

    // e.g., SKYCTL_PLUGINS__CALL_TIMEOUT_SECS=60
    builder = builder.add_source(
        Environment::with_prefix("SKYCTL")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true),
    );

    if let Ok(home) = std::env::var("SKYCTL_PLUGIN_HOME") {
        builder = builder.set_override("plugins.home", home)?;
    }

    builder.build()?.try_deserialize()
}
