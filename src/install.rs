//! Plugin installation.
//!
//! An install attempt moves through
//! `Resolving → AwaitingConfirmation → Staging → Validating → [Uninstalling] → Committing → Done`.
//! The candidate binary never leaves the staging area until validation has
//! passed. The staged file and the plugin process are owned values, so
//! returning early (or dropping the future on Ctrl-C) releases both.

use async_trait::async_trait;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::builtin::CORE_COMMANDS;
use crate::config::{AppConfig, PluginsConfig, RepositoryConfig};
use crate::plugins::{PluginMetadata, PluginVersion};
use crate::registry::{PluginRegistry, RegistryError};
use crate::repository::{verify_checksum, LocatedBinary, RepositoryClient};
use crate::rpc::{BridgeConfig, BridgeError, BridgeHandle};
use crate::source::{self, Fetcher, PluginSource, SourceError};
use crate::staging::{StagedBinary, Stager, StagingError};
use crate::ui::InstallUi;
use crate::validator::{self, ValidationError, Verdict};

#[derive(Debug, Error)]
pub enum InstallError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Staging(#[from] StagingError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Plugin {name} {version} could not be installed. A plugin with that name is already installed (version {installed}).\nTIP: Use 'skyctl install-plugin {input} -f' to force a reinstall.")]
    AlreadyInstalled {
        name: String,
        version: PluginVersion,
        installed: PluginVersion,
        /// Path, URL or name as the user typed it
        input: String,
    },

    #[error("Plugin {0} does not exist.")]
    NotInstalled(String),

    #[error("Could not read confirmation: {0}")]
    Prompt(std::io::Error),

    #[error("Plugin installation cancelled.")]
    Cancelled,
}

impl InstallError {
    /// The user declined; not a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Obtains a candidate plugin's self-description
#[async_trait]
pub trait MetadataProbe: Send + Sync {
    async fn probe(&self, executable: &Path) -> Result<PluginMetadata, BridgeError>;
}

/// Launches the plugin and asks it over the RPC bridge
#[derive(Debug, Clone, Default)]
pub struct RpcProbe {
    config: BridgeConfig,
}

impl RpcProbe {
    pub fn new(config: BridgeConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl MetadataProbe for RpcProbe {
    async fn probe(&self, executable: &Path) -> Result<PluginMetadata, BridgeError> {
        let mut handle = BridgeHandle::start(executable, self.config).await?;
        let metadata = handle.get_metadata().await;
        handle.close().await;
        metadata
    }
}

/// Stage of an install attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallState {
    Resolving,
    AwaitingConfirmation,
    Staging,
    Validating,
    Uninstalling,
    Committing,
    Done,
}

impl fmt::Display for InstallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Resolving => "resolving",
            Self::AwaitingConfirmation => "awaiting-confirmation",
            Self::Staging => "staging",
            Self::Validating => "validating",
            Self::Uninstalling => "uninstalling",
            Self::Committing => "committing",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

/// What the user asked to install
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallRequest {
    /// Path, URL or plugin name as typed
    pub input: String,
    /// `-r`: repository to look the plugin up in
    pub repository: Option<String>,
    /// `-f`: skip the prompt and replace an installed plugin of the same name
    pub force: bool,
}

impl InstallRequest {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            repository: None,
            force: false,
        }
    }

    pub fn with_repository(mut self, repository: impl Into<String>) -> Self {
        self.repository = Some(repository.into());
        self
    }

    pub fn forced(mut self, force: bool) -> Self {
        self.force = force;
        self
    }
}

/// A successfully installed plugin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOutcome {
    pub name: String,
    pub version: PluginVersion,
    pub location: PathBuf,
    /// Version that was replaced by a forced reinstall
    pub replaced: Option<PluginVersion>,
}

/// Per-run bookkeeping
#[derive(Debug)]
struct InstallAttempt {
    state: InstallState,
    source: Option<PluginSource>,
}

impl InstallAttempt {
    fn new() -> Self {
        Self {
            state: InstallState::Resolving,
            source: None,
        }
    }

    fn enter(&mut self, state: InstallState) {
        debug!(from = %self.state, to = %state, source = ?self.source, "Install state");
        self.state = state;
    }
}

/// Runs install and uninstall operations against one plugin home
pub struct Installer {
    plugins: PluginsConfig,
    repositories: Vec<RepositoryConfig>,
    stager: Stager,
    fetcher: Fetcher,
    repository_client: RepositoryClient,
    probe: Arc<dyn MetadataProbe>,
    builtins: &'static [&'static str],
}

impl Installer {
    pub fn new(config: &AppConfig) -> Result<Self, InstallError> {
        let fetcher = Fetcher::new(config.plugins.fetch_timeout())?;
        let repository_client = RepositoryClient::new(fetcher.client().clone());
        Ok(Self {
            plugins: config.plugins.clone(),
            repositories: config.repositories.clone(),
            stager: Stager::new(config.plugins.staging_dir()),
            fetcher,
            repository_client,
            probe: Arc::new(RpcProbe::new(config.plugins.bridge())),
            builtins: CORE_COMMANDS,
        })
    }

    /// Replace the metadata source (tests, alternative transports)
    pub fn with_probe(mut self, probe: Arc<dyn MetadataProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_repository_client(mut self, client: RepositoryClient) -> Self {
        self.repository_client = client;
        self
    }

    /// Install a plugin from a path, URL or repository.
    ///
    /// Nothing is committed unless every step succeeds. When a forced
    /// reinstall fails after the old plugin was removed, the plugin is left
    /// uninstalled.
    pub async fn install(
        &self,
        request: &InstallRequest,
        registry: &mut PluginRegistry,
        ui: &dyn InstallUi,
    ) -> Result<InstallOutcome, InstallError> {
        let mut attempt = InstallAttempt::new();

        let source = source::resolve(&request.input, request.repository.as_deref())?;
        let located = match &source {
            PluginSource::Repository { repository, plugin } => {
                ui.say(&format!("Looking up '{}' in the plugin repositories...", plugin));
                let found = self
                    .repository_client
                    .locate(&self.repositories, repository.as_deref(), plugin)
                    .await?;
                ui.say(&format!(
                    "Plugin {} {} found in: {}",
                    found.plugin, found.version, found.repository
                ));
                Some(found)
            }
            _ => None,
        };
        info!(source = %source, "Resolved plugin source");
        attempt.source = Some(source.clone());

        attempt.enter(InstallState::AwaitingConfirmation);
        self.confirm(ui, &source, request.force).await?;

        attempt.enter(InstallState::Staging);
        let staged = self.stage(&source, located.as_ref(), ui).await?;

        attempt.enter(InstallState::Validating);
        let metadata = self.probe.probe(staged.path()).await?;
        debug!(plugin = %metadata.name, version = %metadata.version, commands = metadata.commands.len(), "Plugin described itself");
        let verdict = validator::validate(&metadata, registry, self.builtins)?;

        let replaced = match verdict {
            Verdict::Fresh => None,
            Verdict::Reinstall { installed, .. } if !request.force => {
                return Err(InstallError::AlreadyInstalled {
                    name: metadata.name,
                    version: metadata.version,
                    installed,
                    input: request.input.clone(),
                });
            }
            Verdict::Reinstall { name, installed } => {
                attempt.enter(InstallState::Uninstalling);
                ui.say(&format!(
                    "Plugin {} {} is already installed. Uninstalling existing plugin...",
                    name, installed
                ));
                registry.remove(&name)?;
                ui.ok(&format!("Plugin {} successfully uninstalled.", name));
                Some(installed)
            }
        };

        attempt.enter(InstallState::Committing);
        ui.say(&format!("Installing plugin {}...", metadata.name));
        let location = self.commit(staged, &metadata, registry)?;

        attempt.enter(InstallState::Done);
        ui.ok(&format!(
            "Plugin {} {} successfully installed.",
            metadata.name, metadata.version
        ));

        Ok(InstallOutcome {
            name: metadata.name,
            version: metadata.version,
            location,
            replaced,
        })
    }

    /// Remove an installed plugin and its binary
    pub fn uninstall(
        &self,
        name: &str,
        registry: &mut PluginRegistry,
        ui: &dyn InstallUi,
    ) -> Result<PluginVersion, InstallError> {
        let Some(entry) = registry.get(name) else {
            return Err(InstallError::NotInstalled(name.to_string()));
        };
        let version = entry.metadata.version;

        ui.say(&format!("Uninstalling plugin {}...", name));
        registry.remove(name)?;
        ui.ok(&format!("Plugin {} {} successfully uninstalled.", name, version));
        Ok(version)
    }

    async fn confirm(
        &self,
        ui: &dyn InstallUi,
        source: &PluginSource,
        force: bool,
    ) -> Result<(), InstallError> {
        ui.warn("Attention: Plugins are binaries written by potentially untrusted authors.");
        ui.warn("Install and use plugins at your own risk.");
        if force {
            return Ok(());
        }

        let question = match source {
            PluginSource::Path(path) => {
                format!("Do you want to install the plugin {}?", path.display())
            }
            PluginSource::Url(url) => format!("Do you want to install the plugin from {}?", url),
            PluginSource::Repository { plugin, .. } => {
                format!("Do you want to install the plugin {}?", plugin)
            }
        };
        if ui.confirm(&question).await.map_err(InstallError::Prompt)? {
            Ok(())
        } else {
            info!("Installation declined");
            Err(InstallError::Cancelled)
        }
    }

    async fn stage(
        &self,
        source: &PluginSource,
        located: Option<&LocatedBinary>,
        ui: &dyn InstallUi,
    ) -> Result<StagedBinary, InstallError> {
        match (source, located) {
            (PluginSource::Path(path), _) => Ok(self.stager.stage_file(path)?),
            (PluginSource::Url(url), _) => {
                ui.say("Starting download of plugin binary from URL...");
                let (staged, bytes) = self
                    .fetcher
                    .fetch(url, &self.stager, &ui.download_progress())
                    .await?;
                ui.say(&format!("{} bytes downloaded...", bytes));
                Ok(staged)
            }
            (PluginSource::Repository { .. }, Some(found)) => {
                ui.say(&format!(
                    "Starting download of plugin binary from repository {}...",
                    found.repository
                ));
                let (staged, bytes) = self
                    .fetcher
                    .fetch(&found.url, &self.stager, &ui.download_progress())
                    .await?;
                ui.say(&format!("{} bytes downloaded...", bytes));
                if let Some(checksum) = &found.checksum {
                    verify_checksum(staged.path(), checksum)?;
                }
                Ok(staged)
            }
            (PluginSource::Repository { plugin, .. }, None) => {
                Err(SourceError::NotFound(plugin.clone()).into())
            }
        }
    }

    fn commit(
        &self,
        staged: StagedBinary,
        metadata: &PluginMetadata,
        registry: &mut PluginRegistry,
    ) -> Result<PathBuf, InstallError> {
        let dest = self.plugins.binary_path(&metadata.name);
        let location = staged.persist(&dest)?;

        if let Err(e) = registry.add(metadata.clone(), &location) {
            if let Err(cleanup) = fs::remove_file(&location) {
                warn!(path = ?location, error = %cleanup, "Could not remove uncommitted plugin binary");
            }
            return Err(e.into());
        }
        Ok(location)
    }
}
