//! skyctl - command-line client for the cloud platform
//!
//! Only the plugin management commands are implemented here.

use anyhow::Context;
use clap::{Parser, Subcommand};
use skyctl::config::{self, AppConfig};
use skyctl::install::{InstallError, InstallRequest, Installer};
use skyctl::registry::{PluginRegistry, RegistryLock};
use skyctl::ui::TerminalUi;
use tracing::{debug, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "skyctl")]
#[command(author, version, about = "Command-line client for the cloud platform")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Install CLI plugin
    #[command(
        after_help = "EXAMPLES:\n   skyctl install-plugin ~/Downloads/plugin-foobar\n   skyctl install-plugin https://example.com/plugin-foobar_linux_amd64\n   skyctl install-plugin -r My-Repo plugin-echo"
    )]
    InstallPlugin {
        /// Local path to the plugin, a URL, or a plugin name with -r
        #[arg(value_name = "PATH|URL|NAME")]
        plugin: String,

        /// Name of a registered repository where the plugin is located
        #[arg(short = 'r', long = "repo", value_name = "REPO_NAME")]
        repository: Option<String>,

        /// Force install of plugin without confirmation
        #[arg(short, long)]
        force: bool,
    },

    /// Uninstall CLI plugin
    UninstallPlugin {
        /// Name of the installed plugin
        name: String,
    },

    /// List commands of installed plugins
    Plugins,

    /// List all added plugin repositories
    ListPluginRepos,

    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging; stdout is reserved for command output
    let filter = if cli.verbose {
        "skyctl=debug"
    } else {
        "skyctl=warn"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match cli.command {
        Commands::InstallPlugin {
            plugin,
            repository,
            force,
        } => cmd_install_plugin(plugin, repository, force).await,
        Commands::UninstallPlugin { name } => cmd_uninstall_plugin(&name),
        Commands::Plugins => cmd_plugins(),
        Commands::ListPluginRepos => cmd_list_plugin_repos(),
        Commands::Config => cmd_config(),
    }
}

fn load_config() -> anyhow::Result<AppConfig> {
    let config = config::load_config().context("Failed to load configuration")?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;
    debug!(home = ?config.plugins.home, "Loaded configuration");
    Ok(config)
}

/// Install a plugin from a path, URL or repository
async fn cmd_install_plugin(
    plugin: String,
    repository: Option<String>,
    force: bool,
) -> anyhow::Result<()> {
    let config = load_config()?;
    let _lock = RegistryLock::acquire(config.plugins.lock_path())?;
    let mut registry = PluginRegistry::load(config.plugins.registry_path())?;
    let installer = Installer::new(&config)?;
    let ui = TerminalUi::new();

    let mut request = InstallRequest::new(plugin).forced(force);
    request.repository = repository;

    // Dropping the install future on Ctrl-C removes the staged binary and
    // kills a running plugin
    let result = tokio::select! {
        result = installer.install(&request, &mut registry, &ui) => result,
        Ok(()) = tokio::signal::ctrl_c() => {
            warn!("Interrupted");
            Err(InstallError::Cancelled)
        }
    };

    match result {
        Ok(_) => Ok(()),
        Err(e) if e.is_cancelled() => {
            println!("{}", e);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Remove an installed plugin
fn cmd_uninstall_plugin(name: &str) -> anyhow::Result<()> {
    let config = load_config()?;
    let _lock = RegistryLock::acquire(config.plugins.lock_path())?;
    let mut registry = PluginRegistry::load(config.plugins.registry_path())?;
    let installer = Installer::new(&config)?;

    installer.uninstall(name, &mut registry, &TerminalUi::new())?;
    Ok(())
}

/// Print installed plugins with their commands
fn cmd_plugins() -> anyhow::Result<()> {
    let config = load_config()?;
    let registry = PluginRegistry::load(config.plugins.registry_path())?;

    if registry.is_empty() {
        println!("No plugins installed.");
        return Ok(());
    }

    let mut rows = vec![[
        "plugin".to_string(),
        "version".to_string(),
        "command name".to_string(),
        "command help".to_string(),
    ]];
    for (name, entry) in registry.entries() {
        for command in &entry.metadata.commands {
            let invoked_as = match command.alias.as_deref().filter(|a| !a.is_empty()) {
                Some(alias) => format!("{}, {}", command.name, alias),
                None => command.name.clone(),
            };
            rows.push([
                name.to_string(),
                entry.metadata.version.to_string(),
                invoked_as,
                command.help_text.clone(),
            ]);
        }
    }
    print_table(&rows);
    Ok(())
}

/// Print configured plugin repositories
fn cmd_list_plugin_repos() -> anyhow::Result<()> {
    let config = load_config()?;
    if config.repositories.is_empty() {
        println!("No plugin repositories added.");
        return Ok(());
    }

    let mut rows = vec![["repo name".to_string(), "url".to_string()]];
    for repo in &config.repositories {
        rows.push([repo.name.clone(), repo.url.clone()]);
    }
    print_table(&rows);
    Ok(())
}

/// Print the effective configuration
fn cmd_config() -> anyhow::Result<()> {
    let config = load_config()?;
    print!("{}", serde_yaml::to_string(&config)?);
    Ok(())
}

fn print_table<const N: usize>(rows: &[[String; N]]) {
    let mut widths = [0usize; N];
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }
    for row in rows {
        let line: Vec<String> = row
            .iter()
            .zip(widths)
            .map(|(cell, width)| format!("{:<width$}", cell, width = width))
            .collect();
        println!("{}", line.join("   ").trim_end());
    }
}
