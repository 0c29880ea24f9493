//! Property tests for the installed plugin registry
//!
//! Random sequences of installs, forced reinstalls and uninstalls must never
//! leave two plugins (or a plugin and a built-in) answering to the same
//! command name.

use async_trait::async_trait;
use proptest::prelude::*;
use skyctl::builtin::is_core_command;
use skyctl::config::{AppConfig, PluginsConfig};
use skyctl::install::{InstallRequest, Installer, MetadataProbe};
use skyctl::plugins::{CommandSpec, PluginMetadata, PluginVersion};
use skyctl::registry::PluginRegistry;
use skyctl::rpc::BridgeError;
use skyctl::ui::InstallUi;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

const PLUGIN_NAMES: &[&str] = &["echo", "echo2", "greeter"];
const COMMAND_POOL: &[&str] = &["say-hi", "hi", "say-bye", "wave", "apps", "push", "shout"];

/// Reads metadata from the staged file instead of running it
struct FileProbe;

#[async_trait]
impl MetadataProbe for FileProbe {
    async fn probe(&self, executable: &Path) -> Result<PluginMetadata, BridgeError> {
        let raw =
            fs::read_to_string(executable).map_err(|e| BridgeError::Launch(e.to_string()))?;
        serde_json::from_str(&raw).map_err(|e| BridgeError::Communication(e.to_string()))
    }
}

struct Silent;

#[async_trait]
impl InstallUi for Silent {
    fn warn(&self, _: &str) {}
    fn say(&self, _: &str) {}
    fn ok(&self, _: &str) {}
    async fn confirm(&self, _: &str) -> std::io::Result<bool> {
        Ok(true)
    }
}

#[derive(Debug, Clone)]
enum Op {
    Install {
        plugin: usize,
        commands: Vec<(usize, Option<usize>)>,
        force: bool,
    },
    Uninstall {
        plugin: usize,
    },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    let command = (
        0..COMMAND_POOL.len(),
        proptest::option::of(0..COMMAND_POOL.len()),
    );
    prop_oneof![
        3 => (
            0..PLUGIN_NAMES.len(),
            proptest::collection::vec(command, 0..4),
            any::<bool>()
        )
            .prop_map(|(plugin, commands, force)| Op::Install {
                plugin,
                commands,
                force
            }),
        1 => (0..PLUGIN_NAMES.len()).prop_map(|plugin| Op::Uninstall { plugin }),
    ]
}

fn assert_no_collisions(registry: &PluginRegistry) {
    let mut owners: HashMap<&str, &str> = HashMap::new();
    for (name, entry) in registry.entries() {
        assert_eq!(name, entry.metadata.name);
        assert!(!is_core_command(name), "plugin named after core command {}", name);
        assert!(entry.location.exists(), "missing binary for {}", name);
        for command in entry.metadata.invocable_names() {
            assert!(!is_core_command(command), "{} shadows a core command", command);
            if let Some(previous) = owners.insert(command, name) {
                panic!("{} provided by both {} and {}", command, previous, name);
            }
        }
    }
}

fn run(ops: Vec<Op>) {
    let dir = TempDir::new().unwrap();
    let config = AppConfig {
        plugins: PluginsConfig::with_home(dir.path().join("home")),
        ..AppConfig::default()
    };
    let installer = Installer::new(&config)
        .unwrap()
        .with_probe(Arc::new(FileProbe));
    let mut registry = PluginRegistry::load(config.plugins.registry_path()).unwrap();

    for (step, op) in ops.into_iter().enumerate() {
        match op {
            Op::Install {
                plugin,
                commands,
                force,
            } => {
                let metadata = PluginMetadata {
                    name: PLUGIN_NAMES[plugin].to_string(),
                    version: PluginVersion::new(step as u32, 0, 0),
                    commands: commands
                        .iter()
                        .map(|(name, alias)| {
                            let spec = CommandSpec::new(COMMAND_POOL[*name], "");
                            match alias {
                                Some(alias) => spec.with_alias(COMMAND_POOL[*alias]),
                                None => spec,
                            }
                        })
                        .collect(),
                };
                let source = dir.path().join(format!("candidate-{}", step));
                fs::write(&source, serde_json::to_string(&metadata).unwrap()).unwrap();

                let was_installed = registry.get(&metadata.name).cloned();
                let old_bytes = was_installed
                    .as_ref()
                    .map(|entry| fs::read(&entry.location).unwrap());
                let request = InstallRequest::new(source.to_str().unwrap()).forced(force);
                let result =
                    tokio_test::block_on(installer.install(&request, &mut registry, &Silent));

                if result.is_err() {
                    // A rejected non-forced install leaves the old entry as it was
                    if !force {
                        assert_eq!(registry.get(&metadata.name).cloned(), was_installed);
                        if let Some(entry) = &was_installed {
                            assert_eq!(fs::read(&entry.location).ok(), old_bytes);
                        }
                    }
                } else {
                    assert_eq!(
                        registry.get(&metadata.name).map(|e| &e.metadata),
                        Some(&metadata)
                    );
                    assert!(force || was_installed.is_none());
                }
            }
            Op::Uninstall { plugin } => {
                let _ = installer.uninstall(PLUGIN_NAMES[plugin], &mut registry, &Silent);
                assert!(!registry.has(PLUGIN_NAMES[plugin]));
            }
        }

        assert_no_collisions(&registry);
        let on_disk = PluginRegistry::load(config.plugins.registry_path()).unwrap();
        assert_eq!(on_disk.len(), registry.len());
        let staged = fs::read_dir(config.plugins.staging_dir())
            .map(|entries| entries.count())
            .unwrap_or(0);
        assert_eq!(staged, 0, "staged file left behind at step {}", step);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_registry_never_holds_colliding_commands(
        ops in proptest::collection::vec(op_strategy(), 1..12)
    ) {
        run(ops);
    }
}

#[test]
fn test_echo_then_echo2_sequence() {
    run(vec![
        Op::Install {
            plugin: 0,
            commands: vec![(0, None)],
            force: false,
        },
        Op::Install {
            plugin: 1,
            commands: vec![(0, None)],
            force: false,
        },
        Op::Install {
            plugin: 0,
            commands: vec![(2, Some(3))],
            force: true,
        },
        Op::Install {
            plugin: 1,
            commands: vec![(0, None)],
            force: false,
        },
        Op::Uninstall { plugin: 0 },
    ]);
}
