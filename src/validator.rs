//! Naming rules for candidate plugins.
//!
//! Runs after the plugin has described itself and before anything is
//! committed. Checks are applied in a fixed order and the first failure is
//! reported.

use std::collections::HashSet;
use thiserror::Error;

use crate::plugins::{PluginMetadata, PluginVersion};
use crate::registry::PluginRegistry;

/// Owner reported when a command clashes with a built-in
pub const CORE_OWNER: &str = "core";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Plugin reported an empty name")]
    EmptyName,

    #[error("Plugin name {0} is already used by a core command")]
    NameCollision(String),

    #[error("Plugin name {0:?} cannot be used as a file name")]
    InvalidName(String),

    #[error("Plugin declares a command with an empty name")]
    EmptyCommandName,

    #[error("Command `{command}` in the plugin being installed is {}. Rename the `{command}` command in the plugin being installed in order to enable its installation and use.", describe_owner(.with))]
    CommandCollision { command: String, with: String },

    #[error("Command `{command}` is declared more than once by the plugin being installed")]
    SelfCollision { command: String },
}

fn describe_owner(with: &str) -> String {
    if with == CORE_OWNER {
        "a native CLI command/alias".to_string()
    } else {
        format!("a command/alias in the `{}` plugin", with)
    }
}

/// Outcome of a successful validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// No plugin by this name is installed
    Fresh,
    /// A plugin by this name is installed under `name`; installing replaces it
    Reinstall {
        name: String,
        installed: PluginVersion,
    },
}

/// Check `metadata` against the built-in names and the installed plugins.
///
/// Commands owned by an installed plugin with the same name do not count as
/// collisions, since a reinstall replaces that plugin. Plugin names match
/// ignoring case.
pub fn validate(
    metadata: &PluginMetadata,
    registry: &PluginRegistry,
    builtins: &[&str],
) -> Result<Verdict, ValidationError> {
    let name = metadata.name.trim();
    if name.is_empty() {
        return Err(ValidationError::EmptyName);
    }
    if builtins.contains(&name) {
        return Err(ValidationError::NameCollision(name.to_string()));
    }
    if !is_file_name_safe(&metadata.name) {
        return Err(ValidationError::InvalidName(metadata.name.clone()));
    }
    if metadata
        .commands
        .iter()
        .any(|cmd| cmd.name.trim().is_empty())
    {
        return Err(ValidationError::EmptyCommandName);
    }

    if let Some(command) = metadata
        .invocable_names()
        .find(|command| builtins.contains(command))
    {
        return Err(ValidationError::CommandCollision {
            command: command.to_string(),
            with: CORE_OWNER.to_string(),
        });
    }

    let same_plugin = registry.lookup(&metadata.name).map(|(name, _)| name);
    for command in metadata.invocable_names() {
        let owner = registry.entries().find(|(owner, entry)| {
            Some(*owner) != same_plugin && entry.metadata.provides(command)
        });
        if let Some((owner, _)) = owner {
            return Err(ValidationError::CommandCollision {
                command: command.to_string(),
                with: owner.to_string(),
            });
        }
    }

    let mut seen = HashSet::new();
    if let Some(command) = metadata.invocable_names().find(|c| !seen.insert(*c)) {
        return Err(ValidationError::SelfCollision {
            command: command.to_string(),
        });
    }

    Ok(match registry.lookup(&metadata.name) {
        Some((name, entry)) => Verdict::Reinstall {
            name: name.to_string(),
            installed: entry.metadata.version,
        },
        None => Verdict::Fresh,
    })
}

// The plugin name becomes the installed binary's file name. Hidden names
// are left to the registry's own files.
fn is_file_name_safe(name: &str) -> bool {
    !name.starts_with('.')
        && name.trim() == name
        && !name
            .chars()
            .any(|c| c == '/' || c == '\\' || c == ':' || c.is_control())
}
