//! Plugin data model shared by the bridge, validator and registry.
//!
//! A plugin describes itself over the RPC bridge with:
//! - a unique name
//! - a `major.minor.patch` version
//! - the ordered list of commands it contributes, each with an optional alias
//!
//! Field names use PascalCase on the wire and in the registry file.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Plugin version as reported by the plugin itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PluginVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl PluginVersion {
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for PluginVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// A command contributed by a plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CommandSpec {
    /// Name the user types to invoke the command
    pub name: String,
    /// One-line help shown in command listings
    pub help_text: String,
    /// Optional short alias
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl CommandSpec {
    pub fn new(name: impl Into<String>, help_text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            help_text: help_text.into(),
            alias: None,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Every name this command can be invoked by: the name, then the alias.
    /// Empty aliases count as absent.
    pub fn invocable_names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.name.as_str()).chain(
            self.alias
                .as_deref()
                .filter(|alias| !alias.is_empty()),
        )
    }
}

/// Self-description returned by a plugin over the bridge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PluginMetadata {
    pub name: String,
    pub version: PluginVersion,
    pub commands: Vec<CommandSpec>,
}

impl PluginMetadata {
    /// All invocable names (command names and aliases) in declaration order
    pub fn invocable_names(&self) -> impl Iterator<Item = &str> {
        self.commands.iter().flat_map(CommandSpec::invocable_names)
    }

    /// Check whether `name` invokes one of this plugin's commands
    pub fn provides(&self, name: &str) -> bool {
        self.invocable_names().any(|n| n == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_display() {
        assert_eq!(PluginVersion::new(1, 2, 3).to_string(), "1.2.3");
        assert_eq!(PluginVersion::new(0, 10, 0).to_string(), "0.10.0");
    }

    #[test]
    fn test_invocable_names_skip_empty_alias() {
        let plain = CommandSpec::new("say-hi", "Say hi");
        assert_eq!(plain.invocable_names().collect::<Vec<_>>(), vec!["say-hi"]);

        let aliased = CommandSpec::new("say-hi", "Say hi").with_alias("hi");
        assert_eq!(
            aliased.invocable_names().collect::<Vec<_>>(),
            vec!["say-hi", "hi"]
        );

        let empty_alias = CommandSpec::new("say-hi", "Say hi").with_alias("");
        assert_eq!(
            empty_alias.invocable_names().collect::<Vec<_>>(),
            vec!["say-hi"]
        );
    }

    #[test]
    fn test_metadata_wire_format() {
        let json = r#"{
            "Name": "echo",
            "Version": {"Major": 1, "Minor": 0, "Patch": 4},
            "Commands": [
                {"Name": "say-hi", "HelpText": "Say hi", "Alias": "hi"},
                {"Name": "say-bye", "HelpText": "Say bye"}
            ]
        }"#;
        let metadata: PluginMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(metadata.name, "echo");
        assert_eq!(metadata.version, PluginVersion::new(1, 0, 4));
        assert!(metadata.provides("hi"));
        assert!(metadata.provides("say-bye"));
        assert!(!metadata.provides("echo"));

        let round = serde_json::to_value(&metadata).unwrap();
        assert!(round["Commands"][1].get("Alias").is_none());
    }

    #[test]
    fn test_metadata_missing_fields_rejected() {
        let missing_version = r#"{"Name": "echo", "Commands": []}"#;
        assert!(serde_json::from_str::<PluginMetadata>(missing_version).is_err());

        let partial_version = r#"{"Name": "echo", "Version": {"Major": 1}, "Commands": []}"#;
        assert!(serde_json::from_str::<PluginMetadata>(partial_version).is_err());

        let missing_help = r#"{"Name": "echo", "Version": {"Major": 1, "Minor": 0, "Patch": 0},
            "Commands": [{"Name": "say-hi"}]}"#;
        assert!(serde_json::from_str::<PluginMetadata>(missing_help).is_err());
    }
}
