//! Reserved command namespace.
//!
//! Names and aliases of every command the CLI ships with. Plugins may not
//! use any of them, whether or not this build implements the command.

/// Built-in command names and aliases
pub const CORE_COMMANDS: &[&str] = &[
    // Plugin management
    "install-plugin",
    "uninstall-plugin",
    "plugins",
    "list-plugin-repos",
    "add-plugin-repo",
    "remove-plugin-repo",
    "repo-plugins",
    // Session and targeting
    "api",
    "login",
    "l",
    "logout",
    "lo",
    "auth",
    "target",
    "t",
    "config",
    "help",
    "h",
    "version",
    // Applications
    "apps",
    "a",
    "app",
    "push",
    "p",
    "start",
    "st",
    "stop",
    "sp",
    "restart",
    "rs",
    "restage",
    "rg",
    "delete",
    "d",
    "rename",
    "scale",
    "logs",
    "env",
    "e",
    "set-env",
    "se",
    "unset-env",
    "ssh",
    // Stacks
    "stacks",
    "stack",
    // Routes and domains
    "routes",
    "r",
    "create-route",
    "delete-route",
    "map-route",
    "unmap-route",
    "check-route",
    "domains",
    // Organizations and spaces
    "orgs",
    "o",
    "org",
    "spaces",
    "space",
    // Services
    "marketplace",
    "m",
    "services",
    "s",
    "service",
    "create-service",
    "cs",
    "delete-service",
    "ds",
    "bind-service",
    "bs",
    "unbind-service",
    "us",
];

/// Check whether `name` is a built-in command name or alias
pub fn is_core_command(name: &str) -> bool {
    CORE_COMMANDS.contains(&name)
}
