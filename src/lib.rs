//! skyctl - command-line client for the cloud platform
//!
//! This library holds the plugin subsystem: resolving a plugin from a path,
//! URL or repository, staging and probing it over the RPC bridge, checking
//! its names, and recording it in the installed plugin registry.
//!
//! The `skyctl` binary and the integration tests both build on it.

pub mod builtin;
pub mod config;
pub mod install;
pub mod plugins;
pub mod registry;
pub mod repository;
pub mod rpc;
pub mod source;
pub mod staging;
pub mod ui;
pub mod validator;
