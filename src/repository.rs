//! Plugin repositories.
//!
//! A repository serves an index at `<url>/list` describing the plugins it
//! hosts and one binary per platform. Installing by name looks the plugin up
//! in one named repository (`-r`) or in every configured repository in order.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::Path;
use tracing::{debug, warn};
use url::Url;

use crate::config::RepositoryConfig;
use crate::source::SourceError;

/// Index document served at `<url>/list`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RepositoryIndex {
    #[serde(default)]
    pub plugins: Vec<IndexedPlugin>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IndexedPlugin {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub binaries: Vec<IndexedBinary>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IndexedBinary {
    pub platform: String,
    pub url: String,
    /// SHA-256 of the binary, hex encoded. Empty means unchecked.
    #[serde(default)]
    pub checksum: String,
}

/// A downloadable binary picked out of a repository index
#[derive(Debug, Clone, PartialEq)]
pub struct LocatedBinary {
    pub repository: String,
    pub plugin: String,
    pub version: String,
    pub url: Url,
    pub checksum: Option<String>,
}

/// Platform key used by repository indexes for the running host
pub fn platform_key() -> &'static str {
    match (std::env::consts::OS, std::env::consts::ARCH) {
        ("macos", "aarch64") => "osx-arm64",
        ("macos", _) => "osx",
        ("windows", "x86") => "win32",
        ("windows", _) => "win64",
        ("linux", "x86") => "linux32",
        ("linux", "aarch64") => "linux-arm64",
        _ => "linux64",
    }
}

/// Fetches repository indexes
#[derive(Debug, Clone)]
pub struct RepositoryClient {
    client: Client,
    platform: String,
}

impl RepositoryClient {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            platform: platform_key().to_string(),
        }
    }

    /// Override the platform key (tests, cross-installs)
    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = platform.into();
        self
    }

    /// Download and decode the index of one repository
    pub async fn index(&self, repo: &RepositoryConfig) -> Result<RepositoryIndex, SourceError> {
        let url = index_url(&repo.url)?;
        debug!(repository = %repo.name, url = %url, "Fetching repository index");

        let response = self.client.get(url.clone()).send().await.map_err(|e| {
            SourceError::Fetch(format!("repository '{}' unreachable: {}", repo.name, e))
        })?;
        if !response.status().is_success() {
            return Err(SourceError::Fetch(format!(
                "repository '{}' returned HTTP {}",
                repo.name,
                response.status()
            )));
        }
        response.json::<RepositoryIndex>().await.map_err(|e| {
            SourceError::Fetch(format!("repository '{}' sent a bad index: {}", repo.name, e))
        })
    }

    /// Find `plugin` in `wanted` (or every repository when `None`) and pick
    /// the binary for this platform
    pub async fn locate(
        &self,
        repos: &[RepositoryConfig],
        wanted: Option<&str>,
        plugin: &str,
    ) -> Result<LocatedBinary, SourceError> {
        let candidates: Vec<&RepositoryConfig> = match wanted {
            Some(name) => {
                let repo = repos
                    .iter()
                    .find(|r| r.name.eq_ignore_ascii_case(name))
                    .ok_or_else(|| SourceError::UnknownRepository(name.to_string()))?;
                vec![repo]
            }
            None if repos.is_empty() => {
                return Err(SourceError::Unsupported(format!(
                    "{} is not a file or URL and no plugin repositories are configured",
                    plugin
                )))
            }
            None => repos.iter().collect(),
        };

        let mut last_fetch_error = None;
        for repo in &candidates {
            let index = match self.index(repo).await {
                Ok(index) => index,
                // A single named repository must answer; a search moves on
                Err(e) if wanted.is_none() => {
                    warn!(repository = %repo.name, error = %e, "Skipping repository");
                    last_fetch_error = Some(e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let Some(entry) = index
                .plugins
                .iter()
                .find(|p| p.name.eq_ignore_ascii_case(plugin))
            else {
                continue;
            };

            let binary = entry
                .binaries
                .iter()
                .find(|b| b.platform == self.platform)
                .ok_or_else(|| SourceError::NoCompatibleBinary {
                    plugin: entry.name.clone(),
                    platform: self.platform.clone(),
                })?;

            let url = Url::parse(&binary.url).map_err(|e| {
                SourceError::Fetch(format!("repository '{}' lists a bad url: {}", repo.name, e))
            })?;
            let checksum = Some(binary.checksum.trim().to_ascii_lowercase())
                .filter(|sum| !sum.is_empty());

            return Ok(LocatedBinary {
                repository: repo.name.clone(),
                plugin: entry.name.clone(),
                version: entry.version.clone(),
                url,
                checksum,
            });
        }

        match last_fetch_error {
            Some(e) if candidates.len() == 1 => Err(e),
            _ => Err(SourceError::NotFound(match wanted {
                Some(repo) => format!("plugin '{}' in repository '{}'", plugin, repo),
                None => format!("plugin '{}' in any configured repository", plugin),
            })),
        }
    }
}

fn index_url(base: &str) -> Result<Url, SourceError> {
    let base = base.trim_end_matches('/');
    Url::parse(&format!("{}/list", base))
        .map_err(|e| SourceError::Fetch(format!("invalid repository url {}: {}", base, e)))
}

/// Hex-encoded SHA-256 of a file
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect())
}

/// Compare a downloaded file against the checksum from the index
pub fn verify_checksum(path: &Path, expected: &str) -> Result<(), SourceError> {
    let actual = sha256_file(path)
        .map_err(|e| SourceError::Fetch(format!("could not read download: {}", e)))?;
    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(())
    } else {
        Err(SourceError::ChecksumMismatch {
            expected: expected.trim().to_string(),
            actual,
        })
    }
}
