//! Source resolution and download.
//!
//! `install-plugin` accepts three kinds of input:
//! - a local file path
//! - an `http://` or `https://` URL
//! - a plugin name, looked up in the configured repositories
//!   (optionally pinned to one repository with `-r`)

use futures::StreamExt;
use indicatif::ProgressBar;
use reqwest::Client;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use url::Url;

use crate::staging::{StagedBinary, Stager, StagingError};

/// Errors raised while resolving or fetching a plugin source
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Unsupported plugin source: {0}")]
    Unsupported(String),

    #[error("Plugin source not found: {0}")]
    NotFound(String),

    #[error("Plugin repository '{0}' is not registered")]
    UnknownRepository(String),

    #[error("Plugin '{plugin}' has no binary for platform '{platform}'")]
    NoCompatibleBinary { plugin: String, platform: String },

    #[error("Download failed: {0}")]
    Fetch(String),

    #[error("Downloaded binary checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error(transparent)]
    Staging(#[from] StagingError),
}

/// Where a plugin binary comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginSource {
    /// Local file
    Path(PathBuf),
    /// Direct download
    Url(Url),
    /// Named plugin; `repository: None` searches every configured repository
    Repository {
        repository: Option<String>,
        plugin: String,
    },
}

impl fmt::Display for PluginSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => write!(f, "{}", path.display()),
            Self::Url(url) => write!(f, "{}", url),
            Self::Repository {
                repository: Some(repo),
                plugin,
            } => write!(f, "{} (repository {})", plugin, repo),
            Self::Repository {
                repository: None,
                plugin,
            } => write!(f, "{}", plugin),
        }
    }
}

/// Classify user input.
///
/// `repository` is the value of `-r`; when present the input is always a
/// plugin name.
pub fn resolve(input: &str, repository: Option<&str>) -> Result<PluginSource, SourceError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(SourceError::Unsupported(
            "a path, URL or plugin name is required".to_string(),
        ));
    }

    if let Some(repo) = repository {
        return Ok(PluginSource::Repository {
            repository: Some(repo.to_string()),
            plugin: input.to_string(),
        });
    }

    if input.contains("://") {
        return match Url::parse(input) {
            Ok(url) if matches!(url.scheme(), "http" | "https") && url.host().is_some() => {
                Ok(PluginSource::Url(url))
            }
            _ => Err(SourceError::Unsupported(input.to_string())),
        };
    }

    let path = Path::new(input);
    if path.is_file() {
        return Ok(PluginSource::Path(path.to_path_buf()));
    }
    if path.exists() {
        return Err(SourceError::Unsupported(format!(
            "{} is not a regular file",
            input
        )));
    }
    if looks_like_path(input) {
        return Err(SourceError::NotFound(input.to_string()));
    }

    Ok(PluginSource::Repository {
        repository: None,
        plugin: input.to_string(),
    })
}

fn looks_like_path(input: &str) -> bool {
    input.contains('/')
        || input.contains(std::path::MAIN_SEPARATOR)
        || input.starts_with('.')
        || input.starts_with('~')
}

/// Downloads plugin binaries into the staging area
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: Client,
}

impl Fetcher {
    pub fn new(timeout: Duration) -> Result<Self, SourceError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("skyctl/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SourceError::Fetch(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Stream `url` into a new staged file.
    ///
    /// Returns the staged binary and the number of bytes written. A partial
    /// download is removed along with its temp file.
    pub async fn fetch(
        &self,
        url: &Url,
        stager: &Stager,
        progress: &ProgressBar,
    ) -> Result<(StagedBinary, u64), SourceError> {
        info!(url = %url, "Downloading plugin binary");

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| SourceError::Fetch(format!("request to {} failed: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(SourceError::Fetch(format!(
                "{} returned HTTP {}",
                url,
                response.status()
            )));
        }

        if let Some(total) = response.content_length() {
            progress.set_length(total);
        }

        let temp = stager.temp_file()?;
        let write_err = |e: std::io::Error| {
            SourceError::Fetch(format!("writing {}: {}", temp.path().display(), e))
        };
        let handle = temp.as_file().try_clone().map_err(write_err)?;
        let mut file = tokio::fs::File::from_std(handle);

        let mut downloaded: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| SourceError::Fetch(format!("reading body: {}", e)))?;
            file.write_all(&chunk).await.map_err(write_err)?;
            downloaded += chunk.len() as u64;
            progress.set_position(downloaded);
        }
        file.flush().await.map_err(write_err)?;
        file.sync_all().await.map_err(write_err)?;
        drop(file);
        progress.finish_and_clear();

        debug!(url = %url, bytes = downloaded, staging = ?stager.dir(), "Download complete");
        let staged = StagedBinary::from_temp(temp)?;
        Ok((staged, downloaded))
    }
}
