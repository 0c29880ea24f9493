//! Executable staging.
//!
//! Candidate plugin binaries are copied (or downloaded) into a private
//! staging directory before anything executes them. A [`StagedBinary`] owns
//! its temp file: dropping it removes the file, so every exit path of an
//! install attempt cleans up without an explicit call.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::{NamedTempFile, TempPath};
use thiserror::Error;
use tracing::debug;

/// Errors raised while staging or committing a binary
#[derive(Debug, Error)]
pub enum StagingError {
    #[error("Could not copy plugin binary {path}: {reason}")]
    Copy { path: PathBuf, reason: String },

    #[error("Could not move plugin binary to {path}: {reason}")]
    Persist { path: PathBuf, reason: String },
}

/// A private, executable copy of a candidate plugin binary
#[derive(Debug)]
pub struct StagedBinary {
    path: TempPath,
}

impl StagedBinary {
    /// Take ownership of a finished temp file and mark it executable
    pub fn from_temp(file: NamedTempFile) -> Result<Self, StagingError> {
        let path = file.into_temp_path();
        make_executable(&path).map_err(|e| StagingError::Copy {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Move the staged binary to its permanent location.
    ///
    /// Falls back to copy + remove when `dest` is on another filesystem.
    /// On error the staged file is still removed.
    pub fn persist(self, dest: &Path) -> Result<PathBuf, StagingError> {
        let persist_err = |e: io::Error| StagingError::Persist {
            path: dest.to_path_buf(),
            reason: e.to_string(),
        };

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(persist_err)?;
        }

        match self.path.persist(dest) {
            Ok(()) => {}
            Err(e) => {
                debug!(error = %e.error, "Rename failed, copying staged binary instead");
                // `e.path` is dropped at the end of this arm, removing the temp file
                fs::copy(&e.path, dest).map_err(persist_err)?;
            }
        }

        make_executable(dest).map_err(persist_err)?;
        Ok(dest.to_path_buf())
    }
}

/// Creates staged copies inside a private directory
#[derive(Debug, Clone)]
pub struct Stager {
    dir: PathBuf,
}

impl Stager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create an empty temp file in the staging directory
    pub fn temp_file(&self) -> Result<NamedTempFile, StagingError> {
        let copy_err = |e: io::Error| StagingError::Copy {
            path: self.dir.clone(),
            reason: e.to_string(),
        };
        fs::create_dir_all(&self.dir).map_err(copy_err)?;
        tempfile::Builder::new()
            .prefix("plugin-")
            .tempfile_in(&self.dir)
            .map_err(copy_err)
    }

    /// Copy `source` byte-for-byte into a new executable temp file.
    ///
    /// The returned path never equals `source`; the original file is only read.
    pub fn stage_file(&self, source: &Path) -> Result<StagedBinary, StagingError> {
        let copy_err = |e: io::Error| StagingError::Copy {
            path: source.to_path_buf(),
            reason: e.to_string(),
        };

        let mut input = fs::File::open(source).map_err(copy_err)?;
        let mut temp = self.temp_file()?;
        let bytes = io::copy(&mut input, temp.as_file_mut()).map_err(copy_err)?;
        temp.as_file().sync_all().map_err(copy_err)?;

        let staged = StagedBinary::from_temp(temp)?;
        if same_file(source, staged.path()) {
            return Err(StagingError::Copy {
                path: source.to_path_buf(),
                reason: "staging directory resolves to the source file".to_string(),
            });
        }

        debug!(source = ?source, staged = ?staged.path(), bytes, "Staged plugin binary");
        Ok(staged)
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

#[cfg(unix)]
fn make_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
fn make_executable(path: &Path) -> io::Result<()> {
    if !path.exists() {
        tracing::warn!(path = ?path, "Staged binary disappeared before it could be marked executable");
        return Err(io::Error::from(io::ErrorKind::NotFound));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn staging_entries(dir: &Path) -> usize {
        fs::read_dir(dir).map(|entries| entries.count()).unwrap_or(0)
    }

    #[test]
    fn test_stage_file_copies_bytes() {
        let src_dir = TempDir::new().unwrap();
        let source = src_dir.path().join("plugin-foobar");
        fs::write(&source, b"#!/bin/sh\necho hi\n").unwrap();

        let stage_dir = TempDir::new().unwrap();
        let stager = Stager::new(stage_dir.path().join("staging"));
        let staged = stager.stage_file(&source).unwrap();

        assert_ne!(staged.path(), source.as_path());
        assert!(staged.path().starts_with(stager.dir()));
        assert_eq!(fs::read(staged.path()).unwrap(), fs::read(&source).unwrap());
        assert_eq!(fs::metadata(staged.path()).unwrap().len(), 18);
    }

    #[cfg(unix)]
    #[test]
    fn test_staged_file_is_executable() {
        use std::os::unix::fs::PermissionsExt;

        let src_dir = TempDir::new().unwrap();
        let source = src_dir.path().join("plugin");
        fs::write(&source, b"binary").unwrap();
        fs::set_permissions(&source, fs::Permissions::from_mode(0o600)).unwrap();

        let stager = Stager::new(src_dir.path().join("staging"));
        let staged = stager.stage_file(&source).unwrap();
        let mode = fs::metadata(staged.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);

        // Source permissions untouched
        let src_mode = fs::metadata(&source).unwrap().permissions().mode();
        assert_eq!(src_mode & 0o777, 0o600);
    }

    #[test]
    fn test_drop_removes_staged_file() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("plugin");
        fs::write(&source, b"binary").unwrap();

        let stager = Stager::new(dir.path().join("staging"));
        let staged = stager.stage_file(&source).unwrap();
        let staged_path = staged.path().to_path_buf();
        assert!(staged_path.exists());

        drop(staged);
        assert!(!staged_path.exists());
        assert_eq!(staging_entries(stager.dir()), 0);
        assert!(source.exists());
    }

    #[test]
    fn test_stage_missing_source() {
        let dir = TempDir::new().unwrap();
        let stager = Stager::new(dir.path().join("staging"));
        let err = stager.stage_file(&dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, StagingError::Copy { .. }));
        assert_eq!(staging_entries(stager.dir()), 0);
    }

    #[test]
    fn test_persist_moves_file() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("plugin");
        fs::write(&source, b"binary").unwrap();

        let stager = Stager::new(dir.path().join("staging"));
        let staged = stager.stage_file(&source).unwrap();
        let staged_path = staged.path().to_path_buf();

        let dest = dir.path().join("bin").join("echo");
        let installed = staged.persist(&dest).unwrap();
        assert_eq!(installed, dest);
        assert_eq!(fs::read(&dest).unwrap(), b"binary");
        assert!(!staged_path.exists());
    }

    #[test]
    fn test_persist_failure_still_cleans_up() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("plugin");
        fs::write(&source, b"binary").unwrap();

        // A regular file where the bin directory should be
        let blocker = dir.path().join("bin");
        fs::write(&blocker, b"not a dir").unwrap();

        let stager = Stager::new(dir.path().join("staging"));
        let staged = stager.stage_file(&source).unwrap();
        let err = staged.persist(&blocker.join("echo")).unwrap_err();
        assert!(matches!(err, StagingError::Persist { .. }));
        assert_eq!(staging_entries(stager.dir()), 0);
    }
}
