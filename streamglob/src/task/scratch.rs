//! Task-private scratch directory.

use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::debug;

use crate::{Error, Result};

/// Prefix of every scratch directory under the system temp dir.
pub const SCRATCH_PREFIX: &str = "streamglob";

/// Lazily created temporary directory owned by exactly one task.
///
/// [`cleanup`](Self::cleanup) removes it at most once; dropping an
/// uncleaned directory removes it as well.
#[derive(Debug, Default)]
pub struct ScratchDir {
    dir: Option<TempDir>,
    parent: Option<PathBuf>,
    cleaned: bool,
}

impl ScratchDir {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the directory under `parent` instead of the system temp dir.
    pub fn in_dir(parent: impl Into<PathBuf>) -> Self {
        Self {
            parent: Some(parent.into()),
            ..Self::default()
        }
    }

    /// Path of the directory, creating it on first use.
    pub fn path(&mut self) -> Result<&Path> {
        if self.cleaned {
            return Err(Error::validation("scratch directory was already removed"));
        }
        if self.dir.is_none() {
            let mut builder = tempfile::Builder::new();
            builder.prefix(SCRATCH_PREFIX);
            let dir = match &self.parent {
                Some(parent) => builder
                    .tempdir_in(parent)
                    .map_err(|e| Error::io_path("creating scratch directory in", parent, e))?,
                None => builder.tempdir().map_err(|e| {
                    Error::io_path("creating scratch directory in", &std::env::temp_dir(), e)
                })?,
            };
            debug!(path = %dir.path().display(), "Created scratch directory");
            self.dir = Some(dir);
        }
        match &self.dir {
            Some(dir) => Ok(dir.path()),
            None => Err(Error::Other("scratch directory unavailable".to_string())),
        }
    }

    /// Path of the directory if it has been created and not removed.
    pub fn existing_path(&self) -> Option<&Path> {
        self.dir.as_ref().map(TempDir::path)
    }

    pub fn is_cleaned(&self) -> bool {
        self.cleaned
    }

    /// Remove the directory. Returns whether anything was removed; every
    /// call after the first returns `Ok(false)`.
    pub fn cleanup(&mut self) -> Result<bool> {
        if self.cleaned {
            return Ok(false);
        }
        self.cleaned = true;

        let Some(dir) = self.dir.take() else {
            return Ok(false);
        };
        let path = dir.path().to_path_buf();
        dir.close()
            .map_err(|e| Error::io_path("removing scratch directory", &path, e))?;
        debug!(path = %path.display(), "Removed scratch directory");
        Ok(true)
    }
}
