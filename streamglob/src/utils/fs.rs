//! Filesystem helpers shared across modules.
//!
//! Errors carry the operation and path so failures in finalisation are
//! readable in logs without extra context.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::{Error, Result};

/// Ensure the parent directory of a file path exists.
pub async fn ensure_parent_dir(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::io_path("creating directory", parent, e)),
        _ => Ok(()),
    }
}

/// Ensure a directory exists (synchronous variant, used during start-up).
pub fn ensure_dir_all_sync(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| Error::io_path("creating directory", path, e))
}

/// Move a file, creating the destination's parent directories.
///
/// Falls back to copy + remove when a plain rename is not possible (for
/// example across filesystems, which is the common case for a scratch
/// directory under the system temp dir).
pub async fn move_file(from: &Path, to: &Path) -> Result<()> {
    ensure_parent_dir(to).await?;
    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            debug!(
                from = %from.display(),
                to = %to.display(),
                error = %rename_err,
                "Rename failed, copying instead"
            );
            tokio::fs::copy(from, to)
                .await
                .map_err(|e| Error::io_path("copying", from, e))?;
            tokio::fs::remove_file(from)
                .await
                .map_err(|e| Error::io_path("removing", from, e))
        }
    }
}

/// Remove a file, treating "not found" as success. Returns whether a file
/// was removed.
pub async fn remove_file_if_exists(path: &Path) -> Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::io_path("removing", path, e)),
    }
}

/// Whether two paths name the same file.
///
/// Compares canonical paths when both exist, otherwise falls back to a
/// lexical comparison of the absolute forms.
pub fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => absolute(a) == absolute(b),
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_move_file_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("0.tmp");
        let to = dir.path().join("nested").join("deeper").join("out.mp4");
        tokio::fs::write(&from, b"data").await.unwrap();

        move_file(&from, &to).await.unwrap();

        assert!(!from.exists());
        assert_eq!(tokio::fs::read(&to).await.unwrap(), b"data");
    }

    #[tokio::test]
    async fn test_move_missing_file_fails_with_context() {
        let dir = tempfile::tempdir().unwrap();
        let err = move_file(&dir.path().join("missing"), &dir.path().join("out"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::IoPath { op: "copying", .. }));
    }

    #[tokio::test]
    async fn test_remove_file_if_exists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.mp4");
        tokio::fs::write(&path, b"x").await.unwrap();
        assert!(remove_file_if_exists(&path).await.unwrap());
        assert!(!remove_file_if_exists(&path).await.unwrap());
    }

    #[test]
    fn test_same_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.mp4");
        std::fs::write(&path, b"x").unwrap();
        let dotted = dir.path().join(".").join("a.mp4");

        assert!(same_file(&path, &dotted));
        assert!(!same_file(&path, &dir.path().join("b.mp4")));
        assert!(same_file(
            &dir.path().join("missing.mp4"),
            &dir.path().join("missing.mp4")
        ));
    }
}
