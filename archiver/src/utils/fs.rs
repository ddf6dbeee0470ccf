//! Filesystem helpers shared across actions.
//!
//! Errors carry the operation and path so task failures are readable from
//! the failure notification alone.

use std::path::Path;
use tracing::debug;

use crate::{Error, Result};

/// Convert an IO error into an application error with operation + path context.
pub fn io_error(op: &'static str, path: &Path, source: std::io::Error) -> Error {
    Error::io_path(op, path, source)
}

/// Ensure a directory exists, creating it (recursively) if needed.
pub async fn ensure_dir_all(path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| io_error("creating directory", path, e))
}

/// Ensure the parent directory of a file path exists.
pub async fn ensure_parent_dir(path: &Path) -> Result<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    ensure_dir_all(parent).await
}

/// Move a file, copying across filesystems when a rename is not possible.
///
/// The copy is checked against the source size before the source is removed.
pub async fn move_file(source: &Path, dest: &Path) -> Result<()> {
    ensure_parent_dir(dest).await?;

    match tokio::fs::rename(source, dest).await {
        Ok(()) => return Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(io_error("moving file", source, e));
        }
        Err(e) => {
            debug!(
                source = %source.display(),
                dest = %dest.display(),
                error = %e,
                "Rename failed, falling back to copy"
            );
        }
    }

    let source_size = tokio::fs::metadata(source)
        .await
        .map_err(|e| io_error("reading file metadata", source, e))?
        .len();
    let copied = tokio::fs::copy(source, dest)
        .await
        .map_err(|e| io_error("copying file", dest, e))?;
    if copied != source_size {
        let _ = tokio::fs::remove_file(dest).await;
        return Err(Error::Other(format!(
            "Copy of {} is incomplete: {copied} of {source_size} bytes",
            source.display()
        )));
    }
    tokio::fs::remove_file(source)
        .await
        .map_err(|e| io_error("removing moved file", source, e))
}

/// Move every entry of a directory into `dest`, merging with what is there.
pub async fn move_dir_contents(source: &Path, dest: &Path) -> Result<()> {
    ensure_dir_all(dest).await?;
    let mut entries = tokio::fs::read_dir(source)
        .await
        .map_err(|e| io_error("reading directory", source, e))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| io_error("reading directory", source, e))?
    {
        let target = dest.join(entry.file_name());
        let file_type = entry
            .file_type()
            .await
            .map_err(|e| io_error("reading file type", &entry.path(), e))?;
        if file_type.is_dir() {
            Box::pin(move_dir_contents(&entry.path(), &target)).await?;
        } else {
            move_file(&entry.path(), &target).await?;
        }
    }
    remove_dir_if_exists(source).await
}

/// Remove a directory tree. A missing directory is not an error.
pub async fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_error("removing directory", path, e)),
    }
}

/// Remove every file or directory in `dir` whose name starts with `prefix`.
///
/// Returns how many entries were removed.
pub async fn remove_with_prefix(dir: &Path, prefix: &str) -> Result<usize> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(io_error("reading directory", dir, e)),
    };

    let mut removed = 0;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| io_error("reading directory", dir, e))?
    {
        let matches = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(prefix));
        if !matches {
            continue;
        }
        let path = entry.path();
        let result = if path.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        match result {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_error("removing scratch file", &path, e)),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn move_creates_destination_parent() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.mp4");
        let dest = dir.path().join("nested/deeper/b.mp4");
        tokio::fs::write(&source, b"video").await.unwrap();

        move_file(&source, &dest).await.unwrap();

        assert!(!source.exists());
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"video");
    }

    #[tokio::test]
    async fn prefix_removal_spares_other_jobs() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["mp4_123-abc-video.mp4", "json_123-abc-chat.json", "mp4_999-def-video.mp4"] {
            tokio::fs::write(dir.path().join(name), b"x").await.unwrap();
        }
        tokio::fs::create_dir(dir.path().join("hls_123-abc")).await.unwrap();

        assert_eq!(remove_with_prefix(dir.path(), "mp4_123-abc").await.unwrap(), 1);
        assert_eq!(remove_with_prefix(dir.path(), "hls_123-abc").await.unwrap(), 1);
        assert!(dir.path().join("json_123-abc-chat.json").exists());
        assert!(dir.path().join("mp4_999-def-video.mp4").exists());
    }

    #[tokio::test]
    async fn removing_missing_directory_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        remove_dir_if_exists(&dir.path().join("gone")).await.unwrap();
        assert_eq!(remove_with_prefix(&dir.path().join("gone"), "x").await.unwrap(), 0);
    }
}
