//! Finds the engine executable inside an extracted archive tree.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Directories nested deeper than this below the root are not searched.
pub const MAX_SEARCH_DEPTH: usize = 64;

/// Searches `root` depth-first for a regular file named exactly `name`.
///
/// Symbolic links are never followed or returned, so a hostile archive
/// cannot point the search outside the extraction directory. Unreadable
/// subdirectories are skipped; an unreadable root is an error.
pub async fn locate_binary(root: &Path, name: &str) -> Result<Option<PathBuf>> {
    let mut stack = vec![(root.to_path_buf(), 0usize)];
    let mut is_root = true;

    while let Some((current, depth)) = stack.pop() {
        let mut entries = match tokio::fs::read_dir(&current).await {
            Ok(entries) => entries,
            Err(e) if is_root => {
                return Err(e).with_context(|| format!("Failed to read {}", current.display()));
            }
            Err(e) => {
                debug!(dir = %current.display(), error = %e, "Skipping unreadable directory");
                continue;
            }
        };
        is_root = false;

        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("Failed to list {}", current.display()))?
        {
            let file_type = match entry.file_type().await {
                Ok(file_type) => file_type,
                Err(_) => continue,
            };
            let path = entry.path();

            if file_type.is_symlink() {
                debug!(path = %path.display(), "Not following symlink");
            } else if file_type.is_dir() {
                if depth < MAX_SEARCH_DEPTH {
                    stack.push((path, depth + 1));
                }
            } else if file_type.is_file() && entry.file_name().to_str() == Some(name) {
                debug!(path = %path.display(), "Found engine binary");
                return Ok(Some(path));
            }
        }
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_finds_nested_binary() {
        let temp = TempDir::new().unwrap();
        let bin = temp.path().join("ffmpeg-7.1-essentials_build/bin");
        fs::create_dir_all(&bin).unwrap();
        fs::write(bin.join("ffmpeg.exe"), b"MZ").unwrap();
        fs::write(bin.join("ffprobe.exe"), b"MZ").unwrap();

        let found = locate_binary(temp.path(), "ffmpeg.exe").await.unwrap();
        assert_eq!(found, Some(bin.join("ffmpeg.exe")));
    }

    #[tokio::test]
    async fn test_exact_name_only() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("ffmpeg.txt"), b"").unwrap();
        fs::write(temp.path().join("FFMPEG-README"), b"").unwrap();
        fs::create_dir_all(temp.path().join("ffmpeg")).unwrap();

        assert_eq!(locate_binary(temp.path(), "ffmpeg").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_missing_root_is_error() {
        let temp = TempDir::new().unwrap();
        assert!(locate_binary(&temp.path().join("nope"), "ffmpeg").await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlinks_are_not_followed() {
        let temp = TempDir::new().unwrap();
        let outside = temp.path().join("outside");
        let root = temp.path().join("extract");
        fs::create_dir_all(&outside).unwrap();
        fs::create_dir_all(&root).unwrap();
        fs::write(outside.join("ffmpeg"), b"elsewhere").unwrap();

        std::os::unix::fs::symlink(&outside, root.join("linked-dir")).unwrap();
        std::os::unix::fs::symlink(outside.join("ffmpeg"), root.join("ffmpeg")).unwrap();

        assert_eq!(locate_binary(&root, "ffmpeg").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_depth_bound() {
        let temp = TempDir::new().unwrap();
        let mut deep = temp.path().to_path_buf();
        for i in 0..(MAX_SEARCH_DEPTH + 2) {
            deep = deep.join(format!("d{}", i));
        }
        fs::create_dir_all(&deep).unwrap();
        fs::write(deep.join("ffmpeg"), b"").unwrap();

        assert_eq!(locate_binary(temp.path(), "ffmpeg").await.unwrap(), None);
    }
}
