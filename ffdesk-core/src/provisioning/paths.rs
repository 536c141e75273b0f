//! Filesystem layout for the engine binary and provisioning scratch space.
//!
//! - Binaries: `{data_local_dir}/ffdesk/binaries/ffmpeg[.exe]`
//!   (falls back to `{temp}/ffdesk/binaries/` when the OS reports no data dir)
//! - Downloads: `{temp}/ffmpeg-download/`
//! - Extraction: `{temp}/ffmpeg-extract/`
//!
//! Both scratch directories are removed once an install succeeds.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use super::types::Platform;

/// Application directory name under the OS data / temp folders.
const FFDESK_DIR: &str = "ffdesk";

/// Directory name holding the engine executable.
const BINARIES_DIR: &str = "binaries";

/// Scratch directory for downloaded archives.
const DOWNLOAD_DIR: &str = "ffmpeg-download";

/// Scratch directory for extracted archive contents.
const EXTRACT_DIR: &str = "ffmpeg-extract";

/// Installed-engine record kept next to the binary.
const MANIFEST_FILE: &str = "engine-manifest.json";

// ============================================================================
// Path Resolution
// ============================================================================

/// Returns the default directory holding the engine binary.
pub fn default_binaries_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(FFDESK_DIR)
        .join(BINARIES_DIR)
}

/// Returns the default parent for the download / extraction scratch dirs.
pub fn default_temp_dir() -> PathBuf {
    std::env::temp_dir()
}

/// Returns the expected engine path inside `binaries_dir`.
pub fn engine_binary_path(binaries_dir: &Path, platform: Platform) -> PathBuf {
    binaries_dir.join(platform.engine_binary_name())
}

/// Path: `{temp}/ffmpeg-download/`
pub fn download_dir(temp_dir: &Path) -> PathBuf {
    temp_dir.join(DOWNLOAD_DIR)
}

/// Path: `{temp}/ffmpeg-extract/`
pub fn extract_dir(temp_dir: &Path) -> PathBuf {
    temp_dir.join(EXTRACT_DIR)
}

/// Path: `{binaries}/engine-manifest.json`
pub fn manifest_path(binaries_dir: &Path) -> PathBuf {
    binaries_dir.join(MANIFEST_FILE)
}

/// Ensures the given directories exist.
///
/// # Errors
///
/// Returns an error if any directory cannot be created (e.g., permission issues).
pub async fn ensure_dirs_exist(dirs: &[&Path]) -> Result<()> {
    for dir in dirs {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_binaries_dir_layout() {
        let dir = default_binaries_dir();
        assert!(dir.ends_with("ffdesk/binaries"));
    }

    #[test]
    fn test_engine_binary_path() {
        let base = Path::new("/opt/ffdesk/binaries");

        assert_eq!(
            engine_binary_path(base, Platform::Linux),
            PathBuf::from("/opt/ffdesk/binaries/ffmpeg")
        );
        assert!(engine_binary_path(base, Platform::Windows)
            .to_string_lossy()
            .ends_with("ffmpeg.exe"));
    }

    #[test]
    fn test_scratch_dirs_are_under_temp() {
        let temp = Path::new("/tmp");
        assert_eq!(download_dir(temp), PathBuf::from("/tmp/ffmpeg-download"));
        assert_eq!(extract_dir(temp), PathBuf::from("/tmp/ffmpeg-extract"));
    }

    #[test]
    fn test_manifest_path_is_next_to_binary() {
        let base = Path::new("/opt/bin");
        let manifest = manifest_path(base);
        assert!(manifest.starts_with(base));
        assert!(manifest.ends_with("engine-manifest.json"));
    }

    #[tokio::test]
    async fn test_ensure_dirs_exist() {
        let temp = TempDir::new().unwrap();
        let a = temp.path().join("a");
        let b = temp.path().join("b/c");

        ensure_dirs_exist(&[&a, &b]).await.unwrap();

        assert!(a.is_dir());
        assert!(b.is_dir());
    }
}
