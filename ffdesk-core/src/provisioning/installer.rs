//! Moving the located binary into place, permissions, and scratch cleanup.

use anyhow::{Context, Result};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Windows `ERROR_NOT_SAME_DEVICE`.
#[cfg(windows)]
const ERROR_NOT_SAME_DEVICE: i32 = 17;

/// Returns true if `err` means source and destination are on different filesystems.
pub fn is_cross_device(err: &io::Error) -> bool {
    #[cfg(unix)]
    {
        err.raw_os_error() == Some(libc::EXDEV)
    }
    #[cfg(windows)]
    {
        err.raw_os_error() == Some(ERROR_NOT_SAME_DEVICE)
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = err;
        false
    }
}

/// Moves `src` to `dest`, replacing any existing file.
///
/// Falls back to copy-then-delete when a rename crosses filesystems (the
/// temp directory often lives on a different volume than the data dir).
pub async fn move_file(src: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    match tokio::fs::rename(src, dest).await {
        Ok(()) => {
            debug!(src = %src.display(), dest = %dest.display(), "Renamed binary");
            Ok(())
        }
        Err(e) if is_cross_device(&e) => {
            info!(src = %src.display(), dest = %dest.display(), "Cross-device move, copying");
            copy_then_remove(src, dest).await
        }
        Err(e) => Err(e).with_context(|| {
            format!("Failed to move {} to {}", src.display(), dest.display())
        }),
    }
}

/// Copies `src` next to `dest`, renames it into place, then removes `src`.
///
/// `dest` is only replaced by a complete copy. A failed copy removes the
/// staging file and leaves any previous `dest` untouched.
async fn copy_then_remove(src: &Path, dest: &Path) -> Result<()> {
    let staging = staging_path(dest);

    if let Err(e) = tokio::fs::copy(src, &staging).await {
        discard_staging(&staging).await;
        return Err(e).with_context(|| {
            format!("Failed to copy {} to {}", src.display(), staging.display())
        });
    }

    if let Err(e) = tokio::fs::rename(&staging, dest).await {
        discard_staging(&staging).await;
        return Err(e).with_context(|| {
            format!("Failed to move {} to {}", staging.display(), dest.display())
        });
    }

    tokio::fs::remove_file(src)
        .await
        .with_context(|| format!("Failed to remove {}", src.display()))?;
    Ok(())
}

/// Hidden sibling of `dest` used while copying across filesystems.
fn staging_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dest.with_file_name(format!(".{}.partial", name))
}

async fn discard_staging(staging: &Path) {
    match tokio::fs::remove_file(staging).await {
        Ok(()) => debug!(path = %staging.display(), "Removed partial copy"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %staging.display(), error = %e, "Failed to remove partial copy"),
    }
}

/// Sets mode 0o755 on the binary (Unix only).
///
/// On Windows, this is a no-op.
#[allow(unused_variables)]
pub fn make_executable(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).with_context(
            || format!("Failed to set executable permission on {}", path.display()),
        )?;

        debug!("Set executable permission on {}", path.display());
    }

    Ok(())
}

/// Returns true if `path` is a regular file the current user could execute.
pub async fn is_executable(path: &Path) -> bool {
    let metadata = match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata,
        Err(_) => return false,
    };

    if !metadata.is_file() {
        return false;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

/// Removes scratch directories, logging instead of failing.
pub async fn cleanup_dirs(dirs: &[&Path]) {
    for dir in dirs {
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => debug!(dir = %dir.display(), "Removed scratch directory"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(dir = %dir.display(), error = %e, "Failed to clean up"),
        }
    }
}
