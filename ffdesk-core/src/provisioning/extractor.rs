//! Archive extraction for downloaded engine packages.
//!
//! Zip archives are unpacked in-process with the `zip` crate; they have no
//! progress signal, so callers see 0 and then 100. 7z archives are handed to
//! an external 7-Zip executable whose `NN%` output is relayed as it arrives.

use anyhow::{Context, Result};
use regex::Regex;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, info};

use super::downloader::MonotonicProgress;
use super::types::ArchiveFormat;
use crate::error::ProvisionError;

/// 7-Zip executables tried on PATH, in order.
pub const SEVENZIP_CANDIDATES: &[&str] = &["7za", "7z", "7zr", "7zz"];

fn sevenzip_percent_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d{1,3})%").expect("valid percent regex"))
}

// ============================================================================
// Archive Extraction
// ============================================================================

/// Extracts `archive_path` into `dest_dir`, reporting percentages to `on_progress`.
///
/// The format is chosen from the file extension alone; anything other than
/// `.zip` or `.7z` fails before the filesystem is touched. Reported values
/// never decrease and end at 100 on success.
pub async fn extract_archive<F>(
    archive_path: &Path,
    dest_dir: &Path,
    sevenzip_override: Option<&Path>,
    mut on_progress: F,
) -> Result<(), ProvisionError>
where
    F: FnMut(f64),
{
    let format = ArchiveFormat::from_path(archive_path)?;

    info!(
        "Extracting {:?} archive {} to {}",
        format,
        archive_path.display(),
        dest_dir.display()
    );

    tokio::fs::create_dir_all(dest_dir)
        .await
        .with_context(|| format!("Failed to create directory: {}", dest_dir.display()))?;

    let mut gate = MonotonicProgress::new();
    let mut report = |percent: f64| {
        if let Some(percent) = gate.offer(percent) {
            on_progress(percent);
        }
    };

    match format {
        ArchiveFormat::Zip => {
            report(0.0);
            let archive = archive_path.to_path_buf();
            let dest = dest_dir.to_path_buf();
            tokio::task::spawn_blocking(move || extract_zip(&archive, &dest))
                .await
                .map_err(|e| ProvisionError::Extraction(format!("zip task failed: {}", e)))?
                .map_err(|e| ProvisionError::Extraction(format!("{:#}", e)))?;
        }
        ArchiveFormat::SevenZ => {
            let binary = resolve_sevenzip(sevenzip_override)?;
            extract_7z(&binary, archive_path, dest_dir, &mut report).await?;
        }
    }

    report(100.0);
    Ok(())
}

// ============================================================================
// ZIP Extraction
// ============================================================================

fn extract_zip(archive_path: &Path, dest_dir: &Path) -> Result<()> {
    let file = File::open(archive_path)
        .with_context(|| format!("Failed to open zip: {}", archive_path.display()))?;

    let mut archive = zip::ZipArchive::new(file)
        .with_context(|| format!("Failed to read zip: {}", archive_path.display()))?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let entry_path = match entry.enclosed_name() {
            Some(path) => path.to_owned(),
            None => {
                debug!(name = entry.name(), "Skipping unsafe path in zip");
                continue;
            }
        };

        let dest_path = dest_dir.join(&entry_path);

        if entry.is_dir() {
            fs::create_dir_all(&dest_path)?;
        } else {
            if let Some(parent) = dest_path.parent() {
                fs::create_dir_all(parent)?;
            }

            let mut outfile = File::create(&dest_path)
                .with_context(|| format!("Failed to create: {}", dest_path.display()))?;

            io::copy(&mut entry, &mut outfile)?;

            #[cfg(unix)]
            set_unix_permissions(&dest_path, entry.unix_mode())?;
        }
    }

    debug!("ZIP extraction complete");
    Ok(())
}

#[cfg(unix)]
fn set_unix_permissions(path: &Path, mode: Option<u32>) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if let Some(mode) = mode {
        if mode & 0o111 != 0 {
            let permissions = fs::Permissions::from_mode(mode | 0o755);
            fs::set_permissions(path, permissions)
                .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
        }
    }

    Ok(())
}

// ============================================================================
// 7z Extraction
// ============================================================================

/// Finds the 7-Zip executable to use.
///
/// An explicit override must exist; it is never silently replaced by a PATH
/// lookup.
pub fn resolve_sevenzip(override_path: Option<&Path>) -> Result<PathBuf, ProvisionError> {
    if let Some(path) = override_path {
        return if path.is_file() {
            Ok(path.to_path_buf())
        } else {
            Err(ProvisionError::ExtractorUnavailable(
                path.display().to_string(),
            ))
        };
    }

    SEVENZIP_CANDIDATES
        .iter()
        .find_map(|name| which::which(name).ok())
        .ok_or_else(|| ProvisionError::ExtractorUnavailable(SEVENZIP_CANDIDATES.join(", ")))
}

async fn extract_7z<F>(
    binary: &Path,
    archive_path: &Path,
    dest_dir: &Path,
    report: &mut F,
) -> Result<(), ProvisionError>
where
    F: FnMut(f64),
{
    let mut output_flag = OsString::from("-o");
    output_flag.push(dest_dir);

    debug!(binary = %binary.display(), "Running 7-Zip");
    let mut child = Command::new(binary)
        .arg("x")
        .arg("-y")
        .arg("-bsp1")
        .arg("-bso0")
        .arg(output_flag)
        .arg(archive_path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => {
                ProvisionError::ExtractorUnavailable(binary.display().to_string())
            }
            _ => ProvisionError::Extraction(format!("Failed to run 7-Zip: {}", e)),
        })?;

    let stderr_task = child.stderr.take().map(|mut stderr| {
        tokio::spawn(async move {
            let mut text = String::new();
            let _ = stderr.read_to_string(&mut text).await;
            text
        })
    });

    if let Some(mut stdout) = child.stdout.take() {
        let mut buf = [0u8; 1024];
        let mut pending = String::new();

        loop {
            let n = match stdout.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!(error = %e, "Stopped reading 7-Zip output");
                    break;
                }
            };
            pending.push_str(&String::from_utf8_lossy(&buf[..n]));

            // Digits after the last '%' may belong to a number still being written.
            if let Some(end) = pending.rfind('%') {
                for percent in scrape_percentages(&pending[..=end]) {
                    report(percent);
                }
                pending.drain(..=end);
            }
        }
    }

    let status = child
        .wait()
        .await
        .map_err(|e| ProvisionError::Extraction(format!("Failed to wait for 7-Zip: {}", e)))?;

    let stderr_text = match stderr_task {
        Some(task) => task.await.unwrap_or_default(),
        None => String::new(),
    };

    if !status.success() {
        let detail = stderr_text.trim();
        return Err(ProvisionError::Extraction(match status.code() {
            Some(code) if detail.is_empty() => format!("7-Zip exited with code {}", code),
            Some(code) => format!("7-Zip exited with code {}: {}", code, detail),
            None => "7-Zip was terminated".to_string(),
        }));
    }

    debug!("7z extraction complete");
    Ok(())
}

/// Extracts every `NN%` value from 7-Zip's progress output.
fn scrape_percentages(text: &str) -> Vec<f64> {
    sevenzip_percent_regex()
        .captures_iter(text)
        .filter_map(|caps| caps.get(1)?.as_str().parse().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_zip(path: &Path) {
        let file = File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);

        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored);

        zip.start_file("ffmpeg-7.1-essentials_build/README.txt", options)
            .unwrap();
        zip.write_all(b"FFmpeg essentials").unwrap();

        zip.start_file(
            "ffmpeg-7.1-essentials_build/bin/ffmpeg",
            options.unix_permissions(0o755),
        )
        .unwrap();
        zip.write_all(b"#!/bin/sh\n").unwrap();

        zip.finish().unwrap();
    }

    #[tokio::test]
    async fn test_extract_zip_reports_zero_then_hundred() {
        let temp_dir = TempDir::new().unwrap();
        let archive_path = temp_dir.path().join("ffmpeg.zip");
        let extract_dir = temp_dir.path().join("extracted");
        write_zip(&archive_path);

        let mut progress = Vec::new();
        extract_archive(&archive_path, &extract_dir, None, |p| progress.push(p))
            .await
            .unwrap();

        assert_eq!(progress, vec![0.0, 100.0]);
        let nested = extract_dir.join("ffmpeg-7.1-essentials_build/bin/ffmpeg");
        assert!(nested.exists());
        let readme =
            fs::read_to_string(extract_dir.join("ffmpeg-7.1-essentials_build/README.txt")).unwrap();
        assert_eq!(readme, "FFmpeg essentials");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&nested).unwrap().permissions().mode();
            assert_ne!(mode & 0o111, 0);
        }
    }

    #[tokio::test]
    async fn test_unsupported_archive_touches_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let archive_path = temp_dir.path().join("ffmpeg.tar.gz");
        fs::write(&archive_path, b"not really").unwrap();
        let extract_dir = temp_dir.path().join("extracted");

        let mut progress = Vec::new();
        let result =
            extract_archive(&archive_path, &extract_dir, None, |p| progress.push(p)).await;

        assert!(matches!(result, Err(ProvisionError::UnsupportedArchive(_))));
        assert!(progress.is_empty());
        assert!(!extract_dir.exists());
    }

    #[tokio::test]
    async fn test_corrupt_zip_is_extraction_error() {
        let temp_dir = TempDir::new().unwrap();
        let archive_path = temp_dir.path().join("broken.zip");
        fs::write(&archive_path, b"PK not a zip").unwrap();

        let result =
            extract_archive(&archive_path, &temp_dir.path().join("out"), None, |_| {}).await;
        assert!(matches!(result, Err(ProvisionError::Extraction(_))));
    }

    #[test]
    fn test_missing_sevenzip_override_is_unavailable() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("7za");
        let err = resolve_sevenzip(Some(&missing)).unwrap_err();
        assert!(matches!(err, ProvisionError::ExtractorUnavailable(_)));
    }

    #[test]
    fn test_scrape_sevenzip_progress() {
        assert_eq!(
            scrape_percentages("  0%\r  7% 2 - ffmpeg/bin/ffmpeg.exe\r 42%\r100%"),
            vec![0.0, 7.0, 42.0, 100.0]
        );
        assert!(scrape_percentages("Everything is Ok").is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_extract_7z_relays_monotonic_progress() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let fake = temp_dir.path().join("fake-7z");
        fs::write(
            &fake,
            "#!/bin/sh\n\
             for a in \"$@\"; do case \"$a\" in -o*) out=\"${a#-o}\";; esac; done\n\
             mkdir -p \"$out/bin\"\n\
             printf '  10%% 1\\r  50%% 2\\r  30%% 3\\r'\n\
             echo engine > \"$out/bin/ffmpeg\"\n",
        )
        .unwrap();
        fs::set_permissions(&fake, fs::Permissions::from_mode(0o755)).unwrap();

        let archive_path = temp_dir.path().join("ffmpeg.7z");
        fs::write(&archive_path, b"7z archive").unwrap();
        let extract_dir = temp_dir.path().join("extracted");

        let mut progress = Vec::new();
        extract_archive(&archive_path, &extract_dir, Some(&fake), |p| progress.push(p))
            .await
            .unwrap();

        assert_eq!(progress, vec![10.0, 50.0, 100.0]);
        assert!(extract_dir.join("bin/ffmpeg").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_extract_7z_failure_carries_stderr() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let fake = temp_dir.path().join("fake-7z");
        fs::write(&fake, "#!/bin/sh\necho 'ERROR: Headers Error' >&2\nexit 2\n").unwrap();
        fs::set_permissions(&fake, fs::Permissions::from_mode(0o755)).unwrap();

        let archive_path = temp_dir.path().join("ffmpeg.7z");
        fs::write(&archive_path, b"7z archive").unwrap();

        let err = extract_archive(&archive_path, &temp_dir.path().join("out"), Some(&fake), |_| {})
            .await
            .unwrap_err();

        let message = err.to_string();
        assert!(message.contains("code 2"), "{}", message);
        assert!(message.contains("Headers Error"), "{}", message);
    }
}
