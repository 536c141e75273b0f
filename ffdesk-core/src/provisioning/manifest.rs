//! Installed-engine record.
//!
//! A small JSON file next to the binary remembers which release was
//! installed, where it came from, and when. It is informational only:
//! presence checks look at the binary itself, never at the manifest.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

use super::types::{AssetDescriptor, Platform};

/// Current schema version for the manifest file.
const SCHEMA_VERSION: u32 = 1;

// ============================================================================
// Manifest Data Structures
// ============================================================================

/// Details of the installed engine binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstalledEngine {
    /// Release version or tag.
    pub version: String,
    /// Archive the binary was extracted from.
    pub asset_name: String,
    /// Where the archive was downloaded from.
    pub source_url: String,
    /// Size of the downloaded archive in bytes.
    pub archive_size_bytes: u64,
    /// Platform the binary was provisioned for.
    pub platform: Platform,
    /// When the engine was installed.
    pub installed_at: DateTime<Utc>,
}

/// Root structure for the engine manifest file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineManifest {
    /// Schema version for forward compatibility.
    pub schema_version: u32,
    #[serde(default)]
    pub engine: Option<InstalledEngine>,
}

impl Default for EngineManifest {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            engine: None,
        }
    }
}

impl EngineManifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `asset` as the installed engine, replacing any previous entry.
    pub fn mark_installed(
        &mut self,
        asset: &AssetDescriptor,
        archive_size_bytes: u64,
        platform: Platform,
    ) {
        self.engine = Some(InstalledEngine {
            version: asset.version.clone(),
            asset_name: asset.name.clone(),
            source_url: asset.download_url.clone(),
            archive_size_bytes,
            platform,
            installed_at: Utc::now(),
        });
    }
}

// ============================================================================
// Manifest Persistence
// ============================================================================

/// Loads the manifest from `path`.
///
/// A missing manifest yields an empty one. A corrupted manifest logs a
/// warning and also yields an empty one.
pub fn load_manifest_from(path: &Path) -> Result<EngineManifest> {
    if !path.exists() {
        debug!("Manifest not found at {}, creating new", path.display());
        return Ok(EngineManifest::new());
    }

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read manifest from {}", path.display()))?;

    match serde_json::from_str::<EngineManifest>(&content) {
        Ok(mut manifest) => {
            if manifest.schema_version != SCHEMA_VERSION {
                info!(
                    "Manifest schema version {} differs from current {}, migrating",
                    manifest.schema_version, SCHEMA_VERSION
                );
                manifest.schema_version = SCHEMA_VERSION;
            }
            Ok(manifest)
        }
        Err(e) => {
            warn!(
                "Failed to parse manifest at {}: {}. Starting fresh.",
                path.display(),
                e
            );
            Ok(EngineManifest::new())
        }
    }
}

/// Saves the manifest to `path`, creating the parent directory if needed.
pub fn save_manifest_to(manifest: &EngineManifest, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| {
            format!("Failed to create manifest directory: {}", parent.display())
        })?;
    }

    let content = serde_json::to_string_pretty(manifest).context("Failed to serialize manifest")?;

    fs::write(path, content)
        .with_context(|| format!("Failed to write manifest to {}", path.display()))?;

    debug!("Manifest saved to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn gyan_asset() -> AssetDescriptor {
        AssetDescriptor {
            version: "7.1".to_string(),
            name: "ffmpeg-7.1-essentials_build.zip".to_string(),
            size_bytes: 88_000_000,
            download_url: "https://github.com/GyanD/codexffmpeg/releases/download/7.1/ffmpeg-7.1-essentials_build.zip".to_string(),
            sha256: None,
        }
    }

    #[test]
    fn test_manifest_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let manifest_path = temp_dir.path().join("engine-manifest.json");

        let mut manifest = EngineManifest::new();
        manifest.mark_installed(&gyan_asset(), 88_000_000, Platform::Windows);
        save_manifest_to(&manifest, &manifest_path).unwrap();

        let loaded = load_manifest_from(&manifest_path).unwrap();
        assert_eq!(loaded.schema_version, SCHEMA_VERSION);
        assert_eq!(loaded.engine, manifest.engine);

        let engine = loaded.engine.unwrap();
        assert_eq!(engine.version, "7.1");
        assert_eq!(engine.platform, Platform::Windows);
        assert!(engine.source_url.starts_with("https://github.com/"));
    }

    #[test]
    fn test_manifest_missing_file_returns_empty() {
        let temp_dir = TempDir::new().unwrap();
        let manifest_path = temp_dir.path().join("nonexistent").join("engine-manifest.json");

        let manifest = load_manifest_from(&manifest_path).unwrap();
        assert!(manifest.engine.is_none());
        assert_eq!(manifest.schema_version, SCHEMA_VERSION);
    }

    #[test]
    fn test_manifest_corrupted_returns_empty() {
        let temp_dir = TempDir::new().unwrap();
        let manifest_path = temp_dir.path().join("engine-manifest.json");

        fs::write(&manifest_path, "not valid json {{{{").unwrap();

        let manifest = load_manifest_from(&manifest_path).unwrap();
        assert!(manifest.engine.is_none());
    }

    #[test]
    fn test_mark_installed_replaces_previous_entry() {
        let mut manifest = EngineManifest::new();
        manifest.mark_installed(&gyan_asset(), 1, Platform::Windows);

        let mac = AssetDescriptor::from_url("https://evermeet.cx/ffmpeg/getrelease/zip");
        manifest.mark_installed(&mac, 2, Platform::Macos);
        assert_eq!(manifest.engine.as_ref().unwrap().archive_size_bytes, 2);
        assert_eq!(manifest.engine.as_ref().unwrap().version, "latest");
        assert_eq!(manifest.engine.as_ref().unwrap().platform, Platform::Macos);
    }

    #[test]
    fn test_manifest_json_format() {
        let mut manifest = EngineManifest::new();
        manifest.mark_installed(&gyan_asset(), 88_000_000, Platform::Windows);
        let json = serde_json::to_string_pretty(&manifest).unwrap();

        assert!(json.contains("schema_version"));
        assert!(json.contains("installed_at"));
        assert!(json.contains("\"platform\": \"windows\""));
        assert!(json.contains("source_url"));
    }
}
