//! Catalog of downloadable engine builds.
//!
//! Windows builds come from the latest GitHub release of a build repository,
//! macOS has one well-known asset that always points at the newest build,
//! and other platforms have no catalog at all.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use tracing::{debug, info};

use super::types::{ArchiveFormat, AssetDescriptor, Platform};
use crate::config::EngineConfig;
use crate::error::ProvisionError;

/// File name given to the fixed macOS asset.
const MAC_ASSET_NAME: &str = "ffmpeg-mac.zip";

/// Marker of the lean Windows build variant.
const ESSENTIALS_MARKER: &str = "essentials";

// ============================================================================
// Catalog Sources
// ============================================================================

/// Something that can list downloadable engine archives.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<AssetDescriptor>, ProvisionError>;
}

/// Lists the assets of a GitHub "latest release" endpoint.
#[derive(Debug, Clone)]
pub struct GithubReleaseCatalog {
    client: reqwest::Client,
    api_url: String,
}

impl GithubReleaseCatalog {
    pub fn new(client: reqwest::Client, api_url: impl Into<String>) -> Self {
        Self {
            client,
            api_url: api_url.into(),
        }
    }
}

#[async_trait]
impl CatalogSource for GithubReleaseCatalog {
    async fn fetch(&self) -> Result<Vec<AssetDescriptor>, ProvisionError> {
        info!(url = %self.api_url, "Fetching engine release catalog");

        let response = self
            .client
            .get(&self.api_url)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProvisionError::Network(format!(
                "Catalog request failed with status {}: {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("Unknown error")
            )));
        }

        let body = response.text().await?;
        parse_release(&body)
    }
}

/// A catalog with exactly one, fixed asset.
#[derive(Debug, Clone)]
pub struct FixedAssetCatalog {
    asset: AssetDescriptor,
}

impl FixedAssetCatalog {
    pub fn new(asset: AssetDescriptor) -> Self {
        Self { asset }
    }

    /// The macOS catalog: a single `latest` zip of unknown size.
    pub fn macos(download_url: &str) -> Self {
        Self::new(AssetDescriptor {
            version: "latest".to_string(),
            name: MAC_ASSET_NAME.to_string(),
            size_bytes: 0,
            download_url: download_url.to_string(),
            sha256: None,
        })
    }
}

#[async_trait]
impl CatalogSource for FixedAssetCatalog {
    async fn fetch(&self) -> Result<Vec<AssetDescriptor>, ProvisionError> {
        Ok(vec![self.asset.clone()])
    }
}

/// Picks the catalog for the configured platform.
pub fn catalog_for(
    config: &EngineConfig,
    client: reqwest::Client,
) -> Result<Box<dyn CatalogSource>, ProvisionError> {
    match config.platform {
        Platform::Windows => Ok(Box::new(GithubReleaseCatalog::new(
            client,
            config.release_api_url.clone(),
        ))),
        Platform::Macos => Ok(Box::new(FixedAssetCatalog::macos(&config.mac_download_url))),
        Platform::Linux => Err(ProvisionError::UnsupportedPlatform(
            config.platform.display_name().to_string(),
        )),
    }
}

// ============================================================================
// Release Parsing
// ============================================================================

#[derive(Debug, Deserialize)]
struct GithubRelease {
    tag_name: String,
    #[serde(default)]
    assets: Vec<GithubAsset>,
}

#[derive(Debug, Deserialize)]
struct GithubAsset {
    name: String,
    #[serde(default)]
    size: u64,
    browser_download_url: String,
    /// `sha256:<hex>` on releases published after GitHub started hashing assets.
    #[serde(default)]
    digest: Option<String>,
}

/// Converts a GitHub release JSON document into asset descriptors.
pub fn parse_release(json: &str) -> Result<Vec<AssetDescriptor>, ProvisionError> {
    let release: GithubRelease = serde_json::from_str(json)
        .map_err(|e| ProvisionError::Network(format!("Invalid release JSON: {}", e)))?;

    let assets: Vec<AssetDescriptor> = release
        .assets
        .into_iter()
        .map(|asset| AssetDescriptor {
            version: release.tag_name.clone(),
            name: asset.name,
            size_bytes: asset.size,
            download_url: asset.browser_download_url,
            sha256: asset
                .digest
                .as_deref()
                .and_then(|d| d.strip_prefix("sha256:"))
                .map(str::to_lowercase),
        })
        .collect();

    debug!(version = %release.tag_name, count = assets.len(), "Parsed release catalog");
    Ok(assets)
}

/// Chooses the asset to install.
///
/// A single-entry catalog is taken as is. Otherwise only archives we can
/// extract are considered, preferring the essentials build and zip over 7z.
pub fn select_asset(assets: &[AssetDescriptor]) -> Option<&AssetDescriptor> {
    if let [only] = assets {
        return Some(only);
    }

    let rank = |asset: &AssetDescriptor| -> Option<u8> {
        let format = ArchiveFormat::from_path(Path::new(&asset.name)).ok()?;
        let name = asset.name.to_lowercase();
        if name.contains("shared") {
            return None;
        }
        let essentials = name.contains(ESSENTIALS_MARKER);
        Some(match (essentials, format) {
            (true, ArchiveFormat::Zip) => 0,
            (true, ArchiveFormat::SevenZ) => 1,
            (false, ArchiveFormat::Zip) => 2,
            (false, ArchiveFormat::SevenZ) => 3,
        })
    };

    assets
        .iter()
        .filter_map(|asset| rank(asset).map(|r| (r, asset)))
        .min_by_key(|(r, _)| *r)
        .map(|(_, asset)| asset)
}
