//! Core types for engine provisioning.
//!
//! This module defines the foundational types used across the provisioning
//! pipeline: platform detection, catalog assets, archive formats, and the
//! installation state machine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::error::ProvisionError;

// ============================================================================
// Platform Detection
// ============================================================================

/// Operating system family the engine is provisioned for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Windows,
    Macos,
    Linux,
}

impl Platform {
    /// Detects the current platform at compile time.
    pub fn current() -> Self {
        #[cfg(target_os = "windows")]
        {
            Platform::Windows
        }
        #[cfg(target_os = "macos")]
        {
            Platform::Macos
        }
        #[cfg(not(any(target_os = "windows", target_os = "macos")))]
        {
            Platform::Linux
        }
    }

    /// Returns the lowercase string identifier for this platform.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Windows => "windows",
            Self::Macos => "macos",
            Self::Linux => "linux",
        }
    }

    /// Returns a human-readable description of the platform.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Windows => "Windows",
            Self::Macos => "macOS",
            Self::Linux => "Linux",
        }
    }

    /// File name of the engine executable on this platform.
    pub fn engine_binary_name(&self) -> &'static str {
        match self {
            Self::Windows => "ffmpeg.exe",
            Self::Macos | Self::Linux => "ffmpeg",
        }
    }

    pub fn is_windows(&self) -> bool {
        matches!(self, Self::Windows)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

impl std::str::FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "windows" | "win32" => Ok(Self::Windows),
            "macos" | "darwin" | "mac" => Ok(Self::Macos),
            "linux" => Ok(Self::Linux),
            _ => Err(format!("Unknown platform: {}", s)),
        }
    }
}

// ============================================================================
// Catalog Assets
// ============================================================================

/// One downloadable engine archive from a catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetDescriptor {
    /// Release version or tag (`latest` when the catalog does not say).
    pub version: String,
    /// Asset file name.
    pub name: String,
    /// Archive size in bytes, 0 when unknown.
    pub size_bytes: u64,
    /// Direct download URL.
    pub download_url: String,
    /// Expected SHA256 (lowercase hex) when the catalog publishes one.
    #[serde(default)]
    pub sha256: Option<String>,
}

impl AssetDescriptor {
    /// Builds a descriptor for a bare download URL with nothing else known.
    pub fn from_url(download_url: &str) -> Self {
        let name = download_url
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or("ffmpeg-download")
            .to_string();

        Self {
            version: "latest".to_string(),
            name,
            size_bytes: 0,
            download_url: download_url.to_string(),
            sha256: None,
        }
    }

    /// Size in bytes if the catalog reported one.
    pub fn known_size(&self) -> Option<u64> {
        (self.size_bytes > 0).then_some(self.size_bytes)
    }

    /// File name to save the download under.
    ///
    /// Keeps `name` when it already ends in a supported archive extension.
    /// Endpoints such as `.../getrelease/zip` name the format in the last URL
    /// segment instead, which becomes the extension of `ffmpeg-download`.
    pub fn archive_file_name(&self) -> String {
        if ArchiveFormat::from_path(Path::new(&self.name)).is_ok() {
            return self.name.clone();
        }

        let last_segment = self
            .download_url
            .split(['?', '#'])
            .next()
            .and_then(|url| url.trim_end_matches('/').rsplit('/').next())
            .unwrap_or_default()
            .to_lowercase();

        match last_segment.as_str() {
            "zip" | "7z" => format!("ffmpeg-download.{}", last_segment),
            _ => self.name.clone(),
        }
    }
}

// ============================================================================
// Archive Formats
// ============================================================================

/// Archive formats the extractor can unpack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArchiveFormat {
    /// ZIP archive (.zip)
    Zip,
    /// 7-Zip archive (.7z)
    SevenZ,
}

impl ArchiveFormat {
    /// Infers the format purely from the file extension.
    ///
    /// No content sniffing is attempted; anything but `.zip` and `.7z`
    /// is rejected.
    pub fn from_path(path: &Path) -> Result<Self, ProvisionError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();

        match ext.as_str() {
            "zip" => Ok(Self::Zip),
            "7z" => Ok(Self::SevenZ),
            "" => Err(ProvisionError::UnsupportedArchive(format!(
                "{} has no extension",
                path.display()
            ))),
            other => Err(ProvisionError::UnsupportedArchive(format!(".{}", other))),
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Zip => "zip",
            Self::SevenZ => "7z",
        }
    }
}

// ============================================================================
// Installation State
// ============================================================================

/// Stage of the provisioning pipeline, kept on failures for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProvisionStage {
    Presence,
    Catalog,
    Download,
    Extract,
    Locate,
    Install,
    Finalize,
}

impl fmt::Display for ProvisionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Presence => "presence",
            Self::Catalog => "catalog",
            Self::Download => "download",
            Self::Extract => "extract",
            Self::Locate => "locate",
            Self::Install => "install",
            Self::Finalize => "finalize",
        };
        write!(f, "{}", name)
    }
}

/// Current state of the engine installation.
#[derive(Debug, Clone, PartialEq)]
pub enum InstallationState {
    NotChecked,
    Checking,
    Missing,
    Downloading {
        /// Progress percentage (0 to 100), `None` while the total is unknown.
        percent: Option<f64>,
    },
    Extracting {
        percent: f64,
    },
    Locating,
    Installing,
    Ready,
    Failed {
        stage: ProvisionStage,
        reason: String,
    },
}

impl InstallationState {
    /// Returns true if the engine is installed and usable.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Returns true while download/extract/install work is in flight.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            Self::Checking
                | Self::Downloading { .. }
                | Self::Extracting { .. }
                | Self::Locating
                | Self::Installing
        )
    }

    /// Returns true if provisioning may be (re)started from this state.
    pub fn can_provision(&self) -> bool {
        matches!(self, Self::Missing | Self::Failed { .. })
    }

    /// Returns true if `next` is a legal successor of this state.
    ///
    /// States only move forward. `Failed` is reachable from every
    /// non-terminal state and is left only through `Missing` (explicit
    /// restart) or a new presence check.
    pub fn can_transition_to(&self, next: &InstallationState) -> bool {
        use InstallationState::*;

        match (self, next) {
            (NotChecked | Missing | Ready | Failed { .. }, Checking) => true,
            (Failed { .. }, Missing) => true,
            (Ready | Failed { .. }, _) => false,
            (_, Failed { .. }) => true,
            (Checking, Ready | Missing) => true,
            (Missing, Downloading { .. } | Extracting { .. }) => true,
            (Downloading { .. }, Downloading { .. } | Extracting { .. }) => true,
            (Extracting { .. }, Extracting { .. } | Locating) => true,
            (Locating, Installing) => true,
            (Installing, Ready) => true,
            _ => false,
        }
    }
}

impl fmt::Display for InstallationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotChecked => write!(f, "not checked"),
            Self::Checking => write!(f, "checking"),
            Self::Missing => write!(f, "missing"),
            Self::Downloading { percent: Some(p) } => write!(f, "downloading ({:.1}%)", p),
            Self::Downloading { percent: None } => write!(f, "downloading"),
            Self::Extracting { percent } => write!(f, "extracting ({:.1}%)", percent),
            Self::Locating => write!(f, "locating"),
            Self::Installing => write!(f, "installing"),
            Self::Ready => write!(f, "ready"),
            Self::Failed { stage, reason } => write!(f, "failed at {}: {}", stage, reason),
        }
    }
}
