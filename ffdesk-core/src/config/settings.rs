//! Engine configuration.
//!
//! Configuration is assembled from defaults plus `FFDESK_*` environment
//! overrides. Nothing here is written to disk; the only persisted state is the
//! engine binary itself (and its manifest) in the binaries directory.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::provisioning::downloader::DownloadStrategy;
use crate::provisioning::paths;
use crate::provisioning::types::Platform;

// =============================================================================
// Defaults
// =============================================================================

/// Release catalog queried on Windows.
pub const DEFAULT_RELEASE_API_URL: &str =
    "https://api.github.com/repos/GyanD/codexffmpeg/releases/latest";

/// Single well-known macOS asset (always the newest build).
pub const DEFAULT_MAC_DOWNLOAD_URL: &str = "https://evermeet.cx/ffmpeg/getrelease/zip";

/// Hosts engine archives may be downloaded from (subdomains included).
pub const DEFAULT_ALLOWED_DOMAINS: &[&str] =
    &["github.com", "githubusercontent.com", "evermeet.cx"];

/// User agent sent to catalog and download hosts (GitHub rejects requests without one).
pub const DEFAULT_USER_AGENT: &str = concat!("ffdesk/", env!("CARGO_PKG_VERSION"));

// =============================================================================
// Engine Configuration
// =============================================================================

/// Settings for locating, provisioning, and running the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Platform the engine is provisioned for.
    pub platform: Platform,

    /// Directory holding the engine executable.
    pub binaries_dir: PathBuf,

    /// Parent of the download / extraction scratch directories.
    pub temp_dir: PathBuf,

    /// How archives are fetched.
    pub download_strategy: DownloadStrategy,

    /// Hosts downloads are allowed from.
    pub allowed_domains: Vec<String>,

    /// Explicit 7-Zip executable; searched on PATH when unset.
    pub sevenzip_binary: Option<PathBuf>,

    /// Explicit curl executable for the curl strategy; `curl` on PATH when unset.
    pub curl_binary: Option<PathBuf>,

    /// GitHub release endpoint used as the Windows catalog.
    pub release_api_url: String,

    /// Fixed macOS asset URL.
    pub mac_download_url: String,

    /// User agent for HTTP requests.
    pub user_agent: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let platform = Platform::current();

        Self {
            platform,
            binaries_dir: paths::default_binaries_dir(),
            temp_dir: paths::default_temp_dir(),
            download_strategy: DownloadStrategy::for_platform(platform),
            allowed_domains: DEFAULT_ALLOWED_DOMAINS
                .iter()
                .map(|d| d.to_string())
                .collect(),
            sevenzip_binary: None,
            curl_binary: None,
            release_api_url: DEFAULT_RELEASE_API_URL.to_string(),
            mac_download_url: DEFAULT_MAC_DOWNLOAD_URL.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl EngineConfig {
    /// Builds a configuration from defaults and `FFDESK_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration using `lookup` in place of the process environment.
    ///
    /// Recognized keys:
    /// - `FFDESK_BINARIES_DIR`
    /// - `FFDESK_TEMP_DIR`
    /// - `FFDESK_DOWNLOAD_STRATEGY` (`http` | `curl`)
    /// - `FFDESK_7Z_PATH`
    /// - `FFDESK_CURL_PATH`
    /// - `FFDESK_ALLOWED_DOMAINS` (comma separated)
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(dir) = lookup("FFDESK_BINARIES_DIR").filter(|v| !v.trim().is_empty()) {
            config.binaries_dir = PathBuf::from(dir);
        }

        if let Some(dir) = lookup("FFDESK_TEMP_DIR").filter(|v| !v.trim().is_empty()) {
            config.temp_dir = PathBuf::from(dir);
        }

        if let Some(value) = lookup("FFDESK_DOWNLOAD_STRATEGY") {
            match value.parse::<DownloadStrategy>() {
                Ok(strategy) => config.download_strategy = strategy,
                Err(e) => {
                    tracing::warn!(error = %e, "Ignoring FFDESK_DOWNLOAD_STRATEGY");
                }
            }
        }

        if let Some(path) = lookup("FFDESK_7Z_PATH").filter(|v| !v.trim().is_empty()) {
            config.sevenzip_binary = Some(PathBuf::from(path));
        }

        if let Some(path) = lookup("FFDESK_CURL_PATH").filter(|v| !v.trim().is_empty()) {
            config.curl_binary = Some(PathBuf::from(path));
        }

        if let Some(domains) = lookup("FFDESK_ALLOWED_DOMAINS") {
            let parsed: Vec<String> = domains
                .split(',')
                .map(|d| d.trim().to_lowercase())
                .filter(|d| !d.is_empty())
                .collect();
            if !parsed.is_empty() {
                config.allowed_domains = parsed;
            }
        }

        config
    }

    /// Expected location of the engine executable.
    pub fn engine_binary_path(&self) -> PathBuf {
        paths::engine_binary_path(&self.binaries_dir, self.platform)
    }

    /// Scratch directory for the downloaded archive.
    pub fn download_dir(&self) -> PathBuf {
        paths::download_dir(&self.temp_dir)
    }

    /// Scratch directory for extracted archive contents.
    pub fn extract_dir(&self) -> PathBuf {
        paths::extract_dir(&self.temp_dir)
    }

    /// Location of the installed-engine manifest.
    pub fn manifest_path(&self) -> PathBuf {
        paths::manifest_path(&self.binaries_dir)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_config_default() {
        let config = EngineConfig::default();
        assert_eq!(config.platform, Platform::current());
        assert_eq!(config.release_api_url, DEFAULT_RELEASE_API_URL);
        assert_eq!(config.mac_download_url, DEFAULT_MAC_DOWNLOAD_URL);
        assert!(config.allowed_domains.contains(&"github.com".to_string()));
        assert!(config.sevenzip_binary.is_none());
        assert!(config.curl_binary.is_none());
        assert!(config.user_agent.starts_with("ffdesk/"));
    }

    #[test]
    fn test_config_env_overrides() {
        let config = EngineConfig::from_lookup(lookup_from(&[
            ("FFDESK_BINARIES_DIR", "/opt/engine"),
            ("FFDESK_TEMP_DIR", "/scratch"),
            ("FFDESK_DOWNLOAD_STRATEGY", "curl"),
            ("FFDESK_7Z_PATH", "/usr/local/bin/7zz"),
            ("FFDESK_CURL_PATH", "/opt/homebrew/bin/curl"),
            ("FFDESK_ALLOWED_DOMAINS", " Example.org , mirror.net,"),
        ]));

        assert_eq!(config.binaries_dir, PathBuf::from("/opt/engine"));
        assert_eq!(config.temp_dir, PathBuf::from("/scratch"));
        assert_eq!(config.download_strategy, DownloadStrategy::Curl);
        assert_eq!(
            config.sevenzip_binary,
            Some(PathBuf::from("/usr/local/bin/7zz"))
        );
        assert_eq!(
            config.curl_binary,
            Some(PathBuf::from("/opt/homebrew/bin/curl"))
        );
        assert_eq!(config.allowed_domains, vec!["example.org", "mirror.net"]);
        assert_eq!(config.download_dir(), PathBuf::from("/scratch/ffmpeg-download"));
        assert_eq!(config.extract_dir(), PathBuf::from("/scratch/ffmpeg-extract"));
    }

    #[test]
    fn test_config_ignores_invalid_values() {
        let config = EngineConfig::from_lookup(lookup_from(&[
            ("FFDESK_BINARIES_DIR", "   "),
            ("FFDESK_DOWNLOAD_STRATEGY", "carrier-pigeon"),
            ("FFDESK_ALLOWED_DOMAINS", ",,"),
        ]));
        let defaults = EngineConfig::default();

        assert_eq!(config.binaries_dir, defaults.binaries_dir);
        assert_eq!(config.download_strategy, defaults.download_strategy);
        assert_eq!(config.allowed_domains, defaults.allowed_domains);
    }

    #[test]
    fn test_engine_binary_path_uses_platform_name() {
        let mut config = EngineConfig::default();
        config.binaries_dir = PathBuf::from("/opt/engine");

        config.platform = Platform::Linux;
        assert_eq!(config.engine_binary_path(), PathBuf::from("/opt/engine/ffmpeg"));

        config.platform = Platform::Windows;
        assert!(config
            .engine_binary_path()
            .to_string_lossy()
            .ends_with("ffmpeg.exe"));
    }

    #[test]
    fn test_config_serialization() {
        let config = EngineConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: EngineConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.binaries_dir, config.binaries_dir);
        assert_eq!(parsed.download_strategy, config.download_strategy);
        assert_eq!(parsed.allowed_domains, config.allowed_domains);
    }

    #[test]
    fn test_config_partial_json_uses_defaults() {
        let parsed: EngineConfig =
            serde_json::from_str(r#"{"binaries_dir": "/srv/ffmpeg"}"#).unwrap();
        assert_eq!(parsed.binaries_dir, PathBuf::from("/srv/ffmpeg"));
        assert_eq!(parsed.release_api_url, DEFAULT_RELEASE_API_URL);
    }
}
