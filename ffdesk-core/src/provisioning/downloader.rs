//! Engine archive downloads with progress reporting and verification.
//!
//! Two strategies are available: a streamed `reqwest` body, and the system
//! `curl` whose `-#` progress bar is scraped from stderr. Either way the
//! caller only ever sees non-decreasing percentages, and the result is
//! checked (non-empty, size, SHA256) before it is handed to extraction.

use anyhow::Context;
use futures::StreamExt;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, info, warn};
use url::Url;

use super::types::{AssetDescriptor, Platform};
use crate::config::EngineConfig;
use crate::error::ProvisionError;

/// Program run by the curl strategy when none is configured.
const DEFAULT_CURL_PROGRAM: &str = "curl";

/// Read size used when hashing a finished download.
const HASH_CHUNK_SIZE: usize = 64 * 1024;

fn curl_percent_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+\.\d+)%").expect("valid percent regex"))
}

// ============================================================================
// Strategy
// ============================================================================

/// How the archive is fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStrategy {
    /// Streamed HTTP body via reqwest.
    Http,
    /// External `curl -L -#`, percentages scraped from stderr.
    Curl,
}

impl DownloadStrategy {
    /// Default strategy for a platform (macOS ships curl and uses it).
    pub fn for_platform(platform: Platform) -> Self {
        match platform {
            Platform::Macos => Self::Curl,
            Platform::Windows | Platform::Linux => Self::Http,
        }
    }
}

impl fmt::Display for DownloadStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http => write!(f, "http"),
            Self::Curl => write!(f, "curl"),
        }
    }
}

impl std::str::FromStr for DownloadStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "http" | "reqwest" => Ok(Self::Http),
            "curl" => Ok(Self::Curl),
            _ => Err(format!("Unknown download strategy: {}", s)),
        }
    }
}

// ============================================================================
// URL Security Validation
// ============================================================================

/// Validates that a URL is safe for downloading.
///
/// Checks:
/// - URL scheme must be HTTPS
/// - Host must be one of `allowed_domains` or a subdomain of one
pub fn validate_url(url_str: &str, allowed_domains: &[String]) -> Result<(), ProvisionError> {
    let url = Url::parse(url_str)
        .map_err(|e| ProvisionError::Verification(format!("Invalid URL {}: {}", url_str, e)))?;

    if url.scheme() != "https" {
        return Err(ProvisionError::Verification(format!(
            "URL must use HTTPS: {}",
            url_str
        )));
    }

    let host = url
        .host_str()
        .ok_or_else(|| ProvisionError::Verification(format!("URL must have a host: {}", url_str)))?
        .to_lowercase();

    let is_allowed = allowed_domains
        .iter()
        .any(|domain| host == *domain || host.ends_with(&format!(".{}", domain)));

    if !is_allowed {
        return Err(ProvisionError::Verification(format!(
            "Download domain not allowed: {}. Allowed: {:?}",
            host, allowed_domains
        )));
    }

    Ok(())
}

// ============================================================================
// Download Progress
// ============================================================================

/// Progress information during a download.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DownloadProgress {
    /// Bytes downloaded so far (unknown when curl does the transfer).
    pub bytes_downloaded: Option<u64>,
    /// Total bytes expected (if known from Content-Length header).
    pub total_bytes: Option<u64>,
    /// Progress percentage (0.0 to 100.0), or None if total is unknown.
    pub percent: Option<f64>,
}

impl DownloadProgress {
    fn from_bytes(bytes_downloaded: u64, total_bytes: Option<u64>) -> Self {
        let percent = total_bytes
            .filter(|total| *total > 0)
            .map(|total| (bytes_downloaded as f64 / total as f64 * 100.0).min(100.0));

        Self {
            bytes_downloaded: Some(bytes_downloaded),
            total_bytes,
            percent,
        }
    }

    fn from_percent(percent: f64) -> Self {
        Self {
            bytes_downloaded: None,
            total_bytes: None,
            percent: Some(percent),
        }
    }
}

/// Forwards a percentage only when it is strictly greater than the last one.
#[derive(Debug, Default, Clone)]
pub struct MonotonicProgress {
    last: Option<f64>,
}

impl MonotonicProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the clamped value if it should be reported.
    pub fn offer(&mut self, percent: f64) -> Option<f64> {
        if !percent.is_finite() {
            return None;
        }
        let percent = percent.clamp(0.0, 100.0);
        match self.last {
            Some(last) if percent <= last => None,
            _ => {
                self.last = Some(percent);
                Some(percent)
            }
        }
    }

    /// Last reported value.
    pub fn last(&self) -> Option<f64> {
        self.last
    }
}

// ============================================================================
// Downloader
// ============================================================================

/// Fetches engine archives according to the configured strategy.
#[derive(Debug, Clone)]
pub struct Downloader {
    client: reqwest::Client,
    strategy: DownloadStrategy,
    allowed_domains: Vec<String>,
    curl_program: PathBuf,
}

impl Downloader {
    pub fn new(config: &EngineConfig) -> Result<Self, ProvisionError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .build()?;

        Ok(Self::with_client(client, config))
    }

    /// Uses an existing HTTP client (connection pools are shared).
    pub fn with_client(client: reqwest::Client, config: &EngineConfig) -> Self {
        Self {
            client,
            strategy: config.download_strategy,
            allowed_domains: config.allowed_domains.clone(),
            curl_program: config
                .curl_binary
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CURL_PROGRAM)),
        }
    }

    pub fn strategy(&self) -> DownloadStrategy {
        self.strategy
    }

    /// Downloads `asset` to `dest` and verifies it.
    ///
    /// Returns the size of the downloaded file in bytes. On a failed
    /// verification the partial file is removed.
    pub async fn download<F>(
        &self,
        asset: &AssetDescriptor,
        dest: &Path,
        mut on_progress: F,
    ) -> Result<u64, ProvisionError>
    where
        F: FnMut(DownloadProgress),
    {
        info!(
            url = %asset.download_url,
            dest = %dest.display(),
            strategy = %self.strategy,
            "Downloading engine archive"
        );

        validate_url(&asset.download_url, &self.allowed_domains)?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let mut gate = MonotonicProgress::new();
        let mut report = |progress: DownloadProgress| match progress.percent {
            Some(percent) => {
                if let Some(percent) = gate.offer(percent) {
                    on_progress(DownloadProgress {
                        percent: Some(percent),
                        ..progress
                    });
                }
            }
            None => on_progress(progress),
        };

        match self.strategy {
            DownloadStrategy::Http => {
                self.fetch_http(&asset.download_url, dest, &mut report)
                    .await?
            }
            DownloadStrategy::Curl => {
                fetch_curl(&self.curl_program, &asset.download_url, dest, &mut report).await?
            }
        }

        match verify_file(dest, asset).await {
            Ok(size) => {
                info!(bytes = size, dest = %dest.display(), "Download complete");
                Ok(size)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(dest).await;
                Err(e)
            }
        }
    }

    async fn fetch_http<F>(
        &self,
        url: &str,
        dest: &Path,
        report: &mut F,
    ) -> Result<(), ProvisionError>
    where
        F: FnMut(DownloadProgress),
    {
        let response = self.client.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProvisionError::Network(format!(
                "Download failed with status {}: {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("Unknown error")
            )));
        }

        let total_bytes = response.content_length();
        debug!(content_length = ?total_bytes, "Response received");

        let mut file = File::create(dest)
            .await
            .with_context(|| format!("Failed to create file: {}", dest.display()))?;

        let mut stream = response.bytes_stream();
        let mut bytes_downloaded: u64 = 0;

        // Unknown totals get a single indeterminate update.
        report(DownloadProgress::from_bytes(0, total_bytes));

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk)
                .await
                .context("Failed to write chunk to file")?;

            bytes_downloaded += chunk.len() as u64;
            if total_bytes.is_some() {
                report(DownloadProgress::from_bytes(bytes_downloaded, total_bytes));
            }
        }

        file.flush().await.context("Failed to flush file")?;
        Ok(())
    }
}

/// Runs `curl -L <url> -o <dest> -#` and relays its progress bar.
async fn fetch_curl<F>(
    program: &Path,
    url: &str,
    dest: &Path,
    report: &mut F,
) -> Result<(), ProvisionError>
where
    F: FnMut(DownloadProgress),
{
    let mut child = Command::new(program)
        .arg("-L")
        .arg("--fail")
        .arg(url)
        .arg("-o")
        .arg(dest)
        .arg("-#")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ProvisionError::Network(format!("Failed to run curl: {}", e)))?;

    if let Some(mut stderr) = child.stderr.take() {
        let mut buf = [0u8; 1024];
        let mut pending = String::new();

        loop {
            let n = match stderr.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!(error = %e, "Stopped reading curl output");
                    break;
                }
            };
            pending.push_str(&String::from_utf8_lossy(&buf[..n]));

            // Only scan complete segments so a number split across reads is never misread.
            if let Some(end) = pending.rfind(['\r', '\n']) {
                for percent in scrape_percentages(&pending[..end]) {
                    report(DownloadProgress::from_percent(percent));
                }
                pending.drain(..=end);
            }
        }

        for percent in scrape_percentages(&pending) {
            report(DownloadProgress::from_percent(percent));
        }
    }

    let status = child
        .wait()
        .await
        .map_err(|e| ProvisionError::Network(format!("Failed to wait for curl: {}", e)))?;

    if !status.success() {
        return Err(ProvisionError::Network(match status.code() {
            Some(code) => format!("curl exited with code {}", code),
            None => "curl was terminated".to_string(),
        }));
    }

    Ok(())
}

/// Extracts every `NN.N%` value from curl's progress output.
fn scrape_percentages(text: &str) -> Vec<f64> {
    curl_percent_regex()
        .captures_iter(text)
        .filter_map(|caps| caps.get(1)?.as_str().parse().ok())
        .collect()
}

// ============================================================================
// Verification
// ============================================================================

/// Checks a finished download against what the catalog promised.
///
/// Returns the file size.
pub async fn verify_file(path: &Path, asset: &AssetDescriptor) -> Result<u64, ProvisionError> {
    let size = tokio::fs::metadata(path)
        .await
        .map_err(|e| ProvisionError::Verification(format!("Downloaded file missing: {}", e)))?
        .len();

    if size == 0 {
        return Err(ProvisionError::Verification(
            "Downloaded file is empty".to_string(),
        ));
    }

    if let Some(expected) = asset.known_size() {
        if size != expected {
            return Err(ProvisionError::Verification(format!(
                "Size mismatch: expected {} bytes, got {}",
                expected, size
            )));
        }
    }

    if let Some(expected) = asset.sha256.as_deref() {
        let actual = sha256_file(path).await?;
        if actual != expected.to_lowercase() {
            warn!(expected, actual = %actual, "SHA256 mismatch");
            return Err(ProvisionError::Verification(format!(
                "SHA256 checksum mismatch!\nExpected: {}\nActual: {}",
                expected, actual
            )));
        }
        debug!("SHA256 verified: {}", actual);
    }

    Ok(size)
}

/// Hashes a file without loading it into memory.
async fn sha256_file(path: &Path) -> Result<String, ProvisionError> {
    let mut file = File::open(path)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_CHUNK_SIZE];

    loop {
        let n = file
            .read(&mut buf)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(format_sha256_hex(&hasher.finalize()))
}

/// Formats a SHA256 hash as lowercase hex without using the hex crate.
fn format_sha256_hex(hash: &[u8]) -> String {
    hash.iter().map(|b| format!("{:02x}", b)).collect()
}
