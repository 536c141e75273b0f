//! Provisioning pipeline: presence check, catalog, download, extract,
//! locate, install, finalize.
//!
//! [`Provisioner`] owns the [`InstallationState`] and reports every change
//! as a [`ProvisionEvent`]. A failed stage leaves the state at
//! `Failed { stage, reason }`; nothing is retried automatically.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::catalog::{self, CatalogSource};
use super::downloader::{DownloadProgress, Downloader};
use super::extractor::extract_archive;
use super::installer;
use super::locator::locate_binary;
use super::manifest::{load_manifest_from, save_manifest_to};
use super::paths;
use super::types::{AssetDescriptor, InstallationState, ProvisionStage};
use crate::config::EngineConfig;
use crate::error::{ProvisionError, StageError};

// =============================================================================
// Events
// =============================================================================

/// Events sent from the provisioner to the UI.
#[derive(Debug, Clone, PartialEq)]
pub enum ProvisionEvent {
    /// Result of a presence check.
    Presence(bool),

    /// The installation state moved to a new phase.
    StateChanged(InstallationState),

    /// Download progress; percentages never decrease within one download.
    DownloadProgress(DownloadProgress),

    /// Extraction progress; ends at 100.
    ExtractProgress { percent: f64 },

    /// The engine is installed and executable.
    Installed { path: PathBuf, version: String },

    /// Provisioning stopped at `stage`.
    InstallError {
        stage: ProvisionStage,
        message: String,
    },
}

/// Sender for provisioning events.
pub type ProvisionEventSender = mpsc::UnboundedSender<ProvisionEvent>;

/// Receiver for provisioning events.
pub type ProvisionEventReceiver = mpsc::UnboundedReceiver<ProvisionEvent>;

/// Create an event channel for streaming provisioning events.
pub fn provision_event_channel() -> (ProvisionEventSender, ProvisionEventReceiver) {
    mpsc::unbounded_channel()
}

fn at(stage: ProvisionStage) -> impl FnOnce(ProvisionError) -> StageError {
    move |source| StageError::new(stage, source)
}

// =============================================================================
// Provisioner
// =============================================================================

/// Drives the installation state machine for the engine binary.
pub struct Provisioner {
    config: EngineConfig,
    events: ProvisionEventSender,
    state: Mutex<InstallationState>,
    client: reqwest::Client,
    catalog: Option<Box<dyn CatalogSource>>,
}

impl std::fmt::Debug for Provisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provisioner")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Provisioner {
    pub fn new(config: EngineConfig, events: ProvisionEventSender) -> Result<Self, ProvisionError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .build()?;

        Ok(Self {
            config,
            events,
            state: Mutex::new(InstallationState::NotChecked),
            client,
            catalog: None,
        })
    }

    /// Replaces the platform catalog.
    pub fn with_catalog(mut self, catalog: Box<dyn CatalogSource>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> InstallationState {
        self.lock().clone()
    }

    /// Where the engine binary lives once installed.
    pub fn engine_path(&self) -> PathBuf {
        self.config.engine_binary_path()
    }

    // -------------------------------------------------------------------------
    // State handling
    // -------------------------------------------------------------------------

    fn lock(&self) -> MutexGuard<'_, InstallationState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: ProvisionEvent) {
        if self.events.send(event).is_err() {
            debug!("Provision event receiver dropped");
        }
    }

    /// Sets `next` and reports it. Caller holds the lock so events stay ordered.
    fn enter(&self, state: &mut InstallationState, next: InstallationState) {
        debug!(from = %state, to = %next, "Installation state change");
        *state = next.clone();
        self.emit(ProvisionEvent::StateChanged(next));
    }

    fn transition(&self, next: InstallationState) -> Result<(), ProvisionError> {
        let mut state = self.lock();
        if !state.can_transition_to(&next) {
            return Err(ProvisionError::InvalidState {
                operation: "advance provisioning",
                state: state.to_string(),
            });
        }
        self.enter(&mut state, next);
        Ok(())
    }

    /// Updates an in-phase percentage without a `StateChanged` event.
    fn update_progress(&self, next: InstallationState) {
        let mut state = self.lock();
        if state.can_transition_to(&next) {
            *state = next;
        }
    }

    /// Moves from `Missing` / `Failed` into the first working phase.
    fn claim(&self, first: InstallationState) -> Result<(), ProvisionError> {
        let mut state = self.lock();
        if !state.can_provision() {
            return Err(ProvisionError::InvalidState {
                operation: "start provisioning",
                state: state.to_string(),
            });
        }
        if matches!(*state, InstallationState::Failed { .. }) {
            self.enter(&mut state, InstallationState::Missing);
        }
        self.enter(&mut state, first);
        Ok(())
    }

    fn fail(&self, err: StageError) -> ProvisionError {
        error!(stage = %err.stage, error = %err.source, "Provisioning failed");
        let message = err.source.to_string();

        let mut state = self.lock();
        self.enter(
            &mut state,
            InstallationState::Failed {
                stage: err.stage,
                reason: message.clone(),
            },
        );
        self.emit(ProvisionEvent::InstallError {
            stage: err.stage,
            message,
        });

        err.source
    }

    // -------------------------------------------------------------------------
    // Operations
    // -------------------------------------------------------------------------

    /// Checks whether an executable engine is installed.
    ///
    /// Moves through `Checking` to `Ready` or `Missing` and emits `Presence`.
    pub async fn check_presence(&self) -> Result<bool, ProvisionError> {
        {
            let mut state = self.lock();
            if !state.can_transition_to(&InstallationState::Checking) {
                return Err(ProvisionError::InvalidState {
                    operation: "check presence",
                    state: state.to_string(),
                });
            }
            self.enter(&mut state, InstallationState::Checking);
        }

        let path = self.engine_path();
        let present = installer::is_executable(&path).await;
        info!(path = %path.display(), present, "Engine presence checked");

        let mut state = self.lock();
        let next = if present {
            InstallationState::Ready
        } else {
            InstallationState::Missing
        };
        self.enter(&mut state, next);
        self.emit(ProvisionEvent::Presence(present));

        Ok(present)
    }

    /// Lists downloadable engine builds for the configured platform.
    pub async fn fetch_catalog(&self) -> Result<Vec<AssetDescriptor>, ProvisionError> {
        match &self.catalog {
            Some(source) => source.fetch().await,
            None => {
                catalog::catalog_for(&self.config, self.client.clone())?
                    .fetch()
                    .await
            }
        }
    }

    /// Fetches the catalog, picks an asset and provisions it.
    pub async fn provision_latest(&self) -> Result<PathBuf, ProvisionError> {
        let state = self.state();
        if !state.can_provision() {
            return Err(ProvisionError::InvalidState {
                operation: "start provisioning",
                state: state.to_string(),
            });
        }

        let asset = match self.fetch_catalog().await {
            Ok(assets) => catalog::select_asset(&assets).cloned().ok_or_else(|| {
                ProvisionError::UnsupportedArchive("no .zip or .7z asset in catalog".to_string())
            }),
            Err(e) => Err(e),
        };

        match asset {
            Ok(asset) => self.provision_asset(&asset).await,
            Err(e) => Err(self.fail(StageError::new(ProvisionStage::Catalog, e))),
        }
    }

    /// Downloads and installs the archive at `download_url`.
    ///
    /// Only valid from `Missing` or `Failed`.
    pub async fn begin_provisioning(&self, download_url: &str) -> Result<PathBuf, ProvisionError> {
        self.provision_asset(&AssetDescriptor::from_url(download_url))
            .await
    }

    /// Downloads and installs `asset`, verifying size and checksum when known.
    pub async fn provision_asset(&self, asset: &AssetDescriptor) -> Result<PathBuf, ProvisionError> {
        self.claim(InstallationState::Downloading { percent: None })?;
        info!(asset = %asset.name, version = %asset.version, "Provisioning engine");

        match self.download_and_install(asset).await {
            Ok(path) => Ok(path),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Installs from an archive that is already on disk.
    pub async fn install_local_archive(&self, archive: &Path) -> Result<PathBuf, ProvisionError> {
        self.claim(InstallationState::Extracting { percent: 0.0 })?;

        let size = match tokio::fs::metadata(archive).await {
            Ok(metadata) => metadata.len(),
            Err(e) => {
                return Err(self.fail(StageError::new(ProvisionStage::Extract, e.into())));
            }
        };

        let asset = AssetDescriptor {
            version: "local".to_string(),
            name: archive
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            size_bytes: size,
            download_url: archive.display().to_string(),
            sha256: None,
        };

        match self.install_archive(archive, &asset, size).await {
            Ok(path) => Ok(path),
            Err(e) => Err(self.fail(e)),
        }
    }

    // -------------------------------------------------------------------------
    // Stages
    // -------------------------------------------------------------------------

    async fn download_and_install(&self, asset: &AssetDescriptor) -> Result<PathBuf, StageError> {
        let download_dir = self.config.download_dir();
        paths::ensure_dirs_exist(&[&download_dir])
            .await
            .map_err(|e| StageError::new(ProvisionStage::Download, e.into()))?;

        let archive = download_dir.join(asset.archive_file_name());
        let downloader = Downloader::with_client(self.client.clone(), &self.config);

        let size = downloader
            .download(asset, &archive, |progress| {
                self.update_progress(InstallationState::Downloading {
                    percent: progress.percent,
                });
                self.emit(ProvisionEvent::DownloadProgress(progress));
            })
            .await
            .map_err(at(ProvisionStage::Download))?;

        self.transition(InstallationState::Extracting { percent: 0.0 })
            .map_err(at(ProvisionStage::Extract))?;

        self.install_archive(&archive, asset, size).await
    }

    /// Extract, locate, install, finalize. Expects state `Extracting`.
    async fn install_archive(
        &self,
        archive: &Path,
        asset: &AssetDescriptor,
        archive_size: u64,
    ) -> Result<PathBuf, StageError> {
        let extract_dir = self.config.extract_dir();
        installer::cleanup_dirs(&[&extract_dir]).await;

        extract_archive(
            archive,
            &extract_dir,
            self.config.sevenzip_binary.as_deref(),
            |percent| {
                self.update_progress(InstallationState::Extracting { percent });
                self.emit(ProvisionEvent::ExtractProgress { percent });
            },
        )
        .await
        .map_err(at(ProvisionStage::Extract))?;

        self.transition(InstallationState::Locating)
            .map_err(at(ProvisionStage::Locate))?;

        let name = self.config.platform.engine_binary_name();
        let found = locate_binary(&extract_dir, name)
            .await
            .map_err(|e| StageError::new(ProvisionStage::Locate, e.into()))?
            .ok_or_else(|| StageError::new(ProvisionStage::Locate, ProvisionError::BinaryNotFound))?;
        info!(path = %found.display(), "Located engine binary");

        self.transition(InstallationState::Installing)
            .map_err(at(ProvisionStage::Install))?;

        let dest = self.engine_path();
        installer::move_file(&found, &dest)
            .await
            .map_err(|e| StageError::new(ProvisionStage::Install, e.into()))?;

        self.finalize(&dest, asset, archive_size).await?;
        Ok(dest)
    }

    async fn finalize(
        &self,
        dest: &Path,
        asset: &AssetDescriptor,
        archive_size: u64,
    ) -> Result<(), StageError> {
        installer::make_executable(dest)
            .map_err(|e| StageError::new(ProvisionStage::Finalize, e.into()))?;

        installer::cleanup_dirs(&[&self.config.download_dir(), &self.config.extract_dir()]).await;
        self.record_install(asset, archive_size).await;

        self.transition(InstallationState::Ready)
            .map_err(at(ProvisionStage::Finalize))?;

        info!(path = %dest.display(), version = %asset.version, "Engine installed");
        self.emit(ProvisionEvent::Installed {
            path: dest.to_path_buf(),
            version: asset.version.clone(),
        });
        Ok(())
    }

    /// Writes the manifest on the blocking pool; failures are logged only.
    async fn record_install(&self, asset: &AssetDescriptor, archive_size: u64) {
        let path = self.config.manifest_path();
        let platform = self.config.platform;
        let asset = asset.clone();

        let target = path.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut manifest = load_manifest_from(&target)?;
            manifest.mark_installed(&asset, archive_size, platform);
            save_manifest_to(&manifest, &target)
        })
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(path = %path.display(), error = %e, "Failed to write engine manifest")
            }
            Err(e) => warn!(error = %e, "Manifest task failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provisioning::catalog::FixedAssetCatalog;
    use crate::provisioning::manifest::load_manifest_from;
    use crate::provisioning::types::Platform;
    use async_trait::async_trait;
    use std::io::Write;
    use tempfile::TempDir;

    fn test_config(temp: &TempDir) -> EngineConfig {
        EngineConfig {
            platform: Platform::Linux,
            binaries_dir: temp.path().join("binaries"),
            temp_dir: temp.path().join("scratch"),
            ..EngineConfig::default()
        }
    }

    fn drain(rx: &mut ProvisionEventReceiver) -> Vec<ProvisionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn write_engine_zip(path: &Path, binary_name: &str) {
        let file = std::fs::File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored);

        zip.start_file("ffmpeg-7.1/README.txt", options).unwrap();
        zip.write_all(b"readme").unwrap();
        zip.start_file(format!("ffmpeg-7.1/bin/{}", binary_name), options)
            .unwrap();
        zip.write_all(b"#!/bin/sh\nexit 0\n").unwrap();
        zip.finish().unwrap();
    }

    struct FailingCatalog;

    #[async_trait]
    impl CatalogSource for FailingCatalog {
        async fn fetch(&self) -> Result<Vec<AssetDescriptor>, ProvisionError> {
            Err(ProvisionError::Network("rate limited".to_string()))
        }
    }

    #[tokio::test]
    async fn test_check_presence_missing() {
        let temp = TempDir::new().unwrap();
        let (tx, mut rx) = provision_event_channel();
        let provisioner = Provisioner::new(test_config(&temp), tx).unwrap();

        assert!(!provisioner.check_presence().await.unwrap());
        assert_eq!(provisioner.state(), InstallationState::Missing);
        assert_eq!(
            drain(&mut rx),
            vec![
                ProvisionEvent::StateChanged(InstallationState::Checking),
                ProvisionEvent::StateChanged(InstallationState::Missing),
                ProvisionEvent::Presence(false),
            ]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_check_presence_ready() {
        let temp = TempDir::new().unwrap();
        let config = test_config(&temp);
        std::fs::create_dir_all(&config.binaries_dir).unwrap();
        let binary = config.engine_binary_path();
        std::fs::write(&binary, b"#!/bin/sh\n").unwrap();
        installer::make_executable(&binary).unwrap();

        let (tx, _rx) = provision_event_channel();
        let provisioner = Provisioner::new(config, tx).unwrap();

        assert!(provisioner.check_presence().await.unwrap());
        assert!(provisioner.state().is_ready());
        assert!(matches!(
            provisioner.begin_provisioning("https://github.com/x/ffmpeg.zip").await,
            Err(ProvisionError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_provisioning_requires_presence_check() {
        let temp = TempDir::new().unwrap();
        let (tx, mut rx) = provision_event_channel();
        let provisioner = Provisioner::new(test_config(&temp), tx).unwrap();

        let result = provisioner
            .begin_provisioning("https://github.com/x/ffmpeg.zip")
            .await;

        assert!(matches!(result, Err(ProvisionError::InvalidState { .. })));
        assert_eq!(provisioner.state(), InstallationState::NotChecked);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_install_local_archive() {
        let temp = TempDir::new().unwrap();
        let config = test_config(&temp);
        let archive = temp.path().join("ffmpeg-7.1.zip");
        write_engine_zip(&archive, "ffmpeg");

        let (tx, mut rx) = provision_event_channel();
        let provisioner = Provisioner::new(config.clone(), tx).unwrap();
        provisioner.check_presence().await.unwrap();
        drain(&mut rx);

        let installed = provisioner.install_local_archive(&archive).await.unwrap();

        assert_eq!(installed, config.engine_binary_path());
        assert!(installed.exists());
        assert!(provisioner.state().is_ready());
        assert!(!config.extract_dir().exists());
        assert!(archive.exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&installed).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }

        let manifest = load_manifest_from(&config.manifest_path()).unwrap();
        assert_eq!(manifest.engine.unwrap().version, "local");

        let events = drain(&mut rx);
        assert_eq!(
            events.first(),
            Some(&ProvisionEvent::StateChanged(InstallationState::Extracting {
                percent: 0.0
            }))
        );
        assert!(events.contains(&ProvisionEvent::ExtractProgress { percent: 100.0 }));
        assert!(events.contains(&ProvisionEvent::StateChanged(InstallationState::Locating)));
        assert!(events.contains(&ProvisionEvent::StateChanged(InstallationState::Ready)));
        assert!(matches!(
            events.last(),
            Some(ProvisionEvent::Installed { .. })
        ));
    }

    #[tokio::test]
    async fn test_unwritable_manifest_does_not_block_ready() {
        let temp = TempDir::new().unwrap();
        let config = test_config(&temp);
        std::fs::create_dir_all(config.manifest_path()).unwrap();
        let archive = temp.path().join("ffmpeg-7.1.zip");
        write_engine_zip(&archive, "ffmpeg");

        let (tx, _rx) = provision_event_channel();
        let provisioner = Provisioner::new(config.clone(), tx).unwrap();
        provisioner.check_presence().await.unwrap();

        let installed = provisioner.install_local_archive(&archive).await.unwrap();

        assert!(installed.exists());
        assert!(provisioner.state().is_ready());
        assert!(config.manifest_path().is_dir());
    }

    #[tokio::test]
    async fn test_archive_without_binary_fails_at_locate_then_restarts() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("wrong.zip");
        write_engine_zip(&archive, "ffprobe");

        let (tx, mut rx) = provision_event_channel();
        let provisioner = Provisioner::new(test_config(&temp), tx).unwrap();
        provisioner.check_presence().await.unwrap();

        let err = provisioner.install_local_archive(&archive).await.unwrap_err();
        assert!(matches!(err, ProvisionError::BinaryNotFound));
        assert!(matches!(
            provisioner.state(),
            InstallationState::Failed {
                stage: ProvisionStage::Locate,
                ..
            }
        ));
        assert!(drain(&mut rx).contains(&ProvisionEvent::InstallError {
            stage: ProvisionStage::Locate,
            message: "FFmpeg executable not found in the extracted files".to_string(),
        }));

        // Restart from Failed: the insecure URL fails before any request is made.
        let err = provisioner
            .begin_provisioning("http://github.com/x/ffmpeg.zip")
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Verification(_)));

        let events = drain(&mut rx);
        assert_eq!(
            events[..2],
            [
                ProvisionEvent::StateChanged(InstallationState::Missing),
                ProvisionEvent::StateChanged(InstallationState::Downloading { percent: None }),
            ]
        );
        assert!(matches!(
            provisioner.state(),
            InstallationState::Failed {
                stage: ProvisionStage::Download,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_catalog_failure_is_recorded() {
        let temp = TempDir::new().unwrap();
        let (tx, mut rx) = provision_event_channel();
        let provisioner = Provisioner::new(test_config(&temp), tx)
            .unwrap()
            .with_catalog(Box::new(FailingCatalog));
        provisioner.check_presence().await.unwrap();
        drain(&mut rx);

        let err = provisioner.provision_latest().await.unwrap_err();
        assert!(matches!(err, ProvisionError::Network(_)));
        assert!(matches!(
            provisioner.state(),
            InstallationState::Failed {
                stage: ProvisionStage::Catalog,
                ..
            }
        ));
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, ProvisionEvent::InstallError { stage: ProvisionStage::Catalog, .. })));
    }

    #[tokio::test]
    async fn test_provision_latest_rejects_foreign_host() {
        let temp = TempDir::new().unwrap();
        let (tx, _rx) = provision_event_channel();
        let provisioner = Provisioner::new(test_config(&temp), tx)
            .unwrap()
            .with_catalog(Box::new(FixedAssetCatalog::new(AssetDescriptor::from_url(
                "https://downloads.example.org/ffmpeg.zip",
            ))));
        provisioner.check_presence().await.unwrap();

        let err = provisioner.provision_latest().await.unwrap_err();
        assert!(err.to_string().contains("not allowed"));
        assert!(matches!(
            provisioner.state(),
            InstallationState::Failed {
                stage: ProvisionStage::Download,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_fetch_catalog_unsupported_platform() {
        let temp = TempDir::new().unwrap();
        let (tx, _rx) = provision_event_channel();
        let provisioner = Provisioner::new(test_config(&temp), tx).unwrap();

        assert!(matches!(
            provisioner.fetch_catalog().await,
            Err(ProvisionError::UnsupportedPlatform(_))
        ));
    }
}
