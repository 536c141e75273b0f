//! On-demand provisioning of the FFmpeg engine binary.
//!
//! The engine is not bundled with the application. When it is missing, the
//! [`Provisioner`] fetches a platform build, unpacks it, and installs the
//! executable into the binaries directory.
//!
//! # Architecture
//!
//! - `types`: Core types (Platform, AssetDescriptor, InstallationState)
//! - `paths`: Binaries and scratch directory layout
//! - `catalog`: Release listings and asset selection
//! - `downloader`: HTTP and curl downloads with progress and verification
//! - `extractor`: Zip (in-process) and 7z (external tool) extraction
//! - `locator`: Bounded search for the executable in an extracted tree
//! - `installer`: Moving the binary into place and scratch cleanup
//! - `manifest`: JSON record of the installed build
//! - `pipeline`: The state machine tying the stages together
//!
//! # Example
//!
//! ```ignore
//! use ffdesk_core::config::EngineConfig;
//! use ffdesk_core::provisioning::{provision_event_channel, Provisioner};
//!
//! let (tx, mut rx) = provision_event_channel();
//! let provisioner = Provisioner::new(EngineConfig::from_env(), tx)?;
//!
//! if !provisioner.check_presence().await? {
//!     let path = provisioner.provision_latest().await?;
//!     println!("Installed at {}", path.display());
//! }
//! ```

pub mod catalog;
pub mod downloader;
pub mod extractor;
pub mod installer;
pub mod locator;
pub mod manifest;
pub mod paths;
pub mod pipeline;
pub mod types;

pub use catalog::{catalog_for, select_asset, CatalogSource, FixedAssetCatalog, GithubReleaseCatalog};
pub use downloader::{DownloadProgress, DownloadStrategy, Downloader};
pub use extractor::extract_archive;
pub use locator::locate_binary;
pub use manifest::{load_manifest_from, save_manifest_to, EngineManifest, InstalledEngine};
pub use pipeline::{
    provision_event_channel, ProvisionEvent, ProvisionEventReceiver, ProvisionEventSender,
    Provisioner,
};
pub use types::{ArchiveFormat, AssetDescriptor, InstallationState, Platform, ProvisionStage};
