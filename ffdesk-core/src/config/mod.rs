//! Configuration module for ffdesk.
//!
//! Holds the engine configuration assembled from defaults and environment.

mod settings;

pub use settings::{
    EngineConfig, DEFAULT_ALLOWED_DOMAINS, DEFAULT_MAC_DOWNLOAD_URL, DEFAULT_RELEASE_API_URL,
    DEFAULT_USER_AGENT,
};
