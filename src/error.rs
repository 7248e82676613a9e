//! Error types for the panel and speech engines

use std::time::Duration;

use thiserror::Error;

/// Result type alias for spooky-panel operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in spooky-panel
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error (fatal at startup)
    #[error("configuration error: {0}")]
    Config(String),

    /// Requested show is not in the registry
    #[error("unknown show: {0}")]
    UnknownShow(String),

    /// LED controller link could not be opened
    #[error("device unavailable at {address}: {reason}")]
    DeviceUnavailable {
        /// Device address (e.g. serial port path)
        address: String,
        /// Underlying failure
        reason: String,
    },

    /// Speech synthesis request failed
    #[error("synthesis failed: {0}")]
    Synthesis(String),

    /// Synthesized audio could not be downloaded
    #[error("download failed: {0}")]
    Download(String),

    /// Audio decode or playback error
    #[error("audio error: {0}")]
    Audio(String),

    /// A worker did not exit within its grace period
    #[error("{component} did not shut down within {grace:?}")]
    ShutdownTimeout {
        /// Component whose worker failed to join
        component: &'static str,
        /// Grace period that expired
        grace: Duration,
    },

    /// A worker ended by panicking instead of a clean stop
    #[error("{component} worker failed: {reason}")]
    WorkerFailed {
        /// Component whose worker died
        component: &'static str,
        /// Panic or join failure message
        reason: String,
    },

    /// Component has been stopped and refuses new work
    #[error("{0} is stopped")]
    Stopped(&'static str),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}
