//! Error types for plinth-core.

use thiserror::Error;

/// Error type for plinth-core operations.
///
/// Nothing on the audio callback path returns one of these; the callback
/// downgrades failures to silence and counts them instead.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Driver is not configured; call configure() first")]
    NotConfigured,

    #[error("Unsupported sample format: {0}")]
    UnsupportedSampleFormat(String),

    #[error("Out of memory allocating {size} bytes")]
    OutOfMemory { size: usize },

    #[error("Requested size {0} exceeds the largest size class")]
    SizeTooLarge(usize),

    #[error("Size class {class} exhausted ({capacity} blocks)")]
    PoolExhausted { class: usize, capacity: usize },

    #[error("Invalid device: {0}")]
    InvalidDevice(String),

    #[error("Audio backend error: {0}")]
    Backend(String),

    #[error("Failed to spawn {name} thread")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[cfg(feature = "cpal")]
    #[error("Audio device not available")]
    DeviceNotAvailable(#[from] cpal::DefaultStreamConfigError),

    #[cfg(feature = "cpal")]
    #[error("Failed to build audio stream")]
    BuildStream(#[from] cpal::BuildStreamError),

    #[cfg(feature = "cpal")]
    #[error("Failed to play audio stream")]
    PlayStream(#[from] cpal::PlayStreamError),

    #[cfg(feature = "cpal")]
    #[error("Failed to enumerate devices")]
    DevicesError(#[from] cpal::DevicesError),

    #[cfg(feature = "cpal")]
    #[error("Failed to get device name")]
    DeviceNameError(#[from] cpal::DeviceNameError),

    #[cfg(feature = "cpal")]
    #[error("Failed to query supported stream configs")]
    SupportedConfigs(#[from] cpal::SupportedStreamConfigsError),
}

impl Error {
    /// Configuration errors are fatal to starting a stream and never retried.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidConfig(_) | Error::NotConfigured | Error::UnsupportedSampleFormat(_)
        )
    }

    /// Resource exhaustion on an allocation path.
    pub fn is_allocation_failure(&self) -> bool {
        matches!(
            self,
            Error::OutOfMemory { .. } | Error::SizeTooLarge(_) | Error::PoolExhausted { .. }
        )
    }
}

/// Result type alias.
pub type Result<T> = core::result::Result<T, Error>;
