//! Error types for Segue.

use thiserror::Error;

/// Result type alias using Segue's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Segue.
#[derive(Error, Debug)]
pub enum Error {
    // Source and decoder errors
    #[error("Failed to open: {0}")]
    OpenFailed(String),

    #[error("Unsupported audio format: {0}")]
    UnsupportedFormat(String),

    #[error("Seeking is not supported")]
    SeekNotSupported,

    #[error("Audio decode error: {0}")]
    DecodeError(String),

    // Output errors
    #[error("Device configuration failed: {0}")]
    DeviceConfigurationFailed(String),

    #[error("Audio output error: {0}")]
    AudioOutput(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Engine is shutting down")]
    Shutdown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true if the error belongs to a single decoder and playback of
    /// other queued items can continue.
    pub const fn is_decoder_local(&self) -> bool {
        matches!(
            self,
            Self::OpenFailed(_) | Self::DecodeError(_) | Self::SeekNotSupported
        )
    }

    /// Returns true if the error came from the output device or host graph.
    pub const fn is_output_failure(&self) -> bool {
        matches!(
            self,
            Self::DeviceConfigurationFailed(_) | Self::AudioOutput(_) | Self::UnsupportedFormat(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(Error::DecodeError("bad frame".into()).is_decoder_local());
        assert!(Error::SeekNotSupported.is_decoder_local());
        assert!(!Error::Shutdown.is_decoder_local());
        assert!(Error::DeviceConfigurationFailed("busy".into()).is_output_failure());
        assert!(!Error::InvalidArgument("volume".into()).is_output_failure());
    }

    #[test]
    fn test_error_display() {
        let err = Error::OpenFailed("missing.flac".into());
        assert_eq!(err.to_string(), "Failed to open: missing.flac");
        assert_eq!(Error::SeekNotSupported.to_string(), "Seeking is not supported");
    }
}
