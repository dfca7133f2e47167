//! Error types for the cohost engine

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for cohost operations
pub type Result<T> = std::result::Result<T, Error>;

/// Which external service an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Reasoning,
    Voice,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reasoning => f.write_str("reasoning"),
            Self::Voice => f.write_str("voice"),
        }
    }
}

/// Errors that can occur in the cohost pipeline
#[derive(Debug, Error)]
pub enum Error {
    /// Backend did not answer within its deadline
    #[error("{backend} backend timed out after {after:?}")]
    BackendTimeout { backend: BackendKind, after: Duration },

    /// Backend unreachable or returned a retryable failure
    #[error("{backend} backend error: {message}")]
    Backend { backend: BackendKind, message: String },

    /// Backend answered with something we cannot use
    #[error("malformed {backend} response: {message}")]
    MalformedResponse { backend: BackendKind, message: String },

    /// No usable output device
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Playback requested while another playback holds the device
    #[error("audio device busy")]
    DeviceBusy,

    /// Output stream failed mid-playback
    #[error("playback error: {0}")]
    Playback(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Operation abandoned because the utterance was cancelled
    #[error("cancelled")]
    Cancelled,

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Whether a retry of the same call might succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::BackendTimeout { .. } | Self::Backend { .. } => true,
            Self::Http(e) => e.is_connect() || e.is_timeout(),
            _ => false,
        }
    }

    /// The backend this error is attributed to, if any.
    pub fn backend(&self) -> Option<BackendKind> {
        match self {
            Self::BackendTimeout { backend, .. }
            | Self::Backend { backend, .. }
            | Self::MalformedResponse { backend, .. } => Some(*backend),
            _ => None,
        }
    }

    /// Taxonomy name reported in pipeline status.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BackendTimeout { backend: BackendKind::Voice, .. }
            | Self::Backend { backend: BackendKind::Voice, .. }
            | Self::MalformedResponse { backend: BackendKind::Voice, .. } => "synthesis_backend",
            Self::BackendTimeout { .. } | Self::Backend { .. } => "transient_backend",
            Self::MalformedResponse { .. } => "backend_protocol",
            Self::DeviceUnavailable(_) => "device_unavailable",
            Self::DeviceBusy => "device_busy",
            Self::Playback(_) => "playback",
            Self::Config(_) => "configuration",
            Self::Cancelled => "cancelled",
            Self::Io(_) => "io",
            Self::Http(_) => "http",
            Self::Json(_) | Self::Toml(_) => "serialization",
        }
    }

    pub(crate) fn backend_error(backend: BackendKind, message: impl Into<String>) -> Self {
        Self::Backend {
            backend,
            message: message.into(),
        }
    }

    pub(crate) fn malformed(backend: BackendKind, message: impl Into<String>) -> Self {
        Self::MalformedResponse {
            backend,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        let timeout = Error::BackendTimeout {
            backend: BackendKind::Reasoning,
            after: Duration::from_secs(10),
        };
        assert!(timeout.is_transient());
        assert!(Error::backend_error(BackendKind::Voice, "503").is_transient());
        assert!(!Error::malformed(BackendKind::Reasoning, "no choices").is_transient());
        assert!(!Error::DeviceBusy.is_transient());
        assert!(!Error::Cancelled.is_transient());
    }

    #[test]
    fn voice_errors_report_as_synthesis() {
        let err = Error::backend_error(BackendKind::Voice, "connection refused");
        assert_eq!(err.kind(), "synthesis_backend");
        assert_eq!(err.backend(), Some(BackendKind::Voice));

        let err = Error::backend_error(BackendKind::Reasoning, "connection refused");
        assert_eq!(err.kind(), "transient_backend");
    }

    #[test]
    fn display_names_backend() {
        let err = Error::malformed(BackendKind::Reasoning, "missing content");
        assert_eq!(err.to_string(), "malformed reasoning response: missing content");
    }
}
