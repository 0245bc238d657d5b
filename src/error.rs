//! Typed error taxonomy for poddl
//!
//! Every variant records whether the failure is transient (scheduled for a
//! retry on the back-off schedule) or fatal (state moves to `Failed`), and
//! carries the short user-visible string shown next to the item.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the download and conversion core
#[derive(Debug, Error)]
pub enum DownloadError {
    /// URL could not be parsed or uses an unsupported scheme
    #[error("Malformed URL: {url}: {message}")]
    MalformedUrl { url: String, message: String },

    /// DNS failure, refused connection, or server closed mid-stream
    #[error("Connection failure: {message}")]
    ConnectionFailure { message: String },

    /// 4xx response other than 401
    #[error("Unexpected status code: {code}")]
    UnexpectedStatusCode { code: u16 },

    /// 5xx response or a zero-length 200 body
    #[error("Possibly temporary error: {message}")]
    PossiblyTemporary { message: String },

    /// Authentication failed after the challenge limit
    #[error("Authorization failed")]
    AuthorizationFailed,

    /// Disk write failure (full disk, permissions, file in use)
    #[error("Write error at {path:?}: {message}")]
    Write { path: PathBuf, message: String },

    /// Advertised size exceeds the free space on the movies volume
    #[error("Not enough disk space: need {needed} bytes, {available} available")]
    NotEnoughDiskSpace { needed: u64, available: u64 },

    /// Torrent metainfo failed the content check or bencode decode
    #[error("Corrupt torrent from {url}: {message}")]
    CorruptTorrent { url: String, message: String },

    /// The torrent session refused to start the torrent
    #[error("Torrent startup failure: {message}")]
    TorrentStartup { message: String },

    /// No converter with the given identifier is registered
    #[error("Converter not found: {name}")]
    ConverterNotFound { name: String },

    /// The converter subprocess reported an error or exited non-zero
    #[error("Converter failed: {message}")]
    ConverterFailed { message: String },

    /// The source probe could not be run or its output could not be parsed
    #[error("Probe failure: {message}")]
    ProbeFailed { message: String },

    /// Downloader not found in the daemon's map
    #[error("Downloader not found: {0}")]
    NotFound(String),

    /// Operation is not valid in the downloader's current state
    #[error("Invalid state: cannot {action} while {current_state}")]
    InvalidState {
        action: &'static str,
        current_state: String,
    },

    /// Daemon is shutting down
    #[error("Daemon is shutting down")]
    Shutdown,

    /// RPC framing or serialization error
    #[error("RPC error: {0}")]
    Rpc(String),

    /// Internal error (bug)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DownloadError {
    /// Whether the error should schedule a retry on the back-off schedule
    /// rather than moving the downloader to `Failed`.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailure { .. } | Self::PossiblyTemporary { .. }
        )
    }

    /// Short user-visible reason, displayed next to the item.
    pub fn short_reason(&self) -> String {
        match self {
            Self::MalformedUrl { .. } => "Invalid URL".to_string(),
            Self::ConnectionFailure { .. } => "Connection failure".to_string(),
            Self::UnexpectedStatusCode { code } => format!("Server error ({})", code),
            Self::PossiblyTemporary { .. } => "Temporary server error".to_string(),
            Self::AuthorizationFailed => "Authorization failed".to_string(),
            Self::Write { path, .. } => format!("Write error: {}", path.display()),
            Self::NotEnoughDiskSpace { .. } => "Not enough disk space".to_string(),
            Self::CorruptTorrent { url, .. } => format!("Corrupt torrent: {}", url),
            Self::TorrentStartup { .. } => "Torrent could not start".to_string(),
            Self::ConverterNotFound { name } => format!("Converter not found: {}", name),
            Self::ConverterFailed { .. } => "Conversion failed".to_string(),
            Self::ProbeFailed { .. } => "Could not read source file".to_string(),
            Self::NotFound(_) => "Unknown download".to_string(),
            Self::InvalidState { .. } => "Invalid operation".to_string(),
            Self::Shutdown => "Shutting down".to_string(),
            Self::Rpc(_) | Self::Internal(_) => "Internal error".to_string(),
        }
    }

    /// Connection-level failure helper.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::ConnectionFailure {
            message: message.into(),
        }
    }

    /// Write failure helper.
    pub fn write(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Write {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Classify an HTTP status code outside the success set.
    ///
    /// 401 is handled by the authentication path before this is reached.
    pub fn from_status(code: u16) -> Self {
        if (500..600).contains(&code) {
            Self::PossiblyTemporary {
                message: format!("HTTP {}", code),
            }
        } else {
            Self::UnexpectedStatusCode { code }
        }
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, DownloadError>;

impl From<std::io::Error> for DownloadError {
    fn from(err: std::io::Error) -> Self {
        Self::Write {
            path: PathBuf::new(),
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for DownloadError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_builder() {
            Self::MalformedUrl {
                url: err.url().map(|u| u.to_string()).unwrap_or_default(),
                message: err.to_string(),
            }
        } else if let Some(status) = err.status() {
            Self::from_status(status.as_u16())
        } else {
            // Timeouts, refused connections, resets and mid-stream closes all
            // land here and are retried.
            Self::ConnectionFailure {
                message: err.to_string(),
            }
        }
    }
}

impl From<url::ParseError> for DownloadError {
    fn from(err: url::ParseError) -> Self {
        Self::MalformedUrl {
            url: String::new(),
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for DownloadError {
    fn from(err: serde_json::Error) -> Self {
        Self::Rpc(format!("JSON error: {}", err))
    }
}
