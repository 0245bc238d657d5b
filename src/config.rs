//! Engine configuration
//!
//! Configuration for the download daemon, the torrent session and the
//! conversion manager. The foreground process owns the configuration store;
//! changed values are re-applied to the running session via
//! [`crate::torrent::session::TorrentSession::apply_settings`].

use crate::error::{DownloadError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Name of the subdirectory of the movies directory holding in-progress
/// HTTP downloads.
pub const INCOMPLETE_DIR_NAME: &str = "Incomplete Downloads";

/// Name of the subdirectory holding conversion outputs.
pub const CONVERTED_DIR_NAME: &str = "Converted";

/// Main configuration for the download and conversion core
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// User's movies directory; every downloader output lives under this
    /// subtree.
    pub movies_dir: PathBuf,

    /// Directory for per-conversion log files
    pub logs_dir: PathBuf,

    /// Refuse transfers whose advertised size exceeds
    /// `free − preserve_bytes` on the movies volume
    pub preserve_disk_space: bool,

    /// Bytes to keep free on the movies volume
    pub preserve_bytes: u64,

    /// Default user agent for HTTP transfers
    pub user_agent: String,

    /// HTTP connect timeout in seconds (body stalls are handled by the
    /// retry schedule, not a read timeout)
    pub connect_timeout: u64,

    /// Maximum authentication challenges answered per transfer
    pub max_auth_attempts: usize,

    /// Seconds between batched status updates to the foreground
    pub update_client_interval: u64,

    /// Back-off schedule in seconds for transient failures, indexed by
    /// the retry count and clamped to the last entry
    #[serde(default = "default_retry_schedule")]
    pub retry_schedule: Vec<u64>,

    /// BitTorrent session settings
    pub torrent: TorrentSettings,

    /// Conversion manager settings
    pub conversion: ConversionSettings,
}

/// BitTorrent session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TorrentSettings {
    /// Port range to bind the listen socket from
    pub listen_port_range: (u16, u16),

    /// Global download ceiling in bytes/sec (None = unlimited)
    pub download_limit: Option<u64>,

    /// Global upload ceiling in bytes/sec (None = unlimited)
    pub upload_limit: Option<u64>,

    /// Request a UPnP mapping for the listen port
    pub use_upnp: bool,

    /// Encryption policy for peer connections
    pub encryption: EncryptionPolicy,

    /// Global connection limit across all torrents
    pub max_connections: usize,

    /// Stop seeding once `uploaded / total_size` exceeds this ratio
    pub upload_ratio: f64,

    /// Whether the upload ratio cap is enforced at all
    pub limit_upload_ratio: bool,

    /// Seconds between fast-resume blob captures
    pub fast_resume_update_interval: u64,

    /// Seconds between status-collection sweeps
    pub status_interval_secs: u64,
}

/// Encryption policy for peer connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionPolicy {
    /// Plaintext only
    Disabled,
    /// Accept both encrypted and plaintext peers
    Allowed,
    /// Prefer encryption, fall back to plaintext
    #[default]
    Preferred,
    /// Reject unencrypted peers
    Required,
}

impl std::fmt::Display for EncryptionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disabled => write!(f, "disabled"),
            Self::Allowed => write!(f, "allowed"),
            Self::Preferred => write!(f, "preferred"),
            Self::Required => write!(f, "required"),
        }
    }
}

/// Conversion manager settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionSettings {
    /// Maximum conversions running at once (failed runners excluded)
    pub max_concurrent: usize,

    /// Converter executable search path additions, tried before `PATH`
    #[serde(default)]
    pub executable_dirs: Vec<PathBuf>,

    /// Probe executable used to read source dimensions and duration
    pub probe_executable: String,

    /// Scheduler cycle length in milliseconds
    pub cycle_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let movies_dir = dirs::video_dir()
            .or_else(dirs::download_dir)
            .unwrap_or_else(|| PathBuf::from("."));
        let logs_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("poddl")
            .join("logs");
        Self {
            movies_dir,
            logs_dir,
            preserve_disk_space: true,
            preserve_bytes: 200 * 1024 * 1024,
            user_agent: format!("poddl/{}", env!("CARGO_PKG_VERSION")),
            connect_timeout: 30,
            max_auth_attempts: 5,
            update_client_interval: 2,
            retry_schedule: default_retry_schedule(),
            torrent: TorrentSettings::default(),
            conversion: ConversionSettings::default(),
        }
    }
}

fn default_retry_schedule() -> Vec<u64> {
    crate::http::RETRY_SCHEDULE.to_vec()
}

impl Default for TorrentSettings {
    fn default() -> Self {
        Self {
            listen_port_range: (8500, 8600),
            download_limit: None,
            upload_limit: None,
            use_upnp: true,
            encryption: EncryptionPolicy::Preferred,
            max_connections: 200,
            upload_ratio: 2.0,
            limit_upload_ratio: false,
            fast_resume_update_interval: 300,
            status_interval_secs: 1,
        }
    }
}

impl Default for ConversionSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            executable_dirs: Vec::new(),
            probe_executable: "ffprobe".to_string(),
            cycle_ms: 500,
        }
    }
}

impl EngineConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the movies directory
    pub fn movies_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.movies_dir = path.into();
        self
    }

    /// Set the log directory
    pub fn logs_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.logs_dir = path.into();
        self
    }

    /// Set the reserved-bytes floor for the disk-space admission check
    pub fn preserve_bytes(mut self, bytes: u64) -> Self {
        self.preserve_bytes = bytes;
        self
    }

    /// Enable or disable the disk-space admission check
    pub fn preserve_disk_space(mut self, on: bool) -> Self {
        self.preserve_disk_space = on;
        self
    }

    /// Set the user agent
    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = ua.into();
        self
    }

    /// Replace the transient-failure back-off schedule
    pub fn retry_schedule(mut self, schedule: Vec<u64>) -> Self {
        self.retry_schedule = schedule;
        self
    }

    /// Set the maximum concurrent conversions
    pub fn max_concurrent_conversions(mut self, max: usize) -> Self {
        self.conversion.max_concurrent = max;
        self
    }

    /// Directory holding in-progress HTTP downloads
    pub fn incomplete_dir(&self) -> PathBuf {
        self.movies_dir.join(INCOMPLETE_DIR_NAME)
    }

    /// Directory holding conversion outputs
    pub fn converted_dir(&self) -> PathBuf {
        self.movies_dir.join(CONVERTED_DIR_NAME)
    }

    /// Final directory for a completed download, under the channel folder
    /// when one is set.
    pub fn final_dir(&self, channel_name: Option<&str>) -> PathBuf {
        match channel_name {
            Some(name) if !name.is_empty() => {
                self.movies_dir.join(crate::util::filename::sanitize(name))
            }
            _ => self.movies_dir.clone(),
        }
    }

    /// Batched status update interval as a `Duration`
    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_client_interval.max(1))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !self.movies_dir.exists() {
            return Err(DownloadError::Internal(format!(
                "movies_dir does not exist: {:?}",
                self.movies_dir
            )));
        }
        if !self.movies_dir.is_dir() {
            return Err(DownloadError::Internal(format!(
                "movies_dir is not a directory: {:?}",
                self.movies_dir
            )));
        }
        if self.retry_schedule.is_empty() {
            return Err(DownloadError::Internal(
                "retry_schedule must have at least one entry".to_string(),
            ));
        }
        if self.conversion.max_concurrent == 0 {
            return Err(DownloadError::Internal(
                "conversion.max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.torrent.listen_port_range.0 > self.torrent.listen_port_range.1 {
            return Err(DownloadError::Internal(
                "listen_port_range start must be <= end".to_string(),
            ));
        }
        if self.torrent.upload_ratio < 0.0 {
            return Err(DownloadError::Internal(
                "upload_ratio must be non-negative".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.conversion.max_concurrent, 2);
        assert_eq!(config.max_auth_attempts, 5);
        assert!(config.preserve_disk_space);
    }

    #[test]
    fn test_config_builder() {
        let config = EngineConfig::new()
            .max_concurrent_conversions(4)
            .preserve_bytes(1024);
        assert_eq!(config.conversion.max_concurrent, 4);
        assert_eq!(config.preserve_bytes, 1024);
    }

    #[test]
    fn test_config_validation() {
        let dir = tempdir().unwrap();
        let config = EngineConfig::new().movies_dir(dir.path());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_movies_dir() {
        let config = EngineConfig::new().movies_dir("/nonexistent/path/12345");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_final_dir_uses_channel_subfolder() {
        let config = EngineConfig::new().movies_dir("/tmp");
        assert_eq!(
            config.final_dir(Some("My Channel")),
            PathBuf::from("/tmp/My Channel")
        );
        assert_eq!(config.final_dir(None), PathBuf::from("/tmp"));
    }
}
