//! Core protocol types
//!
//! The downloader record as exchanged between the daemon and the
//! foreground, plus its identifier and state types.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// MIME type that selects the BitTorrent transfer path
pub const BITTORRENT_MIME: &str = "application/x-bittorrent";

/// Opaque short identifier for a downloader record.
///
/// Assigned by the foreground via random generation retried until
/// collision-free; unique across the process for the record's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DownloaderId(String);

impl DownloaderId {
    const LEN: usize = 8;
    const ALPHABET: &'static [u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

    /// Generate an id, retrying while `exists` reports a collision.
    pub fn generate(mut exists: impl FnMut(&DownloaderId) -> bool) -> Self {
        loop {
            let candidate = Self::random();
            if !exists(&candidate) {
                return candidate;
            }
        }
    }

    fn random() -> Self {
        let mut rng = rand::thread_rng();
        let s: String = (0..Self::LEN)
            .map(|_| {
                let i = rng.gen_range(0..Self::ALPHABET.len());
                Self::ALPHABET[i] as char
            })
            .collect();
        Self(s)
    }

    /// Wrap an existing id string (restored from a persisted snapshot).
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DownloaderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 20-byte identifier computed from a torrent's info dictionary.
///
/// Primary key for duplicate detection in the torrent session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash(pub [u8; 20]);

impl InfoHash {
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 40 {
            return None;
        }
        let mut out = [0u8; 20];
        for (i, chunk) in out.iter_mut().enumerate() {
            *chunk = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).ok()?;
        }
        Some(Self(out))
    }
}

impl std::fmt::Display for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for InfoHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for InfoHash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).ok_or_else(|| serde::de::Error::custom("invalid info hash"))
    }
}

/// Kind of transfer backing a downloader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DownloadKind {
    Http,
    Bittorrent,
}

impl DownloadKind {
    /// Select the kind from a URL and an optional MIME type. The literal
    /// `application/x-bittorrent` (or a `.torrent` path) implies BitTorrent.
    pub fn detect(url: &str, content_type: Option<&str>) -> Self {
        if content_type == Some(BITTORRENT_MIME) || url.ends_with(".torrent") {
            Self::Bittorrent
        } else {
            Self::Http
        }
    }
}

/// State of a downloader record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DownloadState {
    Downloading,
    Paused,
    Stopped,
    /// Transient network failure; a retry is scheduled
    Offline,
    Failed,
    Finished,
    /// Torrent complete, seeding
    Uploading,
    UploadingPaused,
}

impl DownloadState {
    /// Whether a transfer engine is (or should be) making progress
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Downloading | Self::Uploading)
    }

    /// Whether the record is in a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed | Self::Finished)
    }

    /// Whether the output file still lives in the incomplete-downloads
    /// subdirectory
    pub fn in_incomplete_dir(&self) -> bool {
        matches!(self, Self::Downloading | Self::Paused | Self::Offline)
    }
}

impl std::fmt::Display for DownloadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Downloading => "downloading",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Offline => "offline",
            Self::Failed => "failed",
            Self::Finished => "finished",
            Self::Uploading => "uploading",
            Self::UploadingPaused => "uploading-paused",
        };
        write!(f, "{}", s)
    }
}

/// Status snapshot of a downloader record.
///
/// This is both the RPC payload and the persisted snapshot. `metainfo` and
/// `fast_resume_data` are sent delta-only: consumers must tolerate their
/// absence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferStatus {
    pub id: DownloaderId,
    pub url: String,
    #[serde(rename = "dlerType")]
    pub kind: DownloadKind,
    pub state: DownloadState,
    /// Bytes on disk so far
    pub current_size: u64,
    /// Total bytes, `-1` when unknown
    pub total_size: i64,
    /// Rolling download rate estimate in bytes/sec
    pub rate: u64,
    /// Sanitized basename (no path separators, no reserved characters)
    pub short_filename: String,
    /// Absolute path on disk, once known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<PathBuf>,
    /// Back-off index; `-1` once headers have been received successfully
    pub retry_count: i32,
    /// Wall clock of the next scheduled retry
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason_failed: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub short_reason_failed: Option<String>,
    /// Folder name for final placement under the movies directory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Raw .torrent bytes (BitTorrent only; delta-encoded over RPC)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metainfo: Option<Vec<u8>>,
    /// Engine resume blob (BitTorrent only; delta-encoded over RPC)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fast_resume_data: Option<Vec<u8>>,
    /// Seeding statistics (BitTorrent only)
    #[serde(default)]
    pub uploaded: u64,
    #[serde(default)]
    pub up_rate: u64,
    #[serde(default = "unknown_count")]
    pub seeders: i32,
    #[serde(default = "unknown_count")]
    pub leechers: i32,
    /// User asked to keep seeding past the ratio cap
    #[serde(default)]
    pub manual_upload: bool,
    pub last_updated: DateTime<Utc>,
}

fn unknown_count() -> i32 {
    -1
}

impl TransferStatus {
    /// Fresh record for a newly started download.
    pub fn new(id: DownloaderId, url: impl Into<String>, kind: DownloadKind) -> Self {
        Self {
            id,
            url: url.into(),
            kind,
            state: DownloadState::Downloading,
            current_size: 0,
            total_size: -1,
            rate: 0,
            short_filename: String::new(),
            filename: None,
            retry_count: 0,
            retry_time: None,
            reason_failed: None,
            short_reason_failed: None,
            channel_name: None,
            content_type: None,
            metainfo: None,
            fast_resume_data: None,
            uploaded: 0,
            up_rate: 0,
            seeders: -1,
            leechers: -1,
            manual_upload: false,
            last_updated: Utc::now(),
        }
    }

    /// Copy for the RPC channel with the bulky delta-encoded fields dropped.
    pub fn without_deltas(&self) -> Self {
        let mut s = self.clone();
        s.metainfo = None;
        s.fast_resume_data = None;
        s
    }
}
