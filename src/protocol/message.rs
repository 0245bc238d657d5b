//! Daemon/foreground wire protocol
//!
//! Message-oriented: one serde-tagged message per frame, length-prefixed
//! with a 4-byte big-endian size. The daemon receives [`DaemonCommand`]
//! frames and emits [`DaemonNotice`] frames on a separate channel.

use super::types::{DownloaderId, TransferStatus};
use crate::error::{DownloadError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame; metainfo blobs are capped well below this.
pub const MAX_FRAME_SIZE: u32 = 8 * 1024 * 1024;

/// Commands received by the download daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum DaemonCommand {
    StartNewDownload {
        url: String,
        id: DownloaderId,
        #[serde(skip_serializing_if = "Option::is_none")]
        content_type: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        channel_name: Option<String>,
    },
    StartDownload {
        id: DownloaderId,
    },
    PauseDownload {
        id: DownloaderId,
    },
    StopDownload {
        id: DownloaderId,
        delete: bool,
    },
    StopUpload {
        id: DownloaderId,
    },
    PauseUpload {
        id: DownloaderId,
    },
    /// Move a terminal download's file into a new movies directory
    MigrateDownload {
        id: DownloaderId,
        directory: PathBuf,
    },
    /// Reconstruct an engine from a persisted snapshot; the engine kind is
    /// selected by the snapshot's `dlerType` field
    RestoreDownloader {
        status: TransferStatus,
    },
    ShutdownDaemon,
}

/// Notices emitted by the download daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum DaemonNotice {
    UpdateDownloadStatus {
        status: TransferStatus,
    },
    BatchUpdateDownloadStatus {
        statuses: Vec<TransferStatus>,
    },
    /// A second torrent resolved to an already-registered info-hash
    DuplicateTorrent {
        existing_id: DownloaderId,
        new_id: DownloaderId,
    },
    /// Unrecognised RPC or unexpected failure in daemon context
    DownloaderError {
        message: String,
    },
}

/// Write one length-prefixed JSON message.
pub async fn write_message<T, W>(writer: &mut W, message: &T) -> Result<()>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let payload = serde_json::to_vec(message)?;
    if payload.len() as u64 > MAX_FRAME_SIZE as u64 {
        return Err(DownloadError::Rpc(format!(
            "frame too large: {} bytes",
            payload.len()
        )));
    }
    writer
        .write_all(&(payload.len() as u32).to_be_bytes())
        .await
        .map_err(|e| DownloadError::Rpc(e.to_string()))?;
    writer
        .write_all(&payload)
        .await
        .map_err(|e| DownloadError::Rpc(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| DownloadError::Rpc(e.to_string()))?;
    Ok(())
}

/// Read one length-prefixed JSON message. Returns `Ok(None)` on a clean EOF
/// at a frame boundary.
pub async fn read_message<T, R>(reader: &mut R) -> Result<Option<T>>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(DownloadError::Rpc(e.to_string())),
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_SIZE {
        return Err(DownloadError::Rpc(format!("frame too large: {} bytes", len)));
    }
    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| DownloadError::Rpc(e.to_string()))?;
    Ok(Some(serde_json::from_slice(&payload)?))
}
