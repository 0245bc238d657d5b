//! In-process event stream.
//!
//! Transfers and the torrent session publish events on a broadcast
//! channel owned by the daemon. Subscribers (the RPC loop, tests)
//! receive every event; lagging subscribers miss old ones, which is
//! acceptable because the periodic batched status update carries the
//! authoritative state.

use crate::protocol::types::{DownloadState, DownloaderId};

/// Events published on the daemon's broadcast channel.
#[derive(Debug, Clone)]
pub enum DownloadEvent {
    /// A transfer changed lifecycle state.
    StateChanged {
        id: DownloaderId,
        state: DownloadState,
    },
    /// A transfer reached its final location on disk.
    Finished { id: DownloaderId },
    /// A transfer failed permanently.
    Failed { id: DownloaderId, reason: String },
    /// A new torrent download matched the info-hash of an existing one.
    DuplicateTorrent {
        existing_id: DownloaderId,
        new_id: DownloaderId,
    },
    /// A conversion task moved between pending, running and finished.
    ConversionChanged { key: (std::path::PathBuf, std::path::PathBuf) },
}
