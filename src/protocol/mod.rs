//! Protocol types for poddl
//!
//! Everything that crosses the daemon/foreground boundary lives here:
//! the downloader status snapshot, the command and notice unions, and the
//! length-prefixed message framing. These types are serde-serializable so
//! the same definitions back both the RPC channel and the persisted
//! snapshots in the foreground's object store.

mod events;
mod message;
mod types;

pub use events::DownloadEvent;
pub use message::{
    read_message, write_message, DaemonCommand, DaemonNotice, MAX_FRAME_SIZE,
};
pub use types::{DownloadKind, DownloadState, DownloaderId, InfoHash, TransferStatus};
