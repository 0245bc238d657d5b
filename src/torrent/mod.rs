//! BitTorrent support.
//!
//! The session owns every live torrent and is the duplicate-detection
//! authority; each torrent is driven by a [`TorrentTransfer`] that pulls
//! pieces from the torrent's web seeds and announces to its trackers.

pub mod bencode;
pub mod metainfo;
pub mod session;
pub mod swarm;
pub mod tracker;

pub use metainfo::{looks_like_torrent, Metainfo, MAX_METAINFO_SIZE};
pub use session::{Registered, TorrentSession};
pub use swarm::{FastResume, TorrentTransfer};
