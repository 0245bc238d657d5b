//! # poddl
//!
//! The download and conversion backend of a podcast client, run as a
//! companion daemon the frontend talks to over a framed JSON socket.
//!
//! ## Features
//!
//! - **HTTP/HTTPS Downloads**: Resumable downloads with retry backoff and
//!   authentication challenges
//! - **BitTorrent**: Web-seeded torrent transfers with fast-resume state
//!   and an upload ratio cap
//! - **Conversion**: INI-declared converter subprocesses run under a
//!   concurrency cap
//! - **Async**: Built on Tokio, one task per transfer
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use poddl::{Daemon, EngineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EngineConfig::new().movies_dir("/media/podcasts");
//!     let daemon = Daemon::new(config)?;
//!
//!     // Start a download and watch its events
//!     let mut events = daemon.subscribe();
//!     let id = poddl::DownloaderId::generate(|_| false);
//!     daemon
//!         .start_new_download("https://example.com/episode.mp3".into(), id, None, None)
//!         .await?;
//!     while let Ok(event) = events.recv().await {
//!         println!("{:?}", event);
//!     }
//!     Ok(())
//! }
//! ```

// Modules
pub mod config;
pub mod conversion;
pub mod daemon;
pub mod error;
pub mod http;
pub mod protocol;
pub mod remote;
pub mod torrent;
pub mod util;

// Re-exports for convenience
pub use config::{ConversionSettings, EncryptionPolicy, EngineConfig, TorrentSettings};
pub use daemon::Daemon;
pub use error::{DownloadError, Result};
pub use protocol::{
    DaemonCommand, DaemonNotice, DownloadEvent, DownloadKind, DownloadState, DownloaderId,
    InfoHash, TransferStatus,
};

// HTTP module exports
pub use http::{CredentialStore, HttpTransfer, NoCredentials};

// Torrent module exports
pub use torrent::{Metainfo, TorrentSession, TorrentTransfer};

// Conversion module exports
pub use conversion::{ConversionManager, ConverterRegistry, LibraryIngest};

// Remote-side helpers
pub use remote::{restore_action, RemoteDownloader, RestoreAction};
