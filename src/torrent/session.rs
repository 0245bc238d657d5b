//! Torrent session.
//!
//! One session per daemon owns every live torrent: it maps info-hashes
//! to transfers for duplicate detection, fetches `.torrent` files,
//! carries the live torrent settings, and runs the periodic sweep that
//! enforces the seeding ratio cap and refreshes status timestamps.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use reqwest::Client;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::metainfo::{looks_like_torrent, Metainfo, MAX_METAINFO_SIZE};
use super::swarm::TorrentTransfer;
use crate::config::{EngineConfig, TorrentSettings};
use crate::error::{DownloadError, Result};
use crate::http::fetch_body;
use crate::protocol::{DownloadEvent, DownloaderId, InfoHash, TransferStatus};

/// Result of registering a torrent with the session.
pub enum Registered {
    New(Arc<TorrentTransfer>),
    /// A live torrent with the same info-hash already exists.
    Duplicate { existing_id: DownloaderId },
}

pub struct TorrentSession {
    config: Arc<EngineConfig>,
    client: Client,
    events: broadcast::Sender<DownloadEvent>,
    settings: Arc<RwLock<TorrentSettings>>,
    torrents: RwLock<HashMap<InfoHash, Arc<TorrentTransfer>>>,
    sweep: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl TorrentSession {
    pub fn new(
        config: Arc<EngineConfig>,
        client: Client,
        events: broadcast::Sender<DownloadEvent>,
    ) -> Arc<Self> {
        let settings = Arc::new(RwLock::new(config.torrent.clone()));
        Arc::new(Self {
            config,
            client,
            events,
            settings,
            torrents: RwLock::new(HashMap::new()),
            sweep: Mutex::new(None),
        })
    }

    /// Replaces the live torrent settings. Running transfers observe
    /// the change on their next announce or sweep tick.
    pub fn apply_settings(&self, settings: TorrentSettings) {
        *self.settings.write() = settings;
    }

    pub fn len(&self) -> usize {
        self.torrents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.torrents.read().is_empty()
    }

    pub fn find(&self, info_hash: &InfoHash) -> Option<Arc<TorrentTransfer>> {
        self.torrents.read().get(info_hash).cloned()
    }

    /// Drops a torrent from the registry. Its info-hash becomes free
    /// for re-registration.
    pub fn remove(&self, info_hash: &InfoHash) {
        self.torrents.write().remove(info_hash);
    }

    /// Fetches and validates a `.torrent` file. The content check runs
    /// on the first received bytes: every bencoded torrent starts with
    /// `d`, so error pages are rejected before the download completes.
    pub async fn fetch_metainfo(&self, url: &str) -> Result<(Vec<u8>, Metainfo)> {
        let fetched = fetch_body(
            &self.client,
            &self.config.user_agent,
            url,
            MAX_METAINFO_SIZE,
            looks_like_torrent,
        )
        .await?;
        let metainfo = Metainfo::parse(&fetched.body).map_err(|err| match err {
            DownloadError::CorruptTorrent { message, .. } => DownloadError::CorruptTorrent {
                url: url.to_string(),
                message,
            },
            other => other,
        })?;
        Ok((fetched.body, metainfo))
    }

    /// Builds a transfer for parsed metainfo and registers it under its
    /// info-hash. A duplicate info-hash leaves the session untouched and
    /// reports the existing downloader.
    pub fn register(&self, mut status: TransferStatus, metainfo: Metainfo) -> Registered {
        let mut torrents = self.torrents.write();
        if let Some(existing) = torrents.get(&metainfo.info_hash) {
            return Registered::Duplicate {
                existing_id: existing.id().clone(),
            };
        }
        if status.metainfo.is_none() {
            // restore path passes the raw bytes through the status record
            tracing::debug!(id = %status.id, "registering torrent without raw metainfo");
        }
        status.kind = crate::protocol::DownloadKind::Bittorrent;
        let transfer = TorrentTransfer::new(
            status,
            metainfo,
            Arc::clone(&self.config),
            Arc::clone(&self.settings),
            self.client.clone(),
            self.events.clone(),
        );
        torrents.insert(transfer.info_hash(), Arc::clone(&transfer));
        Registered::New(transfer)
    }

    /// Starts the periodic sweep that enforces the ratio cap on seeding
    /// torrents. Idempotent.
    pub fn start_sweep(self: &Arc<Self>) {
        let mut sweep = self.sweep.lock();
        if sweep.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let this = Arc::clone(self);
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let interval = std::time::Duration::from_secs(
                this.settings.read().status_interval_secs.max(1),
            );
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                this.sweep_once().await;
            }
        });
        *sweep = Some((cancel, task));
    }

    /// One sweep pass: stop seeding torrents that reached their ratio
    /// cap, unless the user asked for manual upload.
    pub async fn sweep_once(&self) {
        let snapshot: Vec<Arc<TorrentTransfer>> =
            self.torrents.read().values().cloned().collect();
        for transfer in snapshot {
            let status = transfer.status();
            if status.state == crate::protocol::DownloadState::Uploading
                && !status.manual_upload
                && transfer.ratio_reached()
            {
                tracing::info!(id = %transfer.id(), "upload ratio reached, stopping seed");
                if let Err(err) = transfer.stop_upload().await {
                    tracing::warn!(id = %transfer.id(), "stop upload failed: {err}");
                }
            }
        }
    }

    /// Halts every torrent and flushes resume blobs so the final status
    /// snapshots carry them. States are left untouched; an item that was
    /// downloading restarts on the next launch.
    pub fn shutdown(&self) {
        if let Some((cancel, task)) = self.sweep.lock().take() {
            cancel.cancel();
            task.abort();
        }
        let snapshot: Vec<Arc<TorrentTransfer>> =
            self.torrents.read().values().cloned().collect();
        for transfer in snapshot {
            transfer.halt();
        }
    }
}
