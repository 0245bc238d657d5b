//! Download daemon.
//!
//! The daemon owns every downloader record, the torrent session, and the
//! RPC surface the foreground talks to. Commands arrive as
//! length-prefixed JSON frames; the daemon answers with immediate
//! `UpdateDownloadStatus` notices on state changes and a
//! `BatchUpdateDownloadStatus` sweep on the configured interval.
//!
//! The same methods back the in-process library API: tests and embedders
//! call them directly without going through a socket.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use reqwest::Client;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::{DownloadError, Result};
use crate::http::auth::{CredentialStore, NoCredentials};
use crate::http::HttpTransfer;
use crate::protocol::{
    read_message, write_message, DaemonCommand, DaemonNotice, DownloadEvent, DownloadKind,
    DownloaderId, TransferStatus,
};
use crate::remote::{restore_action, RestoreAction};
use crate::torrent::{Metainfo, Registered, TorrentSession, TorrentTransfer};
use crate::util::filename;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const NOTICE_QUEUE_CAPACITY: usize = 64;

/// A live downloader of either kind.
#[derive(Clone)]
enum Downloader {
    Http(Arc<HttpTransfer>),
    Torrent(Arc<TorrentTransfer>),
}

impl Downloader {
    fn status(&self) -> TransferStatus {
        match self {
            Downloader::Http(t) => t.status(),
            Downloader::Torrent(t) => t.status(),
        }
    }

    fn status_handle(&self) -> Arc<RwLock<TransferStatus>> {
        match self {
            Downloader::Http(t) => t.status_handle(),
            Downloader::Torrent(t) => t.status_handle(),
        }
    }

    fn start(&self, resume: bool) -> Result<()> {
        match self {
            Downloader::Http(t) => t.start(resume),
            Downloader::Torrent(t) => t.start(resume),
        }
    }

    fn pause(&self) -> Result<()> {
        match self {
            Downloader::Http(t) => t.pause(),
            Downloader::Torrent(t) => t.pause(),
        }
    }

    async fn stop(&self, delete: bool) -> Result<()> {
        match self {
            Downloader::Http(t) => t.stop(delete).await,
            Downloader::Torrent(t) => t.stop(delete).await,
        }
    }

    fn halt(&self) {
        match self {
            Downloader::Http(t) => t.halt(),
            Downloader::Torrent(t) => t.halt(),
        }
    }
}

/// Remembers the last status sent per downloader so the bulky
/// `metainfo` and `fastResumeData` fields go over the wire only when
/// they change.
#[derive(Default)]
struct DeltaTracker {
    last: HashMap<DownloaderId, TransferStatus>,
}

impl DeltaTracker {
    fn changed(&self, status: &TransferStatus) -> bool {
        match self.last.get(&status.id) {
            Some(prev) => prev.last_updated < status.last_updated,
            None => true,
        }
    }

    /// Records `status` as sent and returns the wire copy with
    /// unchanged blobs stripped.
    fn prepare(&mut self, status: &TransferStatus) -> TransferStatus {
        let mut out = status.clone();
        if let Some(prev) = self.last.get(&status.id) {
            if prev.metainfo == status.metainfo {
                out.metainfo = None;
            }
            if prev.fast_resume_data == status.fast_resume_data {
                out.fast_resume_data = None;
            }
        }
        self.last.insert(status.id.clone(), status.clone());
        out
    }

    /// Filters to the statuses that changed since the last send and
    /// records them as sent.
    fn collect(&mut self, statuses: Vec<TransferStatus>) -> Vec<TransferStatus> {
        let mut out = Vec::new();
        for status in &statuses {
            if self.changed(status) {
                out.push(self.prepare(status));
            }
        }
        out
    }
}

pub struct Daemon {
    config: Arc<EngineConfig>,
    client: Client,
    events: broadcast::Sender<DownloadEvent>,
    session: Arc<TorrentSession>,
    credentials: Arc<dyn CredentialStore>,
    downloads: RwLock<HashMap<DownloaderId, Downloader>>,
    shutdown: CancellationToken,
}

impl Daemon {
    pub fn new(config: EngineConfig) -> Result<Arc<Self>> {
        Self::with_credentials(config, Arc::new(NoCredentials))
    }

    pub fn with_credentials(
        config: EngineConfig,
        credentials: Arc<dyn CredentialStore>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout))
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()?;
        let config = Arc::new(config);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let session = TorrentSession::new(Arc::clone(&config), client.clone(), events.clone());
        session.start_sweep();
        Ok(Arc::new(Self {
            config,
            client,
            events,
            session,
            credentials,
            downloads: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn session(&self) -> &Arc<TorrentSession> {
        &self.session
    }

    /// Subscribes to the in-process event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.events.subscribe()
    }

    pub fn statuses(&self) -> Vec<TransferStatus> {
        self.downloads.read().values().map(|d| d.status()).collect()
    }

    pub fn status(&self, id: &DownloaderId) -> Result<TransferStatus> {
        Ok(self.get(id)?.status())
    }

    fn get(&self, id: &DownloaderId) -> Result<Downloader> {
        self.downloads
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| DownloadError::NotFound(id.to_string()))
    }

    /// Creates and starts a downloader for `url`. The transfer kind is
    /// picked from the URL and the optional MIME type.
    pub async fn start_new_download(
        &self,
        url: String,
        id: DownloaderId,
        content_type: Option<String>,
        channel_name: Option<String>,
    ) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(DownloadError::Shutdown);
        }
        if self.downloads.read().contains_key(&id) {
            return Err(DownloadError::Internal(format!(
                "downloader id {} already in use",
                id
            )));
        }

        let kind = DownloadKind::detect(&url, content_type.as_deref());
        let mut status = TransferStatus::new(id.clone(), &url, kind);
        status.content_type = content_type;
        status.channel_name = channel_name;

        match kind {
            DownloadKind::Http => {
                let transfer = HttpTransfer::new(
                    status,
                    Arc::clone(&self.config),
                    self.client.clone(),
                    Arc::clone(&self.credentials),
                    self.events.clone(),
                );
                transfer.start(false)?;
                self.downloads
                    .write()
                    .insert(id, Downloader::Http(transfer));
            }
            DownloadKind::Bittorrent => {
                let (raw, metainfo) = self.session.fetch_metainfo(&url).await?;
                status.metainfo = Some(raw);
                match self.session.register(status, metainfo) {
                    Registered::New(transfer) => {
                        transfer.start(false)?;
                        self.downloads
                            .write()
                            .insert(id, Downloader::Torrent(transfer));
                    }
                    Registered::Duplicate { existing_id } => {
                        tracing::info!(new = %id, existing = %existing_id,
                            "torrent already present, not starting");
                        let _ = self.events.send(DownloadEvent::DuplicateTorrent {
                            existing_id,
                            new_id: id,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Resumes a paused, stopped or failed downloader.
    pub fn start_download(&self, id: &DownloaderId) -> Result<()> {
        self.get(id)?.start(true)
    }

    pub fn pause_download(&self, id: &DownloaderId) -> Result<()> {
        self.get(id)?.pause()
    }

    pub async fn stop_download(&self, id: &DownloaderId, delete: bool) -> Result<()> {
        let downloader = self.get(id)?;
        downloader.stop(delete).await?;
        if let Downloader::Torrent(t) = &downloader {
            self.session.remove(&t.info_hash());
        }
        Ok(())
    }

    /// Ends the seeding phase of a torrent.
    pub async fn stop_upload(&self, id: &DownloaderId) -> Result<()> {
        match self.get(id)? {
            Downloader::Torrent(t) => {
                t.stop_upload().await?;
                self.session.remove(&t.info_hash());
                Ok(())
            }
            Downloader::Http(t) => Err(DownloadError::InvalidState {
                action: "stop upload",
                current_state: t.status().state.to_string(),
            }),
        }
    }

    pub fn pause_upload(&self, id: &DownloaderId) -> Result<()> {
        match self.get(id)? {
            Downloader::Torrent(t) => t.pause_upload(),
            Downloader::Http(t) => Err(DownloadError::InvalidState {
                action: "pause upload",
                current_state: t.status().state.to_string(),
            }),
        }
    }

    /// Moves a terminal download's file into a new base directory for
    /// library relocations, keeping the channel subfolder the way a
    /// fresh download would place it.
    pub async fn migrate_download(&self, id: &DownloaderId, directory: PathBuf) -> Result<()> {
        let downloader = self.get(id)?;
        let status = downloader.status();
        if !status.state.is_terminal() {
            return Err(DownloadError::InvalidState {
                action: "migrate",
                current_state: status.state.to_string(),
            });
        }
        let current = status
            .filename
            .ok_or_else(|| DownloadError::Internal("download has no file to migrate".into()))?;
        let dest_dir = match status.channel_name.as_deref() {
            Some(name) if !name.is_empty() => directory.join(filename::sanitize(name)),
            _ => directory,
        };
        let basename = if status.short_filename.is_empty() {
            "download".to_string()
        } else {
            status.short_filename.clone()
        };
        let dest = filename::move_to_dir(&current, &dest_dir, &basename).await?;
        {
            let handle = downloader.status_handle();
            let mut st = handle.write();
            st.filename = Some(dest);
            st.last_updated = chrono::Utc::now();
        }
        Ok(())
    }

    /// Rebuilds a downloader from a persisted snapshot and applies the
    /// startup policy: active items resume, seeding items resume only
    /// while the ratio cap allows it, everything else stays passive.
    pub async fn restore_downloader(&self, status: TransferStatus) -> Result<()> {
        let id = status.id.clone();
        if self.downloads.read().contains_key(&id) {
            return Err(DownloadError::Internal(format!(
                "downloader id {} already in use",
                id
            )));
        }
        match status.kind {
            DownloadKind::Http => {
                let action = restore_action(&status, false);
                let transfer = HttpTransfer::new(
                    status,
                    Arc::clone(&self.config),
                    self.client.clone(),
                    Arc::clone(&self.credentials),
                    self.events.clone(),
                );
                if action == RestoreAction::Resume {
                    transfer.start(true)?;
                }
                self.downloads
                    .write()
                    .insert(id, Downloader::Http(transfer));
            }
            DownloadKind::Bittorrent => {
                let raw = status.metainfo.clone().ok_or_else(|| {
                    DownloadError::Internal("restored torrent carries no metainfo".into())
                })?;
                let metainfo = Metainfo::parse(&raw)?;
                match self.session.register(status, metainfo) {
                    Registered::New(transfer) => {
                        let action =
                            restore_action(&transfer.status(), transfer.ratio_reached());
                        match action {
                            RestoreAction::Resume | RestoreAction::RestoreSeeding => {
                                transfer.start(true)?;
                            }
                            RestoreAction::StopUpload => {
                                transfer.stop_upload().await?;
                                self.session.remove(&transfer.info_hash());
                            }
                            RestoreAction::Keep => {}
                        }
                        self.downloads
                            .write()
                            .insert(id, Downloader::Torrent(transfer));
                    }
                    Registered::Duplicate { existing_id } => {
                        let _ = self.events.send(DownloadEvent::DuplicateTorrent {
                            existing_id,
                            new_id: id,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Halts every worker without changing recorded states, so active
    /// items restart on the next launch.
    pub fn shutdown(&self) {
        tracing::info!("daemon shutting down");
        self.shutdown.cancel();
        for downloader in self.downloads.read().values() {
            downloader.halt();
        }
        self.session.shutdown();
    }

    async fn handle_command(&self, command: DaemonCommand) -> Result<()> {
        match command {
            DaemonCommand::StartNewDownload {
                url,
                id,
                content_type,
                channel_name,
            } => {
                self.start_new_download(url, id, content_type, channel_name)
                    .await
            }
            DaemonCommand::StartDownload { id } => self.start_download(&id),
            DaemonCommand::PauseDownload { id } => self.pause_download(&id),
            DaemonCommand::StopDownload { id, delete } => self.stop_download(&id, delete).await,
            DaemonCommand::StopUpload { id } => self.stop_upload(&id).await,
            DaemonCommand::PauseUpload { id } => self.pause_upload(&id),
            DaemonCommand::MigrateDownload { id, directory } => {
                self.migrate_download(&id, directory).await
            }
            DaemonCommand::RestoreDownloader { status } => self.restore_downloader(status).await,
            DaemonCommand::ShutdownDaemon => {
                self.shutdown();
                Ok(())
            }
        }
    }

    /// Accepts foreground connections until shutdown. One connection is
    /// served at a time; the foreground is a single process.
    pub async fn serve(self: &Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted,
            };
            let (stream, addr) = accepted.map_err(|e| DownloadError::Rpc(e.to_string()))?;
            tracing::info!(%addr, "foreground connected");
            Arc::clone(self).serve_connection(stream).await;
            if self.shutdown.is_cancelled() {
                return Ok(());
            }
        }
    }

    async fn serve_connection(self: Arc<Self>, stream: TcpStream) {
        let (mut reader, mut writer) = stream.into_split();
        let (tx, mut rx) = mpsc::channel::<DaemonNotice>(NOTICE_QUEUE_CAPACITY);
        let deltas = Arc::new(Mutex::new(DeltaTracker::default()));

        let writer_task = tokio::spawn(async move {
            while let Some(notice) = rx.recv().await {
                if write_message(&mut writer, &notice).await.is_err() {
                    break;
                }
            }
        });

        // Immediate notices on state transitions.
        let forwarder = {
            let tx = tx.clone();
            let this = Arc::clone(&self);
            let deltas = Arc::clone(&deltas);
            let mut events = self.events.subscribe();
            tokio::spawn(async move {
                loop {
                    let event = match events.recv().await {
                        Ok(event) => event,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::debug!("event forwarder lagged by {n}");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    };
                    let notice = match event {
                        DownloadEvent::DuplicateTorrent {
                            existing_id,
                            new_id,
                        } => Some(DaemonNotice::DuplicateTorrent {
                            existing_id,
                            new_id,
                        }),
                        DownloadEvent::StateChanged { id, .. }
                        | DownloadEvent::Finished { id }
                        | DownloadEvent::Failed { id, .. } => {
                            this.status(&id).ok().map(|status| {
                                DaemonNotice::UpdateDownloadStatus {
                                    status: deltas.lock().prepare(&status),
                                }
                            })
                        }
                        DownloadEvent::ConversionChanged { .. } => None,
                    };
                    if let Some(notice) = notice {
                        if tx.send(notice).await.is_err() {
                            return;
                        }
                    }
                }
            })
        };

        // Batched progress sweep.
        let batcher = {
            let tx = tx.clone();
            let this = Arc::clone(&self);
            let deltas = Arc::clone(&deltas);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(this.config.update_interval());
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    let statuses = deltas.lock().collect(this.statuses());
                    if statuses.is_empty() {
                        continue;
                    }
                    if tx
                        .send(DaemonNotice::BatchUpdateDownloadStatus { statuses })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            })
        };

        loop {
            match read_message::<DaemonCommand, _>(&mut reader).await {
                Ok(Some(command)) => {
                    let is_shutdown = matches!(command, DaemonCommand::ShutdownDaemon);
                    if let Err(err) = self.handle_command(command).await {
                        tracing::warn!("command failed: {err}");
                        let _ = tx
                            .send(DaemonNotice::DownloaderError {
                                message: err.to_string(),
                            })
                            .await;
                    }
                    if is_shutdown {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!("rpc read failed: {err}");
                    break;
                }
            }
        }

        // Final full snapshot so the foreground persists resume blobs.
        let statuses = self.statuses();
        if !statuses.is_empty() {
            let _ = tx
                .send(DaemonNotice::BatchUpdateDownloadStatus { statuses })
                .await;
        }

        forwarder.abort();
        batcher.abort();
        drop(tx);
        let _ = writer_task.await;
        tracing::info!("foreground disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_tracker_strips_unchanged_blobs() {
        let mut tracker = DeltaTracker::default();
        let mut status = TransferStatus::new(
            DownloaderId::from_string("aaaaaaaa"),
            "http://x/t",
            DownloadKind::Bittorrent,
        );
        status.metainfo = Some(vec![1, 2, 3]);
        status.fast_resume_data = Some(vec![9]);

        let first = tracker.prepare(&status);
        assert!(first.metainfo.is_some());
        assert!(first.fast_resume_data.is_some());

        let second = tracker.prepare(&status);
        assert!(second.metainfo.is_none());
        assert!(second.fast_resume_data.is_none());

        status.fast_resume_data = Some(vec![9, 9]);
        let third = tracker.prepare(&status);
        assert!(third.metainfo.is_none());
        assert_eq!(third.fast_resume_data, Some(vec![9, 9]));
    }

    #[test]
    fn delta_tracker_reports_changes_by_timestamp() {
        let mut tracker = DeltaTracker::default();
        let mut status = TransferStatus::new(
            DownloaderId::from_string("bbbbbbbb"),
            "http://x/f.mp3",
            DownloadKind::Http,
        );
        assert!(tracker.changed(&status));
        tracker.prepare(&status);
        assert!(!tracker.changed(&status));
        status.last_updated = chrono::Utc::now() + chrono::Duration::seconds(1);
        assert!(tracker.changed(&status));
    }

    #[test]
    fn collect_returns_only_changed_statuses() {
        let mut tracker = DeltaTracker::default();
        let a = TransferStatus::new(
            DownloaderId::from_string("cccccccc"),
            "http://x/a.mp3",
            DownloadKind::Http,
        );
        let mut b = TransferStatus::new(
            DownloaderId::from_string("dddddddd"),
            "http://x/b.mp3",
            DownloadKind::Http,
        );

        let first = tracker.collect(vec![a.clone(), b.clone()]);
        assert_eq!(first.len(), 2);

        let second = tracker.collect(vec![a.clone(), b.clone()]);
        assert!(second.is_empty());

        b.last_updated = chrono::Utc::now() + chrono::Duration::seconds(1);
        let third = tracker.collect(vec![a, b.clone()]);
        assert_eq!(third.len(), 1);
        assert_eq!(third[0].id, b.id);
    }
}
