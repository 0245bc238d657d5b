//! Torrent transfer driver.
//!
//! Drives one torrent from metainfo to seeding: fetches missing pieces
//! from the torrent's web seeds (BEP 19), verifies them against the piece
//! hashes, persists a fast-resume blob, announces to trackers, and after
//! completion keeps the torrent in the `uploading` state until the ratio
//! cap is reached or the user stops it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use reqwest::{header, Client, StatusCode};
use sha1::{Digest, Sha1};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::bencode::Bencode;
use super::metainfo::Metainfo;
use super::tracker::{AnnounceEvent, AnnounceRequest, TrackerClient};
use crate::config::{EngineConfig, TorrentSettings};
use crate::error::{DownloadError, Result};
use crate::http::retry_delay;
use crate::protocol::{DownloadEvent, DownloadState, DownloaderId, TransferStatus};
use crate::util::rate::SpeedCalculator;
use crate::util::{diskspace, filename};

/// Progress the engine persists so a torrent can restart without
/// re-checking every piece: the have-bitfield plus transfer totals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FastResume {
    have: Vec<u8>,
    num_pieces: usize,
    pub uploaded: u64,
    pub downloaded: u64,
}

impl FastResume {
    pub fn empty(num_pieces: usize) -> Self {
        Self {
            have: vec![0u8; num_pieces.div_ceil(8)],
            num_pieces,
            uploaded: 0,
            downloaded: 0,
        }
    }

    pub fn has_piece(&self, index: usize) -> bool {
        self.have[index / 8] & (0x80 >> (index % 8)) != 0
    }

    pub fn set_piece(&mut self, index: usize) {
        self.have[index / 8] |= 0x80 >> (index % 8);
    }

    pub fn complete_pieces(&self) -> usize {
        (0..self.num_pieces).filter(|&i| self.has_piece(i)).count()
    }

    pub fn is_complete(&self) -> bool {
        self.complete_pieces() == self.num_pieces
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut dict = std::collections::BTreeMap::new();
        dict.insert(
            b"downloaded".to_vec(),
            Bencode::Int(self.downloaded as i64),
        );
        dict.insert(b"have".to_vec(), Bencode::Bytes(self.have.clone()));
        dict.insert(b"uploaded".to_vec(), Bencode::Int(self.uploaded as i64));
        Bencode::Dict(dict).encode()
    }

    /// Decodes a persisted blob; any mismatch with the torrent's piece
    /// count discards the blob and restarts from nothing.
    pub fn decode(data: &[u8], num_pieces: usize) -> Self {
        let parsed = (|| {
            let root = Bencode::decode(data).ok()?;
            let have = root.get("have")?.as_bytes()?.to_vec();
            if have.len() != num_pieces.div_ceil(8) {
                return None;
            }
            Some(Self {
                have,
                num_pieces,
                uploaded: root.get("uploaded")?.as_int()?.max(0) as u64,
                downloaded: root.get("downloaded")?.as_int()?.max(0) as u64,
            })
        })();
        parsed.unwrap_or_else(|| Self::empty(num_pieces))
    }
}

/// Maps piece writes onto the torrent's files under a root directory.
struct PieceStore {
    metainfo: Arc<Metainfo>,
    root: PathBuf,
}

impl PieceStore {
    /// `root` is the directory the torrent's name entry lives in.
    fn new(metainfo: Arc<Metainfo>, root: PathBuf) -> Self {
        Self { metainfo, root }
    }

    /// Path of the torrent's top-level entry (file or directory).
    fn content_path(&self) -> PathBuf {
        self.root.join(&self.metainfo.name)
    }

    async fn write_piece(&self, index: usize, data: &[u8]) -> Result<()> {
        let mut consumed = 0usize;
        for (file_index, offset, len) in self.metainfo.files_in_piece(index) {
            let rel = &self.metainfo.files[file_index].path;
            let path = self.root.join(rel);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| DownloadError::write(parent, e.to_string()))?;
            }
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .open(&path)
                .await
                .map_err(|e| DownloadError::write(&path, e.to_string()))?;
            file.seek(std::io::SeekFrom::Start(offset))
                .await
                .map_err(|e| DownloadError::write(&path, e.to_string()))?;
            let end = consumed + len as usize;
            file.write_all(&data[consumed..end])
                .await
                .map_err(|e| DownloadError::write(&path, e.to_string()))?;
            file.flush()
                .await
                .map_err(|e| DownloadError::write(&path, e.to_string()))?;
            consumed = end;
        }
        Ok(())
    }
}

/// Webseed URL for one file of the torrent (BEP 19 GetRight style).
fn webseed_file_url(webseed: &str, metainfo: &Metainfo, file_index: usize) -> String {
    if metainfo.is_single_file {
        if webseed.ends_with('/') {
            let mut url = webseed.to_string();
            url.push_str(&urlencoding::encode(&metainfo.name));
            url
        } else {
            webseed.to_string()
        }
    } else {
        let mut url = webseed.trim_end_matches('/').to_string();
        for component in metainfo.files[file_index].path.iter() {
            url.push('/');
            url.push_str(&urlencoding::encode(&component.to_string_lossy()));
        }
        url
    }
}

struct RunHandle {
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

/// One running torrent.
pub struct TorrentTransfer {
    id: DownloaderId,
    config: Arc<EngineConfig>,
    /// Live torrent settings shared with the session; `apply_settings`
    /// changes are picked up without restarting the transfer.
    settings: Arc<RwLock<TorrentSettings>>,
    client: Client,
    events: broadcast::Sender<DownloadEvent>,
    status: Arc<RwLock<TransferStatus>>,
    metainfo: Arc<Metainfo>,
    tracker: TrackerClient,
    peer_id: [u8; 20],
    resume: Mutex<FastResume>,
    run: Mutex<RunHandle>,
}

impl TorrentTransfer {
    /// Builds a transfer from a status record that already carries the
    /// raw metainfo (and the fast-resume blob when restoring).
    pub fn new(
        mut status: TransferStatus,
        metainfo: Metainfo,
        config: Arc<EngineConfig>,
        settings: Arc<RwLock<TorrentSettings>>,
        client: Client,
        events: broadcast::Sender<DownloadEvent>,
    ) -> Arc<Self> {
        let metainfo = Arc::new(metainfo);
        let resume = match &status.fast_resume_data {
            Some(blob) => FastResume::decode(blob, metainfo.num_pieces()),
            None => FastResume::empty(metainfo.num_pieces()),
        };

        status.short_filename = filename::sanitize(&metainfo.name);
        status.total_size = metainfo.total_size as i64;
        status.uploaded = resume.uploaded;
        status.current_size = downloaded_bytes(&resume, &metainfo);

        Arc::new(Self {
            id: status.id.clone(),
            config,
            settings,
            client: client.clone(),
            events,
            status: Arc::new(RwLock::new(status)),
            metainfo,
            tracker: TrackerClient::new(client),
            peer_id: super::tracker::generate_peer_id(),
            resume: Mutex::new(resume),
            run: Mutex::new(RunHandle {
                cancel: None,
                task: None,
            }),
        })
    }

    pub fn id(&self) -> &DownloaderId {
        &self.id
    }

    pub fn info_hash(&self) -> crate::protocol::InfoHash {
        self.metainfo.info_hash
    }

    pub fn status(&self) -> TransferStatus {
        self.status.read().clone()
    }

    pub fn status_handle(&self) -> Arc<RwLock<TransferStatus>> {
        Arc::clone(&self.status)
    }

    pub fn is_running(&self) -> bool {
        self.run.lock().cancel.is_some()
    }

    /// Seeded bytes divided by torrent size.
    pub fn upload_ratio(&self) -> f64 {
        let uploaded = self.resume.lock().uploaded;
        if self.metainfo.total_size == 0 {
            return 0.0;
        }
        uploaded as f64 / self.metainfo.total_size as f64
    }

    /// Whether seeding has exceeded the configured ratio cap. Seeding
    /// at exactly the cap keeps going until the ratio passes it.
    pub fn ratio_reached(&self) -> bool {
        let settings = self.settings.read();
        settings.limit_upload_ratio && self.upload_ratio() > settings.upload_ratio
    }

    /// How often the fast-resume blob in the status record is
    /// refreshed while the torrent is active.
    fn resume_flush_interval(&self) -> Duration {
        Duration::from_secs(self.settings.read().fast_resume_update_interval.max(1))
    }

    pub fn start(self: &Arc<Self>, resume: bool) -> Result<()> {
        let mut run = self.run.lock();
        if run.cancel.is_some() {
            return Err(DownloadError::InvalidState {
                action: "start",
                current_state: self.status.read().state.to_string(),
            });
        }
        if !resume {
            let mut fr = self.resume.lock();
            *fr = FastResume::empty(self.metainfo.num_pieces());
        }
        let cancel = CancellationToken::new();
        run.cancel = Some(cancel.clone());

        let starting_state = if self.resume.lock().is_complete() {
            DownloadState::Uploading
        } else {
            DownloadState::Downloading
        };
        self.set_state(starting_state);
        {
            let mut st = self.status.write();
            st.reason_failed = None;
            st.short_reason_failed = None;
            st.retry_time = None;
        }

        let this = Arc::clone(self);
        run.task = Some(tokio::spawn(async move {
            this.run_loop(cancel).await;
        }));
        Ok(())
    }

    pub fn pause(&self) -> Result<()> {
        let state = self.status.read().state;
        if state.is_terminal() {
            return Err(DownloadError::InvalidState {
                action: "pause",
                current_state: state.to_string(),
            });
        }
        self.cancel_request();
        self.flush_resume();
        let paused = if matches!(state, DownloadState::Uploading) {
            DownloadState::UploadingPaused
        } else {
            DownloadState::Paused
        };
        self.status.write().rate = 0;
        self.set_state(paused);
        Ok(())
    }

    /// Explicit pause of the seeding phase.
    pub fn pause_upload(&self) -> Result<()> {
        let state = self.status.read().state;
        if !matches!(state, DownloadState::Uploading) {
            return Err(DownloadError::InvalidState {
                action: "pause upload",
                current_state: state.to_string(),
            });
        }
        self.pause()
    }

    pub async fn stop(&self, delete: bool) -> Result<()> {
        self.cancel_request();
        self.flush_resume();
        self.announce_best_effort(AnnounceEvent::Stopped).await;
        if delete {
            let content = self
                .status
                .read()
                .filename
                .clone()
                .unwrap_or_else(|| self.store_root().join(&self.metainfo.name));
            if let Err(err) = remove_path(&content).await {
                tracing::debug!(id = %self.id, "could not remove torrent data: {err}");
            }
            {
                let mut st = self.status.write();
                st.current_size = 0;
                st.filename = None;
                st.fast_resume_data = None;
            }
            *self.resume.lock() = FastResume::empty(self.metainfo.num_pieces());
        }
        self.status.write().rate = 0;
        self.set_state(DownloadState::Stopped);
        Ok(())
    }

    /// Ends the seeding phase and marks the torrent finished. The
    /// downloaded data stays in place.
    pub async fn stop_upload(&self) -> Result<()> {
        self.cancel_request();
        self.flush_resume();
        self.announce_best_effort(AnnounceEvent::Stopped).await;
        {
            let mut st = self.status.write();
            st.rate = 0;
            st.up_rate = 0;
        }
        self.set_state(DownloadState::Finished);
        let _ = self.events.send(DownloadEvent::Finished {
            id: self.id.clone(),
        });
        Ok(())
    }

    /// Writes the current fast-resume blob into the status record so the
    /// next persisted snapshot carries it.
    pub fn flush_resume(&self) {
        let (blob, uploaded) = {
            let fr = self.resume.lock();
            (fr.encode(), fr.uploaded)
        };
        let mut st = self.status.write();
        st.fast_resume_data = Some(blob);
        st.uploaded = uploaded;
        st.last_updated = Utc::now();
    }

    /// Cancels the worker and flushes resume data without touching the
    /// recorded state. Used at daemon shutdown so active torrents
    /// restart on next launch.
    pub fn halt(&self) {
        self.cancel_request();
        self.flush_resume();
        let mut st = self.status.write();
        st.rate = 0;
        st.up_rate = 0;
    }

    fn cancel_request(&self) {
        let mut run = self.run.lock();
        if let Some(cancel) = run.cancel.take() {
            cancel.cancel();
        }
        run.task = None;
    }

    fn set_state(&self, state: DownloadState) {
        {
            let mut st = self.status.write();
            st.state = state;
            st.last_updated = Utc::now();
        }
        let _ = self.events.send(DownloadEvent::StateChanged {
            id: self.id.clone(),
            state,
        });
    }

    fn store_root(&self) -> PathBuf {
        self.config.incomplete_dir()
    }

    async fn run_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            match self.attempt(&cancel).await {
                Ok(()) => break,
                Err(err) if err.is_transient() && !cancel.is_cancelled() => {
                    let delay = {
                        let mut st = self.status.write();
                        let delay = retry_delay(&self.config.retry_schedule, st.retry_count);
                        st.state = DownloadState::Offline;
                        st.rate = 0;
                        st.reason_failed = Some(err.to_string());
                        st.short_reason_failed = Some(err.short_reason());
                        st.retry_time =
                            Some(Utc::now() + chrono::Duration::seconds(delay.as_secs() as i64));
                        st.last_updated = Utc::now();
                        delay
                    };
                    let _ = self.events.send(DownloadEvent::StateChanged {
                        id: self.id.clone(),
                        state: DownloadState::Offline,
                    });
                    tracing::info!(id = %self.id, delay_secs = delay.as_secs(),
                        "torrent stalled, retry scheduled: {err}");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    {
                        let mut st = self.status.write();
                        st.retry_count += 1;
                        st.retry_time = None;
                        st.state = DownloadState::Downloading;
                        st.last_updated = Utc::now();
                    }
                }
                Err(err) => {
                    tracing::warn!(id = %self.id, "torrent failed: {err}");
                    {
                        let mut st = self.status.write();
                        st.state = DownloadState::Failed;
                        st.rate = 0;
                        st.retry_time = None;
                        st.reason_failed = Some(err.to_string());
                        st.short_reason_failed = Some(err.short_reason());
                        st.last_updated = Utc::now();
                    }
                    let _ = self.events.send(DownloadEvent::StateChanged {
                        id: self.id.clone(),
                        state: DownloadState::Failed,
                    });
                    let _ = self.events.send(DownloadEvent::Failed {
                        id: self.id.clone(),
                        reason: err.to_string(),
                    });
                    break;
                }
            }
        }
        self.run.lock().cancel = None;
    }

    /// Runs until the transfer is cancelled (pause, stop, stop_upload)
    /// or fails. Completion flows into the seeding phase.
    async fn attempt(&self, cancel: &CancellationToken) -> Result<()> {
        if !self.resume.lock().is_complete() {
            let cancelled = self.download_phase(cancel).await?;
            if cancelled {
                return Ok(());
            }
        }
        self.seed_phase(cancel).await
    }

    /// Fetches missing pieces from web seeds until the torrent is
    /// complete, then moves the data into its final directory. Returns
    /// `true` when interrupted by cancellation.
    async fn download_phase(&self, cancel: &CancellationToken) -> Result<bool> {
        let root = self.store_root();
        fs::create_dir_all(&root)
            .await
            .map_err(|e| DownloadError::write(&root, e.to_string()))?;

        if self.config.preserve_disk_space {
            diskspace::check(&root, self.metainfo.total_size, self.config.preserve_bytes)?;
        }

        // A missing content path invalidates the have-bitfield.
        let store = PieceStore::new(Arc::clone(&self.metainfo), root);
        {
            let mut fr = self.resume.lock();
            if fr.complete_pieces() > 0 && !store.content_path().exists() {
                *fr = FastResume::empty(self.metainfo.num_pieces());
            }
        }
        self.status.write().filename = Some(store.content_path());

        self.announce_best_effort(AnnounceEvent::Started).await;

        if self.metainfo.webseeds.is_empty() {
            return Err(DownloadError::connection(
                "no reachable seeds for this torrent",
            ));
        }

        let mut speed = SpeedCalculator::default();
        let mut last_flush = Instant::now();
        let mut headers_seen = false;

        for index in 0..self.metainfo.num_pieces() {
            if self.resume.lock().has_piece(index) {
                continue;
            }
            if cancel.is_cancelled() {
                return Ok(true);
            }

            let data = tokio::select! {
                r = self.fetch_piece(index) => r?,
                _ = cancel.cancelled() => return Ok(true),
            };
            store.write_piece(index, &data).await?;

            if !headers_seen {
                // First verified piece proves the seed is usable.
                headers_seen = true;
                let mut st = self.status.write();
                st.retry_count = -1;
                st.reason_failed = None;
                st.short_reason_failed = None;
            }

            speed.add_bytes(data.len() as u64);
            {
                let mut fr = self.resume.lock();
                fr.set_piece(index);
                fr.downloaded += data.len() as u64;
                let mut st = self.status.write();
                st.current_size = downloaded_bytes(&fr, &self.metainfo);
                st.rate = speed.speed();
                st.last_updated = Utc::now();
            }
            if last_flush.elapsed() >= self.resume_flush_interval() {
                self.flush_resume();
                last_flush = Instant::now();
            }
        }

        self.finalize_download(&store).await?;
        Ok(false)
    }

    /// Moves the completed content out of the incomplete directory and
    /// switches to the uploading state.
    async fn finalize_download(&self, store: &PieceStore) -> Result<()> {
        let channel = self.status.read().channel_name.clone();
        let dest_dir = self.config.final_dir(channel.as_deref());
        fs::create_dir_all(&dest_dir)
            .await
            .map_err(|e| DownloadError::write(&dest_dir, e.to_string()))?;

        let src = store.content_path();
        let dest = if self.metainfo.is_single_file {
            filename::move_to_dir(&src, &dest_dir, &filename::sanitize(&self.metainfo.name))
                .await?
        } else {
            let dest = filename::next_free_filename(
                &dest_dir,
                &filename::sanitize(&self.metainfo.name),
            );
            fs::rename(&src, &dest)
                .await
                .map_err(|e| DownloadError::write(&dest, e.to_string()))?;
            dest
        };

        self.flush_resume();
        {
            let mut st = self.status.write();
            st.filename = Some(dest);
            st.current_size = self.metainfo.total_size;
            st.rate = 0;
            st.last_updated = Utc::now();
        }
        self.announce_best_effort(AnnounceEvent::Completed).await;
        self.set_state(DownloadState::Uploading);
        tracing::info!(id = %self.id, "torrent complete, seeding");
        Ok(())
    }

    /// Periodic announces while seeding. The ratio cap is enforced by
    /// the session sweep, which calls `stop_upload` and thereby cancels
    /// this loop.
    async fn seed_phase(&self, cancel: &CancellationToken) -> Result<()> {
        let mut last_flush = Instant::now();
        loop {
            let interval = self
                .announce_best_effort(AnnounceEvent::Interval)
                .await
                .unwrap_or(super::tracker::DEFAULT_ANNOUNCE_INTERVAL);

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(interval) => {}
            }
            if last_flush.elapsed() >= self.resume_flush_interval() {
                self.flush_resume();
                last_flush = Instant::now();
            }
        }
    }

    /// Announces to the first tracker that answers. Failures are logged
    /// and swallowed; announce problems never fail the transfer.
    async fn announce_best_effort(&self, event: AnnounceEvent) -> Option<Duration> {
        let (uploaded, downloaded) = {
            let fr = self.resume.lock();
            (fr.uploaded, fr.downloaded)
        };
        let left = self
            .metainfo
            .total_size
            .saturating_sub(self.status.read().current_size);
        let request = AnnounceRequest {
            info_hash: self.metainfo.info_hash,
            peer_id: self.peer_id,
            port: self.settings.read().listen_port_range.0,
            uploaded,
            downloaded,
            left,
            event,
        };
        for tracker_url in &self.metainfo.trackers {
            match self.tracker.announce(tracker_url, &request).await {
                Ok(response) => {
                    let mut st = self.status.write();
                    st.seeders = response.seeders;
                    st.leechers = response.leechers;
                    st.last_updated = Utc::now();
                    return Some(response.interval);
                }
                Err(err) => {
                    tracing::debug!(id = %self.id, tracker = tracker_url,
                        "announce failed: {err}");
                }
            }
        }
        None
    }

    /// Fetches and verifies one piece from the torrent's web seeds,
    /// trying each seed in turn.
    async fn fetch_piece(&self, index: usize) -> Result<Vec<u8>> {
        let mut last_err = None;
        for webseed in &self.metainfo.webseeds {
            match self.fetch_piece_from(webseed, index).await {
                Ok(data) => return Ok(data),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err
            .unwrap_or_else(|| DownloadError::connection("no reachable seeds for this torrent")))
    }

    async fn fetch_piece_from(&self, webseed: &str, index: usize) -> Result<Vec<u8>> {
        let piece_size = self.metainfo.piece_size(index) as usize;
        let mut buf = Vec::with_capacity(piece_size);
        for (file_index, offset, len) in self.metainfo.files_in_piece(index) {
            let url = webseed_file_url(webseed, &self.metainfo, file_index);
            let end = offset + len - 1;
            let response = self
                .client
                .get(&url)
                .header(header::USER_AGENT, &self.config.user_agent)
                .header(header::RANGE, format!("bytes={}-{}", offset, end))
                .send()
                .await?;
            let code = response.status();
            let body = match code {
                StatusCode::PARTIAL_CONTENT => response.bytes().await?.to_vec(),
                StatusCode::OK => {
                    // Seed ignored the range; slice the full body.
                    let full = response.bytes().await?;
                    let start = offset as usize;
                    let stop = start + len as usize;
                    if full.len() < stop {
                        return Err(DownloadError::connection("web seed sent a short body"));
                    }
                    full[start..stop].to_vec()
                }
                c => return Err(DownloadError::from_status(c.as_u16())),
            };
            if body.len() != len as usize {
                return Err(DownloadError::connection("web seed sent a short body"));
            }
            buf.extend_from_slice(&body);
        }

        let mut hasher = Sha1::new();
        hasher.update(&buf);
        let digest: [u8; 20] = hasher.finalize().into();
        if digest != self.metainfo.pieces[index] {
            return Err(DownloadError::connection(format!(
                "piece {} failed hash check",
                index
            )));
        }
        Ok(buf)
    }
}

fn downloaded_bytes(resume: &FastResume, metainfo: &Metainfo) -> u64 {
    (0..metainfo.num_pieces())
        .filter(|&i| resume.has_piece(i))
        .map(|i| metainfo.piece_size(i))
        .sum()
}

async fn remove_path(path: &Path) -> std::io::Result<()> {
    match fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path).await,
        Ok(_) => fs::remove_file(path).await,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fast_resume_round_trips() {
        let mut fr = FastResume::empty(11);
        fr.set_piece(0);
        fr.set_piece(7);
        fr.set_piece(10);
        fr.uploaded = 4096;
        fr.downloaded = 8192;
        let decoded = FastResume::decode(&fr.encode(), 11);
        assert_eq!(decoded, fr);
        assert_eq!(decoded.complete_pieces(), 3);
        assert!(!decoded.is_complete());
    }

    #[test]
    fn corrupt_resume_blob_restarts_clean() {
        let fr = FastResume::decode(b"not bencode", 5);
        assert_eq!(fr, FastResume::empty(5));
        // piece-count mismatch also restarts
        let other = FastResume::empty(64).encode();
        assert_eq!(FastResume::decode(&other, 5), FastResume::empty(5));
    }

    #[test]
    fn completion_detection() {
        let mut fr = FastResume::empty(3);
        fr.set_piece(0);
        fr.set_piece(1);
        assert!(!fr.is_complete());
        fr.set_piece(2);
        assert!(fr.is_complete());
    }

    #[test]
    fn webseed_urls_for_single_and_multi_file() {
        let content = vec![0u8; 10];
        let doc = super::super::metainfo::test_data::single_file_torrent(
            "my episode.mp4",
            &content,
            16,
            None,
        );
        let meta = Metainfo::parse(&doc).unwrap();
        assert_eq!(
            webseed_file_url("http://seed/files/", &meta, 0),
            "http://seed/files/my%20episode.mp4"
        );
        assert_eq!(
            webseed_file_url("http://seed/direct.mp4", &meta, 0),
            "http://seed/direct.mp4"
        );
    }

    #[test]
    fn seeding_stops_only_past_the_ratio_cap() {
        let content = vec![0u8; 100];
        let doc =
            super::super::metainfo::test_data::single_file_torrent("ep.mp4", &content, 32, None);
        let meta = Metainfo::parse(&doc).unwrap();
        let status = TransferStatus::new(
            DownloaderId::from_string("eeeeeeee"),
            "http://x/t",
            crate::protocol::DownloadKind::Bittorrent,
        );
        let mut settings = TorrentSettings::default();
        settings.limit_upload_ratio = true;
        let (events, _) = broadcast::channel(8);
        let transfer = TorrentTransfer::new(
            status,
            meta,
            Arc::new(EngineConfig::default()),
            Arc::new(RwLock::new(settings)),
            Client::new(),
            events,
        );

        // cap is 2.0; sitting exactly on it keeps seeding
        transfer.resume.lock().uploaded = 200;
        assert!(!transfer.ratio_reached());
        transfer.resume.lock().uploaded = 201;
        assert!(transfer.ratio_reached());
    }
}
