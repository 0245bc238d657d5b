//! HTTP transfer engine.
//!
//! One [`HttpTransfer`] drives one download: it streams the response body
//! into a `.part` file under the incomplete directory, publishes progress
//! into a shared [`TransferStatus`], and on completion moves the file into
//! its final per-channel directory. Transient failures park the transfer
//! in the `offline` state and retry on a fixed back-off schedule; fatal
//! failures move it to `failed`.
//!
//! The same module exposes [`fetch_body`] for small bounded in-memory
//! fetches (the torrent path uses it to pull `.torrent` files through the
//! identical redirect, auth and error classification rules).

pub mod auth;

pub use auth::{AuthChallenge, CredentialStore, NoCredentials};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use reqwest::{header, Client, StatusCode};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::{DownloadError, Result};
use crate::protocol::{DownloadEvent, DownloadState, DownloaderId, TransferStatus};
use crate::util::filename;
use crate::util::rate::SpeedCalculator;
use crate::util::diskspace;

/// Default back-off schedule in seconds, indexed by `retry_count`
/// (clamped to the last entry). 1 minute, 5, 10, 30, then 1, 2, 6 and
/// 24 hours. `EngineConfig::retry_schedule` carries the live value.
pub const RETRY_SCHEDULE: [u64; 8] = [60, 300, 600, 1800, 3600, 7200, 21600, 86400];

/// Delay before the next attempt for a given retry count.
pub fn retry_delay(schedule: &[u64], retry_count: i32) -> Duration {
    let idx = (retry_count.max(0) as usize).min(schedule.len().saturating_sub(1));
    Duration::from_secs(schedule.get(idx).copied().unwrap_or(RETRY_SCHEDULE[0]))
}

/// How often streamed progress is written back into the shared status.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

enum Outcome {
    Finished,
    Cancelled,
}

struct RunHandle {
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

/// A single HTTP download with pause/stop/resume semantics.
pub struct HttpTransfer {
    id: DownloaderId,
    config: Arc<EngineConfig>,
    client: Client,
    credentials: Arc<dyn CredentialStore>,
    events: broadcast::Sender<DownloadEvent>,
    status: Arc<RwLock<TransferStatus>>,
    /// Validators remembered from the last successful response, used for
    /// conditional requests when restarting from zero.
    etag: Mutex<Option<String>>,
    last_modified: Mutex<Option<String>>,
    run: Mutex<RunHandle>,
}

impl HttpTransfer {
    pub fn new(
        status: TransferStatus,
        config: Arc<EngineConfig>,
        client: Client,
        credentials: Arc<dyn CredentialStore>,
        events: broadcast::Sender<DownloadEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: status.id.clone(),
            config,
            client,
            credentials,
            events,
            status: Arc::new(RwLock::new(status)),
            etag: Mutex::new(None),
            last_modified: Mutex::new(None),
            run: Mutex::new(RunHandle {
                cancel: None,
                task: None,
            }),
        })
    }

    pub fn id(&self) -> &DownloaderId {
        &self.id
    }

    /// Current status snapshot.
    pub fn status(&self) -> TransferStatus {
        self.status.read().clone()
    }

    /// Shared handle for the daemon's batched status sweep.
    pub fn status_handle(&self) -> Arc<RwLock<TransferStatus>> {
        Arc::clone(&self.status)
    }

    pub fn is_running(&self) -> bool {
        self.run.lock().cancel.is_some()
    }

    /// Starts (or restarts) the transfer. With `resume` the partial file
    /// is kept and the request carries a `Range` header; without it any
    /// partial file is discarded and the transfer begins from zero.
    pub fn start(self: &Arc<Self>, resume: bool) -> Result<()> {
        let mut run = self.run.lock();
        if run.cancel.is_some() {
            return Err(DownloadError::InvalidState {
                action: "start",
                current_state: self.status.read().state.to_string(),
            });
        }
        let cancel = CancellationToken::new();
        run.cancel = Some(cancel.clone());

        self.set_state(DownloadState::Downloading);
        {
            let mut st = self.status.write();
            st.reason_failed = None;
            st.short_reason_failed = None;
            st.retry_time = None;
        }

        let this = Arc::clone(self);
        run.task = Some(tokio::spawn(async move {
            this.run_loop(resume, cancel).await;
        }));
        Ok(())
    }

    /// Cancels the in-flight attempt and parks the transfer as `paused`.
    /// The partial file stays on disk.
    pub fn pause(&self) -> Result<()> {
        let state = self.status.read().state;
        if state.is_terminal() {
            return Err(DownloadError::InvalidState {
                action: "pause",
                current_state: state.to_string(),
            });
        }
        self.cancel_request();
        {
            let mut st = self.status.write();
            st.rate = 0;
            st.retry_time = None;
        }
        self.set_state(DownloadState::Paused);
        Ok(())
    }

    /// Cancels the transfer and marks it `stopped`. With `delete` the
    /// partial file is removed as well.
    pub async fn stop(&self, delete: bool) -> Result<()> {
        self.cancel_request();
        let path = {
            let mut st = self.status.write();
            st.rate = 0;
            st.retry_time = None;
            if delete {
                let p = st.filename.take();
                st.current_size = 0;
                p
            } else {
                None
            }
        };
        if let Some(path) = path {
            if let Err(err) = fs::remove_file(&path).await {
                tracing::debug!(id = %self.id, path = %path.display(),
                    "could not remove partial file: {err}");
            }
        }
        self.set_state(DownloadState::Stopped);
        Ok(())
    }

    /// Cancels the worker without touching the recorded state. Used at
    /// daemon shutdown so a `downloading` item restarts on next launch.
    pub fn halt(&self) {
        self.cancel_request();
        self.status.write().rate = 0;
    }

    /// Signals the worker to abandon the current attempt. State is left
    /// for the caller to set.
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

    async fn run_loop(self: Arc<Self>, mut resume: bool, cancel: CancellationToken) {
        loop {
            match self.attempt(resume, &cancel).await {
                Ok(Outcome::Finished) | Ok(Outcome::Cancelled) => break,
                Err(err) if err.is_transient() && !cancel.is_cancelled() => {
                    let delay = self.schedule_retry(&err);
                    tracing::info!(id = %self.id, delay_secs = delay.as_secs(),
                        "transient failure, retry scheduled: {err}");
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
                    resume = true;
                }
                Err(err) => {
                    self.mark_failed(err);
                    break;
                }
            }
        }
        self.run.lock().cancel = None;
    }

    /// Parks the transfer offline and returns the back-off delay for the
    /// current retry count.
    fn schedule_retry(&self, err: &DownloadError) -> Duration {
        let mut st = self.status.write();
        let delay = retry_delay(&self.config.retry_schedule, st.retry_count);
        st.state = DownloadState::Offline;
        st.rate = 0;
        st.reason_failed = Some(err.to_string());
        st.short_reason_failed = Some(err.short_reason());
        st.retry_time = Some(Utc::now() + chrono::Duration::seconds(delay.as_secs() as i64));
        st.last_updated = Utc::now();
        drop(st);
        let _ = self.events.send(DownloadEvent::StateChanged {
            id: self.id.clone(),
            state: DownloadState::Offline,
        });
        delay
    }

    fn mark_failed(&self, err: DownloadError) {
        tracing::warn!(id = %self.id, "download failed: {err}");
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
    }

    /// One transfer attempt, request through finalization.
    async fn attempt(&self, resume: bool, cancel: &CancellationToken) -> Result<Outcome> {
        let incomplete = self.config.incomplete_dir();
        fs::create_dir_all(&incomplete)
            .await
            .map_err(|e| DownloadError::write(&incomplete, e.to_string()))?;

        let (url, part_path) = {
            let st = self.status.read();
            let part = match &st.filename {
                Some(p) if p.extension().map(|e| e == "part").unwrap_or(false) => p.clone(),
                _ => {
                    let base = if st.short_filename.is_empty() {
                        filename::from_url(&st.url).unwrap_or_else(|| "download".to_string())
                    } else {
                        st.short_filename.clone()
                    };
                    incomplete.join(format!("{}.part", filename::sanitize(&base)))
                }
            };
            (st.url.clone(), part)
        };
        self.status.write().filename = Some(part_path.clone());

        let mut current_size = self.sanity_check_partial(&part_path, resume).await?;
        self.status.write().current_size = current_size;

        let response = self.send_request(&url, current_size, cancel).await?;
        let response = match response {
            Some(r) => r,
            None => return Ok(Outcome::Cancelled),
        };

        let code = response.status();
        let mut resuming = current_size > 0;
        match code {
            StatusCode::PARTIAL_CONTENT if resuming => {}
            StatusCode::NOT_MODIFIED => {
                // Conditional request says our copy is current.
                return self.finalize(&part_path, cancel).await;
            }
            c if c.is_success() => {
                if resuming {
                    // Server ignored the Range header; start over.
                    tracing::debug!(id = %self.id, "range ignored, restarting from zero");
                    let _ = fs::remove_file(&part_path).await;
                    current_size = 0;
                    resuming = false;
                    self.status.write().current_size = 0;
                }
            }
            c => return Err(DownloadError::from_status(c.as_u16())),
        }

        self.process_headers(&response, current_size)?;

        // Stream the body into the partial file.
        let mut file = if current_size > 0 {
            OpenOptions::new().append(true).open(&part_path).await
        } else {
            File::create(&part_path).await
        }
        .map_err(|e| DownloadError::write(&part_path, e.to_string()))?;

        let mut stream = response.bytes_stream();
        let mut speed = SpeedCalculator::default();
        let mut last_publish = Instant::now();
        loop {
            let next = tokio::select! {
                chunk = stream.next() => chunk,
                _ = cancel.cancelled() => {
                    file.flush().await.ok();
                    self.status.write().current_size = current_size;
                    return Ok(Outcome::Cancelled);
                }
            };
            let chunk = match next {
                Some(Ok(chunk)) => chunk,
                Some(Err(err)) => {
                    file.flush().await.ok();
                    self.status.write().current_size = current_size;
                    return Err(DownloadError::connection(format!(
                        "stream interrupted: {err}"
                    )));
                }
                None => break,
            };
            file.write_all(&chunk)
                .await
                .map_err(|e| DownloadError::write(&part_path, e.to_string()))?;
            current_size += chunk.len() as u64;
            speed.add_bytes(chunk.len() as u64);

            if last_publish.elapsed() >= PROGRESS_INTERVAL {
                let mut st = self.status.write();
                st.current_size = current_size;
                st.rate = speed.speed();
                st.last_updated = Utc::now();
                last_publish = Instant::now();
            }
        }

        file.flush()
            .await
            .map_err(|e| DownloadError::write(&part_path, e.to_string()))?;
        file.sync_all()
            .await
            .map_err(|e| DownloadError::write(&part_path, e.to_string()))?;

        let total_size = {
            let mut st = self.status.write();
            st.current_size = current_size;
            st.rate = 0;
            st.last_updated = Utc::now();
            st.total_size
        };

        if !resuming && current_size == 0 {
            return Err(DownloadError::PossiblyTemporary {
                message: "server sent a zero-length response".to_string(),
            });
        }
        if total_size >= 0 && (current_size as i64) < total_size {
            return Err(DownloadError::connection("connection closed mid-transfer"));
        }

        self.finalize(&part_path, cancel).await
    }

    /// Reconciles the on-disk partial file with the recorded offset.
    /// Longer on disk: truncate back. Shorter or missing: restart from
    /// zero. Returns the offset the request should resume at.
    async fn sanity_check_partial(&self, part_path: &PathBuf, resume: bool) -> Result<u64> {
        let recorded = self.status.read().current_size;
        if !resume {
            let _ = fs::remove_file(part_path).await;
            return Ok(0);
        }
        match fs::metadata(part_path).await {
            Ok(meta) => {
                let on_disk = meta.len();
                if on_disk > recorded {
                    let f = OpenOptions::new()
                        .write(true)
                        .open(part_path)
                        .await
                        .map_err(|e| DownloadError::write(part_path, e.to_string()))?;
                    f.set_len(recorded)
                        .await
                        .map_err(|e| DownloadError::write(part_path, e.to_string()))?;
                    Ok(recorded)
                } else if on_disk < recorded {
                    let _ = fs::remove_file(part_path).await;
                    Ok(0)
                } else {
                    Ok(recorded)
                }
            }
            Err(_) => Ok(0),
        }
    }

    /// Sends the request, answering auth challenges from the credential
    /// store up to the configured attempt limit. `Ok(None)` means the
    /// transfer was cancelled while connecting.
    async fn send_request(
        &self,
        url: &str,
        current_size: u64,
        cancel: &CancellationToken,
    ) -> Result<Option<reqwest::Response>> {
        let mut auth_header: Option<String> = None;
        let mut attempts = 0usize;
        loop {
            let mut req = self
                .client
                .get(url)
                .header(header::USER_AGENT, &self.config.user_agent);
            if current_size > 0 {
                req = req.header(header::RANGE, format!("bytes={}-", current_size));
            } else {
                if let Some(etag) = self.etag.lock().clone() {
                    req = req.header(header::IF_NONE_MATCH, etag);
                }
                if let Some(lm) = self.last_modified.lock().clone() {
                    req = req.header(header::IF_MODIFIED_SINCE, lm);
                }
            }
            if let Some(value) = &auth_header {
                req = req.header(header::AUTHORIZATION, value);
            }

            let response = tokio::select! {
                r = req.send() => r?,
                _ = cancel.cancelled() => return Ok(None),
            };

            if response.status() != StatusCode::UNAUTHORIZED {
                return Ok(Some(response));
            }

            attempts += 1;
            if attempts >= self.config.max_auth_attempts {
                return Err(DownloadError::AuthorizationFailed);
            }
            let challenge = response
                .headers()
                .get(header::WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .and_then(auth::parse_www_authenticate)
                .ok_or(DownloadError::AuthorizationFailed)?;
            match self
                .credentials
                .find_http_auth(url, &challenge.scheme, &challenge.realm)
                .await
            {
                Some(value) => auth_header = Some(value),
                None => return Err(DownloadError::AuthorizationFailed),
            }
        }
    }

    /// Applies response headers to the status record. Runs exactly once
    /// per final (non-401, non-redirect) response.
    fn process_headers(&self, response: &reqwest::Response, current_size: u64) -> Result<()> {
        let headers = response.headers();
        let effective_url = response.url().to_string();

        if let Some(etag) = headers.get(header::ETAG).and_then(|v| v.to_str().ok()) {
            *self.etag.lock() = Some(etag.to_string());
        }
        if let Some(lm) = headers
            .get(header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
        {
            *self.last_modified.lock() = Some(lm.to_string());
        }

        let content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let short = headers
            .get(header::CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(filename::from_content_disposition)
            .or_else(|| filename::from_url(&effective_url));

        let total_size: i64 = match response.content_length() {
            Some(len) => (len + current_size) as i64,
            None => -1,
        };

        if self.config.preserve_disk_space && total_size > 0 {
            diskspace::check(
                &self.config.incomplete_dir(),
                total_size as u64,
                self.config.preserve_bytes,
            )?;
        }

        let mut st = self.status.write();
        if let Some(short) = short {
            st.short_filename = filename::sanitize(&short);
        } else if st.short_filename.is_empty() {
            st.short_filename = "download".to_string();
        }
        st.content_type = content_type;
        st.total_size = total_size;
        st.retry_count = -1;
        st.retry_time = None;
        st.reason_failed = None;
        st.short_reason_failed = None;
        st.last_updated = Utc::now();
        Ok(())
    }

    /// Moves the completed file out of the incomplete directory into its
    /// channel folder and marks the transfer finished.
    async fn finalize(&self, part_path: &PathBuf, cancel: &CancellationToken) -> Result<Outcome> {
        if cancel.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }
        let (short, channel) = {
            let st = self.status.read();
            (st.short_filename.clone(), st.channel_name.clone())
        };
        let dest_dir = self.config.final_dir(channel.as_deref());
        let basename = if short.is_empty() {
            "download".to_string()
        } else {
            short
        };
        let dest = filename::move_to_dir(part_path, &dest_dir, &basename).await?;

        {
            let mut st = self.status.write();
            st.filename = Some(dest.clone());
            st.state = DownloadState::Finished;
            st.rate = 0;
            st.retry_time = None;
            st.last_updated = Utc::now();
        }
        tracing::info!(id = %self.id, path = %dest.display(), "download finished");
        let _ = self.events.send(DownloadEvent::StateChanged {
            id: self.id.clone(),
            state: DownloadState::Finished,
        });
        let _ = self.events.send(DownloadEvent::Finished {
            id: self.id.clone(),
        });
        Ok(Outcome::Finished)
    }
}

/// A small response body fetched fully into memory.
pub struct FetchedBody {
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub effective_url: String,
    pub filename: String,
}

/// Fetches a bounded body into memory with an early content check.
///
/// `content_check` runs on the first received bytes; returning `false`
/// aborts the transfer without reading the rest. Bodies larger than
/// `max_size` are rejected the same way. Used for `.torrent` files so
/// they share the engine's redirect and error classification behavior.
pub async fn fetch_body<F>(
    client: &Client,
    user_agent: &str,
    url: &str,
    max_size: usize,
    content_check: F,
) -> Result<FetchedBody>
where
    F: Fn(&[u8]) -> bool,
{
    let response = client
        .get(url)
        .header(header::USER_AGENT, user_agent)
        .send()
        .await?;

    let code = response.status();
    if !code.is_success() {
        return Err(DownloadError::from_status(code.as_u16()));
    }

    let effective_url = response.url().to_string();
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    let filename = response
        .headers()
        .get(header::CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .and_then(filename::from_content_disposition)
        .or_else(|| filename::from_url(&effective_url))
        .unwrap_or_else(|| "download".to_string());

    let mut body: Vec<u8> = Vec::new();
    let mut checked = false;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk =
            chunk.map_err(|e| DownloadError::connection(format!("stream interrupted: {e}")))?;
        body.extend_from_slice(&chunk);
        if body.len() > max_size {
            return Err(DownloadError::CorruptTorrent {
                url: url.to_string(),
                message: format!("response larger than {} bytes", max_size),
            });
        }
        if !checked && !body.is_empty() {
            checked = true;
            if !content_check(&body) {
                return Err(DownloadError::CorruptTorrent {
                    url: url.to_string(),
                    message: "content check failed".to_string(),
                });
            }
        }
    }
    if body.is_empty() || !content_check(&body) {
        return Err(DownloadError::CorruptTorrent {
            url: url.to_string(),
            message: "content check failed".to_string(),
        });
    }

    Ok(FetchedBody {
        body,
        content_type,
        effective_url,
        filename,
    })
}
