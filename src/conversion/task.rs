//! A single conversion task.
//!
//! One task converts one source file with one converter. The converter
//! subprocess runs with piped output; every line it prints lands in a
//! per-task log file and feeds the progress estimate. The log survives
//! only when the task fails.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rand::Rng;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::converters::{scaled_size, ConverterInfo};
use super::probe;
use crate::error::{DownloadError, Result};

/// Identity of a task: the same source converted to the same target is
/// the same task.
pub type TaskKey = (PathBuf, PathBuf);

/// How many times removal of the task's temp directory is retried.
/// Antivirus scanners and indexers hold fresh files open briefly.
const TEMP_DIR_REMOVE_ATTEMPTS: u32 = 5;
const TEMP_DIR_REMOVE_DELAY: Duration = Duration::from_millis(200);

pub struct ConversionTask {
    item_id: String,
    converter: ConverterInfo,
    input: PathBuf,
    final_output: PathBuf,
    executable: PathBuf,
    probe_executable: PathBuf,
    logs_dir: PathBuf,
    progress: Arc<RwLock<f64>>,
    cancel: CancellationToken,
}

impl ConversionTask {
    pub fn new(
        item_id: impl Into<String>,
        converter: ConverterInfo,
        input: PathBuf,
        final_output: PathBuf,
        executable: PathBuf,
        probe_executable: PathBuf,
        logs_dir: PathBuf,
    ) -> Self {
        Self {
            item_id: item_id.into(),
            converter,
            input,
            final_output,
            executable,
            probe_executable,
            logs_dir,
            progress: Arc::new(RwLock::new(0.0)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn key(&self) -> TaskKey {
        (self.input.clone(), self.final_output.clone())
    }

    pub fn item_id(&self) -> &str {
        &self.item_id
    }

    pub fn converter(&self) -> &ConverterInfo {
        &self.converter
    }

    pub fn final_output(&self) -> &Path {
        &self.final_output
    }

    /// Completed fraction in `0.0..=1.0`.
    pub fn progress(&self) -> f64 {
        *self.progress.read()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn log_path(&self) -> PathBuf {
        self.logs_dir.join(format!(
            "conversion-{}-to-{}.log",
            self.item_id, self.converter.identifier
        ))
    }

    /// Runs the conversion to completion. On success the produced file
    /// is returned still inside the task's temp directory, ready for
    /// staging, and the log is deleted. On failure the log stays for
    /// diagnosis.
    pub async fn run(&self) -> Result<TaskOutput> {
        let temp_dir = make_temp_dir(&self.item_id).await?;
        let result = self.run_in(&temp_dir).await;
        match &result {
            Ok(_) => {
                let _ = tokio::fs::remove_file(self.log_path()).await;
            }
            Err(err) => {
                tracing::warn!(item = %self.item_id, converter = %self.converter.identifier,
                    log = %self.log_path().display(), "conversion failed: {err}");
                remove_temp_dir(&temp_dir).await;
            }
        }
        result
    }

    async fn run_in(&self, temp_dir: &Path) -> Result<TaskOutput> {
        let source = probe::probe(&self.probe_executable, &self.input).await?;

        let ssize = match (self.converter.screen_size, source.dimensions) {
            (Some(target), Some(dims)) => {
                let (w, h) = scaled_size(dims, target);
                format!("{}x{}", w, h)
            }
            // source dimensions unknown: pass the target box through
            (Some((w, h)), None) => format!("{}x{}", w, h),
            (None, _) => String::new(),
        };

        let output_name = self.converter.output_name_for(&self.input);
        let temp_output = temp_dir.join(&output_name);
        let args = self
            .converter
            .build_arguments(&self.input, &temp_output, &ssize);

        tokio::fs::create_dir_all(&self.logs_dir)
            .await
            .map_err(|e| DownloadError::write(&self.logs_dir, e.to_string()))?;
        let mut log = tokio::fs::File::create(self.log_path())
            .await
            .map_err(|e| DownloadError::write(self.log_path(), e.to_string()))?;
        log.write_all(
            format!(
                "{} {}\n",
                self.executable.display(),
                args.join(" ")
            )
            .as_bytes(),
        )
        .await
        .ok();

        let mut child = Command::new(&self.executable)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DownloadError::ConverterFailed {
                message: format!("cannot run {}: {}", self.executable.display(), e),
            })?;

        // Merge both output streams into one line channel.
        let (line_tx, mut line_rx) = mpsc::channel::<String>(64);
        if let Some(stdout) = child.stdout.take() {
            let tx = line_tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let tx = line_tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
            });
        }
        drop(line_tx);

        let mut monitor = ProgressMonitor::new(source.duration_secs);
        let mut last_error: Option<String> = None;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = child.kill().await;
                    return Err(DownloadError::ConverterFailed {
                        message: "conversion cancelled".to_string(),
                    });
                }
                line = line_rx.recv() => {
                    let Some(line) = line else { break };
                    log.write_all(line.as_bytes()).await.ok();
                    log.write_all(b"\n").await.ok();
                    if let Some(progress) = monitor.observe(&line) {
                        *self.progress.write() = progress;
                    }
                    if let Some(error) = check_line_for_errors(&line) {
                        last_error = Some(error);
                    }
                }
            }
        }
        log.flush().await.ok();

        let status = child.wait().await.map_err(|e| DownloadError::ConverterFailed {
            message: format!("wait failed: {e}"),
        })?;

        if let Some(error) = last_error {
            return Err(DownloadError::ConverterFailed { message: error });
        }
        if !status.success() {
            return Err(DownloadError::ConverterFailed {
                message: format!("converter exited with {status}"),
            });
        }
        let produced = tokio::fs::metadata(&temp_output)
            .await
            .map(|m| m.len() > 0)
            .unwrap_or(false);
        if !produced {
            return Err(DownloadError::ConverterFailed {
                message: "converter produced no output file".to_string(),
            });
        }

        *self.progress.write() = 1.0;
        Ok(TaskOutput {
            temp_dir: temp_dir.to_path_buf(),
            temp_output,
        })
    }
}

/// Result of a successful run, pending staging.
#[derive(Debug)]
pub struct TaskOutput {
    pub temp_dir: PathBuf,
    pub temp_output: PathBuf,
}

/// Tracks the converter's printed progress.
///
/// ffmpeg-family tools print the source `Duration:` once, then repeated
/// `time=` samples, and an `Lsize=` summary line when the encode ends.
pub struct ProgressMonitor {
    duration_secs: Option<f64>,
    duration_re: Regex,
    time_re: Regex,
}

impl ProgressMonitor {
    pub fn new(duration_secs: Option<f64>) -> Self {
        Self {
            duration_secs,
            duration_re: Regex::new(r"Duration:\s*(\d+):(\d{2}):(\d{2}(?:\.\d+)?)")
                .expect("static regex"),
            time_re: Regex::new(r"time=(?:(\d+):(\d{2}):(\d{2}(?:\.\d+)?)|(\d+(?:\.\d+)?))")
                .expect("static regex"),
        }
    }

    /// Feeds one output line; returns an updated progress fraction when
    /// the line moved it.
    pub fn observe(&mut self, line: &str) -> Option<f64> {
        if let Some(caps) = self.duration_re.captures(line) {
            let h: f64 = caps[1].parse().unwrap_or(0.0);
            let m: f64 = caps[2].parse().unwrap_or(0.0);
            let s: f64 = caps[3].parse().unwrap_or(0.0);
            self.duration_secs = Some(h * 3600.0 + m * 60.0 + s);
            return None;
        }
        if line.contains("Lsize=") {
            return Some(1.0);
        }
        if let Some(caps) = self.time_re.captures(line) {
            let elapsed = if let Some(whole) = caps.get(4) {
                whole.as_str().parse().unwrap_or(0.0)
            } else {
                let h: f64 = caps[1].parse().unwrap_or(0.0);
                let m: f64 = caps[2].parse().unwrap_or(0.0);
                let s: f64 = caps[3].parse().unwrap_or(0.0);
                h * 3600.0 + m * 60.0 + s
            };
            let duration = self.duration_secs?;
            if duration > 0.0 {
                return Some((elapsed / duration).clamp(0.0, 1.0));
            }
        }
        None
    }
}

/// Error strings converters print without a non-zero exit code.
fn check_line_for_errors(line: &str) -> Option<String> {
    const MARKERS: [&str; 4] = [
        "Unknown encoder",
        "Unrecognized option",
        "Error while opening",
        "could not open codec",
    ];
    MARKERS
        .iter()
        .find(|marker| line.contains(*marker))
        .map(|_| line.trim().to_string())
}

async fn make_temp_dir(item_id: &str) -> Result<PathBuf> {
    let suffix: u32 = rand::thread_rng().gen();
    let dir = std::env::temp_dir().join(format!("conversion-{}-{:08x}", item_id, suffix));
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| DownloadError::write(&dir, e.to_string()))?;
    Ok(dir)
}

/// Removes a task's temp directory, retrying a few times for files
/// still held open by scanners.
pub async fn remove_temp_dir(dir: &Path) {
    for attempt in 1..=TEMP_DIR_REMOVE_ATTEMPTS {
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => return,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return,
            Err(err) => {
                if attempt == TEMP_DIR_REMOVE_ATTEMPTS {
                    tracing::warn!(dir = %dir.display(),
                        "giving up removing temp dir: {err}");
                    return;
                }
                tokio::time::sleep(TEMP_DIR_REMOVE_DELAY).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_from_time_samples() {
        let mut monitor = ProgressMonitor::new(None);
        assert_eq!(
            monitor.observe("  Duration: 00:01:40.00, start: 0.0, bitrate: 1 kb/s"),
            None
        );
        let p = monitor
            .observe("frame= 100 fps= 25 time=00:00:50.00 bitrate= 200kbits/s")
            .unwrap();
        assert!((p - 0.5).abs() < 1e-9);
    }

    #[test]
    fn plain_seconds_time_format() {
        let mut monitor = ProgressMonitor::new(Some(200.0));
        let p = monitor.observe("size= 1024kB time=50.0 bitrate=...").unwrap();
        assert!((p - 0.25).abs() < 1e-9);
    }

    #[test]
    fn summary_line_completes_progress() {
        let mut monitor = ProgressMonitor::new(Some(100.0));
        assert_eq!(
            monitor.observe("video:900kB audio:120kB Lsize= 1030kB"),
            Some(1.0)
        );
    }

    #[test]
    fn time_without_known_duration_is_ignored() {
        let mut monitor = ProgressMonitor::new(None);
        assert_eq!(monitor.observe("time=00:00:10.00"), None);
    }

    #[test]
    fn error_markers_are_detected() {
        assert!(check_line_for_errors("Unknown encoder 'libx264'").is_some());
        assert!(check_line_for_errors("frame= 100 time=00:00:01.00").is_none());
    }
}
