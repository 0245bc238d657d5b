//! Media conversion scheduler.
//!
//! Converters are declared in INI files and run as subprocesses. The
//! manager holds a pending queue and a bounded set of running tasks,
//! promoting on a fixed cycle. Finished results, successful or not,
//! stay listed until the client clears them.

pub mod converters;
pub mod probe;
pub mod task;

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use converters::{ConverterInfo, ConverterRegistry};
pub use probe::SourceInfo;
pub use task::{ConversionTask, TaskKey};

use crate::config::EngineConfig;
use crate::error::Result;
use crate::protocol::DownloadEvent;
use crate::util::filename::{move_file, next_free_filename};

/// Receives files the manager has finished staging so the client can
/// add them to its media library.
pub trait LibraryIngest: Send + Sync {
    fn ingest(&self, item_id: &str, path: &Path, display_name: &str);
}

/// A completed task, kept until explicitly cleared.
#[derive(Debug, Clone)]
pub struct FinishedTask {
    pub key: TaskKey,
    pub item_id: String,
    pub converter: String,
    /// Final location on success, failure reason otherwise. The reason
    /// points at the task log, which is kept only on failure.
    pub result: std::result::Result<PathBuf, String>,
}

/// Snapshot of one queued or running task.
#[derive(Debug, Clone)]
pub struct TaskView {
    pub key: TaskKey,
    pub item_id: String,
    pub converter: String,
    pub progress: f64,
}

pub struct ConversionManager {
    config: Arc<EngineConfig>,
    registry: Mutex<ConverterRegistry>,
    events: broadcast::Sender<DownloadEvent>,
    pending: Mutex<VecDeque<Arc<ConversionTask>>>,
    running: Mutex<HashMap<TaskKey, Arc<ConversionTask>>>,
    finished: Mutex<Vec<FinishedTask>>,
    ingest: Mutex<Option<Arc<dyn LibraryIngest>>>,
    cycle: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl ConversionManager {
    pub fn new(
        config: Arc<EngineConfig>,
        registry: ConverterRegistry,
        events: broadcast::Sender<DownloadEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry: Mutex::new(registry),
            events,
            pending: Mutex::new(VecDeque::new()),
            running: Mutex::new(HashMap::new()),
            finished: Mutex::new(Vec::new()),
            ingest: Mutex::new(None),
            cycle: Mutex::new(None),
        })
    }

    /// Registers the hook that gets every successfully staged file.
    pub fn set_ingest(&self, ingest: Arc<dyn LibraryIngest>) {
        *self.ingest.lock() = Some(ingest);
    }

    /// Lists the converters currently loaded.
    pub fn converter_ids(&self) -> Vec<String> {
        self.registry
            .lock()
            .converters()
            .iter()
            .map(|c| c.identifier.clone())
            .collect()
    }

    pub fn reload_converters(&self, registry: ConverterRegistry) {
        *self.registry.lock() = registry;
    }

    /// Queues a conversion of `input` with the named converter. The
    /// result lands in `target_dir`, or the engine's Converted
    /// directory when none is given. A key already queued, running or
    /// finished is not queued again; clear the finished list to redo a
    /// conversion.
    pub fn convert(
        &self,
        item_id: impl Into<String>,
        input: PathBuf,
        converter_id: &str,
        target_dir: Option<PathBuf>,
    ) -> Result<TaskKey> {
        let item_id = item_id.into();
        let (info, executable) = {
            let registry = self.registry.lock();
            let info = registry.get(converter_id)?.clone();
            let executable =
                registry.resolve_executable(&info, &self.config.conversion.executable_dirs);
            (info, executable)
        };
        let target_dir = target_dir.unwrap_or_else(|| self.config.converted_dir());
        let final_output = target_dir.join(info.output_name_for(&input));
        let key = (input.clone(), final_output.clone());

        if self.pending.lock().iter().any(|t| t.key() == key)
            || self.running.lock().contains_key(&key)
            || self.finished.lock().iter().any(|t| t.key == key)
        {
            return Ok(key);
        }

        let probe_executable = converters::resolve_binary(
            &self.config.conversion.probe_executable,
            &self.config.conversion.executable_dirs,
        );
        let task = Arc::new(ConversionTask::new(
            item_id,
            info,
            input,
            final_output,
            executable,
            probe_executable,
            self.config.logs_dir.clone(),
        ));
        self.pending.lock().push_back(task);
        self.notify(&key);
        Ok(key)
    }

    /// Cancels one task. A pending task is dropped from the queue; a
    /// running one gets its subprocess killed and lands in the finished
    /// list as failed.
    pub fn cancel(&self, key: &TaskKey) {
        let dropped = {
            let mut pending = self.pending.lock();
            let before = pending.len();
            pending.retain(|t| t.key() != *key);
            pending.len() != before
        };
        if let Some(task) = self.running.lock().get(key) {
            task.cancel();
        } else if dropped {
            self.notify(key);
        }
    }

    pub fn cancel_all(&self) {
        let drained: Vec<TaskKey> = self.pending.lock().drain(..).map(|t| t.key()).collect();
        for key in &drained {
            self.notify(key);
        }
        for task in self.running.lock().values() {
            task.cancel();
        }
    }

    pub fn clear_finished(&self) {
        self.finished.lock().clear();
    }

    pub fn pending_tasks(&self) -> Vec<TaskView> {
        self.pending.lock().iter().map(|t| view_of(t)).collect()
    }

    pub fn running_tasks(&self) -> Vec<TaskView> {
        self.running.lock().values().map(|t| view_of(t)).collect()
    }

    pub fn finished_tasks(&self) -> Vec<FinishedTask> {
        self.finished.lock().clone()
    }

    /// Starts the promotion cycle. Pending tasks move to running while
    /// the running set is below the concurrency cap.
    pub fn start_cycle(self: &Arc<Self>) {
        let mut slot = self.cycle.lock();
        if slot.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let manager = Arc::clone(self);
        let token = cancel.clone();
        let period = Duration::from_millis(self.config.conversion.cycle_ms.max(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => manager.promote_pending(),
                }
            }
        });
        *slot = Some((cancel, handle));
    }

    fn promote_pending(self: &Arc<Self>) {
        let cap = self.config.conversion.max_concurrent.max(1);
        loop {
            if self.running.lock().len() >= cap {
                return;
            }
            let Some(task) = self.pending.lock().pop_front() else {
                return;
            };
            let key = task.key();
            self.running.lock().insert(key.clone(), Arc::clone(&task));
            self.notify(&key);
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                manager.run_one(task).await;
            });
        }
    }

    async fn run_one(self: Arc<Self>, task: Arc<ConversionTask>) {
        let key = task.key();
        let result = match task.run().await {
            Ok(output) => self.stage(&task, output).await,
            Err(err) => Err(err),
        };
        self.running.lock().remove(&key);
        self.finished.lock().push(FinishedTask {
            key: key.clone(),
            item_id: task.item_id().to_string(),
            converter: task.converter().identifier.clone(),
            result: result.map_err(|e| e.short_reason()),
        });
        self.notify(&key);
    }

    /// Moves a finished file out of its temp directory into the target
    /// directory, renaming around existing files.
    async fn stage(&self, task: &ConversionTask, output: task::TaskOutput) -> Result<PathBuf> {
        let target_dir = task
            .final_output()
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.config.converted_dir());
        tokio::fs::create_dir_all(&target_dir)
            .await
            .map_err(|e| crate::error::DownloadError::write(&target_dir, e.to_string()))?;
        let name = task
            .final_output()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "converted".to_string());
        let dest = next_free_filename(&target_dir, &name);
        move_file(&output.temp_output, &dest).await?;
        task::remove_temp_dir(&output.temp_dir).await;
        tracing::info!(item = %task.item_id(), dest = %dest.display(), "conversion staged");
        let hook = self.ingest.lock().clone();
        if let Some(hook) = hook {
            let display_name = dest
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| task.item_id().to_string());
            hook.ingest(task.item_id(), &dest, &display_name);
        }
        Ok(dest)
    }

    /// Stops the cycle and kills running converters. Pending work is
    /// dropped.
    pub fn shutdown(&self) {
        if let Some((cancel, handle)) = self.cycle.lock().take() {
            cancel.cancel();
            handle.abort();
        }
        self.pending.lock().clear();
        for task in self.running.lock().values() {
            task.cancel();
        }
    }

    fn notify(&self, key: &TaskKey) {
        let _ = self.events.send(DownloadEvent::ConversionChanged { key: key.clone() });
    }
}

fn view_of(task: &ConversionTask) -> TaskView {
    TaskView {
        key: task.key(),
        item_id: task.item_id().to_string(),
        converter: task.converter().identifier.clone(),
        progress: task.progress(),
    }
}
