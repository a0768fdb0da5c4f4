use std::collections::HashMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::fs::{self as async_fs, File};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::config::MatchdayConfig;
use crate::video::{concat_order, MediaMetadata};

use super::{
    CommandBuilder, MetadataProbe, ProcessExit, ProcessSpawner, ProgressParser,
    SystemProcessSpawner, TranscodeError, TranscodeInput, TranscodeListener, TranscodeProcess,
    TranscodeRequest, TranscodeResult,
};

const DEFAULT_LOG_TIMESTAMP: &str = "%Y-%m-%d_%H-%M-%S";

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub max_concurrent: usize,
    pub logging_enabled: bool,
    pub log_timestamp_format: String,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            logging_enabled: true,
            log_timestamp_format: DEFAULT_LOG_TIMESTAMP.to_string(),
        }
    }
}

impl SupervisorSettings {
    pub fn from_config(config: &MatchdayConfig) -> Self {
        Self {
            max_concurrent: config.streaming.max_concurrent_streams.max(1),
            logging_enabled: config.ffmpeg.logging_enabled,
            log_timestamp_format: config.ffmpeg.log_timestamp_format.clone(),
        }
    }
}

enum Slot {
    /// Admitted; the process is being prepared. Counts as live.
    Starting {
        task_id: u64,
        _permit: OwnedSemaphorePermit,
    },
    Running(RunningTask),
}

impl Slot {
    fn task_id(&self) -> u64 {
        match self {
            Slot::Starting { task_id, .. } => *task_id,
            Slot::Running(task) => task.task_id,
        }
    }
}

struct RunningTask {
    task_id: u64,
    process: Arc<dyn TranscodeProcess>,
    inputs: Vec<TranscodeInput>,
    started_at: DateTime<Utc>,
    _permit: OwnedSemaphorePermit,
}

/// Snapshot of one registered transcode.
#[derive(Debug, Clone)]
pub struct TaskInfo {
    pub output: PathBuf,
    pub pid: Option<u32>,
    pub inputs: Vec<TranscodeInput>,
    pub started_at: Option<DateTime<Utc>>,
}

struct Inner {
    settings: SupervisorSettings,
    builder: CommandBuilder,
    probe: MetadataProbe,
    spawner: Arc<dyn ProcessSpawner>,
    permits: Arc<Semaphore>,
    tasks: Mutex<HashMap<PathBuf, Slot>>,
    next_task_id: AtomicU64,
}

/// Admission control and live registry of transcoder processes, keyed by
/// the canonical absolute path of their output playlist.
///
/// Cloning is cheap and every clone shares the same registry.
#[derive(Clone)]
pub struct TranscodeSupervisor {
    inner: Arc<Inner>,
}

impl fmt::Debug for TranscodeSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TranscodeSupervisor")
            .field("settings", &self.inner.settings)
            .field("builder", &self.inner.builder)
            .field("active", &self.count())
            .finish()
    }
}

impl TranscodeSupervisor {
    pub fn new(
        settings: SupervisorSettings,
        builder: CommandBuilder,
        probe: MetadataProbe,
        spawner: Arc<dyn ProcessSpawner>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(settings.max_concurrent.max(1)));
        Self {
            inner: Arc::new(Inner {
                settings,
                builder,
                probe,
                spawner,
                permits,
                tasks: Mutex::new(HashMap::new()),
                next_task_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn from_config(config: &MatchdayConfig) -> Self {
        Self::new(
            SupervisorSettings::from_config(config),
            CommandBuilder::from_config(&config.ffmpeg),
            MetadataProbe::from_config(&config.ffmpeg),
            Arc::new(SystemProcessSpawner),
        )
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.inner.settings
    }

    /// Admits and starts a transcode for `request.output`.
    ///
    /// Returns once the process is running; completion and runtime failures
    /// are reported to the request's listener. Fails with `AlreadyStreaming`
    /// while another live task owns the same output path.
    pub async fn submit(&self, request: TranscodeRequest) -> TranscodeResult<u64> {
        let output = canonical_output(&request.output)?;
        if request.inputs.is_empty() {
            return Err(TranscodeError::NoInputs(output));
        }
        let task_id = self.inner.next_task_id.fetch_add(1, Ordering::Relaxed);
        self.admit(&output, task_id)?;

        match self.start(task_id, &output, request).await {
            Ok(()) => Ok(task_id),
            Err(err) => {
                self.release(&output, task_id);
                warn!(path = %output.display(), error = %err, "failed to start transcode");
                Err(err)
            }
        }
    }

    fn admit(&self, output: &Path, task_id: u64) -> TranscodeResult<()> {
        let mut tasks = self.lock_tasks();
        let zombie = match tasks.get(output) {
            None => false,
            Some(Slot::Starting { .. }) => {
                return Err(TranscodeError::AlreadyStreaming(output.to_path_buf()))
            }
            Some(Slot::Running(task)) if task.process.is_alive() => {
                return Err(TranscodeError::AlreadyStreaming(output.to_path_buf()))
            }
            Some(Slot::Running(_)) => true,
        };
        if zombie {
            if let Some(Slot::Running(task)) = tasks.remove(output) {
                warn!(
                    path = %output.display(),
                    pid = ?task.process.pid(),
                    task_id = task.task_id,
                    "purging zombie transcode task"
                );
                task.process.kill();
            }
        }

        let permit = self
            .inner
            .permits
            .clone()
            .try_acquire_owned()
            .map_err(|_| TranscodeError::PoolExhausted {
                limit: self.inner.settings.max_concurrent,
            })?;
        tasks.insert(
            output.to_path_buf(),
            Slot::Starting {
                task_id,
                _permit: permit,
            },
        );
        Ok(())
    }

    async fn start(
        &self,
        task_id: u64,
        output: &Path,
        request: TranscodeRequest,
    ) -> TranscodeResult<()> {
        let inputs: Vec<TranscodeInput> = concat_order(&request.inputs)
            .into_iter()
            .cloned()
            .collect();
        let ordered: Vec<&TranscodeInput> = inputs.iter().collect();
        let command = self.inner.builder.build(&ordered, output)?;

        async_fs::create_dir_all(&command.working_dir)
            .await
            .map_err(|source| TranscodeError::Io {
                source,
                path: command.working_dir.clone(),
            })?;
        if let Some((path, contents)) = &command.concat_list {
            async_fs::write(path, contents)
                .await
                .map_err(|source| TranscodeError::Io {
                    source,
                    path: path.clone(),
                })?;
        }
        let log = self.open_log(&command.working_dir, request.log_file).await;

        let process = self
            .inner
            .spawner
            .spawn(&command)
            .map_err(|source| TranscodeError::Spawn {
                program: command.program.display().to_string(),
                source,
            })?;

        let interrupted = self.promote(task_id, output, &process, &inputs);
        if interrupted {
            info!(path = %output.display(), task_id, "transcode interrupted during startup");
            process.kill();
        } else {
            info!(
                path = %output.display(),
                pid = ?process.pid(),
                task_id,
                inputs = inputs.len(),
                "transcode started"
            );
        }

        let listener = request.listener;
        listener.on_start(process.pid());
        let output_lines = process.take_output();
        let parser = match request.expected_duration_s {
            Some(seconds) => ProgressParser::new().with_expected_duration(seconds),
            None => ProgressParser::new(),
        };
        let supervisor = self.clone();
        let output = output.to_path_buf();
        tokio::spawn(async move {
            supervisor
                .watch(task_id, output, process, listener, output_lines, log, parser)
                .await;
        });
        Ok(())
    }

    /// Moves the slot from `Starting` to `Running`. Returns `true` when the
    /// slot was interrupted in the meantime.
    fn promote(
        &self,
        task_id: u64,
        output: &Path,
        process: &Arc<dyn TranscodeProcess>,
        inputs: &[TranscodeInput],
    ) -> bool {
        let mut tasks = self.lock_tasks();
        match tasks.remove(output) {
            Some(Slot::Starting {
                task_id: current,
                _permit: permit,
            }) if current == task_id => {
                tasks.insert(
                    output.to_path_buf(),
                    Slot::Running(RunningTask {
                        task_id,
                        process: process.clone(),
                        inputs: inputs.to_vec(),
                        started_at: Utc::now(),
                        _permit: permit,
                    }),
                );
                false
            }
            Some(other) => {
                tasks.insert(output.to_path_buf(), other);
                true
            }
            None => true,
        }
    }

    async fn open_log(&self, stream_dir: &Path, requested: Option<PathBuf>) -> Option<File> {
        let path = match requested {
            Some(path) => path,
            None if self.inner.settings.logging_enabled => stream_dir.join(format!(
                "ffmpeg-{}.log",
                Utc::now().format(&self.inner.settings.log_timestamp_format)
            )),
            None => return None,
        };
        match File::create(&path).await {
            Ok(file) => Some(file),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "could not open transcode log");
                None
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn watch(
        self,
        task_id: u64,
        output: PathBuf,
        process: Arc<dyn TranscodeProcess>,
        listener: Arc<dyn TranscodeListener>,
        lines: Option<mpsc::UnboundedReceiver<String>>,
        mut log: Option<File>,
        mut parser: ProgressParser,
    ) {
        if let Some(mut lines) = lines {
            while let Some(line) = lines.recv().await {
                let failed = match log.as_mut() {
                    Some(file) => {
                        let mut entry = line.clone().into_bytes();
                        entry.push(b'\n');
                        file.write_all(&entry).await.is_err()
                    }
                    None => false,
                };
                if failed {
                    warn!(path = %output.display(), "transcode log write failed; logging disabled");
                    log = None;
                }
                let update = parser.update(line);
                listener.on_progress(&update);
            }
        }
        if let Some(file) = log.as_mut() {
            let _ = file.flush().await;
        }

        let exit = process.wait_for_exit().await;
        if !exit.success() {
            listener.on_error(&failure_message(exit));
        }
        listener.on_complete(exit);
        self.release(&output, task_id);
        info!(
            path = %output.display(),
            task_id,
            code = ?exit.code,
            killed = exit.killed,
            "transcode finished"
        );
    }

    /// Removes the slot for `output` if it still belongs to `task_id`.
    fn release(&self, output: &Path, task_id: u64) {
        let mut tasks = self.lock_tasks();
        if tasks.get(output).map(Slot::task_id) == Some(task_id) {
            tasks.remove(output);
            debug!(path = %output.display(), task_id, "released transcode slot");
        }
    }

    /// Kills and deregisters the task writing to `output`. Returns whether a
    /// task was registered there.
    pub fn interrupt(&self, output: impl AsRef<Path>) -> bool {
        let Ok(output) = canonical_output(output.as_ref()) else {
            return false;
        };
        let removed = self.lock_tasks().remove(&output);
        match removed {
            Some(slot) => {
                if let Slot::Running(task) = &slot {
                    task.process.kill();
                }
                info!(path = %output.display(), task_id = slot.task_id(), "interrupted transcode");
                true
            }
            None => false,
        }
    }

    /// Kills every registered task and empties the registry, whether or not
    /// the processes are still running. Returns how many were registered.
    pub fn interrupt_all(&self) -> usize {
        let drained: Vec<(PathBuf, Slot)> = self.lock_tasks().drain().collect();
        for (path, slot) in &drained {
            if let Slot::Running(task) = slot {
                debug!(path = %path.display(), pid = ?task.process.pid(), "killing transcode");
                task.process.kill();
            }
        }
        if !drained.is_empty() {
            info!(count = drained.len(), "interrupted all transcodes");
        }
        drained.len()
    }

    pub fn count(&self) -> usize {
        self.lock_tasks().len()
    }

    pub fn is_streaming(&self, output: impl AsRef<Path>) -> bool {
        canonical_output(output.as_ref())
            .map(|path| self.lock_tasks().contains_key(&path))
            .unwrap_or(false)
    }

    pub fn tasks(&self) -> Vec<TaskInfo> {
        self.lock_tasks()
            .iter()
            .map(|(path, slot)| match slot {
                Slot::Starting { .. } => TaskInfo {
                    output: path.clone(),
                    pid: None,
                    inputs: Vec::new(),
                    started_at: None,
                },
                Slot::Running(task) => TaskInfo {
                    output: path.clone(),
                    pid: task.process.pid(),
                    inputs: task.inputs.clone(),
                    started_at: Some(task.started_at),
                },
            })
            .collect()
    }

    /// Probes `uri` without registering anything.
    pub async fn read_metadata(&self, uri: &str) -> TranscodeResult<MediaMetadata> {
        self.inner.probe.read_metadata(uri).await
    }

    fn lock_tasks(&self) -> MutexGuard<'_, HashMap<PathBuf, Slot>> {
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn failure_message(exit: ProcessExit) -> String {
    if exit.killed {
        "interrupted".to_string()
    } else {
        match exit.code {
            Some(code) => format!("transcoder exited with status {code}"),
            None => "transcoder terminated abnormally".to_string(),
        }
    }
}

/// Absolute, lexically normalised form of `path`. The file need not exist.
pub(crate) fn canonical_output(path: &Path) -> TranscodeResult<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|source| TranscodeError::Io {
                source,
                path: path.to_path_buf(),
            })?
            .join(path)
    };

    let mut normalised = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalised.pop();
            }
            other => normalised.push(other.as_os_str()),
        }
    }
    if normalised.file_name().is_none() {
        return Err(TranscodeError::InvalidOutput(path.to_path_buf()));
    }
    Ok(normalised)
}
