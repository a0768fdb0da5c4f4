mod command;
mod probe;
mod process;
mod progress;
mod supervisor;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::video::{PartIdentifier, PartOrdered, VideoFile};

pub use command::{CommandBuilder, TranscodeCommand, CONCAT_LIST_NAME};
pub use probe::{CommandExecutor, MetadataProbe, SystemCommandExecutor};
pub use process::{ProcessExit, ProcessSpawner, SystemProcessSpawner, TranscodeProcess};
pub use progress::{ProgressParser, ProgressUpdate};
pub use supervisor::{SupervisorSettings, TaskInfo, TranscodeSupervisor};

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("already streaming to {0}")]
    AlreadyStreaming(PathBuf),
    #[error("all {limit} stream slots are busy")]
    PoolExhausted { limit: usize },
    #[error("no inputs to transcode into {0}")]
    NoInputs(PathBuf),
    #[error("invalid output path {0}")]
    InvalidOutput(PathBuf),
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("io error at {path}: {source}")]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("could not read metadata for {uri}: {reason}")]
    MetadataProbeFailure { uri: String, reason: String },
}

pub type TranscodeResult<T> = Result<T, TranscodeError>;

/// One input of a transcode, tagged with the part it plays.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscodeInput {
    pub file_id: Uuid,
    pub part: PartIdentifier,
    pub created_at: DateTime<Utc>,
    pub uri: String,
}

impl TranscodeInput {
    /// `None` when the file has no usable URL yet.
    pub fn from_file(file: &VideoFile) -> Option<Self> {
        file.stream_url().map(|url| Self {
            file_id: file.id,
            part: file.part,
            created_at: file.created_at,
            uri: url.to_string(),
        })
    }
}

impl PartOrdered for TranscodeInput {
    fn part(&self) -> PartIdentifier {
        self.part
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn ordering_id(&self) -> Uuid {
        self.file_id
    }
}

/// Callbacks for one running transcode. All of them run on the task that
/// watches the process, never on the caller of `submit`.
pub trait TranscodeListener: Send + Sync {
    fn on_start(&self, _pid: Option<u32>) {}

    fn on_progress(&self, _update: &ProgressUpdate) {}

    fn on_error(&self, _message: &str) {}

    fn on_complete(&self, _exit: ProcessExit) {}
}

#[derive(Debug, Default)]
pub struct NoopListener;

impl TranscodeListener for NoopListener {}

pub struct TranscodeRequest {
    pub inputs: Vec<TranscodeInput>,
    pub output: PathBuf,
    pub log_file: Option<PathBuf>,
    /// Total playing time when known up front; otherwise progress waits for
    /// the transcoder's own `Duration:` header.
    pub expected_duration_s: Option<f64>,
    pub listener: Arc<dyn TranscodeListener>,
}

impl TranscodeRequest {
    pub fn new(inputs: Vec<TranscodeInput>, output: impl Into<PathBuf>) -> Self {
        Self {
            inputs,
            output: output.into(),
            log_file: None,
            expected_duration_s: None,
            listener: Arc::new(NoopListener),
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn TranscodeListener>) -> Self {
        self.listener = listener;
        self
    }

    pub fn with_log_file(mut self, log_file: impl Into<PathBuf>) -> Self {
        self.log_file = Some(log_file.into());
        self
    }

    pub fn with_expected_duration(mut self, seconds: f64) -> Self {
        self.expected_duration_s = Some(seconds);
        self
    }
}

impl fmt::Debug for TranscodeRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TranscodeRequest")
            .field("inputs", &self.inputs)
            .field("output", &self.output)
            .field("log_file", &self.log_file)
            .field("expected_duration_s", &self.expected_duration_s)
            .finish()
    }
}
