use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::de::IgnoredAny;
use serde::Deserialize;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::config::FfmpegSection;
use crate::video::MediaMetadata;

use super::{TranscodeError, TranscodeResult};

const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait::async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, command: &mut Command) -> std::io::Result<std::process::Output>;
}

#[derive(Debug, Default)]
pub struct SystemCommandExecutor;

#[async_trait::async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn run(&self, command: &mut Command) -> std::io::Result<std::process::Output> {
        command.kill_on_drop(true).output().await
    }
}

/// Reads media metadata with ffprobe without touching any running stream.
#[derive(Clone)]
pub struct MetadataProbe {
    ffprobe: PathBuf,
    args: Vec<String>,
    executor: Arc<dyn CommandExecutor>,
    timeout: Duration,
}

impl fmt::Debug for MetadataProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetadataProbe")
            .field("ffprobe", &self.ffprobe)
            .field("args", &self.args)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl MetadataProbe {
    pub fn new(ffprobe: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            ffprobe: ffprobe.into(),
            args,
            executor: Arc::new(SystemCommandExecutor),
            timeout: PROBE_TIMEOUT,
        }
    }

    pub fn from_config(section: &FfmpegSection) -> Self {
        Self::new(&section.ffprobe_path, section.probe_args.clone())
    }

    pub fn with_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn read_metadata(&self, uri: &str) -> TranscodeResult<MediaMetadata> {
        let failure = |reason: String| TranscodeError::MetadataProbeFailure {
            uri: uri.to_string(),
            reason,
        };

        let mut command = Command::new(&self.ffprobe);
        command.args(&self.args).arg(uri);
        let output = match timeout(self.timeout, self.executor.run(&mut command)).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => return Err(failure(err.to_string())),
            Err(_) => return Err(failure(format!("timed out after {:?}", self.timeout))),
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(failure(format!(
                "ffprobe exited with {:?}: {}",
                output.status.code(),
                stderr.trim()
            )));
        }

        let parsed: FfprobeOutput =
            serde_json::from_slice(&output.stdout).map_err(|err| failure(err.to_string()))?;
        let metadata = parsed.into_metadata();
        debug!(uri, duration_s = ?metadata.duration_s, streams = metadata.stream_count, "probed media");
        Ok(metadata)
    }
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<IgnoredAny>,
    #[serde(default)]
    format: FfprobeFormat,
}

#[derive(Debug, Deserialize, Default)]
struct FfprobeFormat {
    #[serde(default)]
    duration: Option<String>,
    #[serde(default)]
    format_name: Option<String>,
    #[serde(default)]
    bit_rate: Option<String>,
}

impl FfprobeOutput {
    fn into_metadata(self) -> MediaMetadata {
        MediaMetadata {
            duration_s: self
                .format
                .duration
                .as_deref()
                .and_then(|value| value.parse::<f64>().ok()),
            format_name: self.format.format_name,
            bit_rate: self
                .format
                .bit_rate
                .as_deref()
                .and_then(|value| value.parse::<u64>().ok()),
            stream_count: self.streams.len(),
        }
    }
}
