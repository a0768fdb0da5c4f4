use std::path::{Path, PathBuf};

use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MatchdayConfig {
    pub paths: PathsSection,
    pub ffmpeg: FfmpegSection,
    pub streaming: StreamingSection,
    pub fileservers: FileServersSection,
    #[serde(skip)]
    base_dir: Option<PathBuf>,
}

impl MatchdayConfig {
    /// Resolves `candidate` against the directory the config was loaded from.
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            return path.to_path_buf();
        }
        match &self.base_dir {
            Some(base) => base.join(path),
            None => path.to_path_buf(),
        }
    }

    pub fn storage_root(&self) -> PathBuf {
        self.resolve_path(&self.paths.storage_root)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.logs_dir)
    }

    pub fn locator_db(&self) -> PathBuf {
        self.resolve_path(&self.paths.locator_db)
    }

    pub fn with_base_dir(mut self, base: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(base.into());
        self
    }

    fn validate(&self) -> Result<()> {
        if self.streaming.max_concurrent_streams == 0 {
            return Err(ConfigError::Invalid {
                field: "streaming.max_concurrent_streams",
                reason: "must be at least 1".into(),
            });
        }
        if self.streaming.playlist_name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "streaming.playlist_name",
                reason: "must not be empty".into(),
            });
        }
        for pattern in &self.fileservers.passthrough_hosts {
            Regex::new(pattern).map_err(|err| ConfigError::Invalid {
                field: "fileservers.passthrough_hosts",
                reason: err.to_string(),
            })?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub storage_root: String,
    pub logs_dir: String,
    pub locator_db: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FfmpegSection {
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    pub base_args: Vec<String>,
    pub transcode_args: Vec<String>,
    pub probe_args: Vec<String>,
    pub logging_enabled: bool,
    pub log_timestamp_format: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamingSection {
    pub max_concurrent_streams: usize,
    pub playlist_name: String,
    pub locator_retention_hours: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileServersSection {
    pub default_refresh_minutes: u64,
    pub passthrough_hosts: Vec<String>,
    #[serde(default)]
    pub disabled_plugins: Vec<String>,
}

pub fn load_matchday_config<P: AsRef<Path>>(path: P) -> Result<MatchdayConfig> {
    let path = path.as_ref();
    let config: MatchdayConfig = load_toml(path)?;
    config.validate()?;
    let base_dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    Ok(config.with_base_dir(base_dir))
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
