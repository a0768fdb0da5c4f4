use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use matchday_core::stream::{LocatorFilter, LocatorStore, StreamManager};
use matchday_core::transcode::MetadataProbe;
use matchday_core::{
    load_matchday_config, FileServerRegistry, MatchdayConfig, MediaMetadata, SqliteLocatorStore,
    StreamState, VideoFileSource, VideoStreamLocator,
};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] matchday_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("locator error: {0}")]
    Locator(#[from] matchday_core::LocatorError),
    #[error("stream error: {0}")]
    Stream(#[from] matchday_core::StreamError),
    #[error("transcode error: {0}")]
    Transcode(#[from] matchday_core::TranscodeError),
    #[error("required resource missing: {0}")]
    MissingResource(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("stream {id} failed: {reason}")]
    StreamFailed { id: i64, reason: String },
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Matchday stream orchestration control interface", long_about = None)]
pub struct Cli {
    /// Path to matchday.toml
    #[arg(long, default_value = "configs/matchday.toml")]
    pub config: PathBuf,
    /// Overrides paths.locator_db
    #[arg(long)]
    pub locator_db: Option<PathBuf>,
    /// Overrides paths.storage_root
    #[arg(long)]
    pub storage_root: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Configuration summary and locator counts
    Status,
    /// Stream locator housekeeping
    #[command(subcommand)]
    Locator(LocatorCommands),
    /// Reads container metadata with ffprobe
    Probe(ProbeArgs),
    /// Streams a video file source and waits for the playlist
    Stream(StreamArgs),
    /// Deletes locators idle past the retention window
    Sweep,
    /// Checks binaries, storage and the locator database
    Health,
    /// Prints shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand, Debug)]
pub enum LocatorCommands {
    /// Lists registered locators
    List(LocatorListArgs),
    /// Shows one locator
    Show { id: i64 },
    /// Deletes a locator and its stream directory
    Delete { id: i64 },
}

#[derive(Args, Debug)]
pub struct LocatorListArgs {
    /// Only locators of this source
    #[arg(long)]
    pub source: Option<Uuid>,
    /// Only locators in this state (created, streaming, ready, failed)
    #[arg(long)]
    pub state: Option<String>,
}

#[derive(Args, Debug)]
pub struct ProbeArgs {
    pub uri: String,
}

#[derive(Args, Debug)]
pub struct StreamArgs {
    /// JSON file holding a serialized video file source; refreshed links
    /// are written back to it
    pub source: PathBuf,
    /// Stream a single file instead of the whole primary pack
    #[arg(long)]
    pub file: Option<Uuid>,
    /// Seconds to wait for the stream to settle
    #[arg(long, default_value_t = 3600)]
    pub timeout: u64,
}

/// Installs the global subscriber. `RUST_LOG` overrides the default `info`.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

pub fn run(cli: Cli) -> Result<()> {
    if let Commands::Completions { shell } = &cli.command {
        let mut command = Cli::command();
        let bin_name = command.get_name().to_string();
        clap_complete::generate(*shell, &mut command, bin_name, &mut std::io::stdout());
        return Ok(());
    }

    let context = AppContext::new(&cli)?;
    match &cli.command {
        Commands::Status => {
            let status = context.gather_status()?;
            render(&status, cli.format)?;
        }
        Commands::Locator(LocatorCommands::List(args)) => {
            let list = context.locator_list(args)?;
            render(&list, cli.format)?;
        }
        Commands::Locator(LocatorCommands::Show { id }) => {
            let locator = context.locator_show(*id)?;
            render(&LocatorDetail(locator), cli.format)?;
        }
        Commands::Locator(LocatorCommands::Delete { id }) => {
            let result = block_on(context.locator_delete(*id))??;
            render(&result, cli.format)?;
        }
        Commands::Probe(args) => {
            let metadata = block_on(context.probe(&args.uri))??;
            render(&ProbeReport(metadata), cli.format)?;
        }
        Commands::Stream(args) => {
            let locator = block_on(context.stream(args))??;
            render(&LocatorDetail(locator), cli.format)?;
        }
        Commands::Sweep => {
            let result = block_on(context.sweep())??;
            render(&result, cli.format)?;
        }
        Commands::Health => {
            let report = context.health_check();
            render(&report, cli.format)?;
            if report
                .iter()
                .any(|entry| matches!(entry.status, CheckStatus::Error))
            {
                return Err(AppError::MissingResource(
                    "one or more checks failed".to_string(),
                ));
            }
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}

fn block_on<F: Future>(future: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    Ok(runtime.block_on(future))
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    config: MatchdayConfig,
    config_path: PathBuf,
    locator_db: PathBuf,
    storage_root: PathBuf,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let config_path = cli.config.clone();
        let config = load_matchday_config(&config_path)?;
        let locator_db = cli
            .locator_db
            .clone()
            .unwrap_or_else(|| config.locator_db());
        let storage_root = cli
            .storage_root
            .clone()
            .unwrap_or_else(|| config.storage_root());
        Ok(Self {
            config,
            config_path,
            locator_db,
            storage_root,
        })
    }

    /// Opens the locator database, creating it and its schema on first use.
    fn store(&self) -> Result<SqliteLocatorStore> {
        if let Some(parent) = self.locator_db.parent() {
            fs::create_dir_all(parent)?;
        }
        let store = SqliteLocatorStore::new(&self.locator_db)?;
        store.initialize()?;
        Ok(store)
    }

    fn manager(&self) -> Result<StreamManager> {
        let registry = FileServerRegistry::from_config(&self.config.fileservers)?;
        let mut config = self.config.clone();
        config.paths.storage_root = self.storage_root.display().to_string();
        Ok(StreamManager::from_config(
            &config,
            Arc::new(registry),
            Arc::new(self.store()?),
        ))
    }

    fn gather_status(&self) -> Result<StatusReport> {
        let locator_counts = if self.locator_db.exists() {
            self.store()?
                .counts()?
                .into_iter()
                .map(|(state, count)| (state.to_string(), count))
                .collect()
        } else {
            BTreeMap::new()
        };
        Ok(StatusReport {
            config: self.config_path.clone(),
            storage_root: self.storage_root.clone(),
            locator_db: self.locator_db.clone(),
            ffmpeg: self.config.ffmpeg.ffmpeg_path.clone(),
            max_concurrent_streams: self.config.streaming.max_concurrent_streams,
            playlist_name: self.config.streaming.playlist_name.clone(),
            locator_counts,
        })
    }

    fn locator_list(&self, args: &LocatorListArgs) -> Result<LocatorList> {
        let state = args
            .state
            .as_deref()
            .map(str::parse::<StreamState>)
            .transpose()?;
        let rows = self.store()?.list(&LocatorFilter {
            source_id: args.source,
            state,
        })?;
        Ok(LocatorList { rows })
    }

    fn locator_show(&self, id: i64) -> Result<VideoStreamLocator> {
        self.store()?
            .get(id)?
            .ok_or_else(|| AppError::MissingResource(format!("stream locator {id}")))
    }

    async fn locator_delete(&self, id: i64) -> Result<ActionResult> {
        self.manager()?.delete_stream_locator(id).await?;
        Ok(ActionResult {
            status: "ok".to_string(),
            detail: format!("deleted stream locator {id}"),
        })
    }

    async fn probe(&self, uri: &str) -> Result<MediaMetadata> {
        let probe = MetadataProbe::from_config(&self.config.ffmpeg);
        Ok(probe.read_metadata(uri).await?)
    }

    async fn stream(&self, args: &StreamArgs) -> Result<VideoStreamLocator> {
        let raw = fs::read_to_string(&args.source)?;
        let mut source: VideoFileSource = serde_json::from_str(&raw)?;
        let manager = self.manager()?;

        let started = match args.file {
            Some(file_id) => manager.begin_streaming(&mut source, file_id).await,
            None => manager.begin_source_streaming(&mut source).await,
        };
        fs::write(&args.source, serde_json::to_string_pretty(&source)?)?;
        let locator = started?;
        info!(locator_id = locator.id, path = %locator.playlist_path.display(), "waiting for stream");

        let settled = manager
            .wait_until_settled(
                locator.id,
                StdDuration::from_millis(500),
                StdDuration::from_secs(args.timeout),
            )
            .await?;
        if settled.state == StreamState::Failed {
            return Err(AppError::StreamFailed {
                id: settled.id,
                reason: settled.error.unwrap_or_else(|| "unknown".to_string()),
            });
        }
        Ok(settled)
    }

    async fn sweep(&self) -> Result<ActionResult> {
        let hours = i64::try_from(self.config.streaming.locator_retention_hours)
            .map_err(|_| AppError::InvalidArgument("locator_retention_hours".to_string()))?;
        let deleted = self
            .manager()?
            .delete_expired_locators(chrono::Duration::hours(hours))
            .await?;
        Ok(ActionResult {
            status: "ok".to_string(),
            detail: format!("deleted {deleted} expired locators"),
        })
    }

    fn health_check(&self) -> Vec<HealthEntry> {
        vec![
            self.check_path("matchday.toml", &self.config_path),
            self.check_binary("ffmpeg", &self.config.ffmpeg.ffmpeg_path),
            self.check_binary("ffprobe", &self.config.ffmpeg.ffprobe_path),
            self.check_directory("storage_root", &self.storage_root),
            self.check_directory("logs_dir", &self.config.logs_dir()),
            self.check_database("locators.sqlite", &self.locator_db),
        ]
    }

    fn check_path(&self, name: &str, path: &Path) -> HealthEntry {
        if path.exists() {
            HealthEntry::ok(name, format!("{}", path.display()))
        } else {
            HealthEntry::error(name, format!("{path} missing", path = path.display()))
        }
    }

    fn check_binary(&self, name: &str, program: &str) -> HealthEntry {
        let status = Command::new(program)
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match status {
            Ok(status) if status.success() => HealthEntry::ok(name, program.to_string()),
            Ok(status) => HealthEntry::error(name, format!("{program} -version exited with {status}")),
            Err(err) => HealthEntry::error(name, format!("{program} unavailable: {err}")),
        }
    }

    fn check_directory(&self, name: &str, path: &Path) -> HealthEntry {
        match fs::metadata(path) {
            Ok(meta) if meta.is_dir() => HealthEntry::ok(name, format!("{}", path.display())),
            Ok(_) => HealthEntry::warn(
                name,
                format!("{path} is not a directory", path = path.display()),
            ),
            Err(_) => HealthEntry::warn(name, format!("{path} not found", path = path.display())),
        }
    }

    fn check_database(&self, name: &str, path: &Path) -> HealthEntry {
        if !path.exists() {
            return HealthEntry::warn(name, format!("{path} not found", path = path.display()));
        }
        match Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY) {
            Ok(conn) => {
                let pragma: rusqlite::Result<String> =
                    conn.query_row("PRAGMA integrity_check;", [], |row| row.get(0));
                match pragma {
                    Ok(result) if result.to_lowercase() == "ok" => {
                        HealthEntry::ok(name, "integrity ok".to_string())
                    }
                    Ok(result) => HealthEntry::warn(name, format!("integrity_check: {result}")),
                    Err(err) => HealthEntry::warn(name, format!("error: {err}")),
                }
            }
            Err(err) => HealthEntry::error(name, format!("failed to open: {err}")),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub config: PathBuf,
    pub storage_root: PathBuf,
    pub locator_db: PathBuf,
    pub ffmpeg: String,
    pub max_concurrent_streams: usize,
    pub playlist_name: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub locator_counts: BTreeMap<String, usize>,
}

impl DisplayFallback for StatusReport {
    fn display(&self) -> String {
        let mut lines = vec![
            format!("Config: {}", self.config.display()),
            format!("Storage: {}", self.storage_root.display()),
            format!("Locators: {}", self.locator_db.display()),
            format!(
                "Transcoder: {} (max {} streams, playlist {})",
                self.ffmpeg, self.max_concurrent_streams, self.playlist_name
            ),
        ];
        if self.locator_counts.is_empty() {
            lines.push("No stream locators".to_string());
        } else {
            lines.push("Stream locators:".to_string());
            for (state, count) in &self.locator_counts {
                lines.push(format!("  - {state}: {count}"));
            }
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct LocatorList {
    pub rows: Vec<VideoStreamLocator>,
}

impl DisplayFallback for LocatorList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "No stream locators".to_string();
        }
        self.rows.iter().map(locator_line).collect::<Vec<_>>().join("\n")
    }
}

fn locator_line(locator: &VideoStreamLocator) -> String {
    format!(
        "#{id} {state} {ratio:.0}% source={source} {path}",
        id = locator.id,
        state = locator.state,
        ratio = locator.completion_ratio * 100.0,
        source = locator.source_id,
        path = locator.playlist_path.display(),
    )
}

#[derive(Debug, Serialize)]
#[serde(transparent)]
pub struct LocatorDetail(pub VideoStreamLocator);

impl DisplayFallback for LocatorDetail {
    fn display(&self) -> String {
        let locator = &self.0;
        let mut lines = vec![locator_line(locator)];
        if let Some(file_id) = locator.video_file_id {
            lines.push(format!("  file: {file_id}"));
        }
        if let Some(error) = &locator.error {
            lines.push(format!("  error: {error}"));
        }
        lines.push(format!("  run: {}", locator.run));
        lines.push(format!("  updated: {}", locator.updated_at.to_rfc3339()));
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
#[serde(transparent)]
pub struct ProbeReport(pub MediaMetadata);

impl DisplayFallback for ProbeReport {
    fn display(&self) -> String {
        let meta = &self.0;
        let duration = meta
            .duration_s
            .map(|v| format!("{v:.2}s"))
            .unwrap_or_else(|| "-".to_string());
        let bit_rate = meta
            .bit_rate
            .map(|v| format!("{v} b/s"))
            .unwrap_or_else(|| "-".to_string());
        format!(
            "format={} duration={} bit_rate={} streams={}",
            meta.format_name.as_deref().unwrap_or("-"),
            duration,
            bit_rate,
            meta.stream_count
        )
    }
}

#[derive(Debug, Serialize)]
pub struct ActionResult {
    pub status: String,
    pub detail: String,
}

impl DisplayFallback for ActionResult {
    fn display(&self) -> String {
        self.detail.clone()
    }
}

impl DisplayFallback for Vec<HealthEntry> {
    fn display(&self) -> String {
        self.iter()
            .map(HealthEntry::display)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct HealthEntry {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Debug, Serialize)]
pub enum CheckStatus {
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "error")]
    Error,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CheckStatus::Ok => "OK",
            CheckStatus::Warn => "WARN",
            CheckStatus::Error => "ERROR",
        };
        write!(f, "{}", label)
    }
}

impl HealthEntry {
    fn ok(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Ok,
            detail: detail.into(),
        }
    }

    fn warn(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Warn,
            detail: detail.into(),
        }
    }

    fn error(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Error,
            detail: detail.into(),
        }
    }
}

impl DisplayFallback for HealthEntry {
    fn display(&self) -> String {
        format!(
            "[{status}] {name}: {detail}",
            status = self.status,
            name = self.name,
            detail = self.detail
        )
    }
}
