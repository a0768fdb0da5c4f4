use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use futures::future::join_all;
use thiserror::Error;
use tokio::fs as async_fs;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::MatchdayConfig;
use crate::fileserver::FileServerRegistry;
use crate::freshness::{FreshnessCoordinator, FreshnessError};
use crate::transcode::{
    ProcessExit, ProgressUpdate, TranscodeError, TranscodeInput, TranscodeListener,
    TranscodeRequest, TranscodeSupervisor,
};
use crate::video::{MediaMetadata, VideoFile, VideoFileSource};

use super::locator::{LocatorError, LocatorFilter, NewLocator, StreamState, VideoStreamLocator};
use super::store::LocatorStore;

/// Directory under a source holding the concatenated stream of its pack.
pub const FULL_STREAM_DIR: &str = "full";
const PROGRESS_STEP: f64 = 0.01;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error(transparent)]
    Locator(#[from] LocatorError),
    #[error(transparent)]
    Transcode(#[from] TranscodeError),
    #[error(transparent)]
    Freshness(#[from] FreshnessError),
    #[error("video file {file_id} not found in source {source_id}")]
    FileNotFound { source_id: Uuid, file_id: Uuid },
    #[error("source {0} has no resolved files to stream")]
    NothingToStream(Uuid),
    #[error("locator {locator_id} belongs to source {expected}, not {actual}")]
    SourceMismatch {
        locator_id: i64,
        expected: Uuid,
        actual: Uuid,
    },
    #[error("playlist for locator {0} is not ready")]
    NotReady(i64),
    #[error("timed out waiting for locator {0}")]
    Timeout(i64),
    #[error("io error at {path}: {source}")]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },
}

pub type StreamResult<T> = Result<T, StreamError>;

/// Entry point for stream requests: refreshes links, registers locators and
/// hands admitted work to the supervisor.
#[derive(Clone)]
pub struct StreamManager {
    supervisor: TranscodeSupervisor,
    freshness: FreshnessCoordinator,
    store: Arc<dyn LocatorStore>,
    storage_root: PathBuf,
    playlist_name: String,
}

impl fmt::Debug for StreamManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamManager")
            .field("supervisor", &self.supervisor)
            .field("storage_root", &self.storage_root)
            .field("playlist_name", &self.playlist_name)
            .finish()
    }
}

impl StreamManager {
    pub fn new(
        supervisor: TranscodeSupervisor,
        freshness: FreshnessCoordinator,
        store: Arc<dyn LocatorStore>,
        storage_root: impl Into<PathBuf>,
        playlist_name: impl Into<String>,
    ) -> Self {
        Self {
            supervisor,
            freshness,
            store,
            storage_root: storage_root.into(),
            playlist_name: playlist_name.into(),
        }
    }

    pub fn from_config(
        config: &MatchdayConfig,
        registry: Arc<FileServerRegistry>,
        store: Arc<dyn LocatorStore>,
    ) -> Self {
        Self::new(
            TranscodeSupervisor::from_config(config),
            FreshnessCoordinator::new(registry),
            store,
            config.storage_root(),
            config.streaming.playlist_name.clone(),
        )
    }

    pub fn supervisor(&self) -> &TranscodeSupervisor {
        &self.supervisor
    }

    pub fn store(&self) -> &Arc<dyn LocatorStore> {
        &self.store
    }

    /// `<storage_root>/<source_id>/<file_id | full>/<playlist_name>`
    pub fn playlist_path_for(&self, source_id: Uuid, file_id: Option<Uuid>) -> PathBuf {
        let leaf = file_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| FULL_STREAM_DIR.to_string());
        self.storage_root
            .join(source_id.to_string())
            .join(leaf)
            .join(&self.playlist_name)
    }

    /// Registers a locator for `file` without starting a transcode. Repeated
    /// calls for the same target return the registered locator.
    pub fn create_stream_locator(
        &self,
        source_id: Uuid,
        file: &VideoFile,
    ) -> StreamResult<VideoStreamLocator> {
        let new = NewLocator {
            playlist_path: self.playlist_path_for(source_id, Some(file.id)),
            source_id,
            video_file_id: Some(file.id),
        };
        let (locator, created) = self.store.insert_or_get(&new)?;
        if created {
            info!(locator_id = locator.id, path = %locator.playlist_path.display(), "created stream locator");
        }
        Ok(locator)
    }

    /// Streams one file of `source`.
    ///
    /// A request for a target that already has a locator returns that
    /// locator unchanged, including a failed one; use [`Self::restream`] to
    /// retry.
    pub async fn begin_streaming(
        &self,
        source: &mut VideoFileSource,
        file_id: Uuid,
    ) -> StreamResult<VideoStreamLocator> {
        if source.find_file(file_id).is_none() {
            return Err(StreamError::FileNotFound {
                source_id: source.id,
                file_id,
            });
        }
        let playlist_path = self.playlist_path_for(source.id, Some(file_id));
        if let Some(existing) = self.existing_locator(&playlist_path)? {
            return Ok(existing);
        }

        let (inputs, expected) = self.file_inputs(source, file_id).await?;
        let new = NewLocator {
            playlist_path,
            source_id: source.id,
            video_file_id: Some(file_id),
        };
        self.launch(new, inputs, expected).await
    }

    /// Streams the primary pack of `source` as one concatenated playlist.
    pub async fn begin_source_streaming(
        &self,
        source: &mut VideoFileSource,
    ) -> StreamResult<VideoStreamLocator> {
        let playlist_path = self.playlist_path_for(source.id, None);
        if let Some(existing) = self.existing_locator(&playlist_path)? {
            return Ok(existing);
        }

        let (inputs, expected) = self.pack_inputs(source).await?;
        let new = NewLocator {
            playlist_path,
            source_id: source.id,
            video_file_id: None,
        };
        self.launch(new, inputs, expected).await
    }

    /// Explicit retry of a settled locator. Old artifacts are removed first.
    pub async fn restream(
        &self,
        locator_id: i64,
        source: &mut VideoFileSource,
    ) -> StreamResult<VideoStreamLocator> {
        let locator = self.require_locator(locator_id)?;
        if locator.source_id != source.id {
            return Err(StreamError::SourceMismatch {
                locator_id,
                expected: locator.source_id,
                actual: source.id,
            });
        }
        if locator.state == StreamState::Streaming
            && self.supervisor.is_streaming(&locator.playlist_path)
        {
            debug!(locator_id, "restream requested while streaming; keeping live task");
            return Ok(locator);
        }
        if !locator.state.can_transition_to(StreamState::Streaming) {
            return Err(LocatorError::InvalidTransition {
                id: locator_id,
                from: locator.state,
                to: StreamState::Streaming,
            }
            .into());
        }

        let (inputs, expected) = match locator.video_file_id {
            Some(file_id) => self.file_inputs(source, file_id).await?,
            None => self.pack_inputs(source).await?,
        };
        if let Some(dir) = locator.stream_dir() {
            remove_dir_if_present(dir).await?;
        }
        self.start(locator, inputs, expected).await
    }

    /// Reads the playlist once the transcoder has produced a non-empty one.
    pub async fn read_playlist(&self, locator_id: i64) -> StreamResult<String> {
        let locator = self.require_locator(locator_id)?;
        match async_fs::read_to_string(&locator.playlist_path).await {
            Ok(contents) if !contents.is_empty() => Ok(contents),
            Ok(_) => Err(StreamError::NotReady(locator_id)),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(StreamError::NotReady(locator_id)),
            Err(source) => Err(StreamError::Io {
                source,
                path: locator.playlist_path,
            }),
        }
    }

    /// Polls until the locator settles as ready or failed.
    pub async fn wait_until_settled(
        &self,
        locator_id: i64,
        poll: StdDuration,
        timeout: StdDuration,
    ) -> StreamResult<VideoStreamLocator> {
        let deadline = Instant::now() + timeout;
        loop {
            let locator = self.require_locator(locator_id)?;
            if locator.state.is_settled() {
                return Ok(locator);
            }
            if Instant::now() >= deadline {
                return Err(StreamError::Timeout(locator_id));
            }
            sleep(poll).await;
        }
    }

    pub fn get_stream_locator(&self, locator_id: i64) -> StreamResult<Option<VideoStreamLocator>> {
        Ok(self.store.get(locator_id)?)
    }

    pub fn get_all_stream_locators(&self) -> StreamResult<Vec<VideoStreamLocator>> {
        Ok(self.store.list(&LocatorFilter::default())?)
    }

    pub fn stream_locators_for(&self, source_id: Uuid) -> StreamResult<Vec<VideoStreamLocator>> {
        Ok(self.store.list(&LocatorFilter {
            source_id: Some(source_id),
            state: None,
        })?)
    }

    pub fn active_stream_count(&self) -> usize {
        self.supervisor.count()
    }

    /// The locator turns `Failed` once the killed process is reaped.
    pub fn kill_stream(&self, locator_id: i64) -> StreamResult<bool> {
        let locator = self.require_locator(locator_id)?;
        Ok(self.supervisor.interrupt(&locator.playlist_path))
    }

    pub fn kill_all_streams(&self) -> usize {
        self.supervisor.interrupt_all()
    }

    pub fn kill_all_streams_for(&self, source_id: Uuid) -> StreamResult<usize> {
        let killed = self
            .stream_locators_for(source_id)?
            .iter()
            .filter(|locator| self.supervisor.interrupt(&locator.playlist_path))
            .count();
        info!(source_id = %source_id, killed, "killed streams for source");
        Ok(killed)
    }

    /// Kills any live task for the locator, then removes its record and
    /// on-disk artifacts.
    pub async fn delete_stream_locator(&self, locator_id: i64) -> StreamResult<()> {
        let locator = self.require_locator(locator_id)?;
        self.supervisor.interrupt(&locator.playlist_path);
        self.store.delete(locator_id)?;
        if let Some(dir) = locator.stream_dir() {
            remove_dir_if_present(dir).await?;
        }
        info!(locator_id, path = %locator.playlist_path.display(), "deleted stream locator");
        Ok(())
    }

    /// Deletes settled locators idle for longer than `max_age`. Returns how
    /// many were removed.
    pub async fn delete_expired_locators(&self, max_age: Duration) -> StreamResult<usize> {
        let cutoff = Utc::now() - max_age;
        let expired = self.store.expired(cutoff)?;
        let results = join_all(
            expired
                .iter()
                .map(|locator| self.delete_stream_locator(locator.id)),
        )
        .await;

        let mut deleted = 0;
        for (locator, result) in expired.iter().zip(results) {
            match result {
                Ok(()) => deleted += 1,
                Err(err) => warn!(locator_id = locator.id, error = %err, "could not delete expired locator"),
            }
        }
        Ok(deleted)
    }

    pub async fn probe(&self, uri: &str) -> StreamResult<MediaMetadata> {
        Ok(self.supervisor.read_metadata(uri).await?)
    }

    /// Fills in missing metadata for one file. A failed probe leaves the
    /// metadata unset.
    pub async fn fetch_metadata(&self, source: &mut VideoFileSource, file_id: Uuid) -> StreamResult<bool> {
        let source_id = source.id;
        let file = source
            .find_file_mut(file_id)
            .ok_or(StreamError::FileNotFound { source_id, file_id })?;
        if file.metadata.is_some() {
            return Ok(false);
        }
        let Some(url) = file.stream_url().map(|url| url.to_string()) else {
            return Ok(false);
        };
        match self.supervisor.read_metadata(&url).await {
            Ok(metadata) => {
                file.metadata = Some(metadata);
                Ok(true)
            }
            Err(err) => {
                warn!(file_id = %file_id, error = %err, "metadata probe failed");
                Ok(false)
            }
        }
    }

    fn existing_locator(&self, playlist_path: &Path) -> StreamResult<Option<VideoStreamLocator>> {
        let Some(existing) = self.store.find_by_path(playlist_path)? else {
            return Ok(None);
        };
        match existing.state {
            StreamState::Created => Ok(None),
            StreamState::Streaming if !self.supervisor.is_streaming(playlist_path) => {
                warn!(locator_id = existing.id, "locator streaming without a live task");
                let failed = self.store.transition(
                    existing.id,
                    StreamState::Failed,
                    Some("transcode no longer running".to_string()),
                )?;
                Ok(Some(failed))
            }
            _ => Ok(Some(existing)),
        }
    }

    async fn file_inputs(
        &self,
        source: &mut VideoFileSource,
        file_id: Uuid,
    ) -> StreamResult<(Vec<TranscodeInput>, Option<f64>)> {
        self.freshness.ensure_file_fresh(source, file_id).await?;
        let source_id = source.id;
        let file = source
            .find_file(file_id)
            .ok_or(StreamError::FileNotFound { source_id, file_id })?;
        let input = TranscodeInput::from_file(file).ok_or(StreamError::NothingToStream(source_id))?;
        Ok((vec![input], file.duration_s()))
    }

    async fn pack_inputs(
        &self,
        source: &mut VideoFileSource,
    ) -> StreamResult<(Vec<TranscodeInput>, Option<f64>)> {
        match self.freshness.ensure_fresh(source).await {
            Ok(Some(report)) => {
                for file_id in &report.dropped {
                    warn!(source_id = %source.id, file_id = %file_id, "file left out of stream");
                }
            }
            Ok(None) => {}
            // Only the pack being streamed has to resolve.
            Err(FreshnessError::ResolutionFailure { pack, .. })
                if source
                    .primary_pack()
                    .is_some_and(|primary| primary.files().any(|file| file.stream_url().is_some())) =>
            {
                warn!(source_id = %source.id, pack, "unresolvable pack skipped");
            }
            Err(err) => return Err(err.into()),
        }
        let pack = source
            .primary_pack()
            .ok_or(StreamError::NothingToStream(source.id))?;
        let files: Vec<&VideoFile> = pack.files().filter(|file| file.stream_url().is_some()).collect();
        if files.is_empty() {
            return Err(StreamError::NothingToStream(source.id));
        }
        let expected = files
            .iter()
            .map(|file| file.duration_s())
            .sum::<Option<f64>>();
        let inputs = files.into_iter().filter_map(TranscodeInput::from_file).collect();
        Ok((inputs, expected))
    }

    async fn launch(
        &self,
        new: NewLocator,
        inputs: Vec<TranscodeInput>,
        expected: Option<f64>,
    ) -> StreamResult<VideoStreamLocator> {
        let (locator, created) = self.store.insert_or_get(&new)?;
        if created {
            info!(locator_id = locator.id, path = %locator.playlist_path.display(), "created stream locator");
        } else if locator.state != StreamState::Created {
            return Ok(locator);
        }
        self.start(locator, inputs, expected).await
    }

    async fn start(
        &self,
        locator: VideoStreamLocator,
        inputs: Vec<TranscodeInput>,
        expected: Option<f64>,
    ) -> StreamResult<VideoStreamLocator> {
        let locator = match self
            .store
            .transition(locator.id, StreamState::Streaming, None)
        {
            Ok(locator) => locator,
            // A concurrent request started this locator first.
            Err(LocatorError::InvalidTransition {
                from: StreamState::Streaming,
                ..
            }) => return self.require_locator(locator.id),
            Err(err) => return Err(err.into()),
        };
        let listener = Arc::new(LocatorListener::new(
            self.store.clone(),
            locator.id,
            locator.run,
            locator.playlist_path.clone(),
        ));
        let mut request =
            TranscodeRequest::new(inputs, locator.playlist_path.clone()).with_listener(listener);
        if let Some(seconds) = expected {
            request = request.with_expected_duration(seconds);
        }

        match self.supervisor.submit(request).await {
            Ok(task_id) => {
                info!(locator_id = locator.id, task_id, "stream started");
                Ok(locator)
            }
            Err(TranscodeError::AlreadyStreaming(path)) => {
                debug!(locator_id = locator.id, path = %path.display(), "already streaming");
                Ok(self.require_locator(locator.id)?)
            }
            Err(err) => {
                self.store.transition_run(
                    locator.id,
                    Some(locator.run),
                    StreamState::Failed,
                    Some(err.to_string()),
                )?;
                Err(err.into())
            }
        }
    }

    fn require_locator(&self, locator_id: i64) -> StreamResult<VideoStreamLocator> {
        self.store
            .get(locator_id)?
            .ok_or(StreamError::Locator(LocatorError::NotFound(locator_id)))
    }
}

async fn remove_dir_if_present(dir: &Path) -> StreamResult<()> {
    match async_fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(source) => Err(StreamError::Io {
            source,
            path: dir.to_path_buf(),
        }),
    }
}

/// Mirrors transcode callbacks into the locator store.
/// Mirrors one transcode run into its locator. Callbacks from a run the
/// locator has since moved past are dropped.
struct LocatorListener {
    store: Arc<dyn LocatorStore>,
    locator_id: i64,
    run: u32,
    playlist_path: PathBuf,
    last_error: Mutex<Option<String>>,
    last_ratio: Mutex<f64>,
}

impl LocatorListener {
    fn new(store: Arc<dyn LocatorStore>, locator_id: i64, run: u32, playlist_path: PathBuf) -> Self {
        Self {
            store,
            locator_id,
            run,
            playlist_path,
            last_error: Mutex::new(None),
            last_ratio: Mutex::new(0.0),
        }
    }

    fn playlist_written(&self) -> bool {
        std::fs::metadata(&self.playlist_path)
            .map(|meta| meta.is_file() && meta.len() > 0)
            .unwrap_or(false)
    }
}

impl TranscodeListener for LocatorListener {
    fn on_progress(&self, update: &ProgressUpdate) {
        let Some(ratio) = update.completion else {
            return;
        };
        let mut last = self.last_ratio.lock().unwrap_or_else(PoisonError::into_inner);
        if ratio - *last < PROGRESS_STEP && ratio < 1.0 {
            return;
        }
        *last = ratio;
        if let Err(err) = self
            .store
            .update_run_progress(self.locator_id, Some(self.run), ratio)
        {
            debug!(locator_id = self.locator_id, error = %err, "could not record progress");
        }
    }

    fn on_error(&self, message: &str) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(message.to_string());
    }

    fn on_complete(&self, exit: ProcessExit) {
        let (state, error) = if exit.success() && self.playlist_written() {
            (StreamState::Ready, None)
        } else if exit.success() {
            (
                StreamState::Failed,
                Some("transcoder exited without writing a playlist".to_string()),
            )
        } else {
            let message = self
                .last_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
                .unwrap_or_else(|| "transcode failed".to_string());
            (StreamState::Failed, Some(message))
        };

        match self
            .store
            .transition_run(self.locator_id, Some(self.run), state, error)
        {
            Ok(locator) => info!(locator_id = locator.id, state = %locator.state, "stream settled"),
            Err(LocatorError::NotFound(id)) => {
                debug!(locator_id = id, "locator deleted before stream settled")
            }
            Err(LocatorError::StaleRun { id, run, current }) => {
                debug!(locator_id = id, run, current, "superseded transcode finished")
            }
            Err(err) => warn!(locator_id = self.locator_id, error = %err, "could not settle locator"),
        }
    }
}
