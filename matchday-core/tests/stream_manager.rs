mod common;

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use tempfile::TempDir;
use url::Url;
use uuid::Uuid;

use common::{eventually, supervisor, MockSpawner, RewritingHost};
use matchday_core::fileserver::FileServerRegistry;
use matchday_core::freshness::{FreshnessCoordinator, FreshnessError};
use matchday_core::stream::{
    InMemoryLocatorStore, LocatorStore, NewLocator, StreamError, StreamManager, StreamState,
    FULL_STREAM_DIR,
};
use matchday_core::transcode::CONCAT_LIST_NAME;
use matchday_core::{MediaMetadata, PartIdentifier, VideoFile, VideoFilePack, VideoFileSource};

const POLL: StdDuration = StdDuration::from_millis(5);
const WAIT: StdDuration = StdDuration::from_secs(5);

struct Harness {
    dir: TempDir,
    spawner: Arc<MockSpawner>,
    host: Arc<RewritingHost>,
    store: Arc<InMemoryLocatorStore>,
    manager: StreamManager,
}

impl Harness {
    fn new(max_concurrent: usize) -> Self {
        Self::with_spawner(max_concurrent, MockSpawner::default())
    }

    fn with_spawner(max_concurrent: usize, spawner: MockSpawner) -> Self {
        let dir = TempDir::new().unwrap();
        let spawner = Arc::new(spawner);
        let host = Arc::new(RewritingHost::new(Duration::hours(1)));
        let registry = FileServerRegistry::new(Duration::hours(4)).with_plugin(host.clone());
        let store = Arc::new(InMemoryLocatorStore::new());
        let manager = StreamManager::new(
            supervisor(max_concurrent, spawner.clone()),
            FreshnessCoordinator::new(Arc::new(registry)),
            store.clone(),
            dir.path().join("videos"),
            "playlist.m3u8",
        );
        Self {
            dir,
            spawner,
            host,
            store,
            manager,
        }
    }

    fn root(&self) -> PathBuf {
        self.dir.path().join("videos")
    }
}

fn share(name: &str) -> Url {
    Url::parse(&format!("https://share.test/{name}.mkv")).unwrap()
}

fn file(part: PartIdentifier, name: &str, duration_s: Option<f64>) -> VideoFile {
    let mut file = VideoFile::new(part, share(name));
    file.metadata = duration_s.map(|seconds| MediaMetadata {
        duration_s: Some(seconds),
        ..MediaMetadata::default()
    });
    file
}

fn single_file_source() -> (VideoFileSource, Uuid) {
    let first = file(PartIdentifier::FirstHalf, "first", Some(100.0));
    let id = first.id;
    (
        VideoFileSource::new().with_pack(VideoFilePack::from_files([first])),
        id,
    )
}

#[tokio::test]
async fn begin_streaming_starts_one_transcode_per_file() {
    let harness = Harness::new(4);
    let (mut source, file_id) = single_file_source();

    let locator = harness
        .manager
        .begin_streaming(&mut source, file_id)
        .await
        .unwrap();
    assert_eq!(locator.state, StreamState::Streaming);
    assert_eq!(locator.video_file_id, Some(file_id));
    assert_eq!(
        locator.playlist_path,
        harness
            .root()
            .join(source.id.to_string())
            .join(file_id.to_string())
            .join("playlist.m3u8")
    );
    let command = harness.spawner.command(0);
    assert!(command
        .args
        .iter()
        .any(|arg| arg == "https://cdn.test/first.mkv"));

    let again = harness
        .manager
        .begin_streaming(&mut source, file_id)
        .await
        .unwrap();
    assert_eq!(again.id, locator.id);
    assert_eq!(harness.spawner.count(), 1);
    assert_eq!(harness.host.calls(), 1);
    assert_eq!(harness.manager.active_stream_count(), 1);
}

#[tokio::test]
async fn successful_exit_with_playlist_settles_ready() {
    let harness = Harness::new(4);
    let (mut source, file_id) = single_file_source();
    let locator = harness
        .manager
        .begin_streaming(&mut source, file_id)
        .await
        .unwrap();

    let process = harness.spawner.last();
    process.emit("frame=10 time=00:00:50.00 bitrate=900k");
    let store = harness.store.clone();
    let id = locator.id;
    eventually(move || {
        store
            .get(id)
            .unwrap()
            .map_or(false, |locator| (locator.completion_ratio - 0.5).abs() < 1e-9)
    })
    .await;

    std::fs::write(&locator.playlist_path, "#EXTM3U\n").unwrap();
    process.finish(0);

    let settled = harness
        .manager
        .wait_until_settled(locator.id, POLL, WAIT)
        .await
        .unwrap();
    assert_eq!(settled.state, StreamState::Ready);
    assert_eq!(settled.completion_ratio, 1.0);
    assert!(settled.error.is_none());
    assert_eq!(
        harness.manager.read_playlist(locator.id).await.unwrap(),
        "#EXTM3U\n"
    );
}

#[tokio::test]
async fn failed_locator_is_not_retried_until_restream() {
    let harness = Harness::new(4);
    let (mut source, file_id) = single_file_source();
    let locator = harness
        .manager
        .begin_streaming(&mut source, file_id)
        .await
        .unwrap();
    assert!(matches!(
        harness.manager.read_playlist(locator.id).await,
        Err(StreamError::NotReady(_))
    ));
    harness.spawner.last().finish(0);

    let settled = harness
        .manager
        .wait_until_settled(locator.id, POLL, WAIT)
        .await
        .unwrap();
    assert_eq!(settled.state, StreamState::Failed);
    assert_eq!(
        settled.error.as_deref(),
        Some("transcoder exited without writing a playlist")
    );

    let again = harness
        .manager
        .begin_streaming(&mut source, file_id)
        .await
        .unwrap();
    assert_eq!(again.state, StreamState::Failed);
    assert_eq!(harness.spawner.count(), 1);

    let manager = harness.manager.clone();
    eventually(move || manager.active_stream_count() == 0).await;
    let restarted = harness
        .manager
        .restream(locator.id, &mut source)
        .await
        .unwrap();
    assert_eq!(restarted.state, StreamState::Streaming);
    assert!(restarted.error.is_none());
    assert_eq!(harness.spawner.count(), 2);
}

#[tokio::test]
async fn killed_stream_settles_failed() {
    let harness = Harness::new(4);
    let (mut source, file_id) = single_file_source();
    let locator = harness
        .manager
        .begin_streaming(&mut source, file_id)
        .await
        .unwrap();

    assert!(harness.manager.kill_stream(locator.id).unwrap());
    assert_eq!(harness.manager.active_stream_count(), 0);
    let settled = harness
        .manager
        .wait_until_settled(locator.id, POLL, WAIT)
        .await
        .unwrap();
    assert_eq!(settled.state, StreamState::Failed);
    assert_eq!(settled.error.as_deref(), Some("interrupted"));
    assert!(!harness.manager.kill_stream(locator.id).unwrap());
}

#[tokio::test]
async fn source_stream_concatenates_primary_pack_in_order() {
    let harness = Harness::new(4);
    let mut source = VideoFileSource::new().with_pack(VideoFilePack::from_files([
        file(PartIdentifier::PostMatch, "post", Some(60.0)),
        file(PartIdentifier::FirstHalf, "first", Some(2700.0)),
        file(PartIdentifier::PreMatch, "pre", Some(60.0)),
        file(PartIdentifier::SecondHalf, "second", Some(2700.0)),
    ]));

    let locator = harness
        .manager
        .begin_source_streaming(&mut source)
        .await
        .unwrap();
    assert_eq!(locator.video_file_id, None);
    let stream_dir = harness
        .root()
        .join(source.id.to_string())
        .join(FULL_STREAM_DIR);
    assert_eq!(locator.playlist_path, stream_dir.join("playlist.m3u8"));

    let list = std::fs::read_to_string(stream_dir.join(CONCAT_LIST_NAME)).unwrap();
    assert_eq!(
        list.lines().collect::<Vec<_>>(),
        vec![
            "file 'https://cdn.test/pre.mkv'",
            "file 'https://cdn.test/first.mkv'",
            "file 'https://cdn.test/second.mkv'",
            "file 'https://cdn.test/post.mkv'",
        ]
    );
    assert_eq!(harness.host.calls(), 4);

    assert_eq!(harness.manager.kill_all_streams_for(source.id).unwrap(), 1);
    assert_eq!(harness.manager.active_stream_count(), 0);
}

#[tokio::test]
async fn source_stream_refreshes_files_left_unresolved_by_single_file_streams() {
    let harness = Harness::new(4);
    let first = file(PartIdentifier::FirstHalf, "first", Some(2700.0));
    let first_id = first.id;
    let mut source = VideoFileSource::new().with_pack(VideoFilePack::from_files([
        first,
        file(PartIdentifier::SecondHalf, "second", Some(2700.0)),
    ]));

    harness
        .manager
        .begin_streaming(&mut source, first_id)
        .await
        .unwrap();
    harness
        .manager
        .begin_source_streaming(&mut source)
        .await
        .unwrap();

    let stream_dir = harness
        .root()
        .join(source.id.to_string())
        .join(FULL_STREAM_DIR);
    let list = std::fs::read_to_string(stream_dir.join(CONCAT_LIST_NAME)).unwrap();
    assert_eq!(
        list.lines().collect::<Vec<_>>(),
        vec![
            "file 'https://cdn.test/first.mkv'",
            "file 'https://cdn.test/second.mkv'",
        ]
    );
}

#[tokio::test]
async fn source_stream_ignores_unresolvable_secondary_pack() {
    let harness = Harness::new(4);
    let mirror = VideoFilePack::from_files([VideoFile::new(
        PartIdentifier::Default,
        Url::parse("https://unknown.test/mirror.mkv").unwrap(),
    )]);
    let mut source = VideoFileSource::new()
        .with_pack(VideoFilePack::from_files([
            file(PartIdentifier::FirstHalf, "first", Some(2700.0)),
            file(PartIdentifier::SecondHalf, "second", Some(2700.0)),
        ]))
        .with_pack(mirror);

    let locator = harness
        .manager
        .begin_source_streaming(&mut source)
        .await
        .unwrap();
    assert_eq!(locator.state, StreamState::Streaming);
    let args = harness.spawner.command(0).args;
    assert!(!args.iter().any(|arg| arg.contains("unknown.test")));
}

#[tokio::test]
async fn source_stream_fails_when_primary_pack_is_unresolvable() {
    let harness = Harness::new(4);
    harness.host.failing.store(true, Ordering::SeqCst);
    let mut source = VideoFileSource::new().with_pack(VideoFilePack::from_files([
        file(PartIdentifier::FirstHalf, "first", Some(2700.0)),
        file(PartIdentifier::SecondHalf, "second", Some(2700.0)),
    ]));

    let err = harness
        .manager
        .begin_source_streaming(&mut source)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StreamError::Freshness(FreshnessError::ResolutionFailure { pack: 0, .. })
    ));
    assert_eq!(harness.spawner.count(), 0);
}

#[tokio::test]
async fn reaping_an_interrupted_run_leaves_the_restreamed_run_alone() {
    let harness = Harness::with_spawner(4, MockSpawner::lingering());
    let (mut source, file_id) = single_file_source();
    let locator = harness
        .manager
        .begin_streaming(&mut source, file_id)
        .await
        .unwrap();
    assert_eq!(locator.run, 1);

    assert!(harness.manager.kill_stream(locator.id).unwrap());
    let orphaned = harness
        .manager
        .begin_streaming(&mut source, file_id)
        .await
        .unwrap();
    assert_eq!(orphaned.state, StreamState::Failed);

    let restarted = harness
        .manager
        .restream(locator.id, &mut source)
        .await
        .unwrap();
    assert_eq!(restarted.run, 2);
    assert_eq!(harness.spawner.count(), 2);

    harness.spawner.process(0).reap();
    tokio::time::sleep(StdDuration::from_millis(50)).await;
    let current = harness.store.get(locator.id).unwrap().unwrap();
    assert_eq!(current.state, StreamState::Streaming);
    assert!(current.error.is_none());

    std::fs::write(&locator.playlist_path, "#EXTM3U\n").unwrap();
    harness.spawner.process(1).finish(0);
    let settled = harness
        .manager
        .wait_until_settled(locator.id, POLL, WAIT)
        .await
        .unwrap();
    assert_eq!(settled.state, StreamState::Ready);
    assert!(settled.error.is_none());
}

#[tokio::test]
async fn pool_exhaustion_fails_the_locator() {
    let harness = Harness::new(1);
    let (mut first, first_file) = single_file_source();
    let (mut second, second_file) = single_file_source();

    harness
        .manager
        .begin_streaming(&mut first, first_file)
        .await
        .unwrap();
    let err = harness
        .manager
        .begin_streaming(&mut second, second_file)
        .await
        .unwrap_err();
    assert!(matches!(err, StreamError::Transcode(_)));

    let locators = harness.manager.stream_locators_for(second.id).unwrap();
    assert_eq!(locators.len(), 1);
    assert_eq!(locators[0].state, StreamState::Failed);
    assert_eq!(harness.manager.kill_all_streams(), 1);
}

#[tokio::test]
async fn unresolvable_file_creates_no_locator() {
    let harness = Harness::new(4);
    harness.host.failing.store(true, Ordering::SeqCst);
    let (mut source, file_id) = single_file_source();

    let err = harness
        .manager
        .begin_streaming(&mut source, file_id)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StreamError::Freshness(FreshnessError::FileResolution { .. })
    ));
    assert!(harness.manager.get_all_stream_locators().unwrap().is_empty());
    assert_eq!(harness.spawner.count(), 0);
}

#[tokio::test]
async fn created_locator_is_reused_and_started_later() {
    let harness = Harness::new(4);
    let (mut source, file_id) = single_file_source();
    let video = source.find_file(file_id).cloned().unwrap();

    let first = harness.manager.create_stream_locator(source.id, &video).unwrap();
    let again = harness.manager.create_stream_locator(source.id, &video).unwrap();
    assert_eq!(first.id, again.id);
    assert_eq!(first.state, StreamState::Created);
    assert_eq!(harness.spawner.count(), 0);

    let started = harness
        .manager
        .begin_streaming(&mut source, file_id)
        .await
        .unwrap();
    assert_eq!(started.id, first.id);
    assert_eq!(started.state, StreamState::Streaming);
    assert_eq!(harness.spawner.count(), 1);
}

#[tokio::test]
async fn unknown_file_is_rejected() {
    let harness = Harness::new(4);
    let (mut source, _) = single_file_source();
    let err = harness
        .manager
        .begin_streaming(&mut source, Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, StreamError::FileNotFound { .. }));
}

#[tokio::test]
async fn orphaned_streaming_locator_is_marked_failed() {
    let harness = Harness::new(4);
    let (mut source, file_id) = single_file_source();
    let path = harness.manager.playlist_path_for(source.id, Some(file_id));
    let (orphan, _) = harness
        .store
        .insert_or_get(&NewLocator {
            playlist_path: path,
            source_id: source.id,
            video_file_id: Some(file_id),
        })
        .unwrap();
    harness
        .store
        .transition(orphan.id, StreamState::Streaming, None)
        .unwrap();

    let locator = harness
        .manager
        .begin_streaming(&mut source, file_id)
        .await
        .unwrap();
    assert_eq!(locator.id, orphan.id);
    assert_eq!(locator.state, StreamState::Failed);
    assert_eq!(locator.error.as_deref(), Some("transcode no longer running"));
    assert_eq!(harness.spawner.count(), 0);
}

#[tokio::test]
async fn delete_removes_record_and_artifacts() {
    let harness = Harness::new(4);
    let (mut source, file_id) = single_file_source();
    let locator = harness
        .manager
        .begin_streaming(&mut source, file_id)
        .await
        .unwrap();
    let stream_dir = locator.stream_dir().unwrap().to_path_buf();
    std::fs::write(stream_dir.join("segment_00000.ts"), b"ts").unwrap();

    harness.manager.delete_stream_locator(locator.id).await.unwrap();
    assert!(harness.spawner.last().was_killed());
    assert!(!stream_dir.exists());
    assert!(harness
        .manager
        .get_stream_locator(locator.id)
        .unwrap()
        .is_none());
    assert_eq!(harness.manager.active_stream_count(), 0);
}

#[tokio::test]
async fn expired_sweep_skips_live_streams() {
    let harness = Harness::new(4);
    let (mut live_source, live_file) = single_file_source();
    let (mut idle_source, idle_file) = single_file_source();
    let live = harness
        .manager
        .begin_streaming(&mut live_source, live_file)
        .await
        .unwrap();
    let idle = harness
        .manager
        .begin_streaming(&mut idle_source, idle_file)
        .await
        .unwrap();
    harness.manager.kill_stream(idle.id).unwrap();
    harness
        .manager
        .wait_until_settled(idle.id, POLL, WAIT)
        .await
        .unwrap();
    tokio::time::sleep(StdDuration::from_millis(10)).await;

    let deleted = harness
        .manager
        .delete_expired_locators(Duration::zero())
        .await
        .unwrap();
    assert_eq!(deleted, 1);
    let remaining = harness.manager.get_all_stream_locators().unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, live.id);
}

#[tokio::test]
async fn restream_rejects_other_sources() {
    let harness = Harness::new(4);
    let (mut source, file_id) = single_file_source();
    let locator = harness
        .manager
        .begin_streaming(&mut source, file_id)
        .await
        .unwrap();
    let (mut other, _) = single_file_source();
    let err = harness
        .manager
        .restream(locator.id, &mut other)
        .await
        .unwrap_err();
    assert!(matches!(err, StreamError::SourceMismatch { .. }));
}

#[cfg(unix)]
#[tokio::test]
async fn real_process_writes_playlist() {
    use matchday_core::fileserver::PassthroughPlugin;
    use matchday_core::transcode::{
        CommandBuilder, MetadataProbe, SupervisorSettings, SystemProcessSpawner,
        TranscodeSupervisor,
    };

    let dir = TempDir::new().unwrap();
    let script = dir.path().join("fake-ffmpeg.sh");
    std::fs::write(
        &script,
        "echo 'Duration: 00:00:02.00, start: 0.0' >&2\n\
         echo 'frame=1 time=00:00:02.00 bitrate=1k' >&2\n\
         for last; do :; done\n\
         printf '#EXTM3U\\n' > \"$last\"\n",
    )
    .unwrap();
    let media = dir.path().join("match.mkv");
    std::fs::write(&media, b"not really video").unwrap();

    let supervisor = TranscodeSupervisor::new(
        SupervisorSettings::default(),
        CommandBuilder::new("/bin/sh").with_base_args(vec![script.display().to_string()]),
        MetadataProbe::new("ffprobe", Vec::new()),
        Arc::new(SystemProcessSpawner),
    );
    let passthrough = PassthroughPlugin::new(&[], Duration::hours(1)).unwrap();
    let registry = FileServerRegistry::new(Duration::hours(4)).with_plugin(Arc::new(passthrough));
    let manager = StreamManager::new(
        supervisor,
        FreshnessCoordinator::new(Arc::new(registry)),
        Arc::new(InMemoryLocatorStore::new()),
        dir.path().join("videos"),
        "playlist.m3u8",
    );

    let video = VideoFile::new(
        PartIdentifier::Default,
        Url::from_file_path(&media).unwrap(),
    );
    let file_id = video.id;
    let mut source = VideoFileSource::new().with_pack(VideoFilePack::from_files([video]));

    let locator = manager.begin_streaming(&mut source, file_id).await.unwrap();
    let settled = manager
        .wait_until_settled(locator.id, POLL, WAIT)
        .await
        .unwrap();
    assert_eq!(settled.state, StreamState::Ready, "{:?}", settled.error);
    assert_eq!(manager.read_playlist(locator.id).await.unwrap(), "#EXTM3U\n");

    let logs: Vec<_> = std::fs::read_dir(locator.stream_dir().unwrap())
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().starts_with("ffmpeg-"))
        .collect();
    assert_eq!(logs.len(), 1);
    let log = std::fs::read_to_string(logs[0].path()).unwrap();
    assert!(log.contains("time=00:00:02.00"));
}
