pub mod config;
pub mod error;
pub mod fileserver;
pub mod freshness;
pub mod sqlite;
pub mod stream;
pub mod transcode;
pub mod video;

pub use config::{load_matchday_config, MatchdayConfig};
pub use error::{ConfigError, Result};
pub use fileserver::{
    Credentials, FileServerError, FileServerPlugin, FileServerRegistry, FileServerResult,
    PassthroughPlugin, SessionCookie,
};
pub use freshness::{FreshnessCoordinator, FreshnessError, RefreshReport};
pub use stream::{
    InMemoryLocatorStore, LocatorError, LocatorFilter, LocatorStore, SqliteLocatorStore,
    SqliteLocatorStoreBuilder, StreamError, StreamManager, StreamResult, StreamState,
    VideoStreamLocator,
};
pub use transcode::{
    CommandBuilder, MetadataProbe, ProcessExit, SupervisorSettings, TranscodeError,
    TranscodeInput, TranscodeListener, TranscodeRequest, TranscodeSupervisor,
};
pub use video::{
    MediaMetadata, PartIdentifier, VideoFile, VideoFilePack, VideoFileSource,
};
