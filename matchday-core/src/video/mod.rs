mod ordering;

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use url::Url;
use uuid::Uuid;

pub use ordering::{concat_order, PartOrdered, PART_ORDER};

/// Which portion of a recording a file holds. Declaration order is the
/// canonical playback order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PartIdentifier {
    PreMatch,
    FirstHalf,
    SecondHalf,
    ExtraTime,
    TrophyCeremony,
    PostMatch,
    Default,
}

impl PartIdentifier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartIdentifier::PreMatch => "PRE_MATCH",
            PartIdentifier::FirstHalf => "FIRST_HALF",
            PartIdentifier::SecondHalf => "SECOND_HALF",
            PartIdentifier::ExtraTime => "EXTRA_TIME",
            PartIdentifier::TrophyCeremony => "TROPHY_CEREMONY",
            PartIdentifier::PostMatch => "POST_MATCH",
            PartIdentifier::Default => "DEFAULT",
        }
    }
}

impl fmt::Display for PartIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown part identifier: {0}")]
pub struct UnknownPart(pub String);

impl FromStr for PartIdentifier {
    type Err = UnknownPart;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PART_ORDER
            .iter()
            .copied()
            .find(|part| part.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownPart(s.to_string()))
    }
}

/// Probed container information for a single remote file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaMetadata {
    pub duration_s: Option<f64>,
    pub format_name: Option<String>,
    pub bit_rate: Option<u64>,
    pub stream_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoFile {
    pub id: Uuid,
    pub part: PartIdentifier,
    pub external_url: Url,
    #[serde(default)]
    pub internal_url: Option<Url>,
    #[serde(default = "epoch")]
    pub last_refreshed: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Option<MediaMetadata>,
}

impl VideoFile {
    pub fn new(part: PartIdentifier, external_url: Url) -> Self {
        Self {
            id: Uuid::new_v4(),
            part,
            external_url,
            internal_url: None,
            last_refreshed: epoch(),
            created_at: Utc::now(),
            metadata: None,
        }
    }

    /// Returns the URL the transcoder should read, if one was ever resolved.
    pub fn stream_url(&self) -> Option<&Url> {
        self.internal_url.as_ref()
    }

    pub fn duration_s(&self) -> Option<f64> {
        self.metadata.as_ref().and_then(|meta| meta.duration_s)
    }
}

/// The files of one rendition, at most one per part.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VideoFilePack {
    files: BTreeMap<PartIdentifier, VideoFile>,
}

impl VideoFilePack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_files(files: impl IntoIterator<Item = VideoFile>) -> Self {
        let mut pack = Self::new();
        for file in files {
            pack.insert(file);
        }
        pack
    }

    /// Inserts `file` under its part. When the part is already taken the
    /// earlier-created file is kept. Returns `false` if `file` was dropped.
    pub fn insert(&mut self, file: VideoFile) -> bool {
        match self.files.get(&file.part) {
            Some(existing) if existing.id == file.id => {
                self.files.insert(file.part, file);
                true
            }
            Some(existing) if existing.created_at <= file.created_at => {
                warn!(
                    part = %file.part,
                    kept = %existing.id,
                    dropped = %file.id,
                    "duplicate part in pack; keeping earliest file"
                );
                false
            }
            Some(existing) => {
                warn!(
                    part = %file.part,
                    kept = %file.id,
                    dropped = %existing.id,
                    "duplicate part in pack; keeping earliest file"
                );
                self.files.insert(file.part, file);
                true
            }
            None => {
                self.files.insert(file.part, file);
                true
            }
        }
    }

    pub fn get(&self, part: PartIdentifier) -> Option<&VideoFile> {
        self.files.get(&part)
    }

    pub fn find(&self, file_id: Uuid) -> Option<&VideoFile> {
        self.files.values().find(|file| file.id == file_id)
    }

    pub fn find_mut(&mut self, file_id: Uuid) -> Option<&mut VideoFile> {
        self.files.values_mut().find(|file| file.id == file_id)
    }

    pub fn contains_any<'a>(&self, files: impl IntoIterator<Item = &'a VideoFile>) -> bool {
        files.into_iter().any(|candidate| {
            self.files
                .values()
                .any(|file| file.id == candidate.id || file.external_url == candidate.external_url)
        })
    }

    /// Files in canonical part order.
    pub fn files(&self) -> impl Iterator<Item = &VideoFile> {
        self.files.values()
    }

    pub fn files_mut(&mut self) -> impl Iterator<Item = &mut VideoFile> {
        self.files.values_mut()
    }

    pub fn parts(&self) -> Vec<PartIdentifier> {
        self.files.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn is_playable(&self) -> bool {
        self.files.contains_key(&PartIdentifier::FirstHalf)
            && self.files.contains_key(&PartIdentifier::SecondHalf)
    }

    /// Orders packs by their part lists, lexicographically.
    pub fn cmp_parts(&self, other: &Self) -> Ordering {
        self.files.keys().cmp(other.files.keys())
    }
}

/// One quality/provider variant of an event's video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoFileSource {
    pub id: Uuid,
    #[serde(default)]
    packs: Vec<VideoFilePack>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub languages: Option<String>,
    #[serde(default)]
    pub resolution: Option<String>,
    #[serde(default)]
    pub video_bitrate: Option<u64>,
    #[serde(default)]
    pub audio_bitrate: Option<u64>,
    #[serde(default = "epoch")]
    pub last_refreshed: DateTime<Utc>,
}

impl VideoFileSource {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            packs: Vec::new(),
            channel: None,
            languages: None,
            resolution: None,
            video_bitrate: None,
            audio_bitrate: None,
            last_refreshed: epoch(),
        }
    }

    pub fn with_pack(mut self, pack: VideoFilePack) -> Self {
        self.add_pack(pack);
        self
    }

    /// Adds `pack`, merging it into an existing pack that already holds any of
    /// its files.
    pub fn add_pack(&mut self, pack: VideoFilePack) {
        let existing = self
            .packs
            .iter_mut()
            .find(|candidate| candidate.contains_any(pack.files()));
        match existing {
            Some(target) => {
                for (_, file) in pack.files {
                    target.insert(file);
                }
            }
            None => self.packs.push(pack),
        }
    }

    pub fn packs(&self) -> &[VideoFilePack] {
        &self.packs
    }

    pub fn packs_mut(&mut self) -> &mut [VideoFilePack] {
        &mut self.packs
    }

    /// The pack to play end to end: the first playable one, else the first
    /// non-empty one.
    pub fn primary_pack(&self) -> Option<&VideoFilePack> {
        self.packs
            .iter()
            .find(|pack| pack.is_playable())
            .or_else(|| self.packs.iter().find(|pack| !pack.is_empty()))
    }

    pub fn files(&self) -> impl Iterator<Item = &VideoFile> {
        self.packs.iter().flat_map(VideoFilePack::files)
    }

    pub fn find_file(&self, file_id: Uuid) -> Option<&VideoFile> {
        self.packs.iter().find_map(|pack| pack.find(file_id))
    }

    pub fn find_file_mut(&mut self, file_id: Uuid) -> Option<&mut VideoFile> {
        self.packs.iter_mut().find_map(|pack| pack.find_mut(file_id))
    }

    pub fn file_count(&self) -> usize {
        self.packs.iter().map(VideoFilePack::len).sum()
    }
}

impl Default for VideoFileSource {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::default()
}
