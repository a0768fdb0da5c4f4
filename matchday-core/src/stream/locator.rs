use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum LocatorError {
    #[error("failed to open locator database {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("failed to execute statement on locator database: {0}")]
    Execute(#[from] rusqlite::Error),
    #[error("locator database path not configured")]
    MissingStore,
    #[error("stream locator not found: {0}")]
    NotFound(i64),
    #[error("invalid stream state: {0}")]
    InvalidState(String),
    #[error("locator {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: i64,
        from: StreamState,
        to: StreamState,
    },
    #[error("locator {id} is on run {current}, not run {run}")]
    StaleRun { id: i64, run: u32, current: u32 },
}

pub type LocatorResult<T> = Result<T, LocatorError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Created,
    Streaming,
    Ready,
    Failed,
}

impl StreamState {
    pub const ALL: [StreamState; 4] = [
        StreamState::Created,
        StreamState::Streaming,
        StreamState::Ready,
        StreamState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamState::Created => "created",
            StreamState::Streaming => "streaming",
            StreamState::Ready => "ready",
            StreamState::Failed => "failed",
        }
    }

    pub fn can_transition_to(self, next: StreamState) -> bool {
        use StreamState::*;
        matches!(
            (self, next),
            (Created, Streaming)
                | (Created, Failed)
                | (Streaming, Ready)
                | (Streaming, Failed)
                | (Ready, Streaming)
                | (Failed, Streaming)
        )
    }

    pub fn is_settled(self) -> bool {
        matches!(self, StreamState::Ready | StreamState::Failed)
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for StreamState {
    type Err = LocatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "streaming" => Ok(Self::Streaming),
            "ready" => Ok(Self::Ready),
            "failed" => Ok(Self::Failed),
            other => Err(LocatorError::InvalidState(other.to_string())),
        }
    }
}

/// Tracking record for one playlist build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoStreamLocator {
    pub id: i64,
    pub playlist_path: PathBuf,
    pub source_id: Uuid,
    /// `None` for a stream of a whole pack.
    pub video_file_id: Option<Uuid>,
    pub state: StreamState,
    /// Incremented each time the locator enters `Streaming`.
    #[serde(default)]
    pub run: u32,
    pub completion_ratio: f64,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VideoStreamLocator {
    pub fn stream_dir(&self) -> Option<&Path> {
        self.playlist_path.parent()
    }

    /// Fails with `StaleRun` when `run` is given and the locator has moved on.
    pub fn check_run(&self, run: Option<u32>) -> LocatorResult<()> {
        match run {
            Some(run) if run != self.run => Err(LocatorError::StaleRun {
                id: self.id,
                run,
                current: self.run,
            }),
            _ => Ok(()),
        }
    }

    /// Applies a state change, enforcing the locator lifecycle.
    pub fn transition(
        &mut self,
        to: StreamState,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> LocatorResult<()> {
        if !self.state.can_transition_to(to) {
            return Err(LocatorError::InvalidTransition {
                id: self.id,
                from: self.state,
                to,
            });
        }
        self.state = to;
        self.updated_at = now;
        match to {
            StreamState::Streaming => {
                self.run += 1;
                self.completion_ratio = 0.0;
                self.error = None;
            }
            StreamState::Ready => {
                self.completion_ratio = 1.0;
                self.error = None;
            }
            StreamState::Failed => self.error = error,
            StreamState::Created => {}
        }
        Ok(())
    }
}

/// Fields of a locator about to be registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLocator {
    pub playlist_path: PathBuf,
    pub source_id: Uuid,
    pub video_file_id: Option<Uuid>,
}

#[derive(Debug, Clone, Default)]
pub struct LocatorFilter {
    pub source_id: Option<Uuid>,
    pub state: Option<StreamState>,
}

impl LocatorFilter {
    pub fn matches(&self, locator: &VideoStreamLocator) -> bool {
        self.source_id.map_or(true, |id| locator.source_id == id)
            && self.state.map_or(true, |state| locator.state == state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locator(state: StreamState) -> VideoStreamLocator {
        VideoStreamLocator {
            id: 7,
            playlist_path: PathBuf::from("/srv/a/b/playlist.m3u8"),
            source_id: Uuid::new_v4(),
            video_file_id: None,
            state,
            run: 1,
            completion_ratio: 0.4,
            error: Some("old".into()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn lifecycle_edges() {
        use StreamState::*;
        assert!(Created.can_transition_to(Streaming));
        assert!(Streaming.can_transition_to(Ready));
        assert!(Streaming.can_transition_to(Failed));
        assert!(Ready.can_transition_to(Streaming));
        assert!(Failed.can_transition_to(Streaming));
        assert!(!Ready.can_transition_to(Failed));
        assert!(!Streaming.can_transition_to(Streaming));
        assert!(!Failed.can_transition_to(Created));
    }

    #[test]
    fn restream_clears_error_and_progress() {
        let mut locator = locator(StreamState::Failed);
        locator
            .transition(StreamState::Streaming, None, Utc::now())
            .unwrap();
        assert_eq!(locator.completion_ratio, 0.0);
        assert!(locator.error.is_none());
        assert_eq!(locator.run, 2);
    }

    #[test]
    fn earlier_run_is_stale() {
        let mut locator = locator(StreamState::Failed);
        locator
            .transition(StreamState::Streaming, None, Utc::now())
            .unwrap();
        assert!(locator.check_run(None).is_ok());
        assert!(locator.check_run(Some(2)).is_ok());
        assert!(matches!(
            locator.check_run(Some(1)),
            Err(LocatorError::StaleRun { run: 1, current: 2, .. })
        ));
    }

    #[test]
    fn invalid_transition_is_rejected() {
        let mut locator = locator(StreamState::Ready);
        let err = locator
            .transition(StreamState::Failed, Some("x".into()), Utc::now())
            .unwrap_err();
        assert!(matches!(
            err,
            LocatorError::InvalidTransition {
                from: StreamState::Ready,
                to: StreamState::Failed,
                ..
            }
        ));
        assert_eq!(locator.state, StreamState::Ready);
    }

    #[test]
    fn state_round_trips_through_str() {
        for state in StreamState::ALL {
            assert_eq!(state.as_str().parse::<StreamState>().unwrap(), state);
        }
        assert!("zombie".parse::<StreamState>().is_err());
    }
}
