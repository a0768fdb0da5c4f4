use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use super::locator::{
    LocatorError, LocatorFilter, LocatorResult, NewLocator, StreamState, VideoStreamLocator,
};

/// Persistence for stream locators. Playlist paths are unique.
pub trait LocatorStore: Send + Sync {
    /// Registers `new`, or returns the locator already registered for its
    /// playlist path. The flag is `true` when a record was created.
    fn insert_or_get(&self, new: &NewLocator) -> LocatorResult<(VideoStreamLocator, bool)>;

    fn get(&self, id: i64) -> LocatorResult<Option<VideoStreamLocator>>;

    fn find_by_path(&self, playlist_path: &Path) -> LocatorResult<Option<VideoStreamLocator>>;

    fn list(&self, filter: &LocatorFilter) -> LocatorResult<Vec<VideoStreamLocator>>;

    fn transition(
        &self,
        id: i64,
        to: StreamState,
        error: Option<String>,
    ) -> LocatorResult<VideoStreamLocator> {
        self.transition_run(id, None, to, error)
    }

    /// Applies a transition only while the locator is still on `run`, so a
    /// superseded transcode cannot settle a newer one.
    fn transition_run(
        &self,
        id: i64,
        run: Option<u32>,
        to: StreamState,
        error: Option<String>,
    ) -> LocatorResult<VideoStreamLocator>;

    fn update_progress(&self, id: i64, completion_ratio: f64) -> LocatorResult<()> {
        self.update_run_progress(id, None, completion_ratio)
    }

    fn update_run_progress(
        &self,
        id: i64,
        run: Option<u32>,
        completion_ratio: f64,
    ) -> LocatorResult<()>;

    /// Returns whether a record was removed.
    fn delete(&self, id: i64) -> LocatorResult<bool>;

    /// Settled or never-started locators last touched before `cutoff`.
    fn expired(&self, cutoff: DateTime<Utc>) -> LocatorResult<Vec<VideoStreamLocator>> {
        Ok(self
            .list(&LocatorFilter::default())?
            .into_iter()
            .filter(|locator| locator.state != StreamState::Streaming && locator.updated_at < cutoff)
            .collect())
    }

    fn counts(&self) -> LocatorResult<HashMap<StreamState, usize>> {
        let mut counts = HashMap::new();
        for locator in self.list(&LocatorFilter::default())? {
            *counts.entry(locator.state).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    locators: BTreeMap<i64, VideoStreamLocator>,
}

/// Process-local store, used in tests and when no database is configured.
#[derive(Debug, Default)]
pub struct InMemoryLocatorStore {
    state: Mutex<MemoryState>,
}

impl InMemoryLocatorStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl LocatorStore for InMemoryLocatorStore {
    fn insert_or_get(&self, new: &NewLocator) -> LocatorResult<(VideoStreamLocator, bool)> {
        let mut state = self.lock();
        if let Some(existing) = state
            .locators
            .values()
            .find(|locator| locator.playlist_path == new.playlist_path)
        {
            return Ok((existing.clone(), false));
        }
        state.next_id += 1;
        let now = Utc::now();
        let locator = VideoStreamLocator {
            id: state.next_id,
            playlist_path: new.playlist_path.clone(),
            source_id: new.source_id,
            video_file_id: new.video_file_id,
            state: StreamState::Created,
            run: 0,
            completion_ratio: 0.0,
            error: None,
            created_at: now,
            updated_at: now,
        };
        state.locators.insert(locator.id, locator.clone());
        Ok((locator, true))
    }

    fn get(&self, id: i64) -> LocatorResult<Option<VideoStreamLocator>> {
        Ok(self.lock().locators.get(&id).cloned())
    }

    fn find_by_path(&self, playlist_path: &Path) -> LocatorResult<Option<VideoStreamLocator>> {
        Ok(self
            .lock()
            .locators
            .values()
            .find(|locator| locator.playlist_path == playlist_path)
            .cloned())
    }

    fn list(&self, filter: &LocatorFilter) -> LocatorResult<Vec<VideoStreamLocator>> {
        Ok(self
            .lock()
            .locators
            .values()
            .filter(|locator| filter.matches(locator))
            .cloned()
            .collect())
    }

    fn transition_run(
        &self,
        id: i64,
        run: Option<u32>,
        to: StreamState,
        error: Option<String>,
    ) -> LocatorResult<VideoStreamLocator> {
        let mut state = self.lock();
        let locator = state
            .locators
            .get_mut(&id)
            .ok_or(LocatorError::NotFound(id))?;
        locator.check_run(run)?;
        locator.transition(to, error, Utc::now())?;
        Ok(locator.clone())
    }

    fn update_run_progress(
        &self,
        id: i64,
        run: Option<u32>,
        completion_ratio: f64,
    ) -> LocatorResult<()> {
        let mut state = self.lock();
        let locator = state
            .locators
            .get_mut(&id)
            .ok_or(LocatorError::NotFound(id))?;
        locator.check_run(run)?;
        locator.completion_ratio = completion_ratio.clamp(0.0, 1.0);
        locator.updated_at = Utc::now();
        Ok(())
    }

    fn delete(&self, id: i64) -> LocatorResult<bool> {
        Ok(self.lock().locators.remove(&id).is_some())
    }
}
