use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::fileserver::{FileServerError, FileServerRegistry};
use crate::video::{VideoFile, VideoFileSource};

#[derive(Debug, Error)]
pub enum FreshnessError {
    #[error("no file in pack {pack} of source {source_id} could be resolved")]
    ResolutionFailure { source_id: Uuid, pack: usize },
    #[error("video file {file_id} not found in source {source_id}")]
    FileNotFound { source_id: Uuid, file_id: Uuid },
    #[error("could not resolve {file_id}: {source}")]
    FileResolution {
        file_id: Uuid,
        #[source]
        source: FileServerError,
    },
}

pub type FreshnessResult<T> = Result<T, FreshnessError>;

/// Outcome of one refresh pass over a source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshReport {
    pub refreshed: usize,
    pub failed: usize,
    /// Files with no usable URL after the pass; they are left out of
    /// concatenation until a later refresh succeeds.
    pub dropped: Vec<Uuid>,
}

/// Decides when cached download links are stale and re-resolves them
/// through the file-server registry.
#[derive(Debug, Clone)]
pub struct FreshnessCoordinator {
    registry: Arc<FileServerRegistry>,
}

impl FreshnessCoordinator {
    pub fn new(registry: Arc<FileServerRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<FileServerRegistry> {
        &self.registry
    }

    /// The shortest refresh rate among the hosts serving `source`.
    pub fn refresh_rate(&self, source: &VideoFileSource) -> Duration {
        source
            .files()
            .map(|file| self.registry.refresh_rate_for(&file.external_url))
            .min()
            .unwrap_or_else(|| self.registry.default_refresh_rate())
    }

    pub fn is_stale(&self, source: &VideoFileSource) -> bool {
        self.is_stale_at(source, Utc::now())
    }

    /// Stale strictly after `last_refreshed + refresh_rate`.
    pub fn is_stale_at(&self, source: &VideoFileSource, now: DateTime<Utc>) -> bool {
        now - source.last_refreshed > self.refresh_rate(source)
    }

    pub fn file_is_stale_at(&self, file: &VideoFile, now: DateTime<Utc>) -> bool {
        file.internal_url.is_none()
            || now - file.last_refreshed > self.registry.refresh_rate_for(&file.external_url)
    }

    /// Re-resolves every file of `source`.
    ///
    /// A failed file keeps its previous internal URL. The pass only fails
    /// when a pack is left with no resolvable file at all.
    pub async fn refresh(&self, source: &mut VideoFileSource) -> FreshnessResult<RefreshReport> {
        let source_id = source.id;
        let targets: Vec<(Uuid, url::Url)> = source
            .files()
            .map(|file| (file.id, file.external_url.clone()))
            .collect();

        let resolutions = join_all(
            targets
                .iter()
                .map(|(_, url)| self.registry.download_url(url)),
        )
        .await;

        let now = Utc::now();
        let mut report = RefreshReport::default();
        for ((file_id, external_url), resolution) in targets.into_iter().zip(resolutions) {
            let Some(file) = source.find_file_mut(file_id) else {
                continue;
            };
            match resolution {
                Ok(internal_url) => {
                    file.internal_url = Some(internal_url);
                    file.last_refreshed = now;
                    report.refreshed += 1;
                }
                Err(err) => {
                    warn!(
                        source_id = %source_id,
                        file_id = %file_id,
                        url = %external_url,
                        error = %err,
                        keeps_previous = file.internal_url.is_some(),
                        "could not refresh download link"
                    );
                    report.failed += 1;
                    if file.internal_url.is_none() {
                        report.dropped.push(file_id);
                    }
                }
            }
        }

        if report.refreshed > 0 {
            source.last_refreshed = now;
        }

        for (index, pack) in source.packs().iter().enumerate() {
            if !pack.is_empty() && pack.files().all(|file| file.internal_url.is_none()) {
                return Err(FreshnessError::ResolutionFailure {
                    source_id,
                    pack: index,
                });
            }
        }

        info!(
            source_id = %source_id,
            refreshed = report.refreshed,
            failed = report.failed,
            dropped = report.dropped.len(),
            "refreshed video file source"
        );
        Ok(report)
    }

    /// Refreshes `source` only when it is stale.
    pub async fn ensure_fresh(
        &self,
        source: &mut VideoFileSource,
    ) -> FreshnessResult<Option<RefreshReport>> {
        if !self.is_stale(source) {
            debug!(source_id = %source.id, "video file source is fresh");
            return Ok(None);
        }
        self.refresh(source).await.map(Some)
    }

    /// Re-resolves one file when its own link is stale. Returns whether a
    /// resolution happened. A failed resolution is fatal only if the file has
    /// no previous URL to fall back on. Only the file is stamped; the source
    /// stays stale until every file has been through [`Self::refresh`].
    pub async fn ensure_file_fresh(
        &self,
        source: &mut VideoFileSource,
        file_id: Uuid,
    ) -> FreshnessResult<bool> {
        let source_id = source.id;
        let now = Utc::now();
        let file = source
            .find_file_mut(file_id)
            .ok_or(FreshnessError::FileNotFound { source_id, file_id })?;
        if !self.file_is_stale_at(file, now) {
            return Ok(false);
        }

        match self.registry.download_url(&file.external_url).await {
            Ok(internal_url) => {
                file.internal_url = Some(internal_url);
                file.last_refreshed = now;
                Ok(true)
            }
            Err(err) if file.internal_url.is_some() => {
                warn!(
                    source_id = %source_id,
                    file_id = %file_id,
                    error = %err,
                    "could not refresh download link; using last known url"
                );
                Ok(false)
            }
            Err(err) => Err(FreshnessError::FileResolution {
                file_id,
                source: err,
            }),
        }
    }
}
