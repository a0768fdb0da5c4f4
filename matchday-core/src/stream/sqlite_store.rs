use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use uuid::Uuid;

use crate::sqlite::configure_connection;

use super::locator::{
    LocatorError, LocatorFilter, LocatorResult, NewLocator, StreamState, VideoStreamLocator,
};
use super::store::LocatorStore;

const LOCATOR_SCHEMA: &str = include_str!("../../../sql/locators.sql");

#[derive(Debug, Clone)]
pub struct SqliteLocatorStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SqliteLocatorStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SqliteLocatorStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> LocatorResult<SqliteLocatorStore> {
        let path = self.path.ok_or(LocatorError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        Ok(SqliteLocatorStore { path, flags })
    }
}

#[derive(Debug, Clone)]
pub struct SqliteLocatorStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteLocatorStore {
    pub fn builder() -> SqliteLocatorStoreBuilder {
        SqliteLocatorStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> LocatorResult<Self> {
        SqliteLocatorStoreBuilder::new().path(path).build()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> LocatorResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            LocatorError::Open {
                source,
                path: self.path.clone(),
            }
        })?;
        configure_connection(&conn).map_err(|source| LocatorError::Open {
            source,
            path: self.path.clone(),
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> LocatorResult<()> {
        let conn = self.open()?;
        conn.execute_batch(LOCATOR_SCHEMA)?;
        Ok(())
    }

    fn fetch(conn: &Connection, id: i64) -> LocatorResult<Option<VideoStreamLocator>> {
        Ok(conn
            .query_row(
                "SELECT * FROM stream_locators WHERE id = ?1",
                [id],
                VideoStreamLocator::from_row,
            )
            .optional()?)
    }
}

impl VideoStreamLocator {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let state_index = row.as_ref().column_index("state")?;
        Ok(Self {
            id: row.get("id")?,
            playlist_path: PathBuf::from(row.get::<_, String>("playlist_path")?),
            source_id: parse_uuid(row, "source_id")?,
            video_file_id: match row.get::<_, Option<String>>("video_file_id")? {
                Some(_) => Some(parse_uuid(row, "video_file_id")?),
                None => None,
            },
            state: row
                .get::<_, String>("state")?
                .parse()
                .map_err(|err: LocatorError| {
                    rusqlite::Error::FromSqlConversionFailure(state_index, Type::Text, Box::new(err))
                })?,
            run: row.get("run")?,
            completion_ratio: row.get("completion_ratio")?,
            error: row.get("error")?,
            created_at: row.get::<_, DateTime<Utc>>("created_at")?,
            updated_at: row.get::<_, DateTime<Utc>>("updated_at")?,
        })
    }
}

fn parse_uuid(row: &Row<'_>, column: &str) -> rusqlite::Result<Uuid> {
    let index = row.as_ref().column_index(column)?;
    let raw: String = row.get(index)?;
    Uuid::parse_str(&raw)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(err)))
}

impl LocatorStore for SqliteLocatorStore {
    fn insert_or_get(&self, new: &NewLocator) -> LocatorResult<(VideoStreamLocator, bool)> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let path = new.playlist_path.to_string_lossy().to_string();
        let now = Utc::now();
        let inserted = tx.execute(
            "INSERT INTO stream_locators (
                playlist_path, source_id, video_file_id, state, completion_ratio,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, 'created', 0.0, ?4, ?4)
            ON CONFLICT(playlist_path) DO NOTHING",
            params![
                &path,
                new.source_id.to_string(),
                new.video_file_id.map(|id| id.to_string()),
                now
            ],
        )?;
        let locator = tx.query_row(
            "SELECT * FROM stream_locators WHERE playlist_path = ?1",
            [&path],
            VideoStreamLocator::from_row,
        )?;
        tx.commit()?;
        Ok((locator, inserted > 0))
    }

    fn get(&self, id: i64) -> LocatorResult<Option<VideoStreamLocator>> {
        let conn = self.open()?;
        Self::fetch(&conn, id)
    }

    fn find_by_path(&self, playlist_path: &Path) -> LocatorResult<Option<VideoStreamLocator>> {
        let conn = self.open()?;
        Ok(conn
            .query_row(
                "SELECT * FROM stream_locators WHERE playlist_path = ?1",
                [playlist_path.to_string_lossy().to_string()],
                VideoStreamLocator::from_row,
            )
            .optional()?)
    }

    fn list(&self, filter: &LocatorFilter) -> LocatorResult<Vec<VideoStreamLocator>> {
        let conn = self.open()?;
        let mut query = String::from("SELECT * FROM stream_locators");
        let mut clauses = Vec::new();
        let mut params: Vec<Value> = Vec::new();
        if let Some(source_id) = filter.source_id {
            clauses.push("source_id = ?");
            params.push(Value::Text(source_id.to_string()));
        }
        if let Some(state) = filter.state {
            clauses.push("state = ?");
            params.push(Value::Text(state.as_str().to_string()));
        }
        if !clauses.is_empty() {
            query.push_str(" WHERE ");
            query.push_str(&clauses.join(" AND "));
        }
        query.push_str(" ORDER BY id ASC");

        let mut stmt = conn.prepare(&query)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
        let mut locators = Vec::new();
        while let Some(row) = rows.next()? {
            locators.push(VideoStreamLocator::from_row(row)?);
        }
        Ok(locators)
    }

    fn transition_run(
        &self,
        id: i64,
        run: Option<u32>,
        to: StreamState,
        error: Option<String>,
    ) -> LocatorResult<VideoStreamLocator> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let mut locator = Self::fetch(&tx, id)?.ok_or(LocatorError::NotFound(id))?;
        locator.check_run(run)?;
        locator.transition(to, error, Utc::now())?;
        tx.execute(
            "UPDATE stream_locators
             SET state = ?1, run = ?2, completion_ratio = ?3, error = ?4, updated_at = ?5
             WHERE id = ?6",
            params![
                locator.state.as_str(),
                locator.run,
                locator.completion_ratio,
                &locator.error,
                locator.updated_at,
                id
            ],
        )?;
        tx.commit()?;
        Ok(locator)
    }

    fn update_run_progress(
        &self,
        id: i64,
        run: Option<u32>,
        completion_ratio: f64,
    ) -> LocatorResult<()> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let locator = Self::fetch(&tx, id)?.ok_or(LocatorError::NotFound(id))?;
        locator.check_run(run)?;
        tx.execute(
            "UPDATE stream_locators SET completion_ratio = ?1, updated_at = ?2 WHERE id = ?3",
            params![completion_ratio.clamp(0.0, 1.0), Utc::now(), id],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn delete(&self, id: i64) -> LocatorResult<bool> {
        let conn = self.open()?;
        let removed = conn.execute("DELETE FROM stream_locators WHERE id = ?1", [id])?;
        Ok(removed > 0)
    }

    fn expired(&self, cutoff: DateTime<Utc>) -> LocatorResult<Vec<VideoStreamLocator>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM stream_locators
             WHERE state != 'streaming' AND updated_at < ?1
             ORDER BY updated_at ASC",
        )?;
        let mut rows = stmt.query([cutoff])?;
        let mut locators = Vec::new();
        while let Some(row) = rows.next()? {
            locators.push(VideoStreamLocator::from_row(row)?);
        }
        Ok(locators)
    }
}
