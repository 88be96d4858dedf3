//! SQLite-backed schedule store implementation.

use super::models::{
    JobOrigin, JobSpecificData, JobState, JobStatus, JobTick, JobTickInitData, JobTickStats,
    JobTickStatus, JobType, TickError,
};
use super::schema::SCHEDULE_VERSIONED_SCHEMAS;
use super::{JobStateFilter, JobStateStore, JobTickStore, ScheduleStore};
use crate::error::{Result, StoreError};
use crate::sqlite_persistence::BASE_DB_VERSION;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

/// Construction-time tuning for stores held by long-lived processes.
///
/// There is no runtime tuning hook; pick the settings once when the backend
/// is built.
#[derive(Debug, Clone)]
pub struct SqliteStoreConfig {
    /// How long a statement waits on a locked database before surfacing a
    /// busy error to the caller.
    pub busy_timeout: Duration,
    /// Write-ahead logging. Recommended whenever several evaluation loops
    /// share the database file.
    pub wal: bool,
}

impl Default for SqliteStoreConfig {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_secs(5),
            wal: true,
        }
    }
}

impl SqliteStoreConfig {
    fn apply(&self, conn: &Connection) -> Result<()> {
        conn.busy_timeout(self.busy_timeout)?;
        if self.wal {
            conn.pragma_update(None, "journal_mode", "WAL")?;
        }
        Ok(())
    }
}

/// SQLite-backed schedule store.
///
/// All operations are individually atomic through a single serialized
/// connection; concurrency across processes is handled by SQLite itself
/// (WAL + busy timeout, see [`SqliteStoreConfig`]).
pub struct SqliteScheduleStore {
    conn: Arc<Mutex<Connection>>,
    ready: AtomicBool,
}

// Raw row forms, decoded in a second step so a malformed stored payload
// surfaces as `StoreError::Corrupt` instead of being defaulted away.
struct RawJobState {
    repository_origin_id: String,
    job_name: String,
    job_type: String,
    status: String,
    data: String,
}

struct RawJobTick {
    id: i64,
    job_origin_id: String,
    job_type: String,
    status: String,
    timestamp_micros: i64,
    run_ids: String,
    error: Option<String>,
}

impl SqliteScheduleStore {
    /// Open (or create) the database file with default tuning. The schema is
    /// not created or migrated here; call [`ScheduleStore::upgrade`] first on
    /// a fresh or out-of-date store.
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        Self::open_with_config(db_path, SqliteStoreConfig::default())
    }

    /// Open (or create) the database file with explicit tuning.
    pub fn open_with_config<P: AsRef<Path>>(db_path: P, config: SqliteStoreConfig) -> Result<Self> {
        let conn = Connection::open_with_flags(
            db_path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI
                | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        config.apply(&conn)?;

        let expected = Self::latest_version();
        let found = Self::read_version(&conn)?;
        let ready = if found == expected {
            Self::schema_for_version(found)?.validate(&conn)?;
            true
        } else if found > expected {
            return Err(StoreError::SchemaMismatch(format!(
                "database is at version {}, newer than this build supports ({})",
                found, expected
            )));
        } else {
            false
        };

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            ready: AtomicBool::new(ready),
        })
    }

    /// Open, creating or migrating the schema as needed. Convenience for
    /// callers that do not drive `upgrade()` explicitly.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let store = Self::open(db_path)?;
        store.upgrade()?;
        Ok(store)
    }

    /// In-memory store for testing.
    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        SqliteStoreConfig {
            wal: false,
            ..Default::default()
        }
        .apply(&conn)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            ready: AtomicBool::new(false),
        };
        store.upgrade()?;
        Ok(store)
    }

    fn latest_version() -> usize {
        SCHEDULE_VERSIONED_SCHEMAS
            .last()
            .map(|s| s.version)
            .unwrap_or(0)
    }

    fn schema_for_version(version: usize) -> Result<&'static crate::sqlite_persistence::VersionedSchema> {
        SCHEDULE_VERSIONED_SCHEMAS
            .iter()
            .find(|s| s.version == version)
            .ok_or_else(|| {
                StoreError::SchemaMismatch(format!("unknown schedule store version {}", version))
            })
    }

    fn read_version(conn: &Connection) -> Result<usize> {
        let raw: i64 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
        let base = BASE_DB_VERSION as i64;
        Ok(if raw < base { 0 } else { (raw - base) as usize })
    }

    /// Operations other than `upgrade()` refuse to run until the schema is
    /// at the expected version.
    fn ensure_ready(&self, conn: &Connection) -> Result<()> {
        if self.ready.load(Ordering::Acquire) {
            return Ok(());
        }
        let expected = Self::latest_version();
        let found = Self::read_version(conn)?;
        if found == expected {
            // Another handle (or process) ran the migration in the meantime
            self.ready.store(true, Ordering::Release);
            return Ok(());
        }
        Err(StoreError::MigrationRequired { found, expected })
    }

    fn row_to_raw_state(row: &rusqlite::Row) -> rusqlite::Result<RawJobState> {
        Ok(RawJobState {
            repository_origin_id: row.get("repository_origin_id")?,
            job_name: row.get("job_name")?,
            job_type: row.get("job_type")?,
            status: row.get("status")?,
            data: row.get("data")?,
        })
    }

    fn decode_state(raw: RawJobState) -> Result<JobState> {
        let job_type = JobType::parse(&raw.job_type)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown job type '{}'", raw.job_type)))?;
        let status = JobStatus::parse(&raw.status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown job status '{}'", raw.status)))?;
        let data: JobSpecificData = serde_json::from_str(&raw.data)
            .map_err(|e| StoreError::Corrupt(format!("job state data failed to decode: {}", e)))?;
        Ok(JobState {
            origin: JobOrigin {
                repository_origin_id: raw.repository_origin_id,
                job_name: raw.job_name,
            },
            job_type,
            status,
            data,
        })
    }

    fn row_to_raw_tick(row: &rusqlite::Row) -> rusqlite::Result<RawJobTick> {
        Ok(RawJobTick {
            id: row.get("id")?,
            job_origin_id: row.get("job_origin_id")?,
            job_type: row.get("job_type")?,
            status: row.get("status")?,
            timestamp_micros: row.get("timestamp_micros")?,
            run_ids: row.get("run_ids")?,
            error: row.get("error")?,
        })
    }

    fn decode_tick(raw: RawJobTick) -> Result<JobTick> {
        let job_type = JobType::parse(&raw.job_type)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown job type '{}'", raw.job_type)))?;
        let status = JobTickStatus::parse(&raw.status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown tick status '{}'", raw.status)))?;
        let timestamp = DateTime::from_timestamp_micros(raw.timestamp_micros).ok_or_else(|| {
            StoreError::Corrupt(format!(
                "tick {} timestamp {} out of range",
                raw.id, raw.timestamp_micros
            ))
        })?;
        let run_ids: Vec<String> = serde_json::from_str(&raw.run_ids)
            .map_err(|e| StoreError::Corrupt(format!("tick run ids failed to decode: {}", e)))?;
        let error: Option<TickError> = raw
            .error
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| StoreError::Corrupt(format!("tick error failed to decode: {}", e)))?;
        Ok(JobTick {
            id: raw.id,
            job_origin_id: raw.job_origin_id,
            job_type,
            status,
            timestamp,
            run_ids,
            error,
        })
    }

    fn encode_json<T: serde::Serialize>(value: &T, what: &str) -> Result<String> {
        serde_json::to_string(value)
            .map_err(|e| StoreError::Corrupt(format!("{} failed to encode: {}", what, e)))
    }
}

const TICK_COLUMNS: &str = "id, job_origin_id, job_type, status, timestamp_micros, run_ids, error";

impl JobStateStore for SqliteScheduleStore {
    fn all_job_states(&self, filter: &JobStateFilter) -> Result<Vec<JobState>> {
        let conn = self.conn.lock().unwrap();
        self.ensure_ready(&conn)?;

        let mut sql = String::from(
            "SELECT repository_origin_id, job_name, job_type, status, data FROM job_states",
        );
        let mut clauses: Vec<String> = Vec::new();
        let mut query_params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(repo) = &filter.repository_origin_id {
            clauses.push(format!("repository_origin_id = ?{}", query_params.len() + 1));
            query_params.push(Box::new(repo.clone()));
        }
        if let Some(job_type) = filter.job_type {
            clauses.push(format!("job_type = ?{}", query_params.len() + 1));
            query_params.push(Box::new(job_type.as_str().to_string()));
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY origin_id");

        let mut stmt = conn.prepare(&sql)?;
        let param_refs: Vec<&dyn rusqlite::ToSql> =
            query_params.iter().map(|p| p.as_ref()).collect();
        let raw_states = stmt
            .query_map(param_refs.as_slice(), Self::row_to_raw_state)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        raw_states.into_iter().map(Self::decode_state).collect()
    }

    fn get_job_state(&self, job_origin_id: &str) -> Result<Option<JobState>> {
        let conn = self.conn.lock().unwrap();
        self.ensure_ready(&conn)?;

        let mut stmt = conn.prepare(
            "SELECT repository_origin_id, job_name, job_type, status, data
             FROM job_states WHERE origin_id = ?1",
        )?;
        let raw = stmt
            .query_row(params![job_origin_id], Self::row_to_raw_state)
            .optional()?;

        raw.map(Self::decode_state).transpose()
    }

    fn add_job_state(&self, state: &JobState) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        self.ensure_ready(&conn)?;

        let origin_id = state.origin_id();
        let data = Self::encode_json(&state.data, "job state data")?;
        let result = conn.execute(
            "INSERT INTO job_states (origin_id, repository_origin_id, job_name, job_type, status, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                origin_id,
                state.origin.repository_origin_id,
                state.origin.job_name,
                state.job_type.as_str(),
                state.status.as_str(),
                data,
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::AlreadyExists(origin_id))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn update_job_state(&self, state: &JobState) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        self.ensure_ready(&conn)?;

        let origin_id = state.origin_id();
        let data = Self::encode_json(&state.data, "job state data")?;
        // Identity columns (origin, job_type) are immutable after add and
        // deliberately absent from the SET clause.
        let updated = conn.execute(
            "UPDATE job_states SET status = ?1, data = ?2 WHERE origin_id = ?3",
            params![state.status.as_str(), data, origin_id],
        )?;

        if updated == 0 {
            return Err(StoreError::JobStateNotFound(origin_id));
        }
        Ok(())
    }

    fn delete_job_state(&self, job_origin_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        self.ensure_ready(&conn)?;

        let deleted = conn.execute(
            "DELETE FROM job_states WHERE origin_id = ?1",
            params![job_origin_id],
        )?;

        if deleted == 0 {
            return Err(StoreError::JobStateNotFound(job_origin_id.to_string()));
        }
        Ok(())
    }
}

impl JobTickStore for SqliteScheduleStore {
    fn create_job_tick(&self, data: JobTickInitData) -> Result<JobTick> {
        let conn = self.conn.lock().unwrap();
        self.ensure_ready(&conn)?;

        let timestamp_micros = data.timestamp.timestamp_micros();
        conn.execute(
            "INSERT INTO job_ticks (job_origin_id, job_type, status, timestamp_micros, run_ids, error)
             VALUES (?1, ?2, ?3, ?4, '[]', NULL)",
            params![
                data.job_origin_id,
                data.job_type.as_str(),
                JobTickStatus::Started.as_str(),
                timestamp_micros,
            ],
        )?;
        let id = conn.last_insert_rowid();

        Ok(JobTick {
            id,
            job_origin_id: data.job_origin_id,
            job_type: data.job_type,
            status: JobTickStatus::Started,
            // Microsecond precision is what comes back on re-read
            timestamp: DateTime::from_timestamp_micros(timestamp_micros)
                .unwrap_or(data.timestamp),
            run_ids: Vec::new(),
            error: None,
        })
    }

    fn update_job_tick(&self, tick: &JobTick) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        self.ensure_ready(&conn)?;

        let current: Option<String> = conn
            .query_row(
                "SELECT status FROM job_ticks WHERE id = ?1",
                params![tick.id],
                |row| row.get(0),
            )
            .optional()?;
        let current = current.ok_or(StoreError::JobTickNotFound(tick.id))?;
        let current = JobTickStatus::parse(&current)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown tick status '{}'", current)))?;
        if current.is_terminal() && tick.status == JobTickStatus::Started {
            return Err(StoreError::TerminalTick {
                id: tick.id,
                status: current,
            });
        }

        let run_ids = Self::encode_json(&tick.run_ids, "tick run ids")?;
        let error = tick
            .error
            .as_ref()
            .map(|e| Self::encode_json(e, "tick error"))
            .transpose()?;
        conn.execute(
            "UPDATE job_ticks SET status = ?1, timestamp_micros = ?2, run_ids = ?3, error = ?4
             WHERE id = ?5",
            params![
                tick.status.as_str(),
                tick.timestamp.timestamp_micros(),
                run_ids,
                error,
                tick.id,
            ],
        )?;

        Ok(())
    }

    fn get_job_ticks(&self, job_origin_id: &str) -> Result<Vec<JobTick>> {
        let conn = self.conn.lock().unwrap();
        self.ensure_ready(&conn)?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM job_ticks WHERE job_origin_id = ?1
             ORDER BY timestamp_micros DESC, id DESC",
            TICK_COLUMNS
        ))?;
        let raw_ticks = stmt
            .query_map(params![job_origin_id], Self::row_to_raw_tick)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        raw_ticks.into_iter().map(Self::decode_tick).collect()
    }

    fn get_latest_job_tick(&self, job_origin_id: &str) -> Result<Option<JobTick>> {
        let conn = self.conn.lock().unwrap();
        self.ensure_ready(&conn)?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM job_ticks WHERE job_origin_id = ?1
             ORDER BY timestamp_micros DESC, id DESC LIMIT 1",
            TICK_COLUMNS
        ))?;
        let raw = stmt
            .query_row(params![job_origin_id], Self::row_to_raw_tick)
            .optional()?;

        raw.map(Self::decode_tick).transpose()
    }

    fn purge_job_ticks(
        &self,
        job_origin_id: &str,
        status: JobTickStatus,
        before: DateTime<Utc>,
    ) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        self.ensure_ready(&conn)?;

        let deleted = conn.execute(
            "DELETE FROM job_ticks
             WHERE job_origin_id = ?1 AND status = ?2 AND timestamp_micros < ?3",
            params![job_origin_id, status.as_str(), before.timestamp_micros()],
        )?;

        Ok(deleted)
    }

    fn get_job_tick_stats(&self, job_origin_id: &str) -> Result<JobTickStats> {
        let conn = self.conn.lock().unwrap();
        self.ensure_ready(&conn)?;

        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM job_ticks WHERE job_origin_id = ?1 GROUP BY status",
        )?;
        let counts = stmt
            .query_map(params![job_origin_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut stats = JobTickStats::default();
        for (status, count) in counts {
            let status = JobTickStatus::parse(&status)
                .ok_or_else(|| StoreError::Corrupt(format!("unknown tick status '{}'", status)))?;
            stats.add(status, count as usize);
        }
        Ok(stats)
    }
}

impl ScheduleStore for SqliteScheduleStore {
    fn wipe(&self) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        self.ensure_ready(&conn)?;

        let tx = conn.transaction()?;
        tx.execute("DELETE FROM job_ticks", [])?;
        tx.execute("DELETE FROM job_states", [])?;
        tx.commit()?;
        info!("Wiped all job states and ticks");
        Ok(())
    }

    fn upgrade(&self) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let expected = Self::latest_version();
        let found = Self::read_version(&conn)?;

        if found == expected {
            self.ready.store(true, Ordering::Release);
            return Ok(());
        }
        if found > expected {
            return Err(StoreError::SchemaMismatch(format!(
                "database is at version {}, newer than this build supports ({})",
                found, expected
            )));
        }

        let table_count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'",
            [],
            |r| r.get(0),
        )?;

        if table_count == 0 {
            info!("Creating schedule store schema at version {}", expected);
            if let Some(latest) = SCHEDULE_VERSIONED_SCHEMAS.last() {
                latest.create(&conn)?;
            }
        } else if found == 0 {
            return Err(StoreError::SchemaMismatch(
                "database contains tables but no schedule store version".to_string(),
            ));
        } else {
            // Validate the shape we are migrating from, then run the pending
            // migrations in one transaction.
            Self::schema_for_version(found)?.validate(&conn)?;
            info!(
                "Migrating schedule store from version {} to {}",
                found, expected
            );
            let tx = conn.transaction()?;
            for schema in SCHEDULE_VERSIONED_SCHEMAS.iter().filter(|s| s.version > found) {
                if let Some(migration_fn) = schema.migration {
                    migration_fn(&tx)?;
                }
            }
            tx.execute(
                &format!("PRAGMA user_version = {}", BASE_DB_VERSION + expected),
                [],
            )?;
            tx.commit()?;
        }

        self.ready.store(true, Ordering::Release);
        Ok(())
    }
}
