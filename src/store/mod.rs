//! Storage contract for scheduler bookkeeping.
//!
//! Job definitions (schedules and sensors) and their evaluation history
//! (ticks) live behind the traits below so the backing engine can be swapped
//! at process start: [`SqliteScheduleStore`] for production,
//! [`InMemoryScheduleStore`] for tests and embedded use.
//!
//! Every mutating operation is individually atomic, but there are no
//! cross-call transactions: a "read latest tick, then create the next one"
//! sequence can race with another evaluation loop, and callers are expected
//! to tolerate that. Id assignment in [`JobTickStore::create_job_tick`] is
//! collision-free under concurrent writers, which bounds the damage of such
//! races to duplicate evaluation, never corrupted history.

mod memory_store;
mod models;
mod schema;
mod sqlite_store;

pub use memory_store::InMemoryScheduleStore;
pub use models::*;
pub use schema::SCHEDULE_VERSIONED_SCHEMAS;
pub use sqlite_store::{SqliteScheduleStore, SqliteStoreConfig};

use crate::error::Result;
use chrono::{DateTime, Utc};

/// Filter for [`JobStateStore::all_job_states`]. An absent field matches
/// everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobStateFilter {
    pub repository_origin_id: Option<String>,
    pub job_type: Option<JobType>,
}

impl JobStateFilter {
    /// Matches every job state.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_repository<S: Into<String>>(mut self, repository_origin_id: S) -> Self {
        self.repository_origin_id = Some(repository_origin_id.into());
        self
    }

    pub fn with_job_type(mut self, job_type: JobType) -> Self {
        self.job_type = Some(job_type);
        self
    }

    pub fn matches(&self, state: &JobState) -> bool {
        if let Some(repo) = &self.repository_origin_id {
            if &state.origin.repository_origin_id != repo {
                return false;
            }
        }
        if let Some(job_type) = self.job_type {
            if state.job_type != job_type {
                return false;
            }
        }
        true
    }
}

/// CRUD over job definitions, keyed by origin id.
pub trait JobStateStore: Send + Sync {
    /// All job states matching `filter`. Order is unspecified but stable
    /// within a call.
    fn all_job_states(&self, filter: &JobStateFilter) -> Result<Vec<JobState>>;

    /// Point lookup; an absent state is `Ok(None)`, not an error.
    fn get_job_state(&self, job_origin_id: &str) -> Result<Option<JobState>>;

    /// Add a new job state. Fails with `AlreadyExists` if the origin id is
    /// already present.
    fn add_job_state(&self, state: &JobState) -> Result<()>;

    /// Replace the mutable fields (`status`, `data`) of an existing state,
    /// last-writer-wins. `job_type` and the origin are immutable after add
    /// and are not rewritten. Fails with `JobStateNotFound` if absent.
    fn update_job_state(&self, state: &JobState) -> Result<()>;

    /// Delete a job state. Fails with `JobStateNotFound` if absent. Does NOT
    /// cascade: the job's ticks stay queryable until separately purged.
    fn delete_job_state(&self, job_origin_id: &str) -> Result<()>;
}

/// Append-mostly ledger of evaluation attempts.
pub trait JobTickStore: Send + Sync {
    /// Persist a new tick with a store-assigned id and status `Started`.
    /// Concurrent calls never collide on the id.
    fn create_job_tick(&self, data: JobTickInitData) -> Result<JobTick>;

    /// Replace the mutable fields of an existing tick. Fails with
    /// `JobTickNotFound` for an unknown id, and with `TerminalTick` when the
    /// update would move an already-terminal tick back to `Started` (a
    /// best-effort guard against tick reuse).
    fn update_job_tick(&self, tick: &JobTick) -> Result<()>;

    /// All ticks for a job, most recent first (timestamp descending, id as
    /// tie-break).
    fn get_job_ticks(&self, job_origin_id: &str) -> Result<Vec<JobTick>>;

    /// The most recent tick for a job, without scanning the full history.
    fn get_latest_job_tick(&self, job_origin_id: &str) -> Result<Option<JobTick>>;

    /// Delete ticks for a job with the given status and `timestamp < before`.
    /// Returns the number of ticks deleted; purging an empty range is `Ok(0)`.
    fn purge_job_ticks(
        &self,
        job_origin_id: &str,
        status: JobTickStatus,
        before: DateTime<Utc>,
    ) -> Result<usize>;

    /// Per-status tick counts for a job, computed as one consistent snapshot.
    fn get_job_tick_stats(&self, job_origin_id: &str) -> Result<JobTickStats>;
}

/// The full store surface consumed by an orchestrator process.
pub trait ScheduleStore: JobStateStore + JobTickStore {
    /// Delete all job states and ticks unconditionally. Test/reset use only.
    fn wipe(&self) -> Result<()>;

    /// Create the schema on a fresh store, or run any pending migrations.
    /// Safe to call on an up-to-date store (no-op). Must be run before any
    /// other operation on a fresh store.
    fn upgrade(&self) -> Result<()>;
}
