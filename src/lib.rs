//! Schedule Store
//!
//! Bookkeeping persistence for a scheduler: the definitions of recurring and
//! triggered jobs (schedules and sensors) and the ledger of their evaluation
//! attempts (ticks).
//!
//! The contract lives in the [`store`] traits; two backends implement it:
//! [`SqliteScheduleStore`] for production and [`InMemoryScheduleStore`] for
//! tests and embedded use. Backends are chosen at process start and handed
//! around as `Arc<dyn ScheduleStore>`.
//!
//! An evaluation loop typically loads job states, opens a tick for each due
//! job with [`store::JobTickStore::create_job_tick`], runs the job logic, and
//! closes the tick with a terminal status via
//! [`store::JobTickStore::update_job_tick`]. Administration queries tick
//! stats and purges old ticks for retention.

pub mod error;
pub mod sqlite_persistence;
pub mod store;

pub use error::{Result, StoreError};
pub use store::{
    InMemoryScheduleStore, JobOrigin, JobSpecificData, JobState, JobStateFilter, JobStateStore,
    JobStatus, JobTick, JobTickInitData, JobTickStats, JobTickStatus, JobTickStore, JobType,
    ScheduleStore, SqliteScheduleStore, SqliteStoreConfig, TickError,
};
